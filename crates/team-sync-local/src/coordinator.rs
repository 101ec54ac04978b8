//! Sync coordinator.
//!
//! Owns one [`ActiveProjectSync`] per synchronized project and wires both
//! reconciliation directions:
//! - local: watcher event -> revision bump -> remote mutation
//! - remote: subscription snapshot -> last-writer-wins gate -> echo mark -> file write
//!
//! Every callback re-checks the active-sync map before touching a project, so
//! callbacks still in flight after [`SyncCoordinator::disable_sync`] are no-ops.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{json, Value};
use team_sync_core::{
    ConflictEvent, ConnectionEvent, CredentialStore, Credentials, FileChangeEvent,
    ProjectIdentity, RemoteStore, ResourceKind, RevisionKey, RevisionStore, SubscriptionHandle,
    SyncError, SyncMode, SyncReport, SyncStatus, SyncTeam, SyncUpdate, SyncUser, TeamRole,
    UpdateKind,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::layout::{self, FileOp};
use crate::watcher::{FileWatcher, WatcherConfig};

const LOCAL_ACTOR_FALLBACK: &str = "local-user";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub watcher: WatcherConfig,
    /// Capacity of the recent-updates ring buffer
    pub updates_buffer: usize,
    /// Capacity of the watcher -> coordinator channel
    pub event_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            watcher: WatcherConfig::default(),
            updates_buffer: 100,
            event_buffer: 256,
        }
    }
}

/// Immutable part of an active sync, shared with its callbacks.
#[derive(Debug)]
struct ProjectContext {
    sync_id: u64,
    project_id: String,
    project_path: PathBuf,
    remote_project_id: String,
    identity: ProjectIdentity,
    /// Held while remote records are written to disk; disable waits on it.
    write_gate: tokio::sync::Mutex<()>,
    /// Serializes local pushes so revisions reach the store in bump order.
    push_gate: tokio::sync::Mutex<()>,
}

/// Runtime state of one synchronized project.
struct ActiveProjectSync {
    context: Arc<ProjectContext>,
    subscriptions: Vec<SubscriptionHandle>,
    pumps: Vec<AbortHandle>,
}

impl ActiveProjectSync {
    fn cancel(&self) {
        for subscription in &self.subscriptions {
            subscription.cancel();
        }
    }
}

struct Inner {
    remote: Arc<dyn RemoteStore>,
    credentials: Arc<dyn CredentialStore>,
    revisions: RevisionStore,
    watcher: FileWatcher,
    config: CoordinatorConfig,
    active: DashMap<String, ActiveProjectSync>,
    next_sync_id: AtomicU64,
    status: Mutex<SyncStatus>,
    recent: Mutex<VecDeque<SyncUpdate>>,
    updates: broadcast::Sender<SyncUpdate>,
    local_events: Mutex<Option<mpsc::Receiver<FileChangeEvent>>>,
    dispatcher: Mutex<Option<AbortHandle>>,
    connection_events: Mutex<Option<broadcast::Receiver<ConnectionEvent>>>,
    monitor: Mutex<Option<AbortHandle>>,
}

/// Orchestrates synchronization between project trees and the remote store.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        credentials: Arc<dyn CredentialStore>,
        config: CoordinatorConfig,
    ) -> Result<Self, SyncError> {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let watcher = FileWatcher::new(config.watcher.clone(), events_tx)?;
        let (updates, _) = broadcast::channel(config.updates_buffer.max(1));
        let connection_events = remote.connection_events();

        Ok(Self {
            inner: Arc::new(Inner {
                remote,
                credentials,
                revisions: RevisionStore::new(),
                watcher,
                config,
                active: DashMap::new(),
                next_sync_id: AtomicU64::new(1),
                status: Mutex::new(SyncStatus::default()),
                recent: Mutex::new(VecDeque::new()),
                updates,
                local_events: Mutex::new(Some(events_rx)),
                dispatcher: Mutex::new(None),
                connection_events: Mutex::new(Some(connection_events)),
                monitor: Mutex::new(None),
            }),
        })
    }

    /// Start dispatching local changes and restore a saved session, if any.
    #[instrument(skip(self), level = "debug")]
    pub async fn start(&self) -> Result<(), SyncError> {
        self.inner.ensure_dispatcher();

        let saved = self.inner.credentials.load().await?;
        let Some(credentials) = saved.filter(Credentials::has_session) else {
            debug!("No saved session");
            return Ok(());
        };

        match self
            .inner
            .remote
            .set_auth_token(Some(credentials.session_token.clone()))
            .await
        {
            Ok(()) => {
                let user = SyncUser {
                    id: credentials
                        .user_id
                        .clone()
                        .unwrap_or_else(|| credentials.email.clone()),
                    email: credentials.email.clone(),
                    name: None,
                };
                let team = credentials.active_team_id.clone().map(team_from_id);
                let connected = self.inner.remote.is_connected();
                self.inner.update_status(|status| {
                    status.authenticated = true;
                    status.connected = connected;
                    status.user = Some(user);
                    status.active_team = team;
                    status.error = None;
                    status.mode = SyncMode::Idle;
                });
                self.inner
                    .emit(SyncUpdate::new(UpdateKind::AuthChanged, "Session restored"));
                if connected {
                    self.inner
                        .emit(SyncUpdate::new(UpdateKind::Connected, "Connected to remote store"));
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to restore session: {}", e);
                // An unreachable store keeps the session for the next attempt.
                if matches!(e, SyncError::AuthExchangeFailed(_)) {
                    self.inner.credentials.clear().await?;
                }
                self.inner.fail_auth(&e);
                Err(e)
            }
        }
    }

    /// Stop every sync, the dispatcher and the transport.
    #[instrument(skip(self), level = "debug")]
    pub async fn shutdown(&self) {
        self.inner.disable_all().await;
        self.inner.watcher.close_all();

        let dispatcher = self.inner.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        let monitor = self.inner.monitor.lock().ok().and_then(|mut m| m.take());
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        self.inner.remote.disconnect().await;
        self.inner.update_status(|status| {
            status.connected = false;
            status.mode = SyncMode::Disabled;
            status.pending_changes = 0;
        });
        self.inner
            .emit(SyncUpdate::new(UpdateKind::Disconnected, "Sync engine stopped"));
        info!("Sync coordinator shut down");
    }

    /// Install a session token obtained by the host's sign-in flow.
    ///
    /// A new token for the same user keeps the active team; another user starts without one.
    #[instrument(skip(self, session_token), level = "debug")]
    pub async fn authenticate(&self, session_token: String, user: SyncUser) -> Result<(), SyncError> {
        let device_id = self.inner.credentials.get_or_create_device_id().await?;
        let previous = self.inner.credentials.load().await?.filter(Credentials::has_session);
        let status = self.inner.status();
        let same_user = match &previous {
            Some(saved) => saved.email == user.email,
            None => status.user.as_ref().map_or(true, |current| current.email == user.email),
        };
        let team = if same_user {
            status
                .active_team
                .or_else(|| previous.and_then(|saved| saved.active_team_id).map(team_from_id))
        } else {
            None
        };

        if let Err(e) = self
            .inner
            .remote
            .set_auth_token(Some(session_token.clone()))
            .await
        {
            self.inner.fail_auth(&e);
            return Err(e);
        }

        self.inner
            .credentials
            .save(&Credentials {
                user_id: Some(user.id.clone()),
                email: user.email.clone(),
                session_token,
                active_team_id: team.as_ref().map(|team| team.id.clone()),
                device_id,
            })
            .await?;

        let connected = self.inner.remote.is_connected();
        let message = format!("Signed in as {}", user.email);
        let has_active = !self.inner.active.is_empty();
        self.inner.update_status(|status| {
            status.authenticated = true;
            status.connected = connected;
            status.user = Some(user);
            status.active_team = team;
            status.error = None;
            if matches!(status.mode, SyncMode::Error | SyncMode::Disabled) {
                status.mode = if has_active { SyncMode::Syncing } else { SyncMode::Idle };
            }
        });
        self.inner.emit(SyncUpdate::new(UpdateKind::AuthChanged, message));
        if connected {
            self.inner
                .emit(SyncUpdate::new(UpdateKind::Connected, "Connected to remote store"));
        }
        Ok(())
    }

    /// Select the team that new project syncs are attached to.
    #[instrument(skip(self, team), level = "debug")]
    pub async fn set_active_team(&self, team: SyncTeam) -> Result<(), SyncError> {
        if let Some(mut credentials) = self.inner.credentials.load().await? {
            credentials.active_team_id = Some(team.id.clone());
            self.inner.credentials.save(&credentials).await?;
        }

        let message = format!("Active team: {}", team.name);
        self.inner.update_status(|status| status.active_team = Some(team));
        self.inner.emit(SyncUpdate::new(UpdateKind::TeamChanged, message));
        Ok(())
    }

    /// Disable every project, forget the session and every known revision.
    #[instrument(skip(self), level = "debug")]
    pub async fn sign_out(&self) -> Result<(), SyncError> {
        self.inner.disable_all().await;
        self.inner.credentials.clear().await?;
        if let Err(e) = self.inner.remote.set_auth_token(None).await {
            warn!("Failed to clear transport token: {}", e);
        }
        self.inner.revisions.clear();

        self.inner.update_status(|status| {
            status.authenticated = false;
            status.connected = false;
            status.user = None;
            status.active_team = None;
            status.synced_projects.clear();
            status.pending_changes = 0;
            status.error = None;
            status.mode = SyncMode::Disabled;
        });
        self.inner
            .emit(SyncUpdate::new(UpdateKind::AuthChanged, "Signed out"));
        Ok(())
    }

    /// Begin synchronizing a project.
    ///
    /// # Errors
    /// `NotAuthorized` without an active team. Any failure leaves no sync behind.
    #[instrument(skip(self), level = "debug")]
    pub async fn enable_sync(&self, project_id: &str, project_path: &Path) -> Result<(), SyncError> {
        let team_id = self
            .inner
            .status()
            .active_team
            .map(|team| team.id)
            .ok_or_else(|| SyncError::NotAuthorized("no active team".to_string()))?;

        self.inner.ensure_dispatcher();
        if self.inner.active.contains_key(project_id) {
            self.inner.disable(project_id).await;
        }

        let root = tokio::fs::canonicalize(project_path)
            .await
            .map_err(|e| SyncError::fs(project_path, e))?;
        let identity = ProjectIdentity::resolve_or_fallback(&root).await;
        let project_hash = identity.project_hash();

        let upserted = self
            .inner
            .remote
            .mutation(
                "projects:upsertProject",
                json!({
                    "teamId": team_id,
                    "projectName": identity.repo_slug,
                    "projectHash": project_hash,
                }),
            )
            .await?;
        let remote_project_id = remote_id(&upserted).unwrap_or_else(|| project_hash.clone());

        let context = Arc::new(ProjectContext {
            sync_id: self.inner.next_sync_id.fetch_add(1, Ordering::SeqCst),
            project_id: project_id.to_string(),
            project_path: root.clone(),
            remote_project_id,
            identity,
            write_gate: tokio::sync::Mutex::new(()),
            push_gate: tokio::sync::Mutex::new(()),
        });

        // Record the sync before subscribing so the first snapshot passes the liveness check.
        self.inner.active.insert(
            project_id.to_string(),
            ActiveProjectSync {
                context: Arc::clone(&context),
                subscriptions: Vec::new(),
                pumps: Vec::new(),
            },
        );

        if let Err(e) = self.inner.start_project(&context).await {
            warn!("Rolling back sync of {}: {}", project_id, e);
            self.inner.disable(project_id).await;
            self.inner.refresh_mode();
            return Err(e);
        }

        self.inner.refresh_mode();
        info!(
            "Sync enabled for {} (remote project {})",
            project_id, context.remote_project_id
        );
        self.inner.emit(
            SyncUpdate::new(UpdateKind::SyncEnabled, format!("Sync enabled for {}", context.identity.repo_slug))
                .with_project(project_id),
        );
        Ok(())
    }

    /// Stop synchronizing a project. Idempotent.
    #[instrument(skip(self), level = "debug")]
    pub async fn disable_sync(&self, project_id: &str) -> Result<(), SyncError> {
        if self.inner.disable(project_id).await {
            self.inner.refresh_mode();
            self.inner.emit(
                SyncUpdate::new(UpdateKind::SyncDisabled, "Sync disabled").with_project(project_id),
            );
        }
        Ok(())
    }

    pub fn is_sync_enabled(&self, project_id: &str) -> bool {
        self.inner.active.contains_key(project_id)
    }

    /// Push one debounced local change. Stale events for disabled projects are ignored.
    pub async fn handle_local_file_change(&self, event: FileChangeEvent) -> Result<(), SyncError> {
        self.inner.handle_local_file_change(event).await
    }

    /// Reconcile one full snapshot of a remote collection into the project tree.
    pub async fn handle_remote_change(
        &self,
        project_id: &str,
        resource: ResourceKind,
        records: Value,
    ) -> SyncReport {
        let context = match self.inner.context(project_id) {
            Some(context) => context,
            None => return SyncReport::default(),
        };
        self.inner.handle_remote_change(&context, resource, records).await
    }

    /// Re-send every local artifact, bypassing the revision gate.
    #[instrument(skip(self), level = "debug")]
    pub async fn force_push(&self, project_id: &str) -> Result<SyncReport, SyncError> {
        let context = self
            .inner
            .context(project_id)
            .ok_or_else(|| SyncError::NotEnabled(project_id.to_string()))?;

        self.inner
            .emit(SyncUpdate::new(UpdateKind::SyncStarted, "Pushing all local data").with_project(project_id));
        self.inner.begin_pending();

        let mut report = SyncReport::default();
        match layout::scan_local(&context.project_path).await {
            Ok(artifacts) => {
                for artifact in artifacts {
                    let event = FileChangeEvent {
                        project_id: project_id.to_string(),
                        project_path: context.project_path.clone(),
                        absolute_path: artifact.absolute_path,
                        relative_path: artifact.relative_path,
                        resource: artifact.resource,
                    };
                    match self.inner.push_local(&context, &event).await {
                        Ok(_) => report.record_success(),
                        Err(e) => {
                            warn!("Force push of {} failed: {}", event.relative_path, e);
                            report.record_failure(event.relative_path, e);
                        }
                    }
                }
            }
            Err(e) => report.record_failure("local scan", e),
        }

        self.inner.end_pending();
        self.inner.finish_batch(project_id, "Pushed all local data", &report);
        Ok(report)
    }

    /// Re-read every remote collection and apply it through the revision gate.
    #[instrument(skip(self), level = "debug")]
    pub async fn force_pull(&self, project_id: &str) -> Result<SyncReport, SyncError> {
        let context = self
            .inner
            .context(project_id)
            .ok_or_else(|| SyncError::NotEnabled(project_id.to_string()))?;

        self.inner
            .emit(SyncUpdate::new(UpdateKind::SyncStarted, "Pulling all remote data").with_project(project_id));
        self.inner.begin_pending();

        let pulls = ResourceKind::ALL
            .into_iter()
            .filter(ResourceKind::is_subscribed)
            .filter_map(|resource| layout::query_name(resource).map(|name| (resource, name)))
            .map(|(resource, name)| {
                let inner = Arc::clone(&self.inner);
                let context = Arc::clone(&context);
                async move {
                    let args = json!({ "projectId": context.remote_project_id });
                    match inner.remote.query(name, args).await {
                        Ok(records) => inner.handle_remote_change(&context, resource, records).await,
                        Err(e) => {
                            warn!("Query {} failed: {}", name, e);
                            let mut report = SyncReport::default();
                            report.record_failure(resource.as_str(), e);
                            report
                        }
                    }
                }
            });

        let mut report = SyncReport::default();
        for partial in join_all(pulls).await {
            report.merge(partial);
        }

        self.inner.end_pending();
        self.inner.finish_batch(project_id, "Pulled all remote data", &report);
        Ok(report)
    }

    /// Push project settings as the `projectSettings` resource.
    #[instrument(skip(self, settings), level = "debug")]
    pub async fn push_project_settings(&self, project_id: &str, settings: Value) -> Result<(), SyncError> {
        let context = self
            .inner
            .context(project_id)
            .ok_or_else(|| SyncError::NotEnabled(project_id.to_string()))?;
        let team_id = self
            .inner
            .status()
            .active_team
            .map(|team| team.id)
            .ok_or_else(|| SyncError::NotAuthorized("no active team".to_string()))?;

        let actor = self.inner.actor();
        let key = RevisionKey::singleton(project_id, ResourceKind::ProjectSettings);
        let record = self.inner.revisions.bump_local(&key, &actor);

        self.inner
            .remote
            .mutation(
                "projects:upsertProject",
                json!({
                    "teamId": team_id,
                    "projectName": context.identity.repo_slug,
                    "projectHash": context.identity.project_hash(),
                    "settings": settings,
                    "updatedAt": record.revision,
                    "updatedBy": actor,
                }),
            )
            .await?;
        Ok(())
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status()
    }

    /// Most recent updates, newest first.
    pub fn recent_updates(&self) -> Vec<SyncUpdate> {
        self.inner
            .recent
            .lock()
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SyncUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictEvent> {
        self.inner.revisions.subscribe_conflicts()
    }

    pub fn revisions(&self) -> &RevisionStore {
        &self.inner.revisions
    }

    pub fn watcher(&self) -> &FileWatcher {
        &self.inner.watcher
    }

    /// Remote project id an enabled project is bound to.
    pub fn remote_project_id(&self, project_id: &str) -> Option<String> {
        self.inner
            .context(project_id)
            .map(|context| context.remote_project_id.clone())
    }
}

/// Only the id of the team is persisted; the host can refresh the rest with set_active_team.
fn team_from_id(id: String) -> SyncTeam {
    SyncTeam {
        name: id.clone(),
        id,
        role: TeamRole::Member,
        member_count: None,
    }
}

/// Project id returned by the upsert: a bare id or an object carrying `_id`.
fn remote_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(map) => map
            .get("_id")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

impl Inner {
    fn status(&self) -> SyncStatus {
        self.status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        let mut status = self.status.lock().expect("status lock poisoned");
        f(&mut status);
    }

    fn emit(&self, update: SyncUpdate) {
        debug!("Update {:?}: {}", update.kind, update.message);
        {
            let mut recent = self.recent.lock().expect("updates lock poisoned");
            recent.push_front(update.clone());
            recent.truncate(self.config.updates_buffer);
        }
        // No receivers is fine: the ring buffer covers late observers.
        let _ = self.updates.send(update);
    }

    fn actor(&self) -> String {
        self.status()
            .user
            .map(|user| user.id)
            .unwrap_or_else(|| LOCAL_ACTOR_FALLBACK.to_string())
    }

    fn context(&self, project_id: &str) -> Option<Arc<ProjectContext>> {
        self.active
            .get(project_id)
            .map(|active| Arc::clone(&active.context))
    }

    /// Whether `context` is still the live sync of its project.
    fn is_live(&self, context: &ProjectContext) -> bool {
        self.active
            .get(&context.project_id)
            .map(|active| active.context.sync_id == context.sync_id)
            .unwrap_or(false)
    }

    fn fail_auth(&self, e: &SyncError) {
        let message = e.to_string();
        self.update_status(|status| {
            status.authenticated = false;
            status.connected = false;
            status.mode = SyncMode::Error;
            status.error = Some(message.clone());
        });
        self.emit(SyncUpdate::new(UpdateKind::SyncError, message));
    }

    /// Mode follows the number of active projects unless authentication failed.
    fn refresh_mode(&self) {
        let mut projects: Vec<String> = self.active.iter().map(|a| a.key().clone()).collect();
        projects.sort();
        self.update_status(|status| {
            if status.mode != SyncMode::Error {
                status.mode = if projects.is_empty() {
                    SyncMode::Idle
                } else {
                    SyncMode::Syncing
                };
            }
            status.synced_projects = projects;
        });
    }

    fn begin_pending(&self) {
        self.update_status(|status| status.pending_changes += 1);
    }

    fn end_pending(&self) {
        let now = Utc::now();
        self.update_status(|status| {
            status.pending_changes = status.pending_changes.saturating_sub(1);
            status.last_sync_at = Some(now);
        });
    }

    fn finish_batch(&self, project_id: &str, message: &str, report: &SyncReport) {
        if report.is_success() {
            info!("{} for {} ({} resources)", message, project_id, report.attempted);
            self.emit(SyncUpdate::new(UpdateKind::SyncFinished, message).with_project(project_id));
        } else {
            warn!("{} for {}: {}", message, project_id, report.summary());
            self.emit(SyncUpdate::new(UpdateKind::SyncError, report.summary()).with_project(project_id));
        }
    }

    /// Spawn the task that hands watcher events to the push path.
    fn ensure_dispatcher(self: &Arc<Self>) {
        self.ensure_monitor();
        let Some(mut events) = self.local_events.lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    if let Err(e) = inner.handle_local_file_change(event).await {
                        error!("Local change handler failed: {}", e);
                    }
                });
            }
            debug!("Local change dispatcher stopped");
        });

        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            *dispatcher = Some(task.abort_handle());
        }
    }

    /// Spawn the task that folds transport connection events into the status.
    fn ensure_monitor(self: &Arc<Self>) {
        let Some(mut events) = self.connection_events.lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Connection monitor skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_connection_event(event);
            }
            debug!("Connection monitor stopped");
        });

        if let Ok(mut monitor) = self.monitor.lock() {
            *monitor = Some(task.abort_handle());
        }
    }

    fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::AuthFailed(message) => {
                if self.status().mode == SyncMode::Error {
                    return;
                }
                error!("Remote store rejected the session: {}", message);
                self.fail_auth(&SyncError::AuthExchangeFailed(message));
            }
            ConnectionEvent::Lost(message) => {
                warn!("Lost connection to remote store: {}", message);
                self.update_status(|status| status.connected = false);
                self.emit(SyncUpdate::new(UpdateKind::Disconnected, message));
            }
            ConnectionEvent::Restored => {
                let status = self.status();
                if status.mode == SyncMode::Error || !status.authenticated {
                    return;
                }
                info!("Connection to remote store restored");
                self.update_status(|status| status.connected = true);
                self.emit(SyncUpdate::new(UpdateKind::Connected, "Connected to remote store"));
            }
        }
    }

    /// Start the watcher and the subscriptions of a freshly recorded sync.
    async fn start_project(self: &Arc<Self>, context: &Arc<ProjectContext>) -> Result<(), SyncError> {
        self.watcher.watch(&context.project_id, &context.project_path)?;

        for resource in ResourceKind::ALL.into_iter().filter(ResourceKind::is_subscribed) {
            let Some(name) = layout::query_name(resource) else {
                continue;
            };
            let subscription = self
                .remote
                .subscribe(name, json!({ "projectId": context.remote_project_id }))
                .await?;

            let mut updates = subscription.updates;
            let weak = Arc::downgrade(self);
            let pump_context = Arc::clone(context);
            let pump = tokio::spawn(async move {
                while let Some(records) = updates.recv().await {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    if !inner.is_live(&pump_context) {
                        break;
                    }
                    let report = inner
                        .handle_remote_change(&pump_context, resource, records)
                        .await;
                    if !report.is_success() {
                        warn!(
                            "Applying remote {} for {}: {}",
                            resource,
                            pump_context.project_id,
                            report.summary()
                        );
                        inner.emit(
                            SyncUpdate::new(UpdateKind::SyncError, report.summary())
                                .with_project(&pump_context.project_id)
                                .with_resource(resource),
                        );
                    }
                }
            });

            match self.active.get_mut(&context.project_id) {
                Some(mut active) if active.context.sync_id == context.sync_id => {
                    active.subscriptions.push(subscription.handle);
                    active.pumps.push(pump.abort_handle());
                }
                _ => {
                    subscription.handle.cancel();
                    pump.abort();
                    return Err(SyncError::NotEnabled(context.project_id.clone()));
                }
            }
        }
        Ok(())
    }

    /// Tear down a project sync. Returns whether one was active.
    async fn disable(&self, project_id: &str) -> bool {
        let Some((_, active)) = self.active.remove(project_id) else {
            return false;
        };

        active.cancel();
        self.watcher.unwatch(project_id);
        // Wait for a remote write already past its liveness check.
        let _ = active.context.write_gate.lock().await;
        for pump in &active.pumps {
            pump.abort();
        }

        info!("Sync disabled for {}", project_id);
        true
    }

    async fn disable_all(&self) {
        let projects: Vec<String> = self.active.iter().map(|a| a.key().clone()).collect();
        for project_id in projects {
            if self.disable(&project_id).await {
                self.emit(SyncUpdate::new(UpdateKind::SyncDisabled, "Sync disabled").with_project(&project_id));
            }
        }
        self.refresh_mode();
    }

    async fn handle_local_file_change(&self, event: FileChangeEvent) -> Result<(), SyncError> {
        let Some(context) = self.context(&event.project_id) else {
            debug!("Ignoring change for disabled project {}", event.project_id);
            return Ok(());
        };

        self.begin_pending();
        self.emit(
            SyncUpdate::new(UpdateKind::SyncStarted, format!("Detected {} update", event.resource))
                .with_project(&event.project_id)
                .with_resource(event.resource),
        );

        let result = self.push_local(&context, &event).await;
        self.end_pending();

        match result {
            Ok(_) => {
                self.emit(
                    SyncUpdate::new(UpdateKind::SyncFinished, format!("Synced {}", event.relative_path))
                        .with_project(&event.project_id)
                        .with_resource(event.resource),
                );
            }
            Err(e) if e.is_auth() => {
                warn!("Push of {} rejected: {}", event.relative_path, e);
                self.fail_auth(&e);
            }
            Err(e) => {
                // The revision bump stays: the next change or a force push retries delivery.
                warn!("Failed to push {}: {}", event.relative_path, e);
                self.emit(
                    SyncUpdate::new(UpdateKind::SyncError, format!("Failed to push {}: {}", event.relative_path, e))
                        .with_project(&event.project_id)
                        .with_resource(event.resource),
                );
            }
        }
        Ok(())
    }

    /// Bump the local revision of the artifact and send it. Returns whether a mutation went out.
    async fn push_local(&self, context: &ProjectContext, event: &FileChangeEvent) -> Result<bool, SyncError> {
        let Some(resource_id) = layout::resource_id(event.resource, &event.relative_path) else {
            debug!("No resource id for {}", event.relative_path);
            return Ok(false);
        };

        let _push = context.push_gate.lock().await;
        let key = RevisionKey::new(&event.project_id, event.resource, &resource_id);
        let actor = self.actor();
        let record = self.revisions.bump_local(&key, &actor);

        let push = layout::read_local(
            &event.absolute_path,
            &event.relative_path,
            event.resource,
            &resource_id,
        )
        .await?;
        let Some(push) = push else {
            return Ok(false);
        };

        if !self.is_live(context) {
            debug!("Sync of {} ended before push", event.project_id);
            return Ok(false);
        }

        let mutation = push.mutation;
        let args = push.into_args(&context.remote_project_id, record.revision, &actor);
        self.remote.mutation(mutation, args).await?;
        debug!("Pushed {} at revision {}", key, record.revision);
        Ok(true)
    }

    async fn handle_remote_change(
        &self,
        context: &ProjectContext,
        resource: ResourceKind,
        records: Value,
    ) -> SyncReport {
        let _gate = context.write_gate.lock().await;
        let mut report = SyncReport::default();

        for record in layout::remote_collection(records) {
            if !self.is_live(context) {
                debug!("Sync of {} ended, dropping remote snapshot", context.project_id);
                break;
            }

            let artifact = match layout::materialize(&context.project_path, resource, &record) {
                Ok(artifact) => artifact,
                Err(e) => {
                    warn!("Skipping remote {} record: {}", resource, e);
                    report.record_failure(resource.as_str(), e);
                    continue;
                }
            };

            let key = RevisionKey::new(&context.project_id, resource, &artifact.resource_id);
            if let Err(e) = self.revisions.check_remote(&key, &artifact.record) {
                debug!("Skipping remote record: {}", e);
                report.record_skip();
                continue;
            }

            match self.apply_ops(&artifact.ops).await {
                Ok(()) => {
                    self.revisions.set(&key, artifact.record);
                    report.record_success();
                }
                Err(e) => {
                    warn!("Failed to apply remote {}: {}", key, e);
                    report.record_failure(key.to_string(), e);
                }
            }
        }

        report
    }

    /// Apply file operations, marking each path as an engine write first.
    async fn apply_ops(&self, ops: &[FileOp]) -> Result<(), SyncError> {
        for op in ops {
            match op {
                FileOp::Write { path, contents } => {
                    self.watcher.mark_remote_write(path);
                    if let Err(e) = layout::write_atomic(path, contents).await {
                        self.watcher.clear_remote_write(path);
                        return Err(e);
                    }
                }
                FileOp::Remove { path } => {
                    let exists = tokio::fs::try_exists(path)
                        .await
                        .map_err(|e| SyncError::fs(path, e))?;
                    if !exists {
                        continue;
                    }
                    self.watcher.mark_remote_write(path);
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        self.watcher.clear_remote_write(path);
                        return Err(SyncError::fs(path, e));
                    }
                }
            }
        }
        Ok(())
    }
}
