use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use team_sync_core::memory::MemoryRemoteStore;
use team_sync_core::{
    ConnectionEvent, CredentialStore, Credentials, FileChangeEvent, ResourceKind, RevisionKey, RevisionRecord,
    SyncError, SyncMode, SyncTeam, SyncUser, TeamRole, UpdateKind,
};
use team_sync_local::{CoordinatorConfig, FileCredentialStore, SyncCoordinator, WatcherConfig};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

const DEBOUNCE_MS: u64 = 150;
const REMOTE_PROJECT: &str = "rp1";
const META: &str = ".auto-claude/specs/001-login/task_metadata.json";

struct Harness {
    credentials_dir: TempDir,
    _project_dir: TempDir,
    root: PathBuf,
    store: MemoryRemoteStore,
    coordinator: SyncCoordinator,
}

impl Harness {
    async fn new() -> Self {
        let credentials_dir = TempDir::new().unwrap();
        let project_dir = TempDir::new().unwrap();
        let root = std::fs::canonicalize(project_dir.path()).unwrap();

        let store = MemoryRemoteStore::new();
        store.set_mutation_result("projects:upsertProject", json!(REMOTE_PROJECT));

        let credentials = FileCredentialStore::new(credentials_dir.path().join("credentials.json"));
        let config = CoordinatorConfig {
            watcher: WatcherConfig {
                debounce: Duration::from_millis(DEBOUNCE_MS),
                ..WatcherConfig::default()
            },
            updates_buffer: 10,
            ..CoordinatorConfig::default()
        };
        let coordinator =
            SyncCoordinator::new(Arc::new(store.clone()), Arc::new(credentials), config).unwrap();
        assert_ok!(coordinator.start().await);

        Self {
            credentials_dir,
            _project_dir: project_dir,
            root,
            store,
            coordinator,
        }
    }

    async fn signed_in() -> Self {
        let harness = Self::new().await;
        assert_ok!(
            harness
                .coordinator
                .authenticate("session-token".to_string(), user())
                .await
        );
        assert_ok!(harness.coordinator.set_active_team(team()).await);
        harness
    }

    async fn enabled() -> Self {
        let harness = Self::signed_in().await;
        assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);
        harness
    }

    fn credentials(&self) -> FileCredentialStore {
        FileCredentialStore::new(self.credentials_dir.path().join("credentials.json"))
    }

    async fn saved_credentials(&self) -> Option<Credentials> {
        self.credentials().load().await.unwrap()
    }

    /// A second coordinator sharing the store and the credentials file, as after a restart.
    fn restarted(&self) -> SyncCoordinator {
        SyncCoordinator::new(
            Arc::new(self.store.clone()),
            Arc::new(self.credentials()),
            CoordinatorConfig::default(),
        )
        .unwrap()
    }

    fn local_event(&self, relative: &str) -> FileChangeEvent {
        FileChangeEvent {
            project_id: "p1".to_string(),
            project_path: self.root.clone(),
            absolute_path: self.path(relative),
            relative_path: relative.to_string(),
            resource: ResourceKind::Tasks,
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn write(&self, relative: &str, contents: &str) {
        let path = self.path(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn notify(&self, relative: &str) {
        self.coordinator
            .watcher()
            .handle_notification("p1", &self.path(relative));
    }

    fn pushes(&self, name: &str) -> Vec<Value> {
        self.store
            .mutations_named(name)
            .into_iter()
            .map(|call| call.args)
            .collect()
    }

    async fn publish(&self, name: &str, value: Value) {
        self.store
            .publish(name, json!({ "projectId": REMOTE_PROJECT }), value)
            .await;
    }
}

fn user() -> SyncUser {
    SyncUser {
        id: "user-1".to_string(),
        email: "dev@example.com".to_string(),
        name: None,
    }
}

fn team() -> SyncTeam {
    SyncTeam {
        id: "team-1".to_string(),
        name: "Core".to_string(),
        role: TeamRole::Owner,
        member_count: Some(3),
    }
}

fn task_key(spec_id: &str) -> RevisionKey {
    RevisionKey::new("p1", ResourceKind::Tasks, spec_id)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..150 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS * 3)).await;
}

fn exists(path: &Path) -> bool {
    path.exists()
}

#[tokio::test]
async fn test_enable_without_team_is_not_authorized() {
    let harness = Harness::new().await;

    let err = assert_err!(harness.coordinator.enable_sync("p1", &harness.root).await);
    assert!(matches!(err, SyncError::NotAuthorized(_)));

    assert!(!harness.coordinator.is_sync_enabled("p1"));
    assert!(!harness.coordinator.watcher().is_watching("p1"));
    assert_eq!(harness.store.subscriber_count(), 0);
    assert!(harness.store.mutations().is_empty());
}

#[tokio::test]
async fn test_enable_upserts_project_and_subscribes() {
    let harness = Harness::enabled().await;

    let upserts = harness.pushes("projects:upsertProject");
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0]["teamId"], "team-1");
    assert_eq!(upserts[0]["projectHash"].as_str().unwrap().len(), 16);

    assert!(harness.coordinator.is_sync_enabled("p1"));
    assert!(harness.coordinator.watcher().is_watching("p1"));
    assert_eq!(harness.store.subscriber_count(), 4);
    assert_eq!(
        harness.coordinator.remote_project_id("p1").as_deref(),
        Some(REMOTE_PROJECT)
    );

    let status = harness.coordinator.status();
    assert_eq!(status.mode, SyncMode::Syncing);
    assert_eq!(status.synced_projects, vec!["p1".to_string()]);

    // Re-enabling replaces the previous sync instead of stacking subscriptions
    assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);
    assert_eq!(harness.store.subscriber_count(), 4);

    assert_ok!(harness.coordinator.disable_sync("p1").await);
    assert_ok!(harness.coordinator.disable_sync("p1").await);
    assert_eq!(harness.store.subscriber_count(), 0);
    assert!(!harness.coordinator.watcher().is_watching("p1"));
    assert_eq!(harness.coordinator.status().mode, SyncMode::Idle);
}

#[tokio::test]
async fn test_failed_enable_leaves_nothing_behind() {
    let harness = Harness::signed_in().await;

    let err = assert_err!(
        harness
            .coordinator
            .enable_sync("p1", &harness.root.join("missing"))
            .await
    );
    assert!(matches!(err, SyncError::FileSystem { .. }));
    assert!(!harness.coordinator.is_sync_enabled("p1"));
    assert_eq!(harness.store.subscriber_count(), 0);
}

#[tokio::test]
async fn test_debounced_local_change_pushes_once() {
    let harness = Harness::signed_in().await;
    harness.write(META, r#"{"title":"Login","status":"in_progress"}"#);
    assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);
    harness
        .coordinator
        .revisions()
        .set(&task_key("001-login"), RevisionRecord::new(5, 5, "user-1"));

    for _ in 0..3 {
        harness.notify(META);
    }

    wait_until("task push", || !harness.pushes("tasks:upsertTask").is_empty()).await;
    settle().await;

    let pushes = harness.pushes("tasks:upsertTask");
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0]["specId"], "001-login");
    assert_eq!(pushes[0]["title"], "Login");
    assert_eq!(pushes[0]["status"], "in_progress");
    assert_eq!(pushes[0]["updatedAt"], 6);
    assert_eq!(pushes[0]["updatedBy"], "user-1");
    assert_eq!(pushes[0]["projectId"], REMOTE_PROJECT);
    assert_eq!(
        harness
            .coordinator
            .revisions()
            .get(&task_key("001-login"))
            .unwrap()
            .revision,
        6
    );
}

#[tokio::test]
async fn test_blocked_files_are_never_pushed() {
    let harness = Harness::signed_in().await;
    harness.write(".auto-claude/insights/sessions/credentials.json", "{}");
    assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);

    harness.notify(".auto-claude/insights/sessions/credentials.json");
    settle().await;
    assert!(harness.pushes("insights:upsertSession").is_empty());
}

#[tokio::test]
async fn test_stale_remote_revision_is_rejected() {
    let harness = Harness::enabled().await;
    let mut conflicts = harness.coordinator.subscribe_conflicts();
    harness
        .coordinator
        .revisions()
        .set(&task_key("001-login"), RevisionRecord::new(100, 100, "user-1"));

    harness
        .publish(
            "tasks:getProjectTasks",
            json!([{
                "specId": "001-login",
                "metadata": { "title": "Remote" },
                "updatedAt": 100,
                "updatedBy": "user-2",
            }]),
        )
        .await;

    let conflict = tokio::time::timeout(Duration::from_secs(2), conflicts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conflict.current_revision, 100);
    assert_eq!(conflict.incoming_revision, 100);
    assert_eq!(conflict.remote_actor, "user-2");
    assert!(!exists(&harness.path(META)));
    assert_eq!(
        harness
            .coordinator
            .revisions()
            .get(&task_key("001-login"))
            .unwrap()
            .updated_by,
        "user-1"
    );
}

#[tokio::test]
async fn test_remote_update_is_written_without_echo_push() {
    let harness = Harness::enabled().await;

    harness
        .publish(
            "tasks:getProjectTasks",
            json!([{
                "specId": "001-login",
                "metadata": { "title": "Remote" },
                "specContent": "# Login",
                "updatedAt": 2000,
                "updatedBy": "user-2",
            }]),
        )
        .await;

    wait_until("remote spec write", || exists(&harness.path(".auto-claude/specs/001-login/spec.md"))).await;
    settle().await;

    let metadata: Value =
        serde_json::from_str(&std::fs::read_to_string(harness.path(META)).unwrap()).unwrap();
    assert_eq!(metadata["title"], "Remote");
    assert_eq!(
        harness
            .coordinator
            .revisions()
            .get(&task_key("001-login"))
            .unwrap()
            .revision,
        2000
    );
    assert!(harness.pushes("tasks:upsertTask").is_empty());
}

#[tokio::test]
async fn test_round_trip_does_not_rewrite_local_file() {
    let harness = Harness::signed_in().await;
    let original = r#"{"title":"Login"}"#;
    harness.write(META, original);
    assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);

    harness.notify(META);
    wait_until("task push", || !harness.pushes("tasks:upsertTask").is_empty()).await;
    let pushed = harness.pushes("tasks:upsertTask").remove(0);

    // The server echoes the record back, normalized differently
    let mut echoed = pushed.clone();
    echoed["metadata"] = json!({ "title": "Login", "normalized": true });
    let report = harness
        .coordinator
        .handle_remote_change("p1", ResourceKind::Tasks, json!([echoed]))
        .await;

    assert_eq!(report.skipped, 1);
    assert_eq!(std::fs::read_to_string(harness.path(META)).unwrap(), original);
}

#[tokio::test]
async fn test_force_pull_writes_everything_without_local_state() {
    let harness = Harness::enabled().await;
    let args = json!({ "projectId": REMOTE_PROJECT });
    harness.store.set_query_result(
        "tasks:getProjectTasks",
        args.clone(),
        json!([{ "specId": "002-api", "specContent": "# API", "updatedAt": 10 }]),
    );
    harness.store.set_query_result(
        "insights:getSessions",
        args.clone(),
        json!([{ "sessionId": "s1", "title": "Chat", "messages": [], "updatedAt": 11 }]),
    );
    harness.store.set_query_result(
        "roadmap:getRoadmap",
        args.clone(),
        json!({ "features": [{ "id": "f1" }], "updatedAt": 12 }),
    );
    harness.store.set_query_result(
        "ideation:getIdeation",
        args,
        json!({ "ideas": [], "config": { "mode": "fast" }, "updatedAt": 13 }),
    );

    let report = assert_ok!(harness.coordinator.force_pull("p1").await);
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.succeeded, 4);

    assert!(exists(&harness.path(".auto-claude/specs/002-api/spec.md")));
    assert!(exists(&harness.path(".auto-claude/insights/sessions/s1.json")));
    assert!(exists(&harness.path(".auto-claude/roadmap/roadmap.json")));
    let ideation: Value = serde_json::from_str(
        &std::fs::read_to_string(harness.path(".auto-claude/ideation/ideation.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(ideation["config"]["mode"], "fast");

    let revisions = harness.coordinator.revisions();
    assert_eq!(revisions.get(&task_key("002-api")).unwrap().revision, 10);
    assert_eq!(
        revisions
            .get(&RevisionKey::singleton("p1", ResourceKind::Ideation))
            .unwrap()
            .revision,
        13
    );

    let kinds: Vec<UpdateKind> = harness
        .coordinator
        .recent_updates()
        .iter()
        .map(|u| u.kind)
        .collect();
    assert_eq!(kinds[0], UpdateKind::SyncFinished);
}

#[tokio::test]
async fn test_force_push_reports_per_file_failures() {
    let harness = Harness::signed_in().await;
    harness.write(META, r#"{"title":"Login"}"#);
    harness.write(".auto-claude/roadmap/roadmap.json", "{broken");
    assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);

    let report = assert_ok!(harness.coordinator.force_push("p1").await);
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.summary(), "1 of 2 resources failed to sync");
    assert_eq!(harness.pushes("tasks:upsertTask").len(), 1);

    let latest = &harness.coordinator.recent_updates()[0];
    assert_eq!(latest.kind, UpdateKind::SyncError);
    assert_eq!(latest.message, "1 of 2 resources failed to sync");
}

#[tokio::test]
async fn test_failed_push_keeps_revision_bump() {
    let harness = Harness::signed_in().await;
    harness.write(META, r#"{"title":"Login"}"#);
    assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);
    harness.store.set_fail_mutations(true);

    harness.notify(META);
    wait_until("revision bump", || {
        harness.coordinator.revisions().get(&task_key("001-login")).is_some()
    })
    .await;
    wait_until("sync error update", || {
        harness
            .coordinator
            .recent_updates()
            .iter()
            .any(|u| u.kind == UpdateKind::SyncError)
    })
    .await;
    assert_eq!(
        harness
            .coordinator
            .revisions()
            .get(&task_key("001-login"))
            .unwrap()
            .revision,
        1
    );

    harness.store.set_fail_mutations(false);
    let report = assert_ok!(harness.coordinator.force_push("p1").await);
    assert!(report.is_success());
    assert_eq!(harness.pushes("tasks:upsertTask")[0]["updatedAt"], 2);
}

#[tokio::test]
async fn test_no_writes_after_disable() {
    let harness = Harness::signed_in().await;
    harness.write(META, r#"{"title":"Login"}"#);
    assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);

    harness.notify(META);
    assert_ok!(harness.coordinator.disable_sync("p1").await);
    assert_eq!(harness.coordinator.watcher().pending_timers(), 0);

    harness
        .publish(
            "roadmap:getRoadmap",
            json!({ "features": [], "updatedAt": 50 }),
        )
        .await;
    let report = harness
        .coordinator
        .handle_remote_change("p1", ResourceKind::Roadmap, json!({ "features": [], "updatedAt": 50 }))
        .await;
    settle().await;

    assert_eq!(report.attempted, 0);
    assert!(!exists(&harness.path(".auto-claude/roadmap/roadmap.json")));
    assert!(harness.pushes("tasks:upsertTask").is_empty());
}

#[tokio::test]
async fn test_remote_tombstone_removes_local_file() {
    let harness = Harness::signed_in().await;
    let session = ".auto-claude/insights/sessions/s1.json";
    harness.write(session, r#"{"title":"Chat"}"#);
    assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);

    let report = harness
        .coordinator
        .handle_remote_change(
            "p1",
            ResourceKind::Insights,
            json!([
                { "sessionId": "s1", "updatedAt": 30, "deletedAt": 30, "deletedBy": "user-2" },
                { "sessionId": "../escape", "updatedAt": 30 },
            ]),
        )
        .await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failures.len(), 1);
    assert!(!exists(&harness.path(session)));
    let record = harness
        .coordinator
        .revisions()
        .get(&RevisionKey::new("p1", ResourceKind::Insights, "s1"))
        .unwrap();
    assert_eq!(record.deleted_by.as_deref(), Some("user-2"));

    settle().await;
    assert!(harness.pushes("insights:upsertSession").is_empty());
}

#[tokio::test]
async fn test_project_settings_push_bumps_revision() {
    let harness = Harness::enabled().await;

    assert_ok!(
        harness
            .coordinator
            .push_project_settings("p1", json!({ "model": "fast" }))
            .await
    );
    assert_ok!(
        harness
            .coordinator
            .push_project_settings("p1", json!({ "model": "slow" }))
            .await
    );

    let upserts = harness.pushes("projects:upsertProject");
    assert_eq!(upserts.len(), 3);
    assert_eq!(upserts[2]["settings"]["model"], "slow");
    assert_eq!(upserts[2]["updatedAt"], 2);

    let err = assert_err!(
        harness
            .coordinator
            .push_project_settings("other", json!({}))
            .await
    );
    assert!(matches!(err, SyncError::NotEnabled(_)));
}

#[tokio::test]
async fn test_auth_failure_moves_to_error_until_fresh_sign_in() {
    let harness = Harness::new().await;
    harness.store.reject_token("bad-token");

    let err = assert_err!(
        harness
            .coordinator
            .authenticate("bad-token".to_string(), user())
            .await
    );
    assert!(matches!(err, SyncError::AuthExchangeFailed(_)));
    let status = harness.coordinator.status();
    assert_eq!(status.mode, SyncMode::Error);
    assert!(!status.authenticated);
    assert!(status.error.is_some());

    assert_ok!(
        harness
            .coordinator
            .authenticate("good-token".to_string(), user())
            .await
    );
    let status = harness.coordinator.status();
    assert_eq!(status.mode, SyncMode::Idle);
    assert!(status.authenticated);
    assert!(status.error.is_none());
}

#[tokio::test]
async fn test_sign_out_disables_everything() {
    let harness = Harness::enabled().await;
    harness
        .coordinator
        .revisions()
        .set(&task_key("001-login"), RevisionRecord::new(3, 3, "user-1"));

    assert_ok!(harness.coordinator.sign_out().await);

    assert!(!harness.coordinator.is_sync_enabled("p1"));
    assert!(harness.coordinator.revisions().is_empty());
    assert_eq!(harness.store.subscriber_count(), 0);
    assert!(harness.store.auth_token().is_none());
    let status = harness.coordinator.status();
    assert!(!status.authenticated);
    assert!(status.active_team.is_none());
    assert_eq!(status.mode, SyncMode::Disabled);
}

#[tokio::test]
async fn test_recent_updates_are_bounded_and_newest_first() {
    let harness = Harness::enabled().await;
    for _ in 0..12 {
        assert_ok!(harness.coordinator.disable_sync("p1").await);
        assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);
    }

    let recent = harness.coordinator.recent_updates();
    assert_eq!(recent.len(), 10);
    assert_eq!(recent[0].kind, UpdateKind::SyncEnabled);
    assert!(recent.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
}

#[tokio::test]
async fn test_session_is_restored_on_start() {
    let credentials_dir = TempDir::new().unwrap();
    let path = credentials_dir.path().join("credentials.json");
    let store = MemoryRemoteStore::new();

    let first = SyncCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(FileCredentialStore::new(&path)),
        CoordinatorConfig::default(),
    )
    .unwrap();
    assert_ok!(first.authenticate("session-token".to_string(), user()).await);
    assert_ok!(first.set_active_team(team()).await);
    first.shutdown().await;
    assert_eq!(first.status().mode, SyncMode::Disabled);

    let second = SyncCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(FileCredentialStore::new(&path)),
        CoordinatorConfig::default(),
    )
    .unwrap();
    assert_ok!(second.start().await);

    let status = second.status();
    assert!(status.authenticated);
    assert_eq!(status.mode, SyncMode::Idle);
    assert_eq!(status.user.unwrap().id, "user-1");
    assert_eq!(status.active_team.unwrap().id, "team-1");
    assert_eq!(store.auth_token().as_deref(), Some("session-token"));
}

#[tokio::test]
async fn test_reauthentication_keeps_active_team() {
    let harness = Harness::signed_in().await;

    assert_ok!(
        harness
            .coordinator
            .authenticate("refreshed-token".to_string(), user())
            .await
    );

    assert_eq!(harness.coordinator.status().active_team.unwrap().id, "team-1");
    assert_ok!(harness.coordinator.enable_sync("p1", &harness.root).await);
    let saved = harness.saved_credentials().await.unwrap();
    assert_eq!(saved.session_token, "refreshed-token");
    assert_eq!(saved.active_team_id.as_deref(), Some("team-1"));
}

#[tokio::test]
async fn test_other_user_does_not_inherit_team() {
    let harness = Harness::signed_in().await;
    let other = SyncUser {
        id: "user-2".to_string(),
        email: "other@example.com".to_string(),
        name: None,
    };

    assert_ok!(harness.coordinator.authenticate("other-token".to_string(), other).await);

    assert!(harness.coordinator.status().active_team.is_none());
    assert!(harness.saved_credentials().await.unwrap().active_team_id.is_none());
    let err = assert_err!(harness.coordinator.enable_sync("p1", &harness.root).await);
    assert!(matches!(err, SyncError::NotAuthorized(_)));
}

#[tokio::test]
async fn test_unreachable_store_keeps_saved_session() {
    let harness = Harness::signed_in().await;
    harness.store.set_offline(true);

    let restarted = harness.restarted();
    let err = assert_err!(restarted.start().await);
    assert!(matches!(err, SyncError::Transport(_)));
    assert_eq!(restarted.status().mode, SyncMode::Error);
    let saved = harness.saved_credentials().await.unwrap();
    assert_eq!(saved.session_token, "session-token");
    assert_eq!(saved.active_team_id.as_deref(), Some("team-1"));

    // Back online, the same saved session restores.
    harness.store.set_offline(false);
    assert_ok!(restarted.start().await);
    let status = restarted.status();
    assert!(status.authenticated);
    assert_eq!(status.mode, SyncMode::Idle);
    assert_eq!(status.active_team.unwrap().id, "team-1");
}

#[tokio::test]
async fn test_rejected_saved_session_is_cleared() {
    let harness = Harness::signed_in().await;
    harness.store.reject_token("session-token");

    let restarted = harness.restarted();
    let err = assert_err!(restarted.start().await);
    assert!(matches!(err, SyncError::AuthExchangeFailed(_)));
    assert_eq!(restarted.status().mode, SyncMode::Error);
    assert!(!harness.saved_credentials().await.unwrap().has_session());
}

#[tokio::test]
async fn test_expired_session_moves_to_error() {
    let harness = Harness::enabled().await;

    harness.store.expire_session("session revoked");

    wait_until("error mode", || harness.coordinator.status().mode == SyncMode::Error).await;
    let status = harness.coordinator.status();
    assert!(!status.authenticated);
    assert!(!status.connected);
    assert!(status.error.unwrap().contains("session revoked"));
    assert!(harness
        .coordinator
        .recent_updates()
        .iter()
        .any(|update| update.kind == UpdateKind::SyncError));

    // A fresh sign-in recovers without re-enabling the project.
    assert_ok!(
        harness
            .coordinator
            .authenticate("new-token".to_string(), user())
            .await
    );
    let status = harness.coordinator.status();
    assert!(status.authenticated);
    assert_eq!(status.mode, SyncMode::Syncing);
    assert!(harness.coordinator.is_sync_enabled("p1"));
}

#[tokio::test]
async fn test_connection_loss_and_restore_update_status() {
    let harness = Harness::enabled().await;

    harness
        .store
        .emit_connection(ConnectionEvent::Lost("connection reset".to_string()));
    wait_until("disconnected", || !harness.coordinator.status().connected).await;
    assert_eq!(harness.coordinator.status().mode, SyncMode::Syncing);

    harness.store.emit_connection(ConnectionEvent::Restored);
    wait_until("reconnected", || harness.coordinator.status().connected).await;
    assert!(harness
        .coordinator
        .recent_updates()
        .iter()
        .any(|update| update.kind == UpdateKind::Disconnected));
}

#[tokio::test]
async fn test_unauthorized_push_moves_to_error() {
    let harness = Harness::enabled().await;
    harness.write(META, r#"{"title":"Login"}"#);
    harness.store.revoke_session();

    harness.notify(META);

    wait_until("error mode", || harness.coordinator.status().mode == SyncMode::Error).await;
    let status = harness.coordinator.status();
    assert!(!status.authenticated);
    assert!(status.error.is_some());
    assert!(harness.pushes("tasks:upsertTask").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pushes_of_one_artifact_stay_ordered() {
    let harness = Harness::enabled().await;
    harness.write(META, r#"{"title":"Login"}"#);
    harness
        .coordinator
        .revisions()
        .set(&task_key("001-login"), RevisionRecord::new(5, 5, "user-1"));

    let pushes = (0..5).map(|_| {
        let coordinator = harness.coordinator.clone();
        let event = harness.local_event(META);
        tokio::spawn(async move { coordinator.handle_local_file_change(event).await })
    });
    for result in futures::future::join_all(pushes).await {
        assert_ok!(result.unwrap());
    }

    let revisions: Vec<i64> = harness
        .pushes("tasks:upsertTask")
        .iter()
        .map(|args| args["updatedAt"].as_i64().unwrap())
        .collect();
    assert_eq!(revisions, vec![6, 7, 8, 9, 10]);
    assert_eq!(
        harness
            .coordinator
            .revisions()
            .get(&task_key("001-login"))
            .unwrap()
            .revision,
        10
    );
}
