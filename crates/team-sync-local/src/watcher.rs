//! Project artifact watcher.
//!
//! Turns raw filesystem notifications into debounced, classified
//! [`FileChangeEvent`]s. Writes performed by the engine itself are announced
//! with [`FileWatcher::mark_remote_write`] and swallowed exactly once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use team_sync_core::{FileChangeEvent, ResourceKind, SyncError};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::layout::AUTO_CLAUDE_DIR;

/// Watch patterns, relative to the project root.
const WATCH_PATTERNS: &[(&str, ResourceKind)] = &[
    (".auto-claude/specs/**/implementation_plan.json", ResourceKind::Tasks),
    (".auto-claude/specs/**/task_metadata.json", ResourceKind::Tasks),
    (".auto-claude/specs/**/task_logs.json", ResourceKind::TaskLogs),
    (".auto-claude/specs/**/spec.md", ResourceKind::Tasks),
    (".auto-claude/specs/**/qa_report.md", ResourceKind::Tasks),
    (".auto-claude/roadmap/roadmap.json", ResourceKind::Roadmap),
    (".auto-claude/ideation/ideation.json", ResourceKind::Ideation),
    (".auto-claude/insights/sessions/*.json", ResourceKind::Insights),
];

/// File names that are never synchronized, whatever the patterns say.
const BLOCKED_SUFFIXES: &[&str] = &[".env", "profiles.json", "credentials.json", "tokens.json"];

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period before a change is delivered
    pub debounce: Duration,
    /// How long an unconsumed echo mark stays armed
    pub echo_ttl: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            echo_ttl: Duration::from_secs(10),
        }
    }
}

/// Maps a project-relative path onto a resource kind.
pub struct ResourceClassifier {
    matchers: Vec<(ResourceKind, Gitignore)>,
}

impl ResourceClassifier {
    pub fn new() -> Result<Self, SyncError> {
        let mut matchers = Vec::with_capacity(WATCH_PATTERNS.len());
        for (pattern, kind) in WATCH_PATTERNS {
            let mut builder = GitignoreBuilder::new("");
            builder
                .add_line(None, pattern)
                .map_err(|e| SyncError::parse(*pattern, e))?;
            let matcher = builder.build().map_err(|e| SyncError::parse(*pattern, e))?;
            matchers.push((*kind, matcher));
        }
        Ok(Self { matchers })
    }

    pub fn classify(&self, relative_path: &str) -> Option<ResourceKind> {
        if is_blocked(relative_path) {
            return None;
        }
        self.matchers
            .iter()
            .find(|(_, matcher)| matcher.matched(relative_path, false).is_ignore())
            .map(|(kind, _)| *kind)
    }
}

fn is_blocked(relative_path: &str) -> bool {
    let name = relative_path
        .rsplit('/')
        .next()
        .unwrap_or(relative_path)
        .to_ascii_lowercase();
    BLOCKED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// `/`-separated path of `path` below `root`.
fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Any => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        // inotify reports a rename as From, To and Both; From and To already cover it.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => false,
        EventKind::Modify(_) => true,
        EventKind::Access(_) | EventKind::Other => false,
    }
}

struct PendingTimer {
    generation: u64,
    handle: AbortHandle,
}

/// State shared between the watcher, its pump tasks and the debounce timers.
struct WatcherShared {
    debounce: Duration,
    echo_ttl: Duration,
    classifier: ResourceClassifier,
    events: mpsc::Sender<FileChangeEvent>,
    echo_marks: DashMap<PathBuf, Instant>,
    timers: DashMap<(String, PathBuf), PendingTimer>,
    next_generation: AtomicU64,
}

impl WatcherShared {
    fn ingest(self: &Arc<Self>, project_id: &str, project_path: &Path, absolute_path: &Path) {
        if let Some((_, marked_at)) = self.echo_marks.remove(absolute_path) {
            if marked_at.elapsed() <= self.echo_ttl {
                debug!("Suppressed echo of engine write: {}", absolute_path.display());
                return;
            }
            debug!("Expired echo mark on {}", absolute_path.display());
        }

        let Some(relative_path) = relative_to(project_path, absolute_path) else {
            return;
        };
        let Some(resource) = self.classifier.classify(&relative_path) else {
            return;
        };

        let event = FileChangeEvent {
            project_id: project_id.to_string(),
            project_path: project_path.to_path_buf(),
            absolute_path: absolute_path.to_path_buf(),
            relative_path,
            resource,
        };
        self.schedule(event);
    }

    /// Restart the debounce timer of `(project, path)`.
    fn schedule(self: &Arc<Self>, event: FileChangeEvent) {
        let key = (event.project_id.clone(), event.absolute_path.clone());
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(self);
        let timer_key = key.clone();

        // The entry stays locked until the timer is recorded, so the task never misses it.
        let entry = self.timers.entry(key);
        if let Entry::Occupied(previous) = &entry {
            previous.get().handle.abort();
        }

        let task = tokio::spawn(async move {
            tokio::time::sleep(shared.debounce).await;

            let fired = shared
                .timers
                .remove_if(&timer_key, |_, pending| pending.generation == generation)
                .is_some();
            if !fired {
                return;
            }

            debug!(
                "Delivering {} change for {} ({})",
                event.resource, event.relative_path, event.project_id
            );
            if let Err(e) = shared.events.send(event).await {
                warn!("Dropped file change, receiver closed: {}", e);
            }
        });

        entry.insert(PendingTimer {
            generation,
            handle: task.abort_handle(),
        });
    }

    fn cancel_timers(&self, project_id: &str) {
        self.timers.retain(|(project, _), pending| {
            if project == project_id {
                pending.handle.abort();
                false
            } else {
                true
            }
        });
    }
}

struct ProjectWatch {
    project_path: PathBuf,
    // Dropping the watcher stops notify
    _watcher: RecommendedWatcher,
    pump: AbortHandle,
}

/// Watches the artifact tree of every synchronized project.
pub struct FileWatcher {
    shared: Arc<WatcherShared>,
    watches: DashMap<String, ProjectWatch>,
}

impl FileWatcher {
    /// Create a watcher delivering debounced events on `events`.
    pub fn new(config: WatcherConfig, events: mpsc::Sender<FileChangeEvent>) -> Result<Self, SyncError> {
        Ok(Self {
            shared: Arc::new(WatcherShared {
                debounce: config.debounce,
                echo_ttl: config.echo_ttl,
                classifier: ResourceClassifier::new()?,
                events,
                echo_marks: DashMap::new(),
                timers: DashMap::new(),
                next_generation: AtomicU64::new(0),
            }),
            watches: DashMap::new(),
        })
    }

    /// Start watching `project_path`, replacing any previous watch of `project_id`.
    ///
    /// Returns the canonical project root that event paths are reported under.
    pub fn watch(&self, project_id: &str, project_path: &Path) -> Result<PathBuf, SyncError> {
        self.unwatch(project_id);

        let root = std::fs::canonicalize(project_path).map_err(|e| SyncError::fs(project_path, e))?;
        if !root.is_dir() {
            return Err(SyncError::fs(
                &root,
                std::io::Error::new(std::io::ErrorKind::NotADirectory, "project path is not a directory"),
            ));
        }

        let artifacts = root.join(AUTO_CLAUDE_DIR);
        std::fs::create_dir_all(&artifacts).map_err(|e| SyncError::fs(&artifacts, e))?;

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(e) => warn!("Watch error: {}", e),
        })
        .map_err(|e| SyncError::fs(&artifacts, std::io::Error::other(e)))?;

        watcher
            .watch(&artifacts, RecursiveMode::Recursive)
            .map_err(|e| SyncError::fs(&artifacts, std::io::Error::other(e)))?;

        let shared = Arc::clone(&self.shared);
        let pump_project = project_id.to_string();
        let pump_root = root.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                if !is_relevant(&event.kind) {
                    continue;
                }
                for path in &event.paths {
                    shared.ingest(&pump_project, &pump_root, path);
                }
            }
        });

        info!("Watching {} for project {}", artifacts.display(), project_id);
        self.watches.insert(
            project_id.to_string(),
            ProjectWatch {
                project_path: root.clone(),
                _watcher: watcher,
                pump: pump.abort_handle(),
            },
        );
        Ok(root)
    }

    /// Stop watching a project and cancel its pending debounce timers.
    pub fn unwatch(&self, project_id: &str) {
        if let Some((_, watch)) = self.watches.remove(project_id) {
            watch.pump.abort();
            self.shared
                .echo_marks
                .retain(|path, _| !path.starts_with(&watch.project_path));
            debug!("Stopped watching project {}", project_id);
        }
        self.shared.cancel_timers(project_id);
    }

    pub fn close_all(&self) {
        let projects: Vec<String> = self.watches.iter().map(|w| w.key().clone()).collect();
        for project_id in projects {
            self.unwatch(&project_id);
        }
        for entry in self.shared.timers.iter() {
            entry.value().handle.abort();
        }
        self.shared.timers.clear();
        self.shared.echo_marks.clear();
    }

    /// The next notification for `absolute_path` is an echo of an engine write.
    pub fn mark_remote_write(&self, absolute_path: &Path) {
        self.shared
            .echo_marks
            .insert(absolute_path.to_path_buf(), Instant::now());
    }

    /// Withdraw a mark whose write never happened.
    pub fn clear_remote_write(&self, absolute_path: &Path) {
        self.shared.echo_marks.remove(absolute_path);
    }

    /// Feed one raw notification for `absolute_path` through the pipeline.
    ///
    /// Ignored when the project is not watched.
    pub fn handle_notification(&self, project_id: &str, absolute_path: &Path) {
        let root = match self.watches.get(project_id) {
            Some(watch) => watch.project_path.clone(),
            None => return,
        };
        self.shared.ingest(project_id, &root, absolute_path);
    }

    pub fn is_watching(&self, project_id: &str) -> bool {
        self.watches.contains_key(project_id)
    }

    pub fn pending_timers(&self) -> usize {
        self.shared.timers.len()
    }

    pub fn classifier(&self) -> &ResourceClassifier {
        &self.shared.classifier
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.close_all();
    }
}
