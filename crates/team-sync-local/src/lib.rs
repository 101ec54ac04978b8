//! Local side of team project sync.
//!
//! - `FileWatcher`: debounced, classified change detection with echo suppression
//! - `layout`: where each resource lives on disk and how it maps to remote calls
//! - `FileCredentialStore`: session persistence in the user's home directory
//! - `SyncCoordinator`: the orchestrator tying watcher, revisions and remote store together

mod coordinator;
mod credentials;
pub mod layout;
mod watcher;

pub use coordinator::{CoordinatorConfig, SyncCoordinator};
pub use credentials::FileCredentialStore;
pub use watcher::{FileWatcher, ResourceClassifier, WatcherConfig};
