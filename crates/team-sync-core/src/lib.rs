//! Core traits and types for team project synchronization.
//!
//! This crate defines the pieces shared by the local engine and the remote transports:
//! - `RevisionStore`: last-writer-wins bookkeeping per `(project, resource, id)`
//! - `RemoteStore`: query / mutation / subscribe against the shared real-time store
//! - `CredentialStore`: session token and device identifier persistence
//! - `ProjectIdentity`: cross-machine project matching from the git remote
//! - `SyncUpdate` / `SyncStatus`: events and status published to the host application

mod credentials;
mod error;
mod identity;
pub mod memory;
mod remote;
mod revision;
mod types;
mod update;

pub use credentials::{CredentialStore, Credentials};
pub use error::SyncError;
pub use identity::{canonicalize_remote, project_hash, repo_slug, BindingMode, ProjectIdentity};
pub use remote::{ConnectionEvent, RemoteStore, Subscription, SubscriptionHandle};
pub use revision::{ConflictEvent, RevisionStore};
pub use types::{
    FileChangeEvent, ResourceKind, RevisionKey, RevisionRecord, SyncFailure, SyncReport,
    SINGLETON_RESOURCE_ID,
};
pub use update::{SyncMode, SyncStatus, SyncTeam, SyncUpdate, SyncUser, TeamRole, UpdateKind};
