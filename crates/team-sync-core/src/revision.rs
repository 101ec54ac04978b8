//! Last-writer-wins revision bookkeeping.
//!
//! The store is the single authority for "is this update newer?" decisions.
//! A record is only replaced through the gated paths when the incoming revision
//! is strictly greater than the held one; ties and older revisions are conflicts.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::types::{RevisionKey, RevisionRecord};

const CONFLICT_CHANNEL_CAPACITY: usize = 256;

/// Emitted whenever a remote update is rejected.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEvent {
    pub key: RevisionKey,
    pub current_revision: i64,
    pub incoming_revision: i64,
    pub remote_actor: String,
    pub detected_at: DateTime<Utc>,
}

/// In-memory revision map keyed by `(project, resource, id)`.
pub struct RevisionStore {
    revisions: DashMap<RevisionKey, RevisionRecord>,
    conflicts: broadcast::Sender<ConflictEvent>,
}

impl Default for RevisionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionStore {
    pub fn new() -> Self {
        let (conflicts, _) = broadcast::channel(CONFLICT_CHANNEL_CAPACITY);
        Self {
            revisions: DashMap::new(),
            conflicts,
        }
    }

    pub fn get(&self, key: &RevisionKey) -> Option<RevisionRecord> {
        self.revisions.get(key).map(|r| r.clone())
    }

    /// Unconditional overwrite, for callers that already decided to apply.
    pub fn set(&self, key: &RevisionKey, record: RevisionRecord) {
        debug!(key = %key, revision = record.revision, "Revision set");
        self.revisions.insert(key.clone(), record);
    }

    /// True iff nothing is held for `key` or `incoming` is strictly newer.
    ///
    /// A rejection publishes a [`ConflictEvent`]; the caller must drop the update.
    pub fn should_apply_remote(&self, key: &RevisionKey, incoming: &RevisionRecord) -> bool {
        self.check_remote(key, incoming).is_ok()
    }

    /// Gate an incoming remote record.
    ///
    /// # Errors
    /// `SyncError::Conflict` when `incoming` is not strictly newer than the held revision.
    pub fn check_remote(&self, key: &RevisionKey, incoming: &RevisionRecord) -> Result<(), SyncError> {
        let current = match self.revisions.get(key) {
            Some(current) => current.revision,
            None => return Ok(()),
        };

        if incoming.revision > current {
            return Ok(());
        }

        warn!(
            key = %key,
            current,
            incoming = incoming.revision,
            remote_actor = %incoming.updated_by,
            "Rejected remote update (not newer than local revision)"
        );

        // No receivers is fine: conflicts are observability only.
        let _ = self.conflicts.send(ConflictEvent {
            key: key.clone(),
            current_revision: current,
            incoming_revision: incoming.revision,
            remote_actor: incoming.updated_by.clone(),
            detected_at: Utc::now(),
        });

        Err(SyncError::Conflict {
            key: key.to_string(),
            current,
            incoming: incoming.revision,
        })
    }

    /// Same rule as [`should_apply_remote`](Self::should_apply_remote) from the local direction.
    pub fn should_push_local(&self, key: &RevisionKey, local_revision: i64) -> bool {
        match self.revisions.get(key) {
            Some(current) => local_revision > current.revision,
            None => true,
        }
    }

    pub fn apply_remote_if_newer(&self, key: &RevisionKey, incoming: RevisionRecord) -> bool {
        if !self.should_apply_remote(key, &incoming) {
            return false;
        }
        self.set(key, incoming);
        true
    }

    /// Atomically advance the local revision of `key` by one (or start at 1).
    pub fn bump_local(&self, key: &RevisionKey, actor: &str) -> RevisionRecord {
        let now = Utc::now().timestamp_millis();
        match self.revisions.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let next = RevisionRecord::new(entry.get().revision + 1, now, actor);
                entry.insert(next.clone());
                next
            }
            Entry::Vacant(entry) => {
                let first = RevisionRecord::new(1, now, actor);
                entry.insert(first.clone());
                first
            }
        }
    }

    pub fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictEvent> {
        self.conflicts.subscribe()
    }

    pub fn clear(&self) {
        self.revisions.clear();
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }
}
