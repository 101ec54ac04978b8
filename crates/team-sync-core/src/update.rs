use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ResourceKind;

/// Engine-wide sync mode.
///
/// `Disabled -> Idle -> Syncing -> Idle`, with `Error` reachable from any mode on an
/// unrecoverable authentication failure. `Error` only returns to `Idle` through a
/// fresh successful authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Disabled,
    Idle,
    Syncing,
    Error,
}

impl Default for SyncMode {
    fn default() -> Self {
        Self::Disabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUser {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTeam {
    pub id: String,
    pub name: String,
    pub role: TeamRole,
    #[serde(default)]
    pub member_count: Option<u32>,
}

/// Snapshot of the engine status for the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Whether the transport is connected
    pub connected: bool,
    /// Whether a session passed the transport handshake
    pub authenticated: bool,
    pub user: Option<SyncUser>,
    pub active_team: Option<SyncTeam>,
    /// Local project ids with an active sync
    pub synced_projects: Vec<String>,
    /// Pushes and forced passes currently in flight
    pub pending_changes: u32,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub mode: SyncMode,
    /// Last error message, if any
    pub error: Option<String>,
}

/// Kind of a published status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    Connected,
    Disconnected,
    AuthChanged,
    TeamChanged,
    SyncEnabled,
    SyncDisabled,
    SyncStarted,
    SyncFinished,
    SyncError,
}

/// Status/update event retained in the recent-updates buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceKind>,
    pub timestamp: DateTime<Utc>,
}

impl SyncUpdate {
    pub fn new(kind: UpdateKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            project_id: None,
            resource: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn with_resource(mut self, resource: ResourceKind) -> Self {
        self.resource = Some(resource);
        self
    }
}
