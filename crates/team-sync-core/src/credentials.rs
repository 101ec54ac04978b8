use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Persisted session of the signed-in user on this device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub email: String,
    pub session_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_team_id: Option<String>,
    pub device_id: String,
}

impl Credentials {
    pub fn has_session(&self) -> bool {
        !self.session_token.is_empty()
    }
}

/// Storage for the session token and the device identifier.
///
/// Only consulted to obtain an authenticated transport; no sync decision depends on it.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save(&self, credentials: &Credentials) -> Result<(), SyncError>;

    async fn load(&self) -> Result<Option<Credentials>, SyncError>;

    /// Forget the session. The device identifier survives.
    async fn clear(&self) -> Result<(), SyncError>;

    async fn get_or_create_device_id(&self) -> Result<String, SyncError>;
}
