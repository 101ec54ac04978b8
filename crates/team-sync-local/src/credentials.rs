use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use team_sync_core::{CredentialStore, Credentials, SyncError};
use tracing::{debug, instrument};

const DEFAULT_DIR: &str = ".team-sync";
const DEFAULT_FILE: &str = "credentials.json";

/// Credentials persisted as a JSON file readable only by the current user.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.team-sync/credentials.json`, or a relative path when there is no home directory.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_DIR)
            .join(DEFAULT_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    fn read_blocking(path: &Path) -> Result<Option<Credentials>, SyncError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::fs(path, e)),
        };
        let credentials = serde_json::from_str(&content)
            .map_err(|e| SyncError::parse(path.display().to_string(), e))?;
        Ok(Some(credentials))
    }

    fn write_blocking(path: &Path, lock_path: &Path, credentials: &Credentials) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| SyncError::fs(lock_path, e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| SyncError::fs(lock_path, e))?;

        let json = serde_json::to_string_pretty(credentials)
            .map_err(|e| SyncError::parse(path.display().to_string(), e))?;
        let temp = path.with_extension("json.tmp");
        let result = fs::write(&temp, json)
            .and_then(|_| restrict_permissions(&temp))
            .and_then(|_| fs::rename(&temp, path))
            .map_err(|e| SyncError::fs(path, e));

        let _ = FileExt::unlock(&lock_file);
        result
    }

    async fn read(&self) -> Result<Option<Credentials>, SyncError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::read_blocking(&path))
            .await
            .map_err(|e| SyncError::fs(&self.path, std::io::Error::other(e)))?
    }

    async fn write(&self, credentials: Credentials) -> Result<(), SyncError> {
        let path = self.path.clone();
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || Self::write_blocking(&path, &lock_path, &credentials))
            .await
            .map_err(|e| SyncError::fs(&self.path, std::io::Error::other(e)))?
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    #[instrument(skip(self, credentials), level = "debug")]
    async fn save(&self, credentials: &Credentials) -> Result<(), SyncError> {
        self.write(credentials.clone()).await?;
        debug!("Saved credentials to {}", self.path.display());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn load(&self) -> Result<Option<Credentials>, SyncError> {
        self.read().await
    }

    #[instrument(skip(self), level = "debug")]
    async fn clear(&self) -> Result<(), SyncError> {
        let Some(existing) = self.read().await? else {
            return Ok(());
        };
        self.write(Credentials {
            device_id: existing.device_id,
            ..Credentials::default()
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_or_create_device_id(&self) -> Result<String, SyncError> {
        let mut credentials = self.read().await?.unwrap_or_default();
        if !credentials.device_id.is_empty() {
            return Ok(credentials.device_id);
        }

        credentials.device_id = uuid::Uuid::new_v4().to_string();
        self.write(credentials.clone()).await?;
        debug!("Created device id {}", credentials.device_id);
        Ok(credentials.device_id)
    }
}
