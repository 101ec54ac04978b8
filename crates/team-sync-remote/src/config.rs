use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use team_sync_local::{CoordinatorConfig, WatcherConfig};
use team_sync_remote::HttpRemoteConfig;

/// Configuration for the team-sync daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "team-sync")]
#[command(about = "Keeps local .auto-claude project data in sync with a team's shared store")]
pub struct Config {
    /// Deployment URL of the remote store
    #[arg(long, env = "TEAM_SYNC_URL")]
    pub url: String,

    /// Auth site URL used for the session token exchange
    #[arg(long, env = "TEAM_SYNC_SITE_URL")]
    pub site_url: String,

    /// Subscription polling interval (milliseconds)
    #[arg(long, default_value = "2000", env = "TEAM_SYNC_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    /// Quiet period before a local change is pushed (milliseconds)
    #[arg(long, default_value = "500", env = "TEAM_SYNC_DEBOUNCE_MS")]
    pub debounce_ms: u64,

    /// Credentials file (defaults to ~/.team-sync/credentials.json)
    #[arg(long, env = "TEAM_SYNC_CREDENTIALS_FILE")]
    pub credentials_file: Option<PathBuf>,

    /// Number of recent status updates kept in memory
    #[arg(long, default_value = "100", env = "TEAM_SYNC_UPDATES_BUFFER")]
    pub updates_buffer: usize,

    /// Session token to sign in with, replacing any saved session
    #[arg(long, env = "TEAM_SYNC_SESSION_TOKEN", hide_env_values = true)]
    pub session_token: Option<String>,

    /// Email of the signed-in user (with --session-token)
    #[arg(long, env = "TEAM_SYNC_EMAIL")]
    pub email: Option<String>,

    /// Team that synced projects are attached to
    #[arg(long, env = "TEAM_SYNC_TEAM_ID")]
    pub team_id: Option<String>,

    /// Project to sync, as `id=path` (repeatable)
    #[arg(long = "project", env = "TEAM_SYNC_PROJECTS", value_delimiter = ',')]
    pub projects: Vec<ProjectArg>,
}

/// A project to sync on startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectArg {
    pub id: String,
    pub path: PathBuf,
}

impl FromStr for ProjectArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, path) = s
            .split_once('=')
            .ok_or_else(|| format!("expected id=path, got '{}'", s))?;
        let id = id.trim();
        let path = path.trim();
        if id.is_empty() || path.is_empty() {
            return Err(format!("expected id=path, got '{}'", s));
        }
        Ok(Self {
            id: id.to_string(),
            path: PathBuf::from(path),
        })
    }
}

impl Config {
    pub fn remote(&self) -> HttpRemoteConfig {
        let mut remote = HttpRemoteConfig::new(self.url.clone(), self.site_url.clone());
        remote.poll_interval = Duration::from_millis(self.poll_interval_ms.max(100));
        remote
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            watcher: WatcherConfig {
                debounce: Duration::from_millis(self.debounce_ms),
                ..WatcherConfig::default()
            },
            updates_buffer: self.updates_buffer,
            ..CoordinatorConfig::default()
        }
    }
}
