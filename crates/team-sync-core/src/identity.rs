//! Cross-machine project identity.
//!
//! Two checkouts of the same repository on different machines resolve to the
//! same hash without any shared database key: the hash is derived from the
//! canonical `origin` remote URL, or from the directory name as a fallback.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::debug;

const GIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    GitIdentity,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectIdentity {
    pub remote_url_canonical: String,
    pub repo_slug: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    pub binding_mode: BindingMode,
}

impl ProjectIdentity {
    /// Identity for a project without a usable git remote.
    pub fn from_path(project_path: &Path) -> Self {
        let name = basename(project_path);
        Self {
            remote_url_canonical: String::new(),
            repo_slug: name,
            default_branch: None,
            binding_mode: BindingMode::Manual,
        }
    }

    /// Read the `origin` remote of the repository at `project_path`.
    ///
    /// Returns `None` when the path is not a git checkout or has no `origin`.
    pub async fn resolve(project_path: &Path) -> Option<Self> {
        let remote_raw = git_output(project_path, &["remote", "get-url", "origin"]).await?;
        if remote_raw.is_empty() {
            return None;
        }

        let remote_url_canonical = canonicalize_remote(&remote_raw);
        let mut slug = repo_slug(&remote_url_canonical);
        if slug.is_empty() {
            slug = basename(project_path);
        }

        let default_branch = git_output(project_path, &["symbolic-ref", "refs/remotes/origin/HEAD"])
            .await
            .and_then(|symbolic| symbolic.rsplit('/').next().map(str::to_string))
            .filter(|branch| !branch.is_empty());

        Some(Self {
            remote_url_canonical,
            repo_slug: slug,
            default_branch,
            binding_mode: BindingMode::GitIdentity,
        })
    }

    /// Resolve from git, falling back to the directory name.
    pub async fn resolve_or_fallback(project_path: &Path) -> Self {
        match Self::resolve(project_path).await {
            Some(identity) => identity,
            None => Self::from_path(project_path),
        }
    }

    pub fn project_hash(&self) -> String {
        project_hash(&self.repo_slug)
    }
}

/// Normalize the different spellings of a remote URL to one canonical form.
pub fn canonicalize_remote(remote_url: &str) -> String {
    let trimmed = remote_url.trim();
    let mut canonical = if let Some(rest) = trimmed.strip_prefix("git@github.com:") {
        format!("https://github.com/{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("ssh://") {
        format!("https://{}", rest)
    } else {
        trimmed.to_string()
    };

    if let Some(stripped) = canonical.strip_suffix(".git") {
        canonical = stripped.to_string();
    }
    canonical.to_lowercase()
}

/// `owner/repo` part of a canonical remote URL.
pub fn repo_slug(remote_canonical: &str) -> String {
    match url::Url::parse(remote_canonical) {
        Ok(parsed) => parsed.path().trim_start_matches('/').to_string(),
        Err(_) => remote_canonical.to_string(),
    }
}

/// Stable short identifier of a slug: first 8 bytes of SHA-256, hex encoded.
pub fn project_hash(slug: &str) -> String {
    let digest = Sha256::digest(slug.as_bytes());
    hex::encode(&digest[..8])
}

fn basename(project_path: &Path) -> String {
    project_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| project_path.to_string_lossy().to_string())
}

async fn git_output(project_path: &Path, args: &[&str]) -> Option<String> {
    let mut command = Command::new("git");
    command.arg("-C").arg(project_path).args(args).kill_on_drop(true);

    let output = match tokio::time::timeout(GIT_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("git {:?} failed to run in {}: {}", args, project_path.display(), e);
            return None;
        }
        Err(_) => {
            debug!("git {:?} timed out in {}", args, project_path.display());
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
