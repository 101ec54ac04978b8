use std::path::PathBuf;

/// Errors produced by the sync engine and its transports.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// No active session or team for an operation that needs one.
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// The store rejected the session token.
    #[error("Auth exchange failed: {0}")]
    AuthExchangeFailed(String),

    /// Network or RPC failure talking to the remote store.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An update lost the last-writer-wins check.
    #[error("Revision conflict on {key}: incoming {incoming} is not newer than {current}")]
    Conflict {
        key: String,
        current: i64,
        incoming: i64,
    },

    /// An on-disk artifact or a remote payload could not be parsed.
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },

    /// Reading or writing a local file failed.
    #[error("Filesystem error at {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The project has no active sync.
    #[error("Sync is not enabled for project {0}")]
    NotEnabled(String),

    /// A remote identifier cannot be mapped onto the local tree.
    #[error("Invalid resource identifier: {0}")]
    InvalidResource(String),
}

impl SyncError {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Errors that must reach the caller instead of being folded into a batch report.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::NotAuthorized(_) | Self::AuthExchangeFailed(_))
    }
}
