use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

use crate::error::SyncError;

type CancelFn = Box<dyn FnOnce() + Send>;

/// Cancel handle of a live subscription.
///
/// Canceling is idempotent and also happens on drop.
pub struct SubscriptionHandle {
    cancel: Mutex<Option<CancelFn>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Handle that aborts a spawned task.
    pub fn from_abort(handle: AbortHandle) -> Self {
        Self::new(move || handle.abort())
    }

    pub fn cancel(&self) {
        let cancel = self.cancel.lock().ok().and_then(|mut slot| slot.take());
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel
            .lock()
            .map(|slot| slot.is_none())
            .unwrap_or(true)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// A live query: every item on `updates` is the full current result set, not a diff.
pub struct Subscription {
    pub updates: mpsc::Receiver<Value>,
    pub handle: SubscriptionHandle,
}

/// Connection changes a transport reports on its own, outside any call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The transport can no longer reach the store; it keeps retrying.
    Lost(String),
    /// The transport reached the store again after `Lost`.
    Restored,
    /// The store rejected the session. Nothing recovers without a new sign-in.
    AuthFailed(String),
}

/// Remote real-time store abstraction.
///
/// Function names use the `module:function` form (e.g. `tasks:getProjectTasks`).
/// Implementations:
/// - `HttpRemoteStore` (HTTP API with polling subscriptions)
/// - `MemoryRemoteStore` (in-process, used by tests and offline runs)
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// One-shot read.
    async fn query(&self, name: &str, args: Value) -> Result<Value, SyncError>;

    /// Write. The caller supplies the new revision (`updatedAt`) inside `args`.
    async fn mutation(&self, name: &str, args: Value) -> Result<Value, SyncError>;

    /// Open a push-based subscription on a query.
    async fn subscribe(&self, name: &str, args: Value) -> Result<Subscription, SyncError>;

    /// Install (or clear) the session token and perform the transport handshake.
    ///
    /// # Errors
    /// `AuthExchangeFailed` when the store rejects the token, `Transport` when the
    /// exchange could not be completed (the token may still be valid).
    async fn set_auth_token(&self, token: Option<String>) -> Result<(), SyncError>;

    fn is_connected(&self) -> bool;

    /// Drop live connections; subscriptions stop delivering.
    async fn disconnect(&self);

    /// Stream of background connection changes (token refresh, subscription polls).
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}
