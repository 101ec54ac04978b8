//! In-process remote store.
//!
//! Serves query results from a map, records every mutation, and lets callers
//! push new result sets to live subscriptions with [`MemoryRemoteStore::publish`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, instrument};

use crate::error::SyncError;
use crate::remote::{ConnectionEvent, RemoteStore, Subscription, SubscriptionHandle};

const SUBSCRIPTION_BUFFER: usize = 32;
const CONNECTION_BUFFER: usize = 16;

/// A mutation as received by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationCall {
    pub name: String,
    pub args: Value,
}

struct MemorySubscriber {
    key: String,
    sender: mpsc::Sender<Value>,
}

struct MemoryInner {
    results: Mutex<HashMap<String, Value>>,
    mutation_results: Mutex<HashMap<String, Value>>,
    mutations: Mutex<Vec<MutationCall>>,
    subscribers: DashMap<u64, MemorySubscriber>,
    next_subscriber: AtomicU64,
    connected: AtomicBool,
    token: Mutex<Option<String>>,
    rejected_tokens: Mutex<HashSet<String>>,
    fail_mutations: AtomicBool,
    offline: AtomicBool,
    session_expired: AtomicBool,
    connection: broadcast::Sender<ConnectionEvent>,
}

impl Default for MemoryInner {
    fn default() -> Self {
        let (connection, _) = broadcast::channel(CONNECTION_BUFFER);
        Self {
            results: Mutex::default(),
            mutation_results: Mutex::default(),
            mutations: Mutex::default(),
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            token: Mutex::default(),
            rejected_tokens: Mutex::default(),
            fail_mutations: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            session_expired: AtomicBool::new(false),
            connection,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<MemoryInner>,
}

fn result_key(name: &str, args: &Value) -> String {
    format!("{}|{}", name, args)
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the result of `name(args)` without notifying subscribers.
    pub fn set_query_result(&self, name: &str, args: Value, value: Value) {
        if let Ok(mut results) = self.inner.results.lock() {
            results.insert(result_key(name, &args), value);
        }
    }

    /// Value returned by every call of the mutation `name`. Defaults to `null`.
    pub fn set_mutation_result(&self, name: &str, value: Value) {
        if let Ok(mut results) = self.inner.mutation_results.lock() {
            results.insert(name.to_string(), value);
        }
    }

    /// Replace the result of `name(args)` and deliver it to every live subscription on it.
    pub async fn publish(&self, name: &str, args: Value, value: Value) {
        let key = result_key(name, &args);
        self.set_query_result(name, args, value.clone());

        let senders: Vec<mpsc::Sender<Value>> = self
            .inner
            .subscribers
            .iter()
            .filter(|entry| entry.value().key == key)
            .map(|entry| entry.value().sender.clone())
            .collect();

        debug!("Publishing {} to {} subscriber(s)", name, senders.len());
        for sender in senders {
            // A closed receiver only means the subscriber went away.
            let _ = sender.send(value.clone()).await;
        }
    }

    pub fn mutations(&self) -> Vec<MutationCall> {
        self.inner
            .mutations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn mutations_named(&self, name: &str) -> Vec<MutationCall> {
        self.mutations()
            .into_iter()
            .filter(|call| call.name == name)
            .collect()
    }

    pub fn clear_mutations(&self) {
        if let Ok(mut calls) = self.inner.mutations.lock() {
            calls.clear();
        }
    }

    /// Make every mutation fail with a transport error.
    pub fn set_fail_mutations(&self, fail: bool) {
        self.inner.fail_mutations.store(fail, Ordering::SeqCst);
    }

    /// Make the auth exchange fail for `token`.
    pub fn reject_token(&self, token: &str) {
        if let Ok(mut rejected) = self.inner.rejected_tokens.lock() {
            rejected.insert(token.to_string());
        }
    }

    /// Make the auth exchange fail as if the store were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject mutations as unauthorized until the next successful `set_auth_token`,
    /// without reporting anything on the connection channel.
    pub fn revoke_session(&self) {
        self.inner.session_expired.store(true, Ordering::SeqCst);
    }

    /// Drop the session server-side: report `AuthFailed` and reject mutations
    /// until the next successful `set_auth_token`.
    pub fn expire_session(&self, message: &str) {
        self.revoke_session();
        self.inner.connected.store(false, Ordering::SeqCst);
        let _ = self
            .inner
            .connection
            .send(ConnectionEvent::AuthFailed(message.to_string()));
    }

    /// Report a background connection change to whoever listens.
    pub fn emit_connection(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Lost(_) | ConnectionEvent::AuthFailed(_) => {
                self.inner.connected.store(false, Ordering::SeqCst)
            }
            ConnectionEvent::Restored => self.inner.connected.store(true, Ordering::SeqCst),
        }
        let _ = self.inner.connection.send(event);
    }

    pub fn auth_token(&self) -> Option<String> {
        self.inner.token.lock().ok().and_then(|token| token.clone())
    }

    /// Number of subscriptions that have not been canceled.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn remove_subscriber(inner: &Weak<MemoryInner>, id: u64) {
        if let Some(inner) = inner.upgrade() {
            inner.subscribers.remove(&id);
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    #[instrument(skip(self, args), level = "debug")]
    async fn query(&self, name: &str, args: Value) -> Result<Value, SyncError> {
        let key = result_key(name, &args);
        let results = self
            .inner
            .results
            .lock()
            .map_err(|_| SyncError::Transport("result map poisoned".to_string()))?;
        Ok(results.get(&key).cloned().unwrap_or(Value::Null))
    }

    #[instrument(skip(self, args), level = "debug")]
    async fn mutation(&self, name: &str, args: Value) -> Result<Value, SyncError> {
        if self.inner.session_expired.load(Ordering::SeqCst) {
            return Err(SyncError::NotAuthorized(format!("{}: session expired", name)));
        }
        if self.inner.fail_mutations.load(Ordering::SeqCst) {
            return Err(SyncError::Transport(format!("mutation {} failed", name)));
        }

        if let Ok(mut calls) = self.inner.mutations.lock() {
            calls.push(MutationCall {
                name: name.to_string(),
                args,
            });
        }

        Ok(self
            .inner
            .mutation_results
            .lock()
            .ok()
            .and_then(|results| results.get(name).cloned())
            .unwrap_or(Value::Null))
    }

    #[instrument(skip(self, args), level = "debug")]
    async fn subscribe(&self, name: &str, args: Value) -> Result<Subscription, SyncError> {
        let key = result_key(name, &args);
        let (sender, updates) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let current = self
            .inner
            .results
            .lock()
            .ok()
            .and_then(|results| results.get(&key).cloned());
        if let Some(current) = current {
            let _ = sender.try_send(current);
        }

        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .insert(id, MemorySubscriber { key, sender });

        let weak = Arc::downgrade(&self.inner);
        let handle = SubscriptionHandle::new(move || Self::remove_subscriber(&weak, id));
        Ok(Subscription { updates, handle })
    }

    async fn set_auth_token(&self, token: Option<String>) -> Result<(), SyncError> {
        if token.is_some() && self.inner.offline.load(Ordering::SeqCst) {
            self.inner.connected.store(false, Ordering::SeqCst);
            return Err(SyncError::Transport("remote store unreachable".to_string()));
        }

        let rejected = match &token {
            Some(token) => self
                .inner
                .rejected_tokens
                .lock()
                .map(|rejected| rejected.contains(token))
                .unwrap_or(false),
            None => false,
        };
        if rejected {
            self.inner.connected.store(false, Ordering::SeqCst);
            return Err(SyncError::AuthExchangeFailed(
                "token rejected by remote store".to_string(),
            ));
        }

        let connected = token.is_some();
        self.inner.session_expired.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.inner.token.lock() {
            *slot = token;
        }
        self.inner.connected.store(connected, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.subscribers.clear();
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.subscribe()
    }
}
