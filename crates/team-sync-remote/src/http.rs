use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use team_sync_core::{ConnectionEvent, RemoteStore, Subscription, SubscriptionHandle, SyncError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::token_manager::TokenManager;

const CONNECTION_BUFFER: usize = 16;
const REFRESH_RETRY: Duration = Duration::from_secs(10);

/// Settings of the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    /// Deployment URL serving `/api/query` and `/api/mutation`
    pub url: String,
    /// Auth site URL serving the token exchange
    pub site_url: String,
    /// Interval between subscription polls
    pub poll_interval: Duration,
    /// Bearer token lifetime when the auth site does not report one
    pub token_ttl: Duration,
    /// How long before expiry the bearer token is exchanged again
    pub refresh_margin: Duration,
    /// Retries on 429 before giving up
    pub max_retries: u32,
    /// First retry delay, doubled on every attempt
    pub base_delay: Duration,
}

impl HttpRemoteConfig {
    pub fn new(url: impl Into<String>, site_url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            site_url: site_url.into(),
            poll_interval: Duration::from_secs(2),
            token_ttl: Duration::from_secs(15 * 60),
            refresh_margin: Duration::from_secs(60),
            max_retries: 5,
            base_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionResponse {
    status: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    error_message: Option<String>,
}

struct HttpInner {
    http: Client,
    base_url: String,
    config: HttpRemoteConfig,
    tokens: TokenManager,
    connected: AtomicBool,
    /// Set once the store rejected the session; cleared by the next successful exchange.
    auth_failed: AtomicBool,
    connection: broadcast::Sender<ConnectionEvent>,
    subscriptions: DashMap<u64, AbortHandle>,
    next_subscription: AtomicU64,
    refresh: Mutex<Option<AbortHandle>>,
}

/// Remote store over the deployment's HTTP function API.
///
/// Subscriptions are emulated by polling the query and delivering the result
/// whenever it differs from the last delivered one.
#[derive(Clone)]
pub struct HttpRemoteStore {
    inner: Arc<HttpInner>,
}

impl HttpRemoteStore {
    pub fn new(config: HttpRemoteConfig) -> Result<Self, SyncError> {
        let base = Url::parse(&config.url)
            .map_err(|e| SyncError::Transport(format!("invalid deployment url {}: {}", config.url, e)))?;
        Url::parse(&config.site_url)
            .map_err(|e| SyncError::Transport(format!("invalid site url {}: {}", config.site_url, e)))?;

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to build http client: {}", e)))?;

        let tokens = TokenManager::new(
            http.clone(),
            &config.site_url,
            chrono::Duration::from_std(config.token_ttl).unwrap_or(chrono::Duration::minutes(15)),
            chrono::Duration::from_std(config.refresh_margin).unwrap_or(chrono::Duration::minutes(1)),
        );

        let (connection, _) = broadcast::channel(CONNECTION_BUFFER);

        Ok(Self {
            inner: Arc::new(HttpInner {
                http,
                base_url: base.as_str().trim_end_matches('/').to_string(),
                config,
                tokens,
                connected: AtomicBool::new(false),
                auth_failed: AtomicBool::new(false),
                connection,
                subscriptions: DashMap::new(),
                next_subscription: AtomicU64::new(1),
                refresh: Mutex::new(None),
            }),
        })
    }

    /// Number of live polling subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    fn stop_refresh(&self) {
        let handle = self.inner.refresh.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Keep the bearer token fresh while the session lasts.
    ///
    /// A rejected session ends the loop; an unreachable auth site is retried.
    fn start_refresh(&self) {
        self.stop_refresh();
        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                let delay = match inner.upgrade() {
                    Some(inner) => inner.tokens.refresh_in(),
                    None => return,
                };
                tokio::time::sleep(delay.max(Duration::from_secs(1))).await;
                let Some(inner) = inner.upgrade() else { return };
                match inner.tokens.exchange().await {
                    Ok(_) => {
                        debug!("Bearer token refreshed");
                        inner.report_restored();
                    }
                    Err(SyncError::AuthExchangeFailed(message)) => {
                        warn!("Session rejected during token refresh: {}", message);
                        inner.report_auth_failure(message);
                        return;
                    }
                    Err(e) => {
                        warn!("Bearer token refresh failed, retrying: {}", e);
                        inner.report_lost(e.to_string());
                        drop(inner);
                        tokio::time::sleep(REFRESH_RETRY).await;
                    }
                }
            }
        });
        if let Ok(mut slot) = self.inner.refresh.lock() {
            *slot = Some(task.abort_handle());
        }
    }
}

impl HttpInner {
    fn report_auth_failure(&self, message: String) {
        self.connected.store(false, Ordering::SeqCst);
        if !self.auth_failed.swap(true, Ordering::SeqCst) {
            let _ = self.connection.send(ConnectionEvent::AuthFailed(message));
        }
    }

    fn report_lost(&self, message: String) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.connection.send(ConnectionEvent::Lost(message));
        }
    }

    fn report_restored(&self) {
        if self.auth_failed.load(Ordering::SeqCst) || !self.tokens.has_session() {
            return;
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.connection.send(ConnectionEvent::Restored);
        }
    }

    /// Send a request, retrying with exponential backoff while rate limited.
    async fn send_with_retry(
        &self,
        build_request: impl Fn() -> RequestBuilder,
    ) -> Result<Response, SyncError> {
        let mut delay = self.config.base_delay;

        for attempt in 0..=self.config.max_retries {
            let response = build_request()
                .send()
                .await
                .map_err(|e| SyncError::Transport(format!("request failed: {}", e)))?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            if attempt == self.config.max_retries {
                let text = response.text().await.unwrap_or_default();
                return Err(SyncError::Transport(format!(
                    "rate limited after {} retries: {}",
                    self.config.max_retries, text
                )));
            }

            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Remote store rate limited (429), retrying"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        Err(SyncError::Transport("retry loop exhausted".to_string()))
    }

    /// Call a remote function. `kind` is `query` or `mutation`.
    #[instrument(skip(self, args), level = "debug")]
    async fn call(&self, kind: &str, name: &str, args: Value) -> Result<Value, SyncError> {
        let token = self.tokens.get_valid_token().await?;
        let url = format!("{}/api/{}", self.base_url, kind);
        let body = json!({
            "path": name,
            "args": args,
            "format": "json",
        });

        let response = self
            .send_with_retry(|| {
                let request = self.http.post(&url).json(&body);
                match &token {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            })
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::NotAuthorized(format!("{} {}: {}", name, status, text)));
        }

        let text = response
            .text()
            .await
            .map_err(|e| SyncError::Transport(format!("failed to read {} response: {}", name, e)))?;
        let parsed: FunctionResponse = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                SyncError::parse(name, e)
            } else {
                SyncError::Transport(format!("{} returned {}: {}", name, status, text))
            }
        })?;

        match parsed.status.as_str() {
            "success" => Ok(parsed.value.unwrap_or(Value::Null)),
            _ => Err(SyncError::Transport(format!(
                "{} failed: {}",
                name,
                parsed
                    .error_message
                    .unwrap_or_else(|| format!("status {}", parsed.status))
            ))),
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn query(&self, name: &str, args: Value) -> Result<Value, SyncError> {
        self.inner.call("query", name, args).await
    }

    async fn mutation(&self, name: &str, args: Value) -> Result<Value, SyncError> {
        self.inner.call("mutation", name, args).await
    }

    async fn subscribe(&self, name: &str, args: Value) -> Result<Subscription, SyncError> {
        let (tx, rx) = mpsc::channel(16);
        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.poll_interval;
        let name = name.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Option<Value> = None;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                match inner.call("query", &name, args.clone()).await {
                    Ok(value) => {
                        inner.report_restored();
                        if last.as_ref() == Some(&value) {
                            continue;
                        }
                        if tx.send(value.clone()).await.is_err() {
                            break;
                        }
                        last = Some(value);
                    }
                    Err(e) if e.is_auth() => {
                        warn!("Subscription poll of {} unauthorized: {}", name, e);
                        inner.report_auth_failure(e.to_string());
                    }
                    Err(e) => {
                        warn!("Subscription poll of {} failed: {}", name, e);
                        inner.report_lost(e.to_string());
                    }
                }
            }

            if let Some(inner) = weak.upgrade() {
                inner.subscriptions.remove(&id);
            }
        });

        self.inner.subscriptions.insert(id, task.abort_handle());
        debug!("Opened polling subscription {}", id);

        let weak = Arc::downgrade(&self.inner);
        let abort = task.abort_handle();
        let handle = SubscriptionHandle::new(move || {
            abort.abort();
            if let Some(inner) = weak.upgrade() {
                inner.subscriptions.remove(&id);
            }
        });

        Ok(Subscription {
            updates: rx,
            handle,
        })
    }

    async fn set_auth_token(&self, token: Option<String>) -> Result<(), SyncError> {
        match token {
            Some(token) => {
                self.inner.tokens.set_session(Some(token));
                match self.inner.tokens.exchange().await {
                    Ok(_) => {
                        self.inner.auth_failed.store(false, Ordering::SeqCst);
                        self.inner.connected.store(true, Ordering::SeqCst);
                        self.start_refresh();
                        Ok(())
                    }
                    Err(e) => {
                        self.inner.tokens.set_session(None);
                        self.inner.connected.store(false, Ordering::SeqCst);
                        self.stop_refresh();
                        Err(e)
                    }
                }
            }
            None => {
                self.inner.tokens.set_session(None);
                self.stop_refresh();
                self.inner.connected.store(false, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.stop_refresh();
        let ids: Vec<u64> = self.inner.subscriptions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.inner.subscriptions.remove(&id) {
                handle.abort();
            }
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        debug!("Disconnected from remote store");
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.subscribe()
    }
}

impl Drop for HttpInner {
    fn drop(&mut self) {
        for entry in self.subscriptions.iter() {
            entry.value().abort();
        }
        if let Ok(mut slot) = self.refresh.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}
