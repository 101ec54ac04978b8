//! Session token to transport token exchange with caching.
//!
//! The long-lived session token from sign-in is exchanged at the auth site for
//! a short-lived bearer token used on every remote function call. The bearer
//! token is cached and exchanged again shortly before it expires.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use team_sync_core::SyncError;
use tracing::{debug, info};

const EXCHANGE_PATH: &str = "/api/auth/convex/token";

/// Cached bearer token with expiration.
#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn needs_refresh(&self, margin: Duration) -> bool {
        Utc::now() >= self.expires_at - margin
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeResponse {
    token: String,
    /// Lifetime in seconds, when the auth site reports one
    expires_in: Option<i64>,
}

/// Exchanges the session token for bearer tokens.
pub struct TokenManager {
    http: reqwest::Client,
    exchange_url: String,
    ttl: Duration,
    refresh_margin: Duration,
    session: Mutex<Option<String>>,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, site_url: &str, ttl: Duration, refresh_margin: Duration) -> Self {
        Self {
            http,
            exchange_url: format!("{}{}", site_url.trim_end_matches('/'), EXCHANGE_PATH),
            ttl,
            refresh_margin,
            session: Mutex::new(None),
            cache: Mutex::new(None),
        }
    }

    /// Replace the session token and drop any cached bearer token.
    pub fn set_session(&self, session_token: Option<String>) {
        if let Ok(mut session) = self.session.lock() {
            *session = session_token;
        }
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    pub fn has_session(&self) -> bool {
        self.session
            .lock()
            .map(|session| session.is_some())
            .unwrap_or(false)
    }

    /// Bearer token for the next call, exchanging when missing or about to expire.
    ///
    /// `None` when no session is installed.
    pub async fn get_valid_token(&self) -> Result<Option<String>, SyncError> {
        let cached = self.cache.lock().ok().and_then(|cache| cache.clone());
        if let Some(cached) = cached {
            if !cached.needs_refresh(self.refresh_margin) {
                return Ok(Some(cached.token));
            }
            debug!("Bearer token expires at {}, refreshing", cached.expires_at);
        }

        if !self.has_session() {
            return Ok(None);
        }
        self.exchange().await.map(Some)
    }

    /// Exchange the session token now.
    pub async fn exchange(&self) -> Result<String, SyncError> {
        let session = self
            .session
            .lock()
            .ok()
            .and_then(|session| session.clone())
            .ok_or_else(|| SyncError::NotAuthorized("no session token".to_string()))?;

        let response = self
            .http
            .get(&self.exchange_url)
            .bearer_auth(&session)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("token request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::AuthExchangeFailed(format!(
                "session rejected ({}): {}",
                status, body
            )));
        }
        // Anything else says nothing about the session itself.
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Transport(format!(
                "token exchange returned {}: {}",
                status, body
            )));
        }

        let exchanged: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Transport(format!("invalid token response: {}", e)))?;
        if exchanged.token.is_empty() {
            return Err(SyncError::Transport("token exchange returned an empty token".to_string()));
        }

        let ttl = exchanged
            .expires_in
            .filter(|secs| *secs > 0)
            .map(Duration::seconds)
            .unwrap_or(self.ttl);
        let expires_at = Utc::now() + ttl;

        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CachedToken {
                token: exchanged.token.clone(),
                expires_at,
            });
        }

        info!("Exchanged session for bearer token, expires at {}", expires_at.to_rfc3339());
        Ok(exchanged.token)
    }

    /// Delay until the cached token should be refreshed.
    pub fn refresh_in(&self) -> std::time::Duration {
        let cached = self.cache.lock().ok().and_then(|cache| cache.clone());
        let due = match cached {
            Some(cached) => cached.expires_at - self.refresh_margin - Utc::now(),
            None => Duration::zero(),
        };
        due.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(site: &str) -> TokenManager {
        TokenManager::new(
            reqwest::Client::new(),
            site,
            Duration::minutes(15),
            Duration::minutes(1),
        )
    }

    #[test]
    fn test_needs_refresh_inside_margin() {
        let fresh = CachedToken {
            token: "t".into(),
            expires_at: Utc::now() + Duration::minutes(10),
        };
        assert!(!fresh.needs_refresh(Duration::minutes(1)));

        let expiring = CachedToken {
            token: "t".into(),
            expires_at: Utc::now() + Duration::seconds(30),
        };
        assert!(expiring.needs_refresh(Duration::minutes(1)));
    }

    #[tokio::test]
    async fn test_exchange_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/convex/token"))
            .and(header("authorization", "Bearer session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "token": "jwt-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = manager(&server.uri());
        assert_eq!(tokens.get_valid_token().await.unwrap(), None);

        tokens.set_session(Some("session".into()));
        assert_eq!(tokens.get_valid_token().await.unwrap().as_deref(), Some("jwt-1"));
        assert_eq!(tokens.get_valid_token().await.unwrap().as_deref(), Some("jwt-1"));
        assert!(tokens.refresh_in() > std::time::Duration::from_secs(13 * 60));
    }

    #[tokio::test]
    async fn test_rejected_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/convex/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired session"))
            .mount(&server)
            .await;

        let tokens = manager(&server.uri());
        tokens.set_session(Some("session".into()));
        let err = tokens.exchange().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExchangeFailed(_)));
        assert!(err.to_string().contains("expired session"));
    }

    #[tokio::test]
    async fn test_server_error_keeps_session_valid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/convex/token"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let tokens = manager(&server.uri());
        tokens.set_session(Some("session".into()));
        let err = tokens.exchange().await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert!(tokens.has_session());
    }

    #[tokio::test]
    async fn test_unreachable_site_is_transport_error() {
        let tokens = manager("http://127.0.0.1:1");
        tokens.set_session(Some("session".into()));
        let err = tokens.exchange().await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }
}
