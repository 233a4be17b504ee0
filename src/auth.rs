//! Session tokens and the auth REST trio (login / refresh / logout).
//!
//! Tokens live only in memory and are zeroized when the session is cleared.
//! Refresh is single-flight: concurrent callers that hit a 401 at the same
//! time share one refresh request instead of racing the backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::API_PREFIX;
use crate::error::{Result, SyncError};

/// Local shape check for a JWT: three dot-separated non-empty segments.
/// Catches obviously broken credentials before any network traffic.
pub fn is_jwt_format(token: &str) -> bool {
    let mut parts = token.split('.');
    let ok = |p: Option<&str>| p.map(|s| !s.is_empty()).unwrap_or(false);
    ok(parts.next()) && ok(parts.next()) && ok(parts.next()) && parts.next().is_none()
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

struct Session {
    access: Zeroizing<String>,
    refresh: Option<Zeroizing<String>>,
}

/// In-memory token holder shared by the HTTP client and the WebSocket
/// connection manager. The generation counter lets refresh callers detect
/// that another task already replaced the session while they waited.
#[derive(Default)]
pub struct AuthStore {
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_session(&self, access: String, refresh: Option<String>) {
        if let Ok(mut session) = self.session.lock() {
            *session = Some(Session {
                access: Zeroizing::new(access),
                refresh: refresh.map(Zeroizing::new),
            });
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop the session; the token buffers are zeroized on drop.
    pub fn clear(&self) {
        if let Ok(mut session) = self.session.lock() {
            *session = None;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn access_token(&self) -> Option<String> {
        self.session
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.access.to_string()))
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.session
            .lock()
            .ok()
            .and_then(|s| s.as_ref().and_then(|s| s.refresh.as_ref().map(|r| r.to_string())))
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Auth API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
    #[serde(default)]
    user: Value,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// Login / refresh / logout against the dashboard auth endpoints.
pub struct AuthApi {
    http: reqwest::Client,
    base_url: String,
    store: Arc<AuthStore>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl AuthApi {
    pub fn new(http: reqwest::Client, base_url: String, store: Arc<AuthStore>) -> Self {
        Self {
            http,
            base_url,
            store,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{API_PREFIX}/auth/{path}", self.base_url)
    }

    /// Authenticate and install the session into the store. Returns the
    /// user profile the backend attached to the login response.
    pub async fn login(&self, username: &str, password: &str) -> Result<Value> {
        let response = self
            .http
            .post(self.endpoint("login/"))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("login request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = decode_error_body(response).await;
            if status.as_u16() == 401 {
                return Err(SyncError::Auth(message));
            }
            return Err(SyncError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("bad login response: {e}")))?;
        self.store.set_session(body.access, body.refresh);
        info!(user = %username, "login successful");
        Ok(body.user)
    }

    /// Exchange the refresh token for a fresh access token. Single-flight:
    /// callers that arrive while a refresh is in progress wait for it and
    /// reuse its result.
    pub async fn refresh(&self) -> Result<()> {
        let generation_before = self.store.generation();
        let _guard = self.refresh_lock.lock().await;
        if self.store.generation() != generation_before {
            debug!("session already refreshed by a concurrent caller");
            return Ok(());
        }

        let refresh_token = self
            .store
            .refresh_token()
            .ok_or_else(|| SyncError::Auth("no refresh token in session".to_string()))?;

        let response = self
            .http
            .post(self.endpoint("refresh/"))
            .json(&json!({ "refresh": refresh_token }))
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = decode_error_body(response).await;
            warn!(status = status.as_u16(), "token refresh rejected");
            self.store.clear();
            return Err(SyncError::Auth(message));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("bad refresh response: {e}")))?;
        let refresh = body.refresh.or(Some(refresh_token));
        self.store.set_session(body.access, refresh);
        debug!("access token refreshed");
        Ok(())
    }

    /// Best-effort server-side logout; the local session is cleared either
    /// way.
    pub async fn logout(&self) {
        let result = self.http.post(self.endpoint("logout/")).send().await;
        if let Err(e) = result {
            warn!(error = %e, "logout request failed, clearing session anyway");
        }
        self.store.clear();
        info!("session cleared");
    }
}

/// Pull a human-readable message out of an error body, falling back to the
/// HTTP status text.
pub(crate) async fn decode_error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let fallback = || {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    };
    match response.json::<Value>().await {
        Ok(body) => body
            .get("detail")
            .or_else(|| body.get("message"))
            .or_else(|| body.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(fallback),
        Err(_) => fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_format_requires_three_nonempty_parts() {
        assert!(is_jwt_format("aaa.bbb.ccc"));
        assert!(!is_jwt_format("aaa.bbb"));
        assert!(!is_jwt_format("aaa..ccc"));
        assert!(!is_jwt_format("aaa.bbb.ccc.ddd"));
        assert!(!is_jwt_format(""));
        assert!(!is_jwt_format("no-dots-here"));
    }

    #[test]
    fn store_roundtrips_and_clears_session() {
        let store = AuthStore::new();
        assert!(!store.is_authenticated());
        assert!(store.access_token().is_none());

        store.set_session("a.b.c".into(), Some("r.e.f".into()));
        assert!(store.is_authenticated());
        assert_eq!(store.access_token().as_deref(), Some("a.b.c"));
        assert_eq!(store.refresh_token().as_deref(), Some("r.e.f"));

        store.clear();
        assert!(!store.is_authenticated());
        assert!(store.access_token().is_none());
    }

    #[test]
    fn generation_moves_on_every_session_change() {
        let store = AuthStore::new();
        let g0 = store.generation();
        store.set_session("a.b.c".into(), None);
        let g1 = store.generation();
        store.clear();
        let g2 = store.generation();
        assert!(g0 < g1 && g1 < g2);
    }
}
