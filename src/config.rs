//! Endpoint configuration and URL normalisation.
//!
//! The dashboard deployment hands out a single base URL; everything else
//! (REST prefix, WebSocket endpoints, ws/wss scheme) is derived from it.

use std::time::Duration;

/// Public order-tracking WebSocket endpoint (no credential required).
pub const WS_PUBLIC_TRACKING: &str = "/ws/order/tracking/";
/// Admin orders WebSocket endpoint (JWT required).
pub const WS_ADMIN_ORDERS: &str = "/ws/admin/orders/";
/// REST API prefix.
pub const API_PREFIX: &str = "/api/v1";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the dashboard base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` or `/api/v1` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing API prefixes
    if url.ends_with("/api/v1") {
        url.truncate(url.len() - 7);
    } else if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Derive the WebSocket base URL from the HTTP base URL.
pub fn ws_base_url(http_base: &str) -> String {
    let base = normalize_base_url(http_base);
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base
    }
}

/// Percent-encode a value for use in a query string (unreserved set only).
pub fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

/// WebSocket connection tuning. Defaults match the production dashboard.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Dashboard base URL (http/https; ws scheme is derived).
    pub base_url: String,
    /// Reconnect attempt cap before the connection enters a terminal error
    /// state.
    pub reconnect_attempts: u32,
    /// Base delay for exponential reconnect backoff.
    pub reconnect_delay: Duration,
    /// Cap on the computed backoff delay.
    pub max_reconnect_delay: Duration,
    /// Application-level ping cadence once the socket is open.
    pub heartbeat_interval: Duration,
    /// How long a connection attempt may take before it is abandoned.
    pub connect_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8000".to_string(),
            reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WsConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            ..Self::default()
        }
    }
}

/// Top-level client configuration shared by the composition root.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Dashboard base URL used for both REST and WebSocket.
    pub base_url: String,
    pub ws: WsConfig,
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base = normalize_base_url(&base_url.into());
        Self {
            ws: WsConfig::new(base.clone()),
            base_url: base,
        }
    }
}
