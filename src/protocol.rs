//! Wire protocol for the dashboard WebSocket endpoints.
//!
//! Every frame in either direction is a JSON envelope
//! `{ "type": ..., "payload": {...}, "timestamp": ... }`. Incoming payloads
//! are decoded into the typed structs below at the routing boundary; raw
//! `serde_json::Value` never leaks past the router.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, SyncError};
use crate::model::{de_string_or_number, AccessLevel, Order, PublicOrderData};

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

/// Normal closure. The client never reconnects after this.
pub const CLOSE_NORMAL: u16 = 1000;
/// Backend rejected the credential during the handshake.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
/// Credential valid but lacks access to the endpoint.
pub const CLOSE_FORBIDDEN: u16 = 4403;

/// True when a close code must not trigger automatic reconnection.
pub fn close_is_terminal(code: u16) -> bool {
    code == CLOSE_NORMAL || code == CLOSE_UNAUTHORIZED || code == CLOSE_FORBIDDEN
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A raw frame as received from (or sent to) the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    /// Parse a text frame. Malformed JSON or a missing `type` is a protocol
    /// error; the caller keeps the connection open and reports it.
    pub fn parse(text: &str) -> Result<Envelope> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| SyncError::Protocol(format!("malformed frame: {e}")))?;
        if envelope.kind.trim().is_empty() {
            return Err(SyncError::Protocol("frame has no type".to_string()));
        }
        Ok(envelope)
    }

    /// Decode the payload into a typed struct.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SyncError::Protocol(format!("bad {} payload: {e}", self.kind))
        })
    }
}

// ---------------------------------------------------------------------------
// Outgoing messages
// ---------------------------------------------------------------------------

/// Builder for client-to-server frames. Constructors cover the full outgoing
/// vocabulary; anything else is not part of the protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    pub kind: &'static str,
    pub payload: Value,
}

impl ClientMessage {
    pub fn ping() -> Self {
        Self { kind: "ping", payload: json!({}) }
    }

    pub fn subscribe_order_by_code(order_code: &str) -> Self {
        Self {
            kind: "subscribe_order_by_code",
            payload: json!({ "order_code": order_code }),
        }
    }

    pub fn get_order_by_code(order_code: &str) -> Self {
        Self {
            kind: "get_order_by_code",
            payload: json!({ "order_code": order_code }),
        }
    }

    pub fn unsubscribe_order(order_code: &str) -> Self {
        Self {
            kind: "unsubscribe_order",
            payload: json!({ "order_code": order_code }),
        }
    }

    /// Admin only.
    pub fn subscribe_order(order_id: u64) -> Self {
        Self {
            kind: "subscribe_order",
            payload: json!({ "order_id": order_id }),
        }
    }

    /// Admin only.
    pub fn get_order_details(order_id: u64) -> Self {
        Self {
            kind: "get_order_details",
            payload: json!({ "order_id": order_id }),
        }
    }

    /// Admin only.
    pub fn get_all_orders() -> Self {
        Self { kind: "get_all_orders", payload: json!({}) }
    }

    /// Serialize to the envelope text the server expects, stamped with the
    /// current time.
    pub fn to_frame(&self) -> String {
        json!({
            "type": self.kind,
            "payload": self.payload,
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string()
    }
}

// ---------------------------------------------------------------------------
// Incoming payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionEstablished {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfirmed {
    #[serde(default)]
    pub order_code: Option<String>,
    #[serde(default)]
    pub order_id: Option<u64>,
    #[serde(default)]
    pub message: String,
}

/// Snapshot pushed right after a subscription is confirmed. Carries either
/// the full record (admin) or the limited projection (public).
#[derive(Debug, Clone, Deserialize)]
pub struct OrderInitialData {
    #[serde(default)]
    pub order_data: Option<Order>,
    #[serde(default)]
    pub public_data: Option<PublicOrderData>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusUpdate {
    #[serde(default)]
    pub order_code: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub old_status: String,
    #[serde(default)]
    pub new_status: String,
    #[serde(default)]
    pub order_data: Option<Order>,
    #[serde(default)]
    pub public_data: Option<PublicOrderData>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentUpdate {
    #[serde(default)]
    pub order_code: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub payment_type: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub amount: String,
    #[serde(default)]
    pub order_data: Option<Order>,
    #[serde(default)]
    pub public_data: Option<PublicOrderData>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductionUpdate {
    #[serde(default)]
    pub order_code: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub old_status: String,
    #[serde(default)]
    pub new_status: String,
    #[serde(default)]
    pub order_data: Option<Order>,
    #[serde(default)]
    pub public_data: Option<PublicOrderData>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderCreated {
    pub order: Order,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderUpdated {
    pub order: Order,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderDeleted {
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub order_id: String,
    #[serde(default)]
    pub order_code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemNotification {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderDetailsResponse {
    #[serde(default)]
    pub order_code: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub order_data: Option<Order>,
    #[serde(default)]
    pub public_data: Option<PublicOrderData>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pong {
    #[serde(default)]
    pub server_time: String,
    #[serde(default)]
    pub auth_status: bool,
    #[serde(default)]
    pub access_level: String,
}

/// Consolidated admin push frame. The backend multiplexes several update
/// kinds through `admin_order_update` with a nested discriminator.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminOrderUpdate {
    #[serde(default)]
    pub update_type: String,
    #[serde(default)]
    pub order_code: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub order: Option<Order>,
    #[serde(default)]
    pub order_data: Option<Order>,
    #[serde(default)]
    pub payment_type: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub amount: String,
    #[serde(default)]
    pub old_status: String,
    #[serde(default)]
    pub new_status: String,
    #[serde(default)]
    pub message: String,
    /// Fields not covered above, forwarded verbatim on the fallback path.
    #[serde(flatten)]
    pub extra: Value,
}

/// Accept an optional id that may arrive as a number or a string.
fn de_opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected id, got {other}"
        ))),
    }
}
