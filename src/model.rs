//! Domain records mirrored from the admin dashboard backend.
//!
//! The backend serialises monetary values as decimal strings and is loose
//! about numeric types in push payloads (`quantity` may arrive as `3` or
//! `"3"`, ids as numbers or strings), so deserialization here is deliberately
//! lenient. Validation happens once, at this boundary.

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Lenient field helpers
// ---------------------------------------------------------------------------

/// Accept a JSON string or number and normalise to `String`.
pub(crate) fn de_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Accept a JSON number or numeric string and coerce to `u32` (defaults to 1
/// on unparseable input, matching the dashboard's display fallback).
pub(crate) fn de_quantity<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => Ok(n.as_u64().unwrap_or(1) as u32),
        Value::String(s) => Ok(s.trim().parse().unwrap_or(1)),
        Value::Null => Ok(1),
        other => Err(de::Error::custom(format!(
            "expected numeric quantity, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Nested payment totals some push events carry instead of the flat
/// `total_price` / `paid_amount` fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PaymentSummary {
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub total_amount: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub amount_paid: String,
}

/// Full order record (admin-visible).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Order {
    /// Opaque backend identity. May be absent in nested event payloads and
    /// synthesized from the envelope's `order_id`.
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub id: String,
    /// Human-facing business key, unique per order.
    #[serde(default)]
    pub order_code: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default = "default_quantity", deserialize_with = "de_quantity")]
    pub quantity: u32,
    /// Decimal string, e.g. `"500000"`.
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub total_price: String,
    #[serde(default)]
    pub payment_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp_percent: Option<String>,
    #[serde(default)]
    pub contact_information: String,
    #[serde(default)]
    pub notification_channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design_notes: Option<String>,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub paid_amount: String,
    #[serde(default)]
    pub is_fully_paid: bool,
    #[serde(default)]
    pub status_order: String,
    #[serde(default)]
    pub production_status: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    /// Present on some payment/status push events; preferred over the flat
    /// price fields when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_summary: Option<PaymentSummary>,
}

fn default_quantity() -> u32 {
    1
}

impl Order {
    /// Resolve the field-mapping quirks of push payloads into a store-ready
    /// record: prefer `payment_summary` totals over the flat fields, and
    /// synthesize the row id from the envelope's `order_id` when the nested
    /// payload omits it. Returns `None` when no identity can be established.
    pub fn into_normalized(mut self, fallback_id: Option<&str>) -> Option<Order> {
        if self.id.trim().is_empty() {
            match fallback_id {
                Some(fid) if !fid.trim().is_empty() => self.id = fid.trim().to_string(),
                _ => return None,
            }
        }

        if let Some(summary) = self.payment_summary.take() {
            if !summary.total_amount.trim().is_empty() {
                self.total_price = summary.total_amount;
            }
            if !summary.amount_paid.trim().is_empty() {
                self.paid_amount = summary.amount_paid;
            }
        }

        if self.total_price.trim().is_empty() {
            self.total_price = "0".to_string();
        }
        if self.paid_amount.trim().is_empty() {
            self.paid_amount = "0".to_string();
        }

        Some(self)
    }

    /// Privacy-reduced projection for unauthenticated tracking. No customer
    /// PII, no monetary detail.
    pub fn public_projection(&self) -> PublicOrderData {
        PublicOrderData {
            order_code: self.order_code.clone(),
            product_name: self.product_name.clone(),
            status_order: self.status_order.clone(),
            production_status: self.production_status.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            quantity: Some(self.quantity),
        }
    }
}

/// Limited order view for public (customer) consumers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PublicOrderData {
    pub order_code: String,
    pub product_name: String,
    pub status_order: String,
    pub production_status: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
}

// ---------------------------------------------------------------------------
// Invoices and payments (REST surface)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub invoice_code: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub order: String,
    #[serde(default)]
    pub payment_type: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub invoice_amount: String,
    #[serde(default)]
    pub invoice_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
    #[serde(default)]
    pub notification_channel: String,
    #[serde(default)]
    pub invoice_created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_expired_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_paid_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payment {
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub invoice: String,
    #[serde(default)]
    pub payment_method: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub amount: String,
    #[serde(default)]
    pub payment_time: String,
    #[serde(default)]
    pub contact_info: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Paginated listing envelope the REST API wraps collections in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Whether a connection is unauthenticated/public or authenticated/admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Public,
    Admin,
}

/// Access level as reported by the backend on `connection_established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Public,
    Authenticated,
}

impl Default for AccessLevel {
    fn default() -> Self {
        AccessLevel::Public
    }
}

/// Observable connection state, mutated only by the connection manager.
///
/// Invariant: `connected` and `connecting` are never both true.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub connecting: bool,
    pub error: Option<String>,
    pub reconnect_attempts: u32,
    pub authenticated: bool,
    pub access_level: AccessLevel,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_message: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            connected: false,
            connecting: false,
            error: None,
            reconnect_attempts: 0,
            authenticated: false,
            access_level: AccessLevel::Public,
            last_connected: None,
            last_message: None,
        }
    }
}
