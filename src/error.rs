//! Error taxonomy for the sync client.
//!
//! Transport and protocol failures are contained at the boundary where they
//! occur (the connection loop, the router, a single poll cycle) and surface
//! as events; only connection establishment and HTTP calls propagate errors
//! to the caller.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Socket-level open/close/error. Retried per the backoff policy unless
    /// the close was a normal disconnect or an auth-rejection code.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed JSON or an unrecognized envelope shape. Never fatal to the
    /// connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credential failed the local format check before any network call.
    #[error("invalid access token: {0}")]
    InvalidToken(&'static str),

    /// Backend rejected the credential (close code 4401/4403 or an HTTP 401
    /// that survived a refresh attempt). Never auto-retried.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// HTTP 4xx with the decoded backend message.
    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },

    /// Connection attempt did not settle within the configured timeout.
    #[error("connection timed out")]
    Timeout,

    /// Reconnect attempts exceeded the cap. Recoverable only via an explicit
    /// `force_reconnect()`.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, SyncError>;
