//! Realtime order synchronization client for a garment print-shop admin
//! dashboard.
//!
//! The backend pushes order lifecycle events over two WebSocket endpoints
//! (public tracking and authenticated admin); this crate keeps an in-memory
//! order collection consistent with those pushes, falls back to adaptive
//! REST polling when the socket is down, and exposes the typed REST surface
//! for order, invoice and payment operations.
//!
//! Entry point is [`SyncClient`]; the individual pieces (connection manager,
//! event bus, store, poller, orders service) are public for hosts that want
//! to compose them differently.

pub mod auth;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod events;
pub mod http;
pub mod model;
pub mod polling;
pub mod protocol;
pub mod router;
pub mod store;
pub mod telemetry;

pub use client::SyncClient;
pub use config::{SyncConfig, WsConfig};
pub use error::{Result, SyncError};
pub use events::{ClientEvent, EventBus, EventKind, Subscription};
pub use model::{AccessLevel, AccessMode, ConnectionState, Order, Page, PublicOrderData};
pub use polling::{PollingConfig, SmartPoller};
pub use store::OrderStore;
