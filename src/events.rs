//! Typed event fan-out.
//!
//! Consumers register handlers per event kind and receive events in receipt
//! order. Handlers are plain closures; a slow handler delays delivery but a
//! handler can never corrupt connection state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::model::{ConnectionState, Order};
use crate::protocol::{
    Envelope, ErrorPayload, OrderCreated, OrderDeleted, OrderDetailsResponse, OrderInitialData,
    OrderUpdated, PaymentUpdate, ProductionUpdate, StatusUpdate, SubscriptionConfirmed,
    SystemNotification,
};

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// Everything a consumer can observe from the sync client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    // Connection lifecycle
    ConnectionEstablished(ConnectionState),
    ConnectionLost { code: u16, reason: String },
    ConnectionError { error: String },
    ConnectionReconnecting { attempt: u32, delay: Duration },

    // Order push events
    OrderCreated(OrderCreated),
    OrderUpdated(OrderUpdated),
    OrderDeleted(OrderDeleted),
    OrderStatusUpdate(StatusUpdate),
    OrderPaymentUpdate(PaymentUpdate),
    OrderProductionUpdate(ProductionUpdate),
    OrderInitialData(OrderInitialData),
    OrderDetails(OrderDetailsResponse),
    SubscriptionConfirmed(SubscriptionConfirmed),

    // System
    SystemNotification(SystemNotification),
    SystemError(ErrorPayload),

    // Every parsed inbound frame, before routing.
    RawMessage(Envelope),

    // Polling fallback
    PollingDataUpdate { orders: Vec<Order> },
    PollingPaymentActivity(Order),
    PollingStatusActivity(Order),
    PollingError { message: String, retry_count: u32 },
}

/// Registry key for handler subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionEstablished,
    ConnectionLost,
    ConnectionError,
    ConnectionReconnecting,
    OrderCreated,
    OrderUpdated,
    OrderDeleted,
    OrderStatusUpdate,
    OrderPaymentUpdate,
    OrderProductionUpdate,
    OrderInitialData,
    OrderDetails,
    SubscriptionConfirmed,
    SystemNotification,
    SystemError,
    RawMessage,
    PollingDataUpdate,
    PollingPaymentActivity,
    PollingStatusActivity,
    PollingError,
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::ConnectionEstablished(_) => EventKind::ConnectionEstablished,
            ClientEvent::ConnectionLost { .. } => EventKind::ConnectionLost,
            ClientEvent::ConnectionError { .. } => EventKind::ConnectionError,
            ClientEvent::ConnectionReconnecting { .. } => EventKind::ConnectionReconnecting,
            ClientEvent::OrderCreated(_) => EventKind::OrderCreated,
            ClientEvent::OrderUpdated(_) => EventKind::OrderUpdated,
            ClientEvent::OrderDeleted(_) => EventKind::OrderDeleted,
            ClientEvent::OrderStatusUpdate(_) => EventKind::OrderStatusUpdate,
            ClientEvent::OrderPaymentUpdate(_) => EventKind::OrderPaymentUpdate,
            ClientEvent::OrderProductionUpdate(_) => EventKind::OrderProductionUpdate,
            ClientEvent::OrderInitialData(_) => EventKind::OrderInitialData,
            ClientEvent::OrderDetails(_) => EventKind::OrderDetails,
            ClientEvent::SubscriptionConfirmed(_) => EventKind::SubscriptionConfirmed,
            ClientEvent::SystemNotification(_) => EventKind::SystemNotification,
            ClientEvent::SystemError(_) => EventKind::SystemError,
            ClientEvent::RawMessage(_) => EventKind::RawMessage,
            ClientEvent::PollingDataUpdate { .. } => EventKind::PollingDataUpdate,
            ClientEvent::PollingPaymentActivity(_) => EventKind::PollingPaymentActivity,
            ClientEvent::PollingStatusActivity(_) => EventKind::PollingStatusActivity,
            ClientEvent::PollingError { .. } => EventKind::PollingError,
        }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    handlers: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

/// Multi-consumer event bus. Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. The handler stays registered
    /// until the returned guard is dropped or `unsubscribe` is called on it.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut handlers) = self.registry.handlers.lock() {
            handlers
                .entry(kind)
                .or_default()
                .push((id, Arc::new(handler)));
        }
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Deliver an event to every handler registered for its kind. Handlers
    /// run sequentially in registration order, outside the registry lock so
    /// they may subscribe or unsubscribe re-entrantly.
    pub fn emit(&self, event: &ClientEvent) {
        let snapshot: Vec<Handler> = match self.registry.handlers.lock() {
            Ok(handlers) => handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };
        for handler in snapshot {
            handler(event);
        }
    }

    /// Number of live handlers for a kind. Diagnostic only.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry
            .handlers
            .lock()
            .map(|h| h.get(&kind).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

/// Registration guard. Dropping it removes the handler.
pub struct Subscription {
    registry: Weak<Registry>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Explicit removal; equivalent to dropping the guard.
    pub fn unsubscribe(self) {}

    fn remove(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut handlers) = registry.handlers.lock() {
                if let Some(list) = handlers.get_mut(&self.kind) {
                    list.retain(|(id, _)| *id != self.id);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn notification(message: &str) -> ClientEvent {
        ClientEvent::SystemNotification(
            serde_json::from_value(serde_json::json!({ "message": message, "type": "info" }))
                .expect("notification payload"),
        )
    }

    #[test]
    fn handlers_receive_only_their_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let _sub = bus.on(EventKind::SystemNotification, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&notification("a"));
        bus.emit(&ClientEvent::ConnectionError { error: "x".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_removes_handler() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let sub = bus.on(EventKind::SystemNotification, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&notification("a"));
        sub.unsubscribe();
        bus.emit(&notification("b"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(EventKind::SystemNotification), 0);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let _a = bus.on(EventKind::SystemNotification, move |_| {
            o1.lock().unwrap().push(1);
        });
        let _b = bus.on(EventKind::SystemNotification, move |_| {
            o2.lock().unwrap().push(2);
        });
        bus.emit(&notification("a"));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
