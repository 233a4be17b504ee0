//! In-memory order collection kept consistent with push events.
//!
//! The store is the single source the UI reads order lists from. Push events
//! mutate it through the narrow operations below; REST mutations do not write
//! it and rely on the subsequent push (or polling cycle) to converge.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::model::Order;

/// Observable order collection. At most one row per order id.
///
/// Change notification is an explicit revision counter on a `watch` channel;
/// readers snapshot the collection when the revision moves.
#[derive(Clone)]
pub struct OrderStore {
    inner: Arc<Mutex<Vec<Order>>>,
    revision_tx: Arc<watch::Sender<u64>>,
}

impl Default for OrderStore {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            revision_tx: Arc::new(tx),
        }
    }
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to revision bumps. Every mutation that changed the
    /// collection increments the revision exactly once.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    fn bump(&self) {
        self.revision_tx.send_modify(|rev| *rev += 1);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Order>> {
        // Mutations are infallible; a poisoned lock means a panicked writer
        // and the data is still the last consistent snapshot.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replace the whole collection (initial REST load, polling snapshot).
    pub fn load(&self, orders: Vec<Order>) {
        {
            let mut rows = self.lock();
            *rows = orders;
        }
        self.bump();
    }

    /// Insert a new order. A row with the same id already present is treated
    /// as a duplicate event and replaced rather than appended.
    pub fn add_order(&self, order: Order) {
        {
            let mut rows = self.lock();
            if let Some(existing) = rows.iter_mut().find(|o| o.id == order.id) {
                debug!(order_id = %order.id, "duplicate create event, replacing row");
                *existing = order;
            } else {
                rows.insert(0, order);
            }
        }
        self.bump();
    }

    /// Apply an update to an existing row. Updates for unknown ids are
    /// dropped (no upsert); the row gets a fresh `updated_at` stamp.
    pub fn update_order(&self, order: Order) {
        let changed = {
            let mut rows = self.lock();
            match rows.iter_mut().find(|o| o.id == order.id) {
                Some(existing) => {
                    let mut order = order;
                    order.updated_at = Utc::now().to_rfc3339();
                    *existing = order;
                    true
                }
                None => {
                    warn!(order_id = %order.id, "update for unknown order dropped");
                    false
                }
            }
        };
        if changed {
            self.bump();
        }
    }

    /// Remove a row by id. Removing an absent id is a no-op.
    pub fn remove_order(&self, order_id: &str) {
        let changed = {
            let mut rows = self.lock();
            let before = rows.len();
            rows.retain(|o| o.id != order_id);
            rows.len() != before
        };
        if changed {
            self.bump();
        }
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.lock().iter().find(|o| o.id == order_id).cloned()
    }

    pub fn get_by_code(&self, order_code: &str) -> Option<Order> {
        self.lock()
            .iter()
            .find(|o| o.order_code == order_code)
            .cloned()
    }

    /// Full snapshot in store order (most recently created first).
    pub fn snapshot(&self) -> Vec<Order> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
