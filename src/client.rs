//! Composition root.
//!
//! `SyncClient` owns one of everything — auth session, REST service,
//! connection manager, order store, poller — and wires push events into the
//! store. There is no global state; two clients in one process are two
//! independent sync pipelines.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::info;

use crate::auth::{AuthApi, AuthStore};
use crate::config::SyncConfig;
use crate::conn::ConnectionManager;
use crate::error::{Result, SyncError};
use crate::events::{ClientEvent, EventBus, EventKind, Subscription};
use crate::http::{ApiClient, OrderListParams, OrdersService};
use crate::model::{ConnectionState, Order, Page};
use crate::polling::{PollingConfig, SmartPoller};
use crate::store::OrderStore;

/// Realtime order sync client: WebSocket push with a smart-polling fallback,
/// reconciled into an observable order store.
pub struct SyncClient {
    bus: EventBus,
    auth_store: Arc<AuthStore>,
    auth_api: Arc<AuthApi>,
    orders: Arc<OrdersService>,
    conn: Arc<ConnectionManager>,
    store: OrderStore,
    poller: SmartPoller,
    // Keeps the store wiring alive for the client's lifetime.
    _wiring: Vec<Subscription>,
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Transport(format!("http client init failed: {e}")))?;

        let bus = EventBus::new();
        let auth_store = Arc::new(AuthStore::new());
        let auth_api = Arc::new(AuthApi::new(
            http.clone(),
            config.base_url.clone(),
            Arc::clone(&auth_store),
        ));
        let api = Arc::new(ApiClient::new(
            http,
            config.base_url.clone(),
            Arc::clone(&auth_store),
            Arc::clone(&auth_api),
        ));
        let orders = Arc::new(OrdersService::new(api));
        let conn = Arc::new(ConnectionManager::new(
            config.ws.clone(),
            bus.clone(),
            Arc::clone(&auth_store),
        ));
        let store = OrderStore::new();

        let fetch_orders = {
            let orders = Arc::clone(&orders);
            Arc::new(move || {
                let orders = Arc::clone(&orders);
                async move { orders.fetch_orders_payload().await }.boxed()
            })
        };
        let poller = SmartPoller::new(PollingConfig::default(), bus.clone(), fetch_orders);

        let wiring = wire_store(&bus, &store);

        Ok(Self {
            bus,
            auth_store,
            auth_api,
            orders,
            conn,
            store,
            poller,
            _wiring: wiring,
        })
    }

    // -- accessors ----------------------------------------------------------

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.on(kind, handler)
    }

    pub fn store(&self) -> &OrderStore {
        &self.store
    }

    pub fn orders(&self) -> &OrdersService {
        &self.orders
    }

    pub fn auth(&self) -> &AuthApi {
        &self.auth_api
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    pub fn poller(&self) -> &SmartPoller {
        &self.poller
    }

    // -- lifecycle ----------------------------------------------------------

    /// Authenticate against the dashboard and open the admin push channel.
    pub async fn login(&self, username: &str, password: &str) -> Result<Value> {
        let user = self.auth_api.login(username, password).await?;
        let token = self
            .auth_store
            .access_token()
            .ok_or(SyncError::InvalidToken("login produced no access token"))?;
        self.conn.connect_admin(&token).await?;
        Ok(user)
    }

    pub async fn connect_public(&self) -> Result<()> {
        self.conn.connect_public().await
    }

    pub async fn connect_admin(&self, token: &str) -> Result<()> {
        self.conn.connect_admin(token).await
    }

    pub async fn force_reconnect(&self) -> Result<()> {
        self.conn.force_reconnect().await
    }

    /// Replace the store from a REST fetch.
    pub async fn load_orders(&self, params: &OrderListParams) -> Result<Page<Order>> {
        let page = self.orders.get_orders(params).await?;
        self.store.load(page.results.clone());
        Ok(page)
    }

    /// Begin REST polling, e.g. when the push channel stays down.
    pub fn start_polling_fallback(&self) {
        self.poller.start();
    }

    pub fn stop_polling(&self) {
        self.poller.stop();
    }

    pub fn boost_polling(&self, cycles: u32) {
        self.poller.boost_polling(cycles);
    }

    /// Disconnect, stop polling and drop the session.
    pub async fn shutdown(&self) {
        self.poller.stop();
        self.conn.disconnect().await;
        self.auth_store.clear();
        info!("sync client shut down");
    }
}

/// Subscribe the store to every event that moves order data.
fn wire_store(bus: &EventBus, store: &OrderStore) -> Vec<Subscription> {
    let mut wiring = Vec::new();

    let s = store.clone();
    wiring.push(bus.on(EventKind::OrderCreated, move |event| {
        if let ClientEvent::OrderCreated(payload) = event {
            if let Some(order) = payload.order.clone().into_normalized(None) {
                s.add_order(order);
            }
        }
    }));

    let s = store.clone();
    wiring.push(bus.on(EventKind::OrderUpdated, move |event| {
        if let ClientEvent::OrderUpdated(payload) = event {
            if let Some(order) = payload.order.clone().into_normalized(None) {
                s.update_order(order);
            }
        }
    }));

    let s = store.clone();
    wiring.push(bus.on(EventKind::OrderDeleted, move |event| {
        if let ClientEvent::OrderDeleted(payload) = event {
            s.remove_order(&payload.order_id);
        }
    }));

    let s = store.clone();
    wiring.push(bus.on(EventKind::OrderStatusUpdate, move |event| {
        if let ClientEvent::OrderStatusUpdate(payload) = event {
            if let Some(record) = payload.order_data.clone() {
                if let Some(order) = record.into_normalized(payload.order_id.as_deref()) {
                    s.update_order(order);
                }
            }
        }
    }));

    let s = store.clone();
    wiring.push(bus.on(EventKind::OrderPaymentUpdate, move |event| {
        if let ClientEvent::OrderPaymentUpdate(payload) = event {
            if let Some(record) = payload.order_data.clone() {
                if let Some(order) = record.into_normalized(payload.order_id.as_deref()) {
                    s.update_order(order);
                }
            }
        }
    }));

    let s = store.clone();
    wiring.push(bus.on(EventKind::OrderProductionUpdate, move |event| {
        if let ClientEvent::OrderProductionUpdate(payload) = event {
            if let Some(record) = payload.order_data.clone() {
                if let Some(order) = record.into_normalized(payload.order_id.as_deref()) {
                    s.update_order(order);
                }
            }
        }
    }));

    let s = store.clone();
    wiring.push(bus.on(EventKind::PollingDataUpdate, move |event| {
        if let ClientEvent::PollingDataUpdate { orders } = event {
            s.load(orders.clone());
        }
    }));

    wiring
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> SyncClient {
        SyncClient::new(SyncConfig::new("https://dashboard.example.invalid")).expect("client")
    }

    fn emit(client: &SyncClient, kind: &str, payload: Value) {
        let envelope = crate::protocol::Envelope {
            kind: kind.to_string(),
            payload,
            timestamp: None,
        };
        for event in crate::router::route(crate::model::AccessMode::Admin, &envelope) {
            client.events().emit(&event);
        }
    }

    #[tokio::test]
    async fn created_orders_land_in_the_store() {
        let client = client();
        emit(
            &client,
            "order_created",
            json!({ "order": { "id": "1", "order_code": "ORD-1", "total_price": "100000" } }),
        );
        assert_eq!(client.store().len(), 1);
        assert_eq!(client.store().get("1").unwrap().order_code, "ORD-1");
    }

    #[tokio::test]
    async fn status_update_with_payment_summary_reconciles_totals() {
        let client = client();
        emit(
            &client,
            "order_created",
            json!({ "order": { "id": "7", "order_code": "ORD-7", "total_price": "100000" } }),
        );
        emit(
            &client,
            "order_status_update",
            json!({
                "order_code": "ORD-7",
                "order_id": 7,
                "new_status": "dp_dibayar",
                "order_data": {
                    "order_code": "ORD-7",
                    "status_order": "dp_dibayar",
                    "payment_summary": { "total_amount": "500000", "amount_paid": "200000" }
                }
            }),
        );
        let row = client.store().get("7").unwrap();
        assert_eq!(row.total_price, "500000");
        assert_eq!(row.paid_amount, "200000");
        assert_eq!(row.status_order, "dp_dibayar");
    }

    #[tokio::test]
    async fn deleted_orders_leave_the_store() {
        let client = client();
        emit(
            &client,
            "order_created",
            json!({ "order": { "id": "1", "order_code": "ORD-1" } }),
        );
        emit(
            &client,
            "order_deleted",
            json!({ "order_id": "1", "order_code": "ORD-1" }),
        );
        assert!(client.store().is_empty());
    }

    #[tokio::test]
    async fn polling_updates_replace_the_store() {
        let client = client();
        emit(
            &client,
            "order_created",
            json!({ "order": { "id": "1", "order_code": "ORD-1" } }),
        );
        client.events().emit(&ClientEvent::PollingDataUpdate {
            orders: vec![
                Order {
                    id: "2".into(),
                    order_code: "ORD-2".into(),
                    ..Order::default()
                },
                Order {
                    id: "3".into(),
                    order_code: "ORD-3".into(),
                    ..Order::default()
                },
            ],
        });
        assert_eq!(client.store().len(), 2);
        assert!(client.store().get("1").is_none());
    }
}
