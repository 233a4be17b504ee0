//! REST client for the dashboard API.
//!
//! Three layers: `RequestCache` (TTL cache plus in-flight deduplication),
//! `ApiClient` (bearer auth, CSRF replay, 401 refresh-and-retry) and
//! `OrdersService` (the typed endpoint surface). Mutations invalidate the
//! cache but never write the order store; the store converges through push
//! events or the next poll cycle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::{header, Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{decode_error_body, AuthApi, AuthStore};
use crate::config::API_PREFIX;
use crate::error::{Result, SyncError};
use crate::model::{Invoice, Order, Page, Payment};

const ORDER_URL: &str = "/order/";
const INVOICE_URL: &str = "/invoice/";
const PAYMENT_URL: &str = "/payment/";
/// TTL for order listing responses.
const LISTING_TTL: Duration = Duration::from_secs(30);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Request cache
// ---------------------------------------------------------------------------

struct CacheEntry {
    data: Value,
    expires_at: Instant,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

#[derive(Default)]
struct CacheInner {
    entries: Mutex<HashMap<String, CacheEntry>>,
    pending: Mutex<HashMap<String, SharedFetch>>,
}

/// TTL response cache with single-flight request deduplication: at most one
/// network request per key is ever in flight, and concurrent callers share
/// its result.
#[derive(Clone, Default)]
pub struct RequestCache {
    inner: Arc<CacheInner>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable key for (url, params): params are sorted so that argument
    /// order does not split the cache.
    pub fn cache_key(url: &str, params: &[(String, String)]) -> String {
        let mut params: Vec<&(String, String)> = params.iter().collect();
        params.sort();
        let mut key = String::from(url);
        for (name, value) in params {
            key.push('&');
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        key
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = locked(&self.inner.entries);
        match entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => {
                debug!(key, "cache hit");
                Some(entry.data.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, data: Value, ttl: Duration) {
        locked(&self.inner.entries).insert(
            key.to_string(),
            CacheEntry {
                data,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Run `fetch` unless an identical request is already in flight, in
    /// which case await that one instead.
    pub async fn deduplicate<F, Fut>(&self, key: &str, fetch: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let shared = {
            let mut pending = locked(&self.inner.pending);
            match pending.get(key) {
                Some(existing) => {
                    debug!(key, "joining in-flight request");
                    existing.clone()
                }
                None => {
                    let fut: BoxFuture<'static, Result<Value>> = fetch().boxed();
                    let shared = fut.shared();
                    pending.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };
        let result = shared.await;
        locked(&self.inner.pending).remove(key);
        result
    }

    pub fn clear(&self) {
        locked(&self.inner.entries).clear();
    }

    pub fn clear_expired(&self) {
        let now = Instant::now();
        locked(&self.inner.entries).retain(|_, entry| now < entry.expires_at);
    }
}

// ---------------------------------------------------------------------------
// API client
// ---------------------------------------------------------------------------

/// Endpoints reachable without a session; everything else gets the bearer
/// header and participates in 401 refresh handling.
const PUBLIC_ENDPOINTS: [&str; 4] = [
    "/auth/login/",
    "/auth/register/",
    "/track-order/",
    "/invoice/detail/",
];

fn requires_auth(path: &str) -> bool {
    !PUBLIC_ENDPOINTS.iter().any(|p| path.starts_with(p))
}

fn friendly_transport_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else if e.is_connect() {
        SyncError::Transport("cannot reach the dashboard server".to_string())
    } else {
        SyncError::Transport(e.to_string())
    }
}

/// Thin wrapper over `reqwest` that owns the cross-cutting HTTP concerns:
/// bearer auth, the Django CSRF cookie replayed as `X-CSRFToken` on non-GET
/// requests, and the 401 → refresh → retry-once → logout sequence.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth: Arc<AuthStore>,
    auth_api: Arc<AuthApi>,
    csrf: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        auth: Arc<AuthStore>,
        auth_api: Arc<AuthApi>,
    ) -> Self {
        Self {
            http,
            base_url,
            auth,
            auth_api,
            csrf: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    pub async fn get(&self, path: &str, query: Option<&[(String, String)]>) -> Result<Value> {
        self.request(Method::GET, path, query, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Method::POST, path, None, Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Method::PATCH, path, None, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::DELETE, path, None, None).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(String, String)]>,
        body: Option<Value>,
    ) -> Result<Value> {
        let response = self.execute(&method, path, query, body.as_ref()).await?;
        self.capture_csrf(&response);

        if response.status() == StatusCode::UNAUTHORIZED && requires_auth(path) {
            debug!(path, "401 received, refreshing session");
            if let Err(refresh_err) = self.auth_api.refresh().await {
                self.auth_api.logout().await;
                return Err(refresh_err);
            }
            let retry = self.execute(&method, path, query, body.as_ref()).await?;
            self.capture_csrf(&retry);
            if retry.status() == StatusCode::UNAUTHORIZED {
                warn!(path, "still unauthorized after refresh, logging out");
                self.auth_api.logout().await;
                return Err(SyncError::Auth("session expired".to_string()));
            }
            return finish(retry).await;
        }

        finish(response).await
    }

    async fn execute(
        &self,
        method: &Method,
        path: &str,
        query: Option<&[(String, String)]>,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.request(method.clone(), self.url(path));
        if let Some(query) = query {
            request = request.query(query);
        }
        if requires_auth(path) {
            if let Some(token) = self.auth.access_token() {
                request = request.bearer_auth(token);
            }
        }
        if *method != Method::GET {
            if let Some(csrf) = locked(&self.csrf).clone() {
                request = request.header("X-CSRFToken", csrf);
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(friendly_transport_error)
    }

    /// Remember the `csrftoken` cookie the backend sets; it is replayed on
    /// subsequent mutating requests.
    fn capture_csrf(&self, response: &reqwest::Response) {
        for cookie in response.headers().get_all(header::SET_COOKIE) {
            if let Ok(text) = cookie.to_str() {
                if let Some(rest) = text.strip_prefix("csrftoken=") {
                    let token = rest.split(';').next().unwrap_or_default().to_string();
                    if !token.is_empty() {
                        *locked(&self.csrf) = Some(token);
                    }
                }
            }
        }
    }
}

async fn finish(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let message = decode_error_body(response).await;
        return Err(SyncError::Http {
            status: status.as_u16(),
            message,
        });
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let text = response
        .text()
        .await
        .map_err(|e| SyncError::Transport(format!("failed to read body: {e}")))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| SyncError::Protocol(format!("bad response body: {e}")))
}

// ---------------------------------------------------------------------------
// Orders service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct OrderListParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub status: Option<String>,
    pub customer_name: Option<String>,
    pub order_code: Option<String>,
}

impl OrderListParams {
    fn to_query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(page) = self.page {
            query.push(("page".to_string(), page.to_string()));
        }
        if let Some(page_size) = self.page_size {
            query.push(("page_size".to_string(), page_size.to_string()));
        }
        if let Some(status) = &self.status {
            query.push(("status".to_string(), status.clone()));
        }
        if let Some(customer_name) = &self.customer_name {
            query.push(("customer_name".to_string(), customer_name.clone()));
        }
        if let Some(order_code) = &self.order_code {
            query.push(("order_code".to_string(), order_code.clone()));
        }
        query
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateOrderRequest {
    pub customer_name: String,
    pub product_name: String,
    pub quantity: u32,
    pub total_price: String,
    pub payment_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dp_percent: Option<String>,
    pub contact_information: String,
    pub notification_channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub design_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualPaymentRequest {
    pub invoice_id: String,
    pub payment_method: String,
    pub amount: String,
    pub contact_info: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Typed surface over the order, invoice and payment endpoints.
///
/// Mutations clear the listing cache so the next read is fresh, but they do
/// not touch the in-memory order store; the store converges via the push
/// channel or the polling fallback.
pub struct OrdersService {
    api: Arc<ApiClient>,
    cache: RequestCache,
}

impl OrdersService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            cache: RequestCache::new(),
        }
    }

    pub fn refresh_cache(&self) {
        self.cache.clear();
        info!("orders cache cleared");
    }

    // -- orders -------------------------------------------------------------

    /// Paginated order listing, cached for 30 seconds and deduplicated
    /// across concurrent callers.
    pub async fn get_orders(&self, params: &OrderListParams) -> Result<Page<Order>> {
        let query = params.to_query();
        let key = RequestCache::cache_key(ORDER_URL, &query);
        if let Some(hit) = self.cache.get(&key) {
            return decode(hit);
        }

        let api = Arc::clone(&self.api);
        let cache = self.cache.clone();
        let dedup_key = key.clone();
        let value = self
            .cache
            .deduplicate(&key, move || async move {
                let value = api.get(ORDER_URL, Some(&query)).await?;
                cache.set(&dedup_key, value.clone(), LISTING_TTL);
                Ok(value)
            })
            .await?;
        decode(value)
    }

    /// Uncached listing fetch, used as the polling source so change
    /// detection always sees live data.
    pub async fn fetch_orders_payload(&self) -> Result<Value> {
        self.api.get(ORDER_URL, None).await
    }

    pub async fn get_order(&self, id: &str) -> Result<Order> {
        decode(self.api.get(&format!("/{id}/"), None).await?)
    }

    /// Create an order. A client request id rides along so a retried POST
    /// can be recognized server-side.
    pub async fn create_order(&self, request: &CreateOrderRequest) -> Result<Value> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| SyncError::Protocol(format!("unserializable order: {e}")))?;
        if let Some(map) = body.as_object_mut() {
            map.insert(
                "client_request_id".to_string(),
                json!(Uuid::new_v4().to_string()),
            );
        }
        let created = self.api.post("/admin/create-order/", body).await?;
        self.refresh_cache();
        Ok(created)
    }

    pub async fn update_order(&self, id: &str, patch: Value) -> Result<Order> {
        let updated = self.api.patch(&format!("/{id}/"), patch).await?;
        self.refresh_cache();
        decode(updated)
    }

    pub async fn update_production_status(&self, id: &str, production_status: &str) -> Result<Order> {
        self.update_order(id, json!({ "production_status": production_status }))
            .await
    }

    pub async fn delete_order(&self, id: &str) -> Result<()> {
        self.api.delete(&format!("/{id}/")).await?;
        self.refresh_cache();
        Ok(())
    }

    pub async fn create_payment_link(&self, order_id: &str) -> Result<Value> {
        let result = self
            .api
            .post(&format!("/{order_id}/create-payment-link/"), json!({}))
            .await?;
        self.refresh_cache();
        Ok(result)
    }

    /// Public order lookup by business code. No session required.
    pub async fn track_order(&self, order_code: &str) -> Result<Value> {
        self.api
            .get(
                "/track-order/",
                Some(&[("order_code".to_string(), order_code.trim().to_string())]),
            )
            .await
    }

    // -- invoices -----------------------------------------------------------

    pub async fn get_invoices(&self, query: &[(String, String)]) -> Result<Page<Invoice>> {
        decode(self.api.get(INVOICE_URL, Some(query)).await?)
    }

    pub async fn get_invoice(&self, id: &str) -> Result<Invoice> {
        decode(self.api.get(&format!("{INVOICE_URL}{id}/"), None).await?)
    }

    /// Public invoice detail by invoice code.
    pub async fn get_invoice_by_code(&self, invoice_code: &str) -> Result<Value> {
        self.api
            .get(&format!("{INVOICE_URL}detail/{invoice_code}/"), None)
            .await
    }

    pub async fn send_payment_link(&self, invoice_id: &str) -> Result<Value> {
        self.api
            .post(&format!("{INVOICE_URL}{invoice_id}/send-payment-link/"), json!({}))
            .await
    }

    pub async fn update_invoice(&self, id: &str, patch: Value) -> Result<Invoice> {
        let updated = self.api.patch(&format!("{INVOICE_URL}{id}/"), patch).await?;
        self.refresh_cache();
        decode(updated)
    }

    // -- payments -----------------------------------------------------------

    pub async fn get_payments(&self, query: &[(String, String)]) -> Result<Page<Payment>> {
        decode(self.api.get(PAYMENT_URL, Some(query)).await?)
    }

    pub async fn get_payment(&self, id: &str) -> Result<Payment> {
        decode(self.api.get(&format!("{PAYMENT_URL}{id}/"), None).await?)
    }

    pub async fn record_manual_payment(&self, payment: &ManualPaymentRequest) -> Result<Payment> {
        let body = serde_json::to_value(payment)
            .map_err(|e| SyncError::Protocol(format!("unserializable payment: {e}")))?;
        let recorded = self.api.post(&format!("{PAYMENT_URL}manual/"), body).await?;
        self.refresh_cache();
        decode(recorded)
    }

    // -- dashboard ----------------------------------------------------------

    pub async fn dashboard_stats(&self) -> Result<Value> {
        self.api.get("/admin/dashboard/stats/", None).await
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| SyncError::Protocol(format!("bad response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cache_key_is_order_insensitive() {
        let a = RequestCache::cache_key(
            "/order/",
            &[
                ("page".to_string(), "2".to_string()),
                ("status".to_string(), "lunas".to_string()),
            ],
        );
        let b = RequestCache::cache_key(
            "/order/",
            &[
                ("status".to_string(), "lunas".to_string()),
                ("page".to_string(), "2".to_string()),
            ],
        );
        assert_eq!(a, b);
        assert_ne!(a, RequestCache::cache_key("/order/", &[]));
    }

    #[test]
    fn cache_entries_expire() {
        let cache = RequestCache::new();
        cache.set("k", json!(1), Duration::from_secs(30));
        assert_eq!(cache.get("k"), Some(json!(1)));
        cache.set("k", json!(2), Duration::ZERO);
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_fetch() {
        let cache = RequestCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!({ "count": 0 }))
        };

        let (a, b, c) = tokio::join!(
            cache.deduplicate("k", || fetch(Arc::clone(&calls))),
            cache.deduplicate("k", || fetch(Arc::clone(&calls))),
            cache.deduplicate("k", || fetch(Arc::clone(&calls))),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share_fetches() {
        let cache = RequestCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        };
        let (a, b) = tokio::join!(
            cache.deduplicate("k1", || fetch(Arc::clone(&calls))),
            cache.deduplicate("k2", || fetch(Arc::clone(&calls))),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn auth_is_skipped_only_for_public_endpoints() {
        assert!(!requires_auth("/track-order/"));
        assert!(!requires_auth("/invoice/detail/INV-1/"));
        assert!(!requires_auth("/auth/login/"));
        assert!(requires_auth("/order/"));
        assert!(requires_auth("/admin/dashboard/stats/"));
        assert!(requires_auth("/invoice/"));
    }
}
