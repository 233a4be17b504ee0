//! Smart polling fallback for when the push channel is unavailable.
//!
//! Cadence adapts to the shop's rhythm: faster during weekday business
//! hours, slower on weekends, and backed off while fetches keep failing. A
//! digest of the fetched payload suppresses update events when nothing
//! changed, so a healthy-but-quiet backend costs consumers nothing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{ClientEvent, EventBus};
use crate::model::Order;

/// Statuses that indicate money has moved on an order.
const PAID_STATUSES: [&str; 2] = ["lunas", "dp_dibayar"];
/// Rows updated within this window count as recent activity.
const ACTIVITY_WINDOW: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Config & interval policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub base_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Applied on weekdays between 08:00 and 22:00 local time.
    pub business_hours_multiplier: f64,
    /// Applied on Saturday and Sunday.
    pub weekend_multiplier: f64,
    /// Compounded per consecutive fetch failure.
    pub backoff_multiplier: f64,
    /// Cap on the failure counter feeding the backoff.
    pub max_retries: u32,
    /// Cadence while a boost is active.
    pub boost_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(30),
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(300),
            business_hours_multiplier: 0.5,
            weekend_multiplier: 2.0,
            backoff_multiplier: 1.5,
            max_retries: 5,
            boost_interval: Duration::from_secs(10),
        }
    }
}

/// Next poll delay for a given wall-clock moment and failure count.
pub fn compute_interval(config: &PollingConfig, now: DateTime<Local>, retry_count: u32) -> Duration {
    let mut seconds = config.base_interval.as_secs_f64();

    let weekend = matches!(now.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun);
    if weekend {
        seconds *= config.weekend_multiplier;
    } else if (8..22).contains(&now.hour()) {
        seconds *= config.business_hours_multiplier;
    }

    let retries = retry_count.min(config.max_retries);
    seconds *= config.backoff_multiplier.powi(retries as i32);

    let clamped = seconds.clamp(
        config.min_interval.as_secs_f64(),
        config.max_interval.as_secs_f64(),
    );
    Duration::from_secs_f64(clamped)
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Async source of the raw orders listing payload.
pub type OrdersFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PollingStatus {
    pub active: bool,
    pub retry_count: u32,
    pub boost_cycles_remaining: u32,
    pub has_baseline: bool,
}

struct PollerInner {
    config: PollingConfig,
    bus: EventBus,
    fetcher: OrdersFetcher,
    active: AtomicBool,
    retry_count: AtomicU32,
    boost_remaining: AtomicU32,
    last_hash: Mutex<Option<String>>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// Periodic REST fetcher with change detection. Cheap to clone.
#[derive(Clone)]
pub struct SmartPoller {
    inner: Arc<PollerInner>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SmartPoller {
    pub fn new(config: PollingConfig, bus: EventBus, fetcher: OrdersFetcher) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                config,
                bus,
                fetcher,
                active: AtomicBool::new(false),
                retry_count: AtomicU32::new(0),
                boost_remaining: AtomicU32::new(0),
                last_hash: Mutex::new(None),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Begin polling. Idempotent; a second start while running is ignored.
    pub fn start(&self) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            debug!("poller already running");
            return;
        }
        let cancel = CancellationToken::new();
        *locked(&self.inner.cancel) = Some(cancel.clone());
        let poller = self.clone();
        tokio::spawn(async move {
            info!("polling started");
            loop {
                let delay = poller.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                poller.poll_once().await;
            }
            info!("polling stopped");
        });
    }

    pub fn stop(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        if let Some(cancel) = locked(&self.inner.cancel).take() {
            cancel.cancel();
        }
    }

    /// Temporarily poll on the fast boost cadence for `cycles` polls, then
    /// fall back to the adaptive interval automatically.
    pub fn boost_polling(&self, cycles: u32) {
        self.inner.boost_remaining.store(cycles, Ordering::SeqCst);
        debug!(cycles, "polling boost engaged");
    }

    pub fn status(&self) -> PollingStatus {
        PollingStatus {
            active: self.inner.active.load(Ordering::SeqCst),
            retry_count: self.inner.retry_count.load(Ordering::SeqCst),
            boost_cycles_remaining: self.inner.boost_remaining.load(Ordering::SeqCst),
            has_baseline: locked(&self.inner.last_hash).is_some(),
        }
    }

    fn next_delay(&self) -> Duration {
        let boosted = self
            .inner
            .boost_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if boosted {
            self.inner.config.boost_interval
        } else {
            compute_interval(
                &self.inner.config,
                Local::now(),
                self.inner.retry_count.load(Ordering::SeqCst),
            )
        }
    }

    /// Run one poll cycle immediately. Returns whether the payload changed.
    /// Fetch errors bump the bounded retry counter and surface as a
    /// `polling_error` event; they never stop the poller.
    pub async fn poll_now(&self) -> bool {
        self.poll_once().await
    }

    async fn poll_once(&self) -> bool {
        let payload = match (self.inner.fetcher)().await {
            Ok(payload) => payload,
            Err(e) => {
                let prev = self.inner.retry_count.load(Ordering::SeqCst);
                let count = (prev + 1).min(self.inner.config.max_retries);
                self.inner.retry_count.store(count, Ordering::SeqCst);
                warn!(error = %e, retry_count = count, "poll fetch failed");
                self.inner.bus.emit(&ClientEvent::PollingError {
                    message: e.to_string(),
                    retry_count: count,
                });
                return false;
            }
        };

        // Unchanged payload is a healthy no-op poll, not a failure.
        self.inner.retry_count.store(0, Ordering::SeqCst);
        let digest = format!("{:x}", md5::compute(payload.to_string()));
        {
            let mut last = locked(&self.inner.last_hash);
            if last.as_deref() == Some(digest.as_str()) {
                debug!("payload unchanged, skipping update");
                return false;
            }
            *last = Some(digest);
        }

        let orders = extract_orders(&payload);
        // Any paid row in a changed payload counts as payment activity; the
        // recency window only gates status activity.
        for order in &orders {
            if PAID_STATUSES.contains(&order.status_order.as_str()) {
                self.inner
                    .bus
                    .emit(&ClientEvent::PollingPaymentActivity(order.clone()));
            }
        }
        for order in recent_activity(&orders, Utc::now()) {
            self.inner
                .bus
                .emit(&ClientEvent::PollingStatusActivity(order.clone()));
        }
        self.inner
            .bus
            .emit(&ClientEvent::PollingDataUpdate { orders });
        true
    }
}

/// Pull order rows out of a listing payload, accepting both the paginated
/// envelope and a bare array. Undecodable rows are skipped.
fn extract_orders(payload: &Value) -> Vec<Order> {
    let rows = payload
        .get("results")
        .and_then(Value::as_array)
        .or_else(|| payload.as_array());
    match rows {
        Some(rows) => rows
            .iter()
            .filter_map(|row| match serde_json::from_value(row.clone()) {
                Ok(order) => Some(order),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable order row");
                    None
                }
            })
            .collect(),
        None => Vec::new(),
    }
}

/// Orders whose `updated_at` falls inside the activity window.
fn recent_activity<'a>(orders: &'a [Order], now: DateTime<Utc>) -> Vec<&'a Order> {
    orders
        .iter()
        .filter(|order| {
            DateTime::parse_from_rfc3339(&order.updated_at)
                .map(|updated| {
                    let age = now.signed_duration_since(updated.with_timezone(&Utc));
                    age >= chrono::Duration::zero()
                        && age.to_std().map(|d| d <= ACTIVITY_WINDOW).unwrap_or(false)
                })
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use chrono::TimeZone;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn fixed_fetcher(payload: Value) -> OrdersFetcher {
        Arc::new(move || {
            let payload = payload.clone();
            async move { Ok(payload) }.boxed()
        })
    }

    fn failing_fetcher() -> OrdersFetcher {
        Arc::new(|| {
            async { Err(crate::error::SyncError::Transport("down".to_string())) }.boxed()
        })
    }

    fn listing(rows: Value) -> Value {
        json!({ "count": 1, "next": null, "previous": null, "results": rows })
    }

    #[test]
    fn business_hours_poll_faster_than_weekends() {
        let config = PollingConfig::default();
        // Tuesday mid-morning vs Saturday mid-morning.
        let tuesday = Local.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        let saturday = Local.with_ymd_and_hms(2025, 7, 5, 10, 0, 0).unwrap();
        let busy = compute_interval(&config, tuesday, 0);
        let quiet = compute_interval(&config, saturday, 0);
        assert!(busy < quiet);
        assert_eq!(busy, Duration::from_secs(15));
        assert_eq!(quiet, Duration::from_secs(60));
    }

    #[test]
    fn interval_is_clamped_under_backoff() {
        let config = PollingConfig::default();
        let saturday = Local.with_ymd_and_hms(2025, 7, 5, 10, 0, 0).unwrap();
        // Weekend base 60s * 1.5^5 = 455.6s, clamped to the 300s ceiling.
        let backed_off = compute_interval(&config, saturday, config.max_retries);
        assert_eq!(backed_off, Duration::from_secs(300));
        // Retry counts beyond the cap change nothing.
        assert_eq!(compute_interval(&config, saturday, 50), backed_off);
    }

    #[tokio::test]
    async fn identical_payload_emits_no_update() {
        let bus = EventBus::new();
        let updates = Arc::new(AtomicUsize::new(0));
        let updates2 = Arc::clone(&updates);
        let _sub = bus.on(EventKind::PollingDataUpdate, move |_| {
            updates2.fetch_add(1, Ordering::SeqCst);
        });

        let payload = listing(json!([{ "id": "1", "order_code": "ORD-1" }]));
        let poller = SmartPoller::new(PollingConfig::default(), bus, fixed_fetcher(payload));

        assert!(poller.poll_now().await);
        assert!(!poller.poll_now().await);
        assert!(!poller.poll_now().await);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_errors_bound_the_retry_counter_and_emit_events() {
        let bus = EventBus::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors2 = Arc::clone(&errors);
        let _sub = bus.on(EventKind::PollingError, move |_| {
            errors2.fetch_add(1, Ordering::SeqCst);
        });

        let poller = SmartPoller::new(PollingConfig::default(), bus, failing_fetcher());
        for _ in 0..10 {
            assert!(!poller.poll_now().await);
        }
        assert_eq!(errors.load(Ordering::SeqCst), 10);
        assert_eq!(poller.status().retry_count, PollingConfig::default().max_retries);
    }

    #[tokio::test]
    async fn successful_poll_resets_the_retry_counter() {
        let bus = EventBus::new();
        let poller = SmartPoller::new(PollingConfig::default(), bus.clone(), failing_fetcher());
        poller.poll_now().await;
        assert_eq!(poller.status().retry_count, 1);

        let recovered = SmartPoller::new(
            PollingConfig::default(),
            bus,
            fixed_fetcher(listing(json!([]))),
        );
        recovered.inner.retry_count.store(3, Ordering::SeqCst);
        recovered.poll_now().await;
        assert_eq!(recovered.status().retry_count, 0);
    }

    #[tokio::test]
    async fn paid_rows_surface_payment_activity_regardless_of_age() {
        let bus = EventBus::new();
        let payments = Arc::new(AtomicUsize::new(0));
        let payments2 = Arc::clone(&payments);
        let _sub = bus.on(EventKind::PollingPaymentActivity, move |_| {
            payments2.fetch_add(1, Ordering::SeqCst);
        });
        let statuses = Arc::new(AtomicUsize::new(0));
        let statuses2 = Arc::clone(&statuses);
        let _sub2 = bus.on(EventKind::PollingStatusActivity, move |_| {
            statuses2.fetch_add(1, Ordering::SeqCst);
        });

        let fresh = Utc::now().to_rfc3339();
        let payload = listing(json!([
            { "id": "1", "order_code": "ORD-1", "status_order": "lunas", "updated_at": fresh },
            { "id": "2", "order_code": "ORD-2", "status_order": "menunggu_link", "updated_at": fresh },
            { "id": "3", "order_code": "ORD-3", "status_order": "lunas", "updated_at": "2020-01-01T00:00:00Z" }
        ]));
        let poller = SmartPoller::new(PollingConfig::default(), bus, fixed_fetcher(payload));
        poller.poll_now().await;
        // Both paid rows fire, the old one included; only the two recently
        // updated rows count as status activity.
        assert_eq!(payments.load(Ordering::SeqCst), 2);
        assert_eq!(statuses.load(Ordering::SeqCst), 2);

        // An unchanged payload fires nothing at all.
        poller.poll_now().await;
        assert_eq!(payments.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn boost_overrides_the_adaptive_interval_for_n_cycles() {
        let poller = SmartPoller::new(
            PollingConfig::default(),
            EventBus::new(),
            fixed_fetcher(listing(json!([]))),
        );
        poller.boost_polling(2);
        assert_eq!(poller.next_delay(), Duration::from_secs(10));
        assert_eq!(poller.next_delay(), Duration::from_secs(10));
        assert_ne!(poller.next_delay(), Duration::from_secs(10));
        assert_eq!(poller.status().boost_cycles_remaining, 0);
    }
}
