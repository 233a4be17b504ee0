//! WebSocket connection manager.
//!
//! One logical connection per manager, in one of two mutually exclusive
//! roles: public order tracking (no credential) or the admin orders feed
//! (JWT in the URL query, since a socket upgrade request cannot carry custom
//! headers). A supervisor task owns the live socket and the reconnect loop;
//! the manager hands frames to it over a channel and mirrors its view of the
//! connection into a shared `ConnectionState`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::auth::{is_jwt_format, AuthStore};
use crate::config::{percent_encode, ws_base_url, WsConfig, WS_ADMIN_ORDERS, WS_PUBLIC_TRACKING};
use crate::error::{Result, SyncError};
use crate::events::{ClientEvent, EventBus};
use crate::model::{AccessMode, ConnectionState};
use crate::protocol::{
    close_is_terminal, ClientMessage, ConnectionEstablished, Envelope, ErrorPayload, Pong,
    CLOSE_FORBIDDEN, CLOSE_UNAUTHORIZED,
};
use crate::router::route;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Exponential backoff: `base * 2^attempt`, capped.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).map(|d| d.min(max)).unwrap_or(max)
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State shared between the manager handle and the supervisor task.
struct Shared {
    config: WsConfig,
    bus: EventBus,
    state: Mutex<ConnectionState>,
    mode: Mutex<AccessMode>,
    /// Credential for the current admin session, preserved across reconnect
    /// cycles and dropped (zeroized) on disconnect.
    credential: Mutex<Option<Zeroizing<String>>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Shared {
    fn update_state(&self, f: impl FnOnce(&mut ConnectionState)) {
        f(&mut locked(&self.state));
    }

    fn state_snapshot(&self) -> ConnectionState {
        locked(&self.state).clone()
    }

    fn mark_open(&self) {
        self.update_state(|s| {
            s.connected = true;
            s.connecting = false;
            s.error = None;
            s.reconnect_attempts = 0;
            s.last_connected = Some(Utc::now());
        });
    }

    fn mark_closed(&self) {
        self.update_state(|s| {
            s.connected = false;
            s.connecting = false;
            s.authenticated = false;
        });
    }
}

/// Per-connection resources owned behind the connect lock.
#[derive(Default)]
struct Inner {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the socket lifecycle. One instance per process; the composition root
/// holds it and nothing else opens sockets to the dashboard.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    auth: Arc<AuthStore>,
    inner: tokio::sync::Mutex<Inner>,
}

impl ConnectionManager {
    pub fn new(config: WsConfig, bus: EventBus, auth: Arc<AuthStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                bus,
                state: Mutex::new(ConnectionState::default()),
                mode: Mutex::new(AccessMode::Public),
                credential: Mutex::new(None),
                outgoing: Mutex::new(None),
            }),
            auth,
            inner: tokio::sync::Mutex::new(Inner::default()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state_snapshot()
    }

    pub fn mode(&self) -> AccessMode {
        *locked(&self.shared.mode)
    }

    pub fn is_connected(&self) -> bool {
        locked(&self.shared.state).connected
    }

    /// Open the public tracking endpoint. No credential involved.
    pub async fn connect_public(&self) -> Result<()> {
        self.connect(AccessMode::Public, None, false).await
    }

    /// Open the admin orders endpoint. The token must look like a JWT before
    /// any network traffic happens; connecting again with the same token
    /// while connected is a no-op.
    pub async fn connect_admin(&self, token: &str) -> Result<()> {
        if !is_jwt_format(token) {
            return Err(SyncError::InvalidToken(
                "credential is not a 3-part dot-separated token",
            ));
        }
        self.connect(AccessMode::Admin, Some(token.to_string()), false)
            .await
    }

    async fn connect(&self, mode: AccessMode, token: Option<String>, force: bool) -> Result<()> {
        // An attempt already in flight holds this lock; give it a second to
        // settle before superseding it.
        let mut inner = match timeout(Duration::from_secs(1), self.inner.lock()).await {
            Ok(guard) => guard,
            Err(_) => self.inner.lock().await,
        };

        if !force && self.is_connected() && self.mode() == mode {
            let same_credential = {
                let current = locked(&self.shared.credential);
                match (&token, current.as_ref()) {
                    (None, None) => true,
                    (Some(new), Some(old)) => new.as_str() == old.as_str(),
                    _ => false,
                }
            };
            if same_credential {
                debug!(?mode, "already connected with identical credential");
                return Ok(());
            }
        }

        self.teardown(&mut inner).await;

        *locked(&self.shared.mode) = mode;
        *locked(&self.shared.credential) = token.map(Zeroizing::new);
        self.shared.update_state(|s| {
            s.connected = false;
            s.connecting = true;
            s.error = None;
        });

        let credential = locked(&self.shared.credential)
            .as_ref()
            .map(|t| t.to_string());
        let socket = match open_socket(&self.shared.config, mode, credential.as_deref()).await {
            Ok(socket) => socket,
            Err(err) => {
                let message = err.to_string();
                self.shared.update_state(|s| {
                    s.connecting = false;
                    s.error = Some(message.clone());
                });
                return Err(err);
            }
        };

        self.shared.mark_open();
        info!(?mode, "websocket connected");

        let (tx, rx) = mpsc::unbounded_channel();
        *locked(&self.shared.outgoing) = Some(tx);

        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());
        inner.task = Some(tokio::spawn(supervise(
            Arc::clone(&self.shared),
            socket,
            rx,
            cancel,
        )));
        Ok(())
    }

    /// Close with the normal code, stop all timers and zeroize the stored
    /// credential. Never reconnects.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
        *locked(&self.shared.credential) = None;
        self.shared.update_state(|s| {
            s.connected = false;
            s.connecting = false;
            s.authenticated = false;
            s.reconnect_attempts = 0;
            s.error = None;
        });
        info!("websocket disconnected");
    }

    /// Tear down and reconnect from a clean slate: backoff counter reset and
    /// the credential re-read from the auth store rather than the one
    /// captured at connect time.
    pub async fn force_reconnect(&self) -> Result<()> {
        let mode = self.mode();
        self.shared.update_state(|s| s.reconnect_attempts = 0);
        match mode {
            AccessMode::Public => self.connect(AccessMode::Public, None, true).await,
            AccessMode::Admin => {
                let token = self
                    .auth
                    .access_token()
                    .or_else(|| {
                        locked(&self.shared.credential)
                            .as_ref()
                            .map(|t| t.to_string())
                    })
                    .ok_or(SyncError::InvalidToken("no credential available"))?;
                self.connect(AccessMode::Admin, Some(token), true).await
            }
        }
    }

    async fn teardown(&self, inner: &mut Inner) {
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        locked(&self.shared.outgoing).take();
        if let Some(task) = inner.task.take() {
            if timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("supervisor task did not stop in time");
            }
        }
    }

    // -- outgoing -----------------------------------------------------------

    /// Transmit a frame. Dropped with a warning when not connected; lost
    /// messages are re-requested after reconnect, never queued.
    pub fn send_message(&self, message: ClientMessage) {
        if !self.is_connected() {
            warn!(kind = message.kind, "not connected, dropping message");
            return;
        }
        let sent = locked(&self.shared.outgoing)
            .as_ref()
            .map(|tx| tx.send(message.to_frame()).is_ok())
            .unwrap_or(false);
        if !sent {
            warn!(kind = message.kind, "outgoing channel gone, dropping message");
        }
    }

    pub fn subscribe_order_by_code(&self, order_code: &str) {
        self.send_message(ClientMessage::subscribe_order_by_code(order_code));
    }

    pub fn get_order_by_code(&self, order_code: &str) {
        self.send_message(ClientMessage::get_order_by_code(order_code));
    }

    pub fn unsubscribe_order(&self, order_code: &str) {
        self.send_message(ClientMessage::unsubscribe_order(order_code));
    }

    /// Admin only; refused with a warning in public mode.
    pub fn subscribe_order(&self, order_id: u64) {
        if self.require_admin("subscribe_order") {
            self.send_message(ClientMessage::subscribe_order(order_id));
        }
    }

    /// Admin only; refused with a warning in public mode.
    pub fn get_order_details(&self, order_id: u64) {
        if self.require_admin("get_order_details") {
            self.send_message(ClientMessage::get_order_details(order_id));
        }
    }

    /// Admin only; refused with a warning in public mode.
    pub fn get_all_orders(&self) {
        if self.require_admin("get_all_orders") {
            self.send_message(ClientMessage::get_all_orders());
        }
    }

    fn require_admin(&self, operation: &str) -> bool {
        if self.mode() == AccessMode::Admin {
            true
        } else {
            warn!(operation, "admin-only operation refused in public mode");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Socket plumbing
// ---------------------------------------------------------------------------

async fn open_socket(
    config: &WsConfig,
    mode: AccessMode,
    credential: Option<&str>,
) -> Result<WsStream> {
    let base = ws_base_url(&config.base_url);
    let url = match mode {
        AccessMode::Public => format!("{base}{WS_PUBLIC_TRACKING}"),
        AccessMode::Admin => {
            let token = credential.ok_or(SyncError::InvalidToken("missing credential"))?;
            format!("{base}{WS_ADMIN_ORDERS}?token={}", percent_encode(token))
        }
    };
    match timeout(config.connect_timeout, connect_async(&url)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(SyncError::Transport(format!("websocket connect failed: {e}"))),
        Err(_) => Err(SyncError::Timeout),
    }
}

enum SessionEnd {
    /// Explicit teardown via the cancellation token.
    Cancelled,
    Closed { code: u16, reason: String },
    Transport(String),
}

/// Whether a finished session should enter the reconnect loop. Normal
/// closure and auth rejections are final.
fn should_reconnect(end: &SessionEnd) -> bool {
    match end {
        SessionEnd::Cancelled => false,
        SessionEnd::Closed { code, .. } => !close_is_terminal(*code),
        SessionEnd::Transport(_) => true,
    }
}

/// Drive one socket until it dies, then reconnect with backoff until the
/// attempt cap, a terminal close, or cancellation.
async fn supervise(
    shared: Arc<Shared>,
    socket: WsStream,
    mut rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let mut socket = Some(socket);
    'sessions: while let Some(current) = socket.take() {
        let end = run_session(current, &mut rx, &cancel, &shared).await;
        shared.mark_closed();

        match &end {
            SessionEnd::Cancelled => {
                shared.bus.emit(&ClientEvent::ConnectionLost {
                    code: 1000,
                    reason: "client disconnect".to_string(),
                });
                break;
            }
            SessionEnd::Closed { code, reason } => {
                info!(code, reason = %reason, "websocket closed");
                shared.bus.emit(&ClientEvent::ConnectionLost {
                    code: *code,
                    reason: reason.clone(),
                });
                if *code == CLOSE_UNAUTHORIZED || *code == CLOSE_FORBIDDEN {
                    let message = format!("authentication rejected (close {code})");
                    shared.update_state(|s| s.error = Some(message.clone()));
                    shared.bus.emit(&ClientEvent::ConnectionError { error: message });
                }
            }
            SessionEnd::Transport(error) => {
                warn!(error = %error, "websocket transport error");
                shared
                    .bus
                    .emit(&ClientEvent::ConnectionError { error: error.clone() });
            }
        }

        if !should_reconnect(&end) {
            break;
        }

        // Reconnect loop. Attempts reset to zero on every successful open.
        loop {
            let attempt = {
                let mut state = locked(&shared.state);
                state.reconnect_attempts += 1;
                state.reconnect_attempts
            };
            if attempt > shared.config.reconnect_attempts {
                let err = SyncError::ReconnectExhausted {
                    attempts: shared.config.reconnect_attempts,
                };
                let message = err.to_string();
                warn!(%message, "giving up on reconnection");
                shared.update_state(|s| {
                    s.connecting = false;
                    s.error = Some(message.clone());
                });
                shared.bus.emit(&ClientEvent::ConnectionError { error: message });
                break 'sessions;
            }

            let delay = backoff_delay(
                shared.config.reconnect_delay,
                attempt - 1,
                shared.config.max_reconnect_delay,
            );
            shared
                .bus
                .emit(&ClientEvent::ConnectionReconnecting { attempt, delay });
            tokio::select! {
                _ = cancel.cancelled() => break 'sessions,
                _ = tokio::time::sleep(delay) => {}
            }

            shared.update_state(|s| {
                s.connected = false;
                s.connecting = true;
            });
            let mode = *locked(&shared.mode);
            let credential = locked(&shared.credential).as_ref().map(|t| t.to_string());
            match open_socket(&shared.config, mode, credential.as_deref()).await {
                Ok(next) => {
                    shared.mark_open();
                    info!(attempt, "websocket reconnected");
                    socket = Some(next);
                    continue 'sessions;
                }
                Err(e) => {
                    let message = e.to_string();
                    shared.update_state(|s| {
                        s.connecting = false;
                        s.error = Some(message.clone());
                    });
                    shared.bus.emit(&ClientEvent::ConnectionError { error: message });
                }
            }
        }
    }
    locked(&shared.outgoing).take();
}

/// Pump one socket: outgoing frames, heartbeat pings, inbound routing.
async fn run_session(
    socket: WsStream,
    rx: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
    shared: &Arc<Shared>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    // First tick fires immediately, giving the ping-on-open behavior.
    let mut heartbeat = interval(shared.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                return SessionEnd::Cancelled;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(Message::Text(ClientMessage::ping().to_frame())).await {
                    return SessionEnd::Transport(format!("ping send failed: {e}"));
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            return SessionEnd::Transport(format!("send failed: {e}"));
                        }
                    }
                    None => return SessionEnd::Cancelled,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => handle_text(&text, shared),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1006, String::new()));
                        return SessionEnd::Closed { code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Transport(e.to_string()),
                    None => return SessionEnd::Closed {
                        code: 1006,
                        reason: "stream ended".to_string(),
                    },
                }
            }
        }
    }
}

/// Handle one inbound text frame. Malformed payloads surface as
/// `system:error` events and never close the connection.
fn handle_text(text: &str, shared: &Arc<Shared>) {
    shared.update_state(|s| s.last_message = Some(Utc::now()));

    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            shared.bus.emit(&ClientEvent::SystemError(ErrorPayload {
                code: "parse_error".to_string(),
                message: e.to_string(),
                details: None,
            }));
            return;
        }
    };

    shared
        .bus
        .emit(&ClientEvent::RawMessage(envelope.clone()));

    match envelope.kind.as_str() {
        "connection_established" => match envelope.decode::<ConnectionEstablished>() {
            Ok(payload) => {
                shared.update_state(|s| {
                    s.authenticated = payload.authenticated;
                    s.access_level = payload.access_level;
                });
                info!(access_level = ?payload.access_level, "connection established");
                shared
                    .bus
                    .emit(&ClientEvent::ConnectionEstablished(shared.state_snapshot()));
            }
            Err(e) => warn!(error = %e, "bad connection_established payload"),
        },
        "pong" => match envelope.decode::<Pong>() {
            Ok(pong) => debug!(
                server_time = %pong.server_time,
                auth_status = pong.auth_status,
                access_level = %pong.access_level,
                "heartbeat pong"
            ),
            Err(e) => debug!(error = %e, "heartbeat pong with odd payload"),
        },
        _ => {
            let mode = *locked(&shared.mode);
            for event in route(mode, &envelope) {
                shared.bus.emit(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            WsConfig::new("https://dashboard.example.invalid"),
            EventBus::new(),
            Arc::new(AuthStore::new()),
        )
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, 0, max), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 1, max), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, 3, max), Duration::from_millis(8000));
        assert_eq!(backoff_delay(base, 5, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, 31, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, 40, max), Duration::from_secs(30));
    }

    #[test]
    fn normal_and_auth_closes_are_final() {
        assert!(!should_reconnect(&SessionEnd::Cancelled));
        assert!(!should_reconnect(&SessionEnd::Closed {
            code: 1000,
            reason: String::new()
        }));
        assert!(!should_reconnect(&SessionEnd::Closed {
            code: 4401,
            reason: String::new()
        }));
        assert!(!should_reconnect(&SessionEnd::Closed {
            code: 4403,
            reason: String::new()
        }));
        assert!(should_reconnect(&SessionEnd::Closed {
            code: 1006,
            reason: String::new()
        }));
        assert!(should_reconnect(&SessionEnd::Transport("reset".into())));
    }

    #[tokio::test]
    async fn malformed_token_is_rejected_before_any_io() {
        let manager = manager();
        let err = manager
            .connect_admin("definitely-not-a-jwt")
            .await
            .expect_err("format check fails");
        assert!(matches!(err, SyncError::InvalidToken(_)));
        // No attempt was recorded; the state never left idle.
        let state = manager.state();
        assert!(!state.connected && !state.connecting);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn admin_operations_refused_in_public_mode() {
        let manager = manager();
        // Default mode is public; these must be silently refused.
        manager.subscribe_order(7);
        manager.get_order_details(7);
        manager.get_all_orders();
        assert_eq!(manager.mode(), AccessMode::Public);
    }

    #[tokio::test]
    async fn send_message_when_disconnected_is_a_quiet_drop() {
        let manager = manager();
        manager.send_message(ClientMessage::ping());
        assert!(!manager.is_connected());
    }

    /// Accept websocket upgrades on a loopback listener, greet each socket
    /// with a `connection_established` frame and count the accepts.
    async fn spawn_ws_server(accepted: Arc<AtomicUsize>) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let greeting = serde_json::json!({
                        "type": "connection_established",
                        "payload": {
                            "message": "connected",
                            "authenticated": true,
                            "access_level": "authenticated"
                        }
                    })
                    .to_string();
                    let _ = ws.send(Message::Text(greeting)).await;
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn repeat_admin_connect_with_same_token_opens_no_second_socket() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let addr = spawn_ws_server(Arc::clone(&accepted)).await;

        let bus = EventBus::new();
        let established = Arc::new(AtomicUsize::new(0));
        let established2 = Arc::clone(&established);
        let _sub = bus.on(EventKind::ConnectionEstablished, move |_| {
            established2.fetch_add(1, Ordering::SeqCst);
        });

        let manager = ConnectionManager::new(
            WsConfig::new(format!("http://{addr}")),
            bus,
            Arc::new(AuthStore::new()),
        );
        let token = "eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiI3In0.c2ln";

        manager.connect_admin(token).await.expect("first connect");
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.connect_admin(token).await.expect("repeat connect");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(accepted.load(Ordering::SeqCst), 1, "one socket accepted");
        assert_eq!(established.load(Ordering::SeqCst), 1, "one open event");
        assert!(manager.is_connected());
        assert_eq!(manager.mode(), AccessMode::Admin);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn malformed_frame_emits_system_error_event() {
        let manager = manager();
        let errors = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let errors2 = Arc::clone(&errors);
        let _sub = manager
            .shared
            .bus
            .on(EventKind::SystemError, move |_| {
                errors2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        handle_text("{broken", &manager.shared);
        assert_eq!(errors.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
