//! `ConnectionCore`: the reactor task that exclusively owns the transport
//! and every other stateful component, plus `StarlingClient`, the cheaply
//! cloneable handle application code actually holds.
//!
//! Generalizes the single-reactor-task-plus-command-channel architecture of
//! a DEALER-socket client: one task owns the socket and every mutable
//! component (`SendBuffer`, `RequestRegistry`, `MethodRegistry`,
//! `TopicRouter`, `ReconnectionController`, `StateManager`); every other
//! task talks to it exclusively through an mpsc command channel, so none of
//! those components need a mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use starling_config::StarlingConfig;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;

use crate::error::{ConnectError, MethodError, RequestError, StateError, TopicError};
use crate::event_bus::{Disposer, Event, EventBus};
use crate::frame::{now_ms, DecodeOutcome, ErrorObject, MessageCodec, ProtocolFrame};
use crate::method_registry::{
    ContextMessage, MethodHandler, MethodOptions, MethodRegistry, RequestContext,
};
use crate::request_registry::{RequestHandle, RequestOptions, RequestRegistry};
use crate::send_buffer::{AddOutcome, SendBuffer};
use crate::reconnect::ReconnectMetrics;
use crate::state_manager::{RecoveryToken, StateManager, StateMetrics, REFRESH_METHOD};
use crate::reconnect::ReconnectionController;
use crate::topic_router::{TopicHandler, TopicOptions, TopicRouter};
use crate::transport::{self, Transport};

/// Subscription handle returned by `StarlingClient::subscribe`.
pub type SubscriptionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Default)]
struct Hooks {
    text: Mutex<Option<Box<dyn Fn(String) + Send + Sync>>>,
    json: Mutex<Option<Box<dyn Fn(Value) + Send + Sync>>>,
    binary: Mutex<Option<Box<dyn Fn(Vec<u8>) + Send + Sync>>>,
    notification: Mutex<Option<Box<dyn Fn(Value) + Send + Sync>>>,
}

enum Command {
    Connect {
        respond_to: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect {
        reason: Option<String>,
        respond_to: oneshot::Sender<()>,
    },
    Request {
        method: String,
        payload: Option<Value>,
        options: RequestOptions,
        respond_to: oneshot::Sender<RequestHandle>,
    },
    RegisterMethod {
        name: String,
        handler: MethodHandler,
        options: MethodOptions,
        respond_to: oneshot::Sender<Result<(), MethodError>>,
    },
    UnregisterMethod {
        name: String,
        respond_to: oneshot::Sender<bool>,
    },
    Subscribe {
        pattern: String,
        options: TopicOptions,
        handler: TopicHandler,
        respond_to: oneshot::Sender<Result<SubscriptionId, TopicError>>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Sync {
        respond_to: oneshot::Sender<Result<RecoveryToken, StateError>>,
    },
    ReconnectMetrics {
        respond_to: oneshot::Sender<ReconnectMetrics>,
    },
    StateMetrics {
        respond_to: oneshot::Sender<StateMetrics>,
    },
    Send {
        frame: ProtocolFrame,
    },
    Shutdown,
}

/// Application handle to a Helios-Starling connection. Cheap to clone; every
/// clone talks to the same reactor task.
#[derive(Clone)]
pub struct StarlingClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    cancel_tx: mpsc::UnboundedSender<(Uuid, String)>,
    events: Arc<EventBus>,
    hooks: Arc<Hooks>,
}

impl StarlingClient {
    /// Build a client and spawn its reactor task. The connection is not
    /// established until `connect()` is called.
    pub fn new(config: StarlingConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventBus::new());
        let hooks = Arc::new(Hooks::default());

        let reactor = ConnectionReactor::new(
            config,
            cmd_rx,
            cancel_rx,
            cancel_tx.clone(),
            Arc::clone(&events),
            Arc::clone(&hooks),
        );
        tokio::spawn(reactor.run());

        Self {
            cmd_tx,
            cancel_tx,
            events,
            hooks,
        }
    }

    pub async fn connect(&self) -> Result<(), ConnectError> {
        let (respond_to, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Connect { respond_to }).is_err() {
            return Err(ConnectError::Transport("reactor task is gone".to_string()));
        }
        rx.await
            .unwrap_or_else(|_| Err(ConnectError::Transport("reactor task is gone".to_string())))
    }

    pub async fn disconnect(&self, reason: Option<String>) {
        let (respond_to, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Disconnect { reason, respond_to })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn request(
        &self,
        method: impl Into<String>,
        payload: Option<Value>,
        options: RequestOptions,
    ) -> Result<RequestHandle, RequestError> {
        let (respond_to, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                method: method.into(),
                payload,
                options,
                respond_to,
            })
            .map_err(|_| RequestError::ConnectionClosed)?;
        rx.await.map_err(|_| RequestError::ConnectionClosed)
    }

    pub async fn register_method(
        &self,
        name: impl Into<String>,
        handler: MethodHandler,
        options: MethodOptions,
    ) -> Result<(), MethodError> {
        let (respond_to, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::RegisterMethod {
            name: name.into(),
            handler,
            options,
            respond_to,
        });
        rx.await
            .unwrap_or(Err(MethodError::InvalidName("reactor task is gone".to_string())))
    }

    pub async fn unregister_method(&self, name: impl Into<String>) -> bool {
        let (respond_to, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::UnregisterMethod {
            name: name.into(),
            respond_to,
        });
        rx.await.unwrap_or(false)
    }

    pub async fn subscribe(
        &self,
        pattern: impl Into<String>,
        options: TopicOptions,
        handler: TopicHandler,
    ) -> Result<SubscriptionId, TopicError> {
        let (respond_to, rx) = oneshot::channel();
        let pattern = pattern.into();
        let _ = self.cmd_tx.send(Command::Subscribe {
            pattern: pattern.clone(),
            options,
            handler,
            respond_to,
        });
        rx.await
            .unwrap_or(Err(TopicError::InvalidPattern(pattern)))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.cmd_tx.send(Command::Unsubscribe { id });
    }

    /// Force an immediate recovery-token refresh.
    pub async fn sync(&self) -> Result<RecoveryToken, StateError> {
        let (respond_to, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Sync { respond_to });
        rx.await.unwrap_or(Err(StateError::NotConnected))
    }

    /// Snapshot of `ReconnectionController`'s observable metrics surface
    /// (spec.md §4.7's `getMetrics()`).
    pub async fn reconnect_metrics(&self) -> ReconnectMetrics {
        let (respond_to, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::ReconnectMetrics { respond_to });
        rx.await.unwrap_or_default()
    }

    /// Snapshot of `StateManager`'s observable metrics surface (spec.md
    /// §3's `{refreshes, refreshFailures, reconnections, totalDowntime,
    /// lastDisconnect}`).
    pub async fn state_metrics(&self) -> StateMetrics {
        let (respond_to, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::StateMetrics { respond_to });
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// Send a raw protocol frame: non-blocking, buffered while disconnected.
    /// `request`/`register_method`/`subscribe` build specific frame shapes
    /// on top of this; application code reaches for it directly only to
    /// build a `Notification` or `Error` frame the higher-level API doesn't
    /// already cover.
    pub async fn send(&self, frame: ProtocolFrame) {
        let _ = self.cmd_tx.send(Command::Send { frame });
    }

    /// Shortcut constructing and sending a topic-scoped notification frame.
    /// Non-blocking; buffered while disconnected like any other send.
    pub async fn notify(&self, topic: impl Into<String>, data: Value, request_id: Option<Uuid>) {
        self.send(ProtocolFrame::Notification {
            notification: crate::frame::NotificationBody {
                topic: Some(topic.into()),
                request_id,
                data: Some(data),
            },
        })
        .await;
    }

    /// Subscribe to lifecycle events (`starling:connected`,
    /// `starling:reconnect:*`, `state:refreshed`, `buffer:*`, ...).
    pub fn on(
        &self,
        pattern: impl Into<String>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Disposer {
        self.events.subscribe(pattern, handler)
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Called with the raw text of any inbound frame that parsed as JSON
    /// but failed schema validation.
    pub fn on_json(&self, f: impl Fn(Value) + Send + Sync + 'static) {
        *self.hooks.json.lock().expect("hooks mutex poisoned") = Some(Box::new(f));
    }

    /// Called with any inbound text frame that was not valid JSON at all.
    pub fn on_text(&self, f: impl Fn(String) + Send + Sync + 'static) {
        *self.hooks.text.lock().expect("hooks mutex poisoned") = Some(Box::new(f));
    }

    /// Called with any inbound binary frame.
    pub fn on_binary(&self, f: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        *self.hooks.binary.lock().expect("hooks mutex poisoned") = Some(Box::new(f));
    }

    /// Called with a notification frame's data when it carries neither a
    /// `requestId` (progress on an in-flight request) nor a `topic`
    /// (subscription dispatch).
    pub fn on_notification(&self, f: impl Fn(Value) + Send + Sync + 'static) {
        *self.hooks.notification.lock().expect("hooks mutex poisoned") = Some(Box::new(f));
    }
}

async fn sleep_until_opt(deadline: Option<TokioInstant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn next_message(
    transport: &mut Option<Box<dyn Transport>>,
) -> Option<Result<Message, WsError>> {
    match transport {
        Some(t) => t.next().await,
        None => std::future::pending().await,
    }
}

/// Outcome of a single state-refresh attempt, reported back to the reactor
/// loop by the detached task that awaits the request's `RequestHandle`.
/// Kept off the reactor's own await chain so a slow/never-answered refresh
/// can never block the reactor from servicing the rest of the connection
/// (in particular, from ever reading the very response the refresh is
/// waiting on).
enum RefreshEvent {
    Success(RecoveryToken),
    Retry { attempts_left: u32 },
    Failed(RequestError),
}

struct ConnectionReactor {
    config: StarlingConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cancel_rx: mpsc::UnboundedReceiver<(Uuid, String)>,
    cancel_tx: mpsc::UnboundedSender<(Uuid, String)>,
    events: Arc<EventBus>,
    hooks: Arc<Hooks>,
    codec: MessageCodec,
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    intentional_disconnect: bool,
    buffer: SendBuffer,
    requests: RequestRegistry,
    methods: MethodRegistry,
    topics: TopicRouter,
    reconnect: ReconnectionController,
    state_manager: StateManager,
    reconnect_deadline: Option<TokioInstant>,
    reset_deadline: Option<TokioInstant>,
    sweep_interval: tokio::time::Interval,
    state_refresh_interval: tokio::time::Interval,
    method_results_tx: mpsc::UnboundedSender<(Uuid, ContextMessage)>,
    method_results_rx: mpsc::UnboundedReceiver<(Uuid, ContextMessage)>,
    refresh_tx: mpsc::UnboundedSender<RefreshEvent>,
    refresh_rx: mpsc::UnboundedReceiver<RefreshEvent>,
    pending_sync: Option<oneshot::Sender<Result<RecoveryToken, StateError>>>,
}

impl ConnectionReactor {
    fn new(
        config: StarlingConfig,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        cancel_rx: mpsc::UnboundedReceiver<(Uuid, String)>,
        cancel_tx: mpsc::UnboundedSender<(Uuid, String)>,
        events: Arc<EventBus>,
        hooks: Arc<Hooks>,
    ) -> Self {
        let sweep_interval =
            tokio::time::interval(Duration::from_millis(config.bootstrap.request.sweep_interval_ms));
        let state_refresh_interval = tokio::time::interval(Duration::from_millis(
            config.bootstrap.state.refresh_interval_ms,
        ));
        let buffer = SendBuffer::new(config.infra.buffer.capacity);
        let methods = MethodRegistry::new(config.bootstrap.request.method_timeout_ms);
        let reconnect = ReconnectionController::new(config.bootstrap.reconnect.clone());
        let state_manager = StateManager::new(config.bootstrap.state.clone());
        let (method_results_tx, method_results_rx) = mpsc::unbounded_channel();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        Self {
            config,
            cmd_rx,
            cancel_rx,
            cancel_tx,
            events,
            hooks,
            codec: MessageCodec,
            transport: None,
            state: ConnectionState::Disconnected,
            intentional_disconnect: false,
            buffer,
            requests: RequestRegistry::new(),
            methods,
            topics: TopicRouter::new(),
            reconnect,
            state_manager,
            reconnect_deadline: None,
            reset_deadline: None,
            sweep_interval,
            state_refresh_interval,
            method_results_tx,
            method_results_rx,
            refresh_tx,
            refresh_rx,
            pending_sync: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => if self.handle_command(cmd).await { break; },
                        None => break,
                    }
                }
                Some((id, reason)) = self.cancel_rx.recv() => {
                    self.requests.cancel(id, reason);
                }
                Some((request_id, msg)) = self.method_results_rx.recv() => {
                    self.handle_method_result(request_id, msg).await;
                }
                Some(event) = self.refresh_rx.recv() => {
                    self.handle_refresh_event(event).await;
                }
                _ = self.sweep_interval.tick() => {
                    let swept = self.requests.sweep_timeouts();
                    if swept > 0 {
                        tracing::debug!(swept, "swept timed-out requests");
                    }
                }
                _ = self.state_refresh_interval.tick() => {
                    self.maybe_periodic_refresh().await;
                }
                _ = sleep_until_opt(self.reconnect_deadline) => {
                    self.reconnect_deadline = None;
                    self.attempt_reconnect().await;
                }
                _ = sleep_until_opt(self.reset_deadline) => {
                    self.reset_deadline = None;
                    if self.state == ConnectionState::Connected {
                        self.reconnect.reset();
                    }
                }
                event = next_message(&mut self.transport) => {
                    self.handle_transport_event(event).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect { respond_to } => self.handle_connect(respond_to).await,
            Command::Disconnect { reason, respond_to } => {
                self.handle_disconnect(reason, respond_to).await
            }
            Command::Request {
                method,
                payload,
                options,
                respond_to,
            } => self.handle_request(method, payload, options, respond_to).await,
            Command::RegisterMethod {
                name,
                handler,
                options,
                respond_to,
            } => {
                let result = self.methods.register(&name, handler, options);
                let _ = respond_to.send(result);
            }
            Command::UnregisterMethod { name, respond_to } => {
                let _ = respond_to.send(self.methods.unregister(&name));
            }
            Command::Subscribe {
                pattern,
                options,
                handler,
                respond_to,
            } => {
                let result = self.topics.subscribe(&pattern, options, handler);
                let _ = respond_to.send(result);
            }
            Command::Unsubscribe { id } => self.topics.unsubscribe(id),
            Command::Sync { respond_to } => self.handle_sync(respond_to).await,
            Command::ReconnectMetrics { respond_to } => {
                let _ = respond_to.send(self.reconnect.metrics());
            }
            Command::StateMetrics { respond_to } => {
                let _ = respond_to.send(self.state_manager.metrics());
            }
            Command::Send { frame } => {
                let content = self.codec.encode(frame);
                self.write_or_buffer(content).await;
            }
            Command::Shutdown => return true,
        }
        false
    }

    async fn handle_connect(&mut self, respond_to: oneshot::Sender<Result<(), ConnectError>>) {
        if self.state == ConnectionState::Connecting {
            let _ = respond_to.send(Err(ConnectError::AlreadyConnecting));
            return;
        }

        self.state = ConnectionState::Connecting;
        self.intentional_disconnect = false;
        let token = self.state_manager.token().map(|t| t.0);
        let timeout = Duration::from_millis(self.config.infra.connection.connect_timeout_ms);
        let url = self.config.infra.connection.url.clone();

        let dialed = tokio::time::timeout(timeout, transport::connect(&url, token.as_deref())).await;
        match dialed {
            Ok(Ok(t)) => {
                self.transport = Some(Box::new(t));
                self.state = ConnectionState::Connected;
                self.reconnect.reset();
                self.state_manager.note_reconnected();
                self.events
                    .emit(Event::new("starling:connected", json!({"at": now_ms(), "reconnected": false})));
                self.flush_buffer().await;
                self.refresh_state_after_connect().await;
                let _ = respond_to.send(Ok(()));
            }
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                let _ = respond_to.send(Err(ConnectError::Transport(e.to_string())));
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                let _ = respond_to.send(Err(ConnectError::Timeout(timeout.as_millis() as u64)));
            }
        }
    }

    async fn handle_disconnect(&mut self, reason: Option<String>, respond_to: oneshot::Sender<()>) {
        self.intentional_disconnect = true;
        self.reconnect_deadline = None;
        self.reset_deadline = None;
        if let Some(transport) = self.transport.as_mut() {
            let _ = transport.close().await;
        }
        self.transport = None;
        self.state = ConnectionState::Disconnected;
        self.requests
            .cancel_all(reason.as_deref().unwrap_or("disconnected"));
        if !self.buffer.is_empty() {
            self.buffer.clear();
            self.events.emit(Event::new("buffer:cleared", json!({})));
        }
        self.state_manager.note_disconnected();
        self.events
            .emit(Event::new("starling:disconnected", json!({"reason": reason})));
        let _ = respond_to.send(());
    }

    async fn handle_transport_event(&mut self, event: Option<Result<Message, WsError>>) {
        match event {
            Some(Ok(message)) => self.handle_incoming(message).await,
            Some(Err(e)) => self.handle_unexpected_disconnect(e.to_string()).await,
            None => self.handle_unexpected_disconnect("connection closed by peer".to_string()).await,
        }
    }

    async fn handle_unexpected_disconnect(&mut self, reason: String) {
        self.transport = None;
        self.reset_deadline = None;
        self.state_manager.note_disconnected();
        self.events
            .emit(Event::new("starling:disconnected", json!({"reason": reason})));

        if self.intentional_disconnect {
            self.state = ConnectionState::Disconnected;
            return;
        }

        self.requests.cancel_all("connection lost, request will not be retried");
        self.state = ConnectionState::Reconnecting;
        self.events.emit(Event::new("starling:reconnect:started", json!({})));
        let delay = self.reconnect.next_delay_ms();
        self.events.emit(Event::new(
            "starling:reconnect:scheduled",
            json!({"attempt": 0, "delay_ms": delay}),
        ));
        self.reconnect_deadline = Some(TokioInstant::now() + Duration::from_millis(delay));
    }

    async fn attempt_reconnect(&mut self) {
        let attempt_started = TokioInstant::now();
        let attempt = self.reconnect.begin_attempt();
        if self.reconnect.exhausted(attempt) {
            self.events.emit(Event::new(
                "starling:reconnect:max_attempts",
                json!({"attempts": attempt - 1}),
            ));
            self.events.emit(Event::new("starling:reconnect:stopped", json!({})));
            self.state = ConnectionState::Disconnected;
            return;
        }

        self.events
            .emit(Event::new("starling:reconnect:attempt", json!({"attempt": attempt})));

        let token = self.state_manager.token().map(|t| t.0);
        let url = self.config.infra.connection.url.clone();
        match transport::connect(&url, token.as_deref()).await {
            Ok(t) => {
                self.transport = Some(Box::new(t));
                self.state = ConnectionState::Connected;
                self.reconnect
                    .record_success(attempt_started.elapsed().as_millis() as u64);
                self.state_manager.note_reconnected();
                self.events.emit(Event::new(
                    "starling:connected",
                    json!({"at": now_ms(), "reconnected": true}),
                ));
                self.reset_deadline =
                    Some(TokioInstant::now() + Duration::from_millis(self.reconnect.reset_threshold_ms()));
                self.flush_buffer().await;
                self.refresh_state_after_connect().await;
            }
            Err(e) => {
                self.reconnect.record_failure();
                self.events.emit(Event::new(
                    "starling:reconnect:failed",
                    json!({"attempt": attempt, "error": e.to_string()}),
                ));
                let delay = self.reconnect.next_delay_ms();
                self.events.emit(Event::new(
                    "starling:reconnect:scheduled",
                    json!({"attempt": attempt, "delay_ms": delay}),
                ));
                self.reconnect_deadline = Some(TokioInstant::now() + Duration::from_millis(delay));
            }
        }
    }

    async fn refresh_state_after_connect(&mut self) {
        let force = self.state_manager.force_refresh_on_reconnect() || self.state_manager.token().is_none();
        if self.state_manager.check_refresh_allowed(force).is_err() {
            return;
        }
        if !self.state_manager.begin_refresh() {
            return;
        }
        self.begin_state_refresh(self.state_manager.retry_attempts().max(1)).await;
    }

    async fn maybe_periodic_refresh(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if self.state_manager.check_refresh_allowed(false).is_err() {
            return;
        }
        if !self.state_manager.begin_refresh() {
            return;
        }
        self.begin_state_refresh(self.state_manager.retry_attempts().max(1)).await;
    }

    async fn handle_sync(&mut self, respond_to: oneshot::Sender<Result<RecoveryToken, StateError>>) {
        if self.state != ConnectionState::Connected {
            let _ = respond_to.send(Err(StateError::NotConnected));
            return;
        }
        if let Err(e) = self.state_manager.check_refresh_allowed(true) {
            let _ = respond_to.send(Err(e));
            return;
        }
        if !self.state_manager.begin_refresh() {
            let _ = respond_to.send(Err(StateError::RefreshInProgress));
            return;
        }
        self.pending_sync = Some(respond_to);
        self.begin_state_refresh(self.state_manager.retry_attempts().max(1)).await;
    }

    /// Issue (or re-issue) one `starling:state` request and hand the
    /// resulting [`RequestHandle`] to a detached task that awaits it and
    /// reports the outcome back over `refresh_tx`. Crucially, this method
    /// itself never awaits the response — only the quick, local
    /// track-then-write — so the reactor's own `select!` loop stays free to
    /// receive the inbound response that the spawned task is waiting on.
    /// Without that split, a refresh issued from inside `handle_connect`
    /// would deadlock: nothing else could ever read the socket to resolve
    /// the very request blocking it.
    async fn begin_state_refresh(&mut self, attempts_left: u32) {
        let request_id = Uuid::new_v4();
        let handle = self.requests.track(
            request_id,
            self.config.bootstrap.request.default_timeout_ms,
            self.cancel_tx.clone(),
        );
        let content = self.codec.encode(ProtocolFrame::Request {
            request_id,
            method: REFRESH_METHOD.to_string(),
            payload: None,
            options: None,
        });
        self.write_or_buffer(content).await;

        let retry_delay = self.state_manager.retry_delay();
        let tx = self.refresh_tx.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(data) => {
                    let token = data.get("token").and_then(|v| v.as_str()).map(str::to_string);
                    let event = match token {
                        Some(t) => RefreshEvent::Success(RecoveryToken(t)),
                        None => RefreshEvent::Failed(RequestError::Failed(ErrorObject::new(
                            "E_INVALID_STATE_RESPONSE",
                            "state refresh response was missing a token field",
                        ))),
                    };
                    let _ = tx.send(event);
                }
                Err(e) => {
                    let remaining = attempts_left.saturating_sub(1);
                    if remaining == 0 {
                        let _ = tx.send(RefreshEvent::Failed(e));
                    } else {
                        tokio::time::sleep(retry_delay).await;
                        let _ = tx.send(RefreshEvent::Retry {
                            attempts_left: remaining,
                        });
                    }
                }
            }
        });
    }

    async fn handle_refresh_event(&mut self, event: RefreshEvent) {
        match event {
            RefreshEvent::Success(token) => {
                self.state_manager.set_token(token.clone());
                self.state_manager.note_refresh_success();
                self.events
                    .emit(Event::new("state:refreshed", json!({"token": token.as_str()})));
                self.state_manager.end_refresh();
                if let Some(respond_to) = self.pending_sync.take() {
                    let _ = respond_to.send(Ok(token));
                }
            }
            RefreshEvent::Retry { attempts_left } => {
                self.begin_state_refresh(attempts_left).await;
            }
            RefreshEvent::Failed(e) => {
                tracing::warn!(error = %e, "state refresh failed");
                self.state_manager.note_refresh_failure();
                self.state_manager.end_refresh();
                if let Some(respond_to) = self.pending_sync.take() {
                    let _ = respond_to.send(Err(StateError::RequestFailed(e)));
                }
            }
        }
    }

    async fn handle_request(
        &mut self,
        method: String,
        payload: Option<Value>,
        options: RequestOptions,
        respond_to: oneshot::Sender<RequestHandle>,
    ) {
        let request_id = Uuid::new_v4();
        let timeout_ms = options
            .timeout_ms
            .unwrap_or(self.config.bootstrap.request.default_timeout_ms)
            .min(self.config.bootstrap.request.max_timeout_ms);

        let handle = self.requests.track(request_id, timeout_ms, self.cancel_tx.clone());

        if self.state != ConnectionState::Connected && !options.retry {
            self.requests
                .fail(request_id, ErrorObject::new("E_NOT_CONNECTED", "not connected"));
        } else {
            let content = self.codec.encode(ProtocolFrame::Request {
                request_id,
                method,
                payload,
                options: options.metadata,
            });
            self.write_or_buffer(content).await;
        }

        let _ = respond_to.send(handle);
    }

    async fn handle_incoming(&mut self, message: Message) {
        match self.codec.decode(&message) {
            DecodeOutcome::Valid(frame) => self.handle_frame(frame.body).await,
            DecodeOutcome::JsonInvalid(value) => {
                self.events.emit(Event::new("message:invalid", value.clone()));
                if let Some(hook) = self.hooks.json.lock().expect("hooks mutex poisoned").as_ref() {
                    hook(value);
                }
            }
            DecodeOutcome::Text(text) => {
                if let Some(hook) = self.hooks.text.lock().expect("hooks mutex poisoned").as_ref() {
                    hook(text);
                }
            }
            DecodeOutcome::Binary(bytes) => {
                if let Some(hook) = self.hooks.binary.lock().expect("hooks mutex poisoned").as_ref() {
                    hook(bytes);
                }
            }
        }
    }

    async fn handle_frame(&mut self, body: ProtocolFrame) {
        match body {
            ProtocolFrame::Request {
                request_id,
                method,
                payload,
                options,
            } => {
                self.events
                    .emit(Event::new("message:request", json!({"method": method})));
                self.dispatch_request(request_id, method, payload, options).await;
            }
            ProtocolFrame::Response {
                request_id,
                success,
                data,
                error,
            } => {
                self.events.emit(Event::new(
                    "message:response",
                    json!({"requestId": request_id, "success": success}),
                ));
                if success {
                    self.requests.complete(request_id, data.unwrap_or(Value::Null));
                } else {
                    self.requests.fail(
                        request_id,
                        error.unwrap_or_else(|| ErrorObject::new("E_UNKNOWN", "no error detail provided")),
                    );
                }
            }
            ProtocolFrame::Notification { notification } => {
                self.events.emit(Event::new(
                    "message:notification",
                    json!({"topic": notification.topic, "requestId": notification.request_id}),
                ));
                if let Some(request_id) = notification.request_id {
                    self.requests
                        .deliver_progress(request_id, notification.data.unwrap_or(Value::Null));
                } else if let Some(topic) = notification.topic {
                    self.topics.dispatch(&topic, &notification.data.unwrap_or(Value::Null));
                } else if let Some(hook) = self
                    .hooks
                    .notification
                    .lock()
                    .expect("hooks mutex poisoned")
                    .as_ref()
                {
                    hook(notification.data.unwrap_or(Value::Null));
                }
            }
            ProtocolFrame::Error { request_id, error } => {
                self.events.emit(Event::new(
                    "message:error",
                    json!({"requestId": request_id, "code": error.code.clone()}),
                ));
                match request_id {
                    Some(id) => self.requests.fail(id, error),
                    None => self
                        .events
                        .emit(Event::new("starling:error", json!({"code": error.code, "message": error.message}))),
                }
            }
        }
    }

    async fn dispatch_request(
        &mut self,
        request_id: Uuid,
        method: String,
        payload: Option<Value>,
        options: Option<Value>,
    ) {
        let dispatch = self.methods.get(&method).map(|entry| {
            (entry.handler.clone(), entry.timeout_ms)
        });

        let (handler, timeout_ms) = match dispatch {
            Some(pair) => pair,
            None => {
                let content = self.codec.encode(ProtocolFrame::Response {
                    request_id,
                    success: false,
                    data: None,
                    error: Some(ErrorObject::new(
                        "METHOD_NOT_FOUND",
                        format!("no handler registered for '{method}'"),
                    )),
                });
                self.write_or_buffer(content).await;
                return;
            }
        };

        let finished = Arc::new(AtomicBool::new(false));
        let (ctx_tx, mut ctx_rx) = mpsc::unbounded_channel();
        let ctx = RequestContext::new(request_id, method, now_ms(), payload, options, finished, ctx_tx);

        let results_tx = self.method_results_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ctx_rx.recv().await {
                let terminal = matches!(msg, ContextMessage::Success(_) | ContextMessage::Error(_));
                let _ = results_tx.send((request_id, msg));
                if terminal {
                    break;
                }
            }
        });

        let ctx_for_timeout = ctx.clone();
        tokio::spawn(async move {
            let handler_fut = handler(ctx);
            if tokio::time::timeout(Duration::from_millis(timeout_ms), handler_fut)
                .await
                .is_err()
            {
                let _ = ctx_for_timeout.error(ErrorObject::new("METHOD_TIMEOUT", "method handler timed out"));
            }
        });
    }

    async fn handle_method_result(&mut self, request_id: Uuid, msg: ContextMessage) {
        let content = match msg {
            ContextMessage::Notification(data) => self.codec.encode(ProtocolFrame::Notification {
                notification: crate::frame::NotificationBody {
                    topic: None,
                    request_id: Some(request_id),
                    data: Some(data),
                },
            }),
            ContextMessage::Success(data) => self.codec.encode(ProtocolFrame::Response {
                request_id,
                success: true,
                data: Some(data),
                error: None,
            }),
            ContextMessage::Error(error) => self.codec.encode(ProtocolFrame::Response {
                request_id,
                success: false,
                data: None,
                error: Some(error),
            }),
        };
        self.write_or_buffer(content).await;
    }

    async fn write_or_buffer(&mut self, content: String) {
        if self.state == ConnectionState::Connected {
            if let Some(transport) = self.transport.as_mut() {
                match transport.send(Message::Text(content.clone())).await {
                    Ok(()) => return,
                    Err(e) => tracing::warn!(error = %e, "write failed, buffering frame"),
                }
            }
        }

        match self.buffer.add(content, now_ms()) {
            AddOutcome::Added => {
                self.events
                    .emit(Event::new("buffer:added", json!({"size": self.buffer.len()})));
            }
            AddOutcome::AddedAfterDroppingOldest => {
                self.events
                    .emit(Event::new("buffer:full", json!({"size": self.buffer.len()})));
            }
        }
    }

    async fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut flushed = 0usize;
        while let Some(frame) = self.buffer.pop_front() {
            let Some(transport) = self.transport.as_mut() else {
                self.buffer.push_front(frame);
                break;
            };
            match transport.send(Message::Text(frame.content.clone())).await {
                Ok(()) => flushed += 1,
                Err(_) => {
                    self.buffer.push_front(frame);
                    break;
                }
            }
        }
        if flushed > 0 {
            self.events
                .emit(Event::new("buffer:flushed", json!({"count": flushed})));
        }
        if self.buffer.is_empty() {
            self.events.emit(Event::new("buffer:cleared", json!({})));
        }
    }
}
