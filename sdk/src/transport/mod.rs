//! Request/response and pub/sub multiplexer over the reconnecting socket.
//!
//! A single driver task owns every piece of mutable state (pending requests,
//! offline queue, rate limiter, keepalive bookkeeping); the cloneable
//! [`Transport`] handle talks to it over a command channel. Each outstanding
//! request owns a unique response topic derived from its token, so no
//! per-topic locking is needed anywhere.

mod queue;
mod rate_limit;
mod stats;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rand::{distributions::Alphanumeric, Rng};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

pub use self::stats::{Health, TransportStats};
use self::{queue::RequestQueue, rate_limit::RateLimiter, stats::StatsInner};
use crate::{
    bus::{EventBus, Subscription},
    error::Error,
    frame::{Frame, FrameKind, Value},
    socket::{ReadyState, ReconnectingSocket, SocketEvent, SocketOptions},
    RequestToken, Result, Topic,
};

/// Local topic emitted when the socket (re)opens.
pub const TOPIC_OPEN: &str = "transport.open";
/// Local topic emitted when the socket closes, with `{code, reason}`.
pub const TOPIC_CLOSE: &str = "transport.close";
/// Local topic emitted exactly once when the transport is disposed.
pub const TOPIC_CLOSED: &str = "transport.closed";
/// Local topic emitted when a malformed frame is dropped.
pub const TOPIC_ERROR: &str = "transport.error";

const EVENT_CLIENT_ID: &str = "App.Actions.GetClientId";
const EVENT_BOOT_ERROR: &str = "Events.BootError";

/// Per-call knobs.
#[derive(Debug, Default, Clone)]
pub struct CallOptions {
    /// Overall bound on the call, including queueing time.
    pub timeout: Option<Duration>,
    /// Cancels the call when fired; an already-cancelled token fails it
    /// immediately.
    pub abort:   Option<CancellationToken>,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub ping_interval:   Duration,
    pub max_retries:     u32,
    pub retry_base:      Duration,
    pub retry_cap:       Duration,
    pub rate_limit:      usize,
    pub rate_window:     Duration,
    pub queue_limit:     usize,
    pub queue_max_age:   Duration,
    pub connect_timeout: Duration,
    pub socket:          SocketOptions,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            ping_interval:   Duration::from_secs(30),
            max_retries:     10,
            retry_base:      Duration::from_secs(1),
            retry_cap:       Duration::from_secs(30),
            rate_limit:      50,
            rate_window:     Duration::from_secs(1),
            queue_limit:     100,
            queue_max_age:   Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            socket:          SocketOptions::default(),
        }
    }
}

impl TransportOptions {
    pub fn validate(&self) -> Result<()> {
        if self.ping_interval < Duration::from_secs(5) || self.ping_interval > Duration::from_secs(120)
        {
            return Err(Error::InvalidConfig(format!(
                "ping interval must be between 5s and 120s, got {:?}",
                self.ping_interval
            )));
        }
        if self.max_retries > 20 {
            return Err(Error::InvalidConfig(format!(
                "max retries must be at most 20, got {}",
                self.max_retries
            )));
        }
        if self.rate_limit == 0 {
            return Err(Error::InvalidConfig("rate limit must be positive".into()));
        }
        if self.queue_limit == 0 {
            return Err(Error::InvalidConfig("queue limit must be positive".into()));
        }
        Ok(())
    }
}

struct CallRequest {
    action: String,
    token:  RequestToken,
    data:   Value,
    reply:  oneshot::Sender<Result<Value>>,
}

enum Command {
    Call(CallRequest),
    Forget { token: RequestToken },
    Connect { ack: oneshot::Sender<Result<()>> },
    Reconnect { ack: oneshot::Sender<Result<()>> },
    Close { ack: oneshot::Sender<()> },
}

/// Handle to the multiplexer. Cheap to clone; all clones address the same
/// driver task.
#[derive(Clone)]
pub struct Transport {
    bus:          EventBus<Value>,
    cmd_tx:       mpsc::UnboundedSender<Command>,
    options:      Arc<TransportOptions>,
    stats:        Arc<Mutex<StatsInner>>,
    client_id:    Arc<Mutex<Option<String>>>,
    state_rx:     watch::Receiver<ReadyState>,
    token_prefix: Arc<str>,
    next_token:   Arc<AtomicU64>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state())
            .finish()
    }
}

impl Transport {
    /// Spawns the driver task for the notebook at `url`.
    ///
    /// With the default lazy socket no connection attempt is made until the
    /// first [`invoke`](Self::invoke) or [`connect`](Self::connect).
    pub fn spawn(url: impl Into<String>, options: TransportOptions) -> Result<Transport> {
        options.validate()?;
        let (socket, socket_events) =
            ReconnectingSocket::spawn(url, options.socket.clone());
        let state_rx = socket.state_stream();
        let bus = EventBus::new();
        let stats = Arc::new(Mutex::new(StatsInner::default()));
        let client_id = Arc::new(Mutex::new(None));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let options = Arc::new(options);

        let driver = Driver {
            options: Arc::clone(&options),
            bus: bus.clone(),
            socket,
            socket_events,
            cmd_rx,
            pending: HashMap::new(),
            topics: HashMap::new(),
            queue: RequestQueue::new(options.queue_limit, options.queue_max_age),
            limiter: RateLimiter::new(options.rate_limit, options.rate_window),
            stats: Arc::clone(&stats),
            client_id: Arc::clone(&client_id),
            connect_waiters: Vec::new(),
            ever_connected: false,
            pings_unanswered: 0,
            rate_limited: None,
            stopped: false,
            disposed: false,
        };
        tokio::spawn(driver.run());

        let token_prefix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        Ok(Transport {
            bus,
            cmd_tx,
            options,
            stats,
            client_id,
            state_rx,
            token_prefix: token_prefix.into(),
            next_token: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Issues `action` with default call options.
    pub async fn invoke(&self, action: &str, data: Value) -> Result<Value> {
        self.invoke_with(action, data, CallOptions::default()).await
    }

    /// Issues `action`, retrying transparently on connection trouble.
    ///
    /// Application errors, rate limits, timeouts and aborts are returned to
    /// the caller without retry.
    #[instrument(level = "debug", skip(self, data, options))]
    pub async fn invoke_with(
        &self,
        action: &str,
        data: Value,
        options: CallOptions,
    ) -> Result<Value> {
        if let Some(abort) = &options.abort {
            if abort.is_cancelled() {
                return Err(Error::Aborted);
            }
        }
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(action, data.clone(), &options).await {
                Err(err) if err.is_retriable() && attempt < self.options.max_retries => {
                    let delay = retry_delay(&self.options, attempt);
                    attempt += 1;
                    debug!(action, attempt, ?delay, %err, "retrying request");
                    match &options.abort {
                        Some(abort) => tokio::select! {
                            _ = tokio::time::sleep(delay) => {},
                            _ = abort.cancelled() => return Err(Error::Aborted),
                        },
                        None => tokio::time::sleep(delay).await,
                    }
                },
                other => return other,
            }
        }
    }

    async fn attempt(&self, action: &str, data: Value, options: &CallOptions) -> Result<Value> {
        let token = self.next_token();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call(CallRequest {
                action: action.to_owned(),
                token: token.clone(),
                data,
                reply: reply_tx,
            }))
            .map_err(|_| Error::Closed)?;

        let timeout = options.timeout;
        let abort = options.abort.clone();
        tokio::select! {
            reply = &mut reply_rx => reply.unwrap_or(Err(Error::Closed)),
            _ = sleep_forever_if_none(timeout) => {
                let _ = self.cmd_tx.send(Command::Forget { token });
                Err(Error::RequestTimeout(timeout.unwrap_or_default()))
            },
            _ = cancelled_forever_if_none(abort) => {
                let _ = self.cmd_tx.send(Command::Forget { token });
                Err(Error::Aborted)
            },
        }
    }

    /// Registers a bus handler for a server push topic.
    pub fn listen(
        &self,
        topic: impl Into<Topic>,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.on(topic, handler)
    }

    /// Registers a bus handler for the next emission of a topic only.
    pub fn listen_once(
        &self,
        topic: impl Into<Topic>,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.once(topic, handler)
    }

    /// Ensures the socket is open, coalescing concurrent callers onto the
    /// same in-flight attempt.
    #[instrument(level = "debug", skip(self))]
    pub async fn connect(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { ack: ack_tx })
            .map_err(|_| Error::Closed)?;
        match tokio::time::timeout(self.options.connect_timeout, ack_rx).await {
            Err(_) => Err(Error::ConnectTimeout(self.options.connect_timeout)),
            Ok(Err(_)) => Err(Error::Closed),
            Ok(Ok(result)) => result,
        }
    }

    /// Explicitly reconnects, clearing any stop imposed by close-code
    /// policy (including rate-limit fail-fast).
    #[instrument(level = "debug", skip(self))]
    pub async fn reconnect(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Reconnect { ack: ack_tx })
            .map_err(|_| Error::Closed)?;
        match tokio::time::timeout(self.options.connect_timeout, ack_rx).await {
            Err(_) => Err(Error::ConnectTimeout(self.options.connect_timeout)),
            Ok(Err(_)) => Err(Error::Closed),
            Ok(Ok(result)) => result,
        }
    }

    /// Keepalive probe; resolves with the server's reply payload.
    pub async fn ping(&self) -> Result<Value> { self.invoke("ping", Value::Null).await }

    /// Rejects all pending and queued requests, releases subscriptions,
    /// closes the socket and emits a final `transport.closed` event.
    /// Subsequent calls are no-ops.
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { ack: ack_tx }).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn state(&self) -> ReadyState { *self.state_rx.borrow() }

    /// How many bus handlers are registered for `topic`.
    pub fn listener_count(&self, topic: &str) -> usize { self.bus.handler_count(topic) }

    /// The id the server assigned this client, once reported.
    pub fn client_id(&self) -> Option<String> { self.client_id.lock().unwrap().clone() }

    pub fn stats(&self) -> TransportStats {
        self.stats.lock().unwrap().snapshot(Instant::now())
    }

    pub fn health(&self) -> Health {
        self.stats().health(self.options.ping_interval)
    }

    fn next_token(&self) -> RequestToken {
        let n = self.next_token.fetch_add(1, Ordering::Relaxed);
        format!("{}{n}", self.token_prefix)
    }
}

async fn sleep_forever_if_none(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

async fn cancelled_forever_if_none(abort: Option<CancellationToken>) {
    match abort {
        Some(abort) => abort.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

fn retry_delay(options: &TransportOptions, attempt: u32) -> Duration {
    let exp = 2f64.powi(attempt as i32);
    let raw = options.retry_base.as_millis() as f64 * exp;
    let capped = raw.min(options.retry_cap.as_millis() as f64);
    let jittered = capped / 2.0 + rand::thread_rng().gen_range(0.0..capped / 2.0);
    Duration::from_millis(jittered as u64)
}

struct Pending {
    action:         String,
    response_topic: Topic,
    error_topic:    Topic,
    reply:          oneshot::Sender<Result<Value>>,
    started:        Instant,
}

/// The driver task. Owns all mutable multiplexer state; everything reaches
/// it through the command channel or the socket event channel.
struct Driver {
    options:         Arc<TransportOptions>,
    bus:             EventBus<Value>,
    socket:          ReconnectingSocket,
    socket_events:   mpsc::UnboundedReceiver<SocketEvent>,
    cmd_rx:          mpsc::UnboundedReceiver<Command>,
    pending:         HashMap<RequestToken, Pending>,
    topics:          HashMap<Topic, RequestToken>,
    queue:           RequestQueue<CallRequest>,
    limiter:         RateLimiter,
    stats:           Arc<Mutex<StatsInner>>,
    client_id:       Arc<Mutex<Option<String>>>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    ever_connected:  bool,
    /// Keepalive pings sent since the last pong.
    pings_unanswered: u32,
    /// Fail-fast reason after a 1008 close, until an explicit reconnect.
    rate_limited:    Option<String>,
    /// Set after a normal (1000) close; cleared by connect/reconnect.
    stopped:         bool,
    disposed:        bool,
}

impl Driver {
    async fn run(mut self) {
        let mut keepalive = tokio::time::interval(self.options.ping_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so the first ping
        // goes out one interval after connect.
        keepalive.tick().await;

        loop {
            tokio::select! {
                event = self.socket_events.recv() => match event {
                    Some(event) => self.on_socket_event(event),
                    None => break,
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.dispose();
                        break;
                    },
                },
                _ = keepalive.tick() => self.on_keepalive(),
            }
            if self.disposed {
                break;
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call(call) => self.handle_call(call),
            Command::Forget { token } => self.forget(&token),
            Command::Connect { ack } => {
                if self.disposed {
                    let _ = ack.send(Err(Error::Closed));
                } else if let Some(reason) = &self.rate_limited {
                    let _ = ack.send(Err(Error::RateLimited(reason.clone())));
                } else if self.socket.state() == ReadyState::Open {
                    let _ = ack.send(Ok(()));
                } else {
                    self.stopped = false;
                    if self.socket.state() == ReadyState::Closed {
                        self.socket.reconnect();
                    }
                    self.connect_waiters.push(ack);
                }
            },
            Command::Reconnect { ack } => {
                if self.disposed {
                    let _ = ack.send(Err(Error::Closed));
                } else {
                    self.rate_limited = None;
                    self.stopped = false;
                    self.socket.reconnect();
                    self.connect_waiters.push(ack);
                }
            },
            Command::Close { ack } => {
                self.dispose();
                let _ = ack.send(());
            },
        }
    }

    fn handle_call(&mut self, call: CallRequest) {
        if self.disposed || self.stopped {
            let _ = call.reply.send(Err(Error::Closed));
            return;
        }
        if let Some(reason) = &self.rate_limited {
            let _ = call.reply.send(Err(Error::RateLimited(reason.clone())));
            return;
        }
        match self.socket.state() {
            ReadyState::Open => {
                if self.limiter.try_acquire(Instant::now()) {
                    self.send_call(call);
                } else {
                    trace!(action = %call.action, "rate limit window saturated");
                    self.stats.lock().unwrap().errors += 1;
                    let _ = call
                        .reply
                        .send(Err(Error::RateLimited("client rate limit window saturated".into())));
                }
            },
            _ => {
                // Submitting while disconnected both queues the request and,
                // for a lazily closed socket, starts the first connection
                // attempt.
                if self.socket.state() == ReadyState::Closed {
                    self.socket.reconnect();
                }
                if let Some(evicted) = self.queue.push(call, Instant::now()) {
                    let _ = evicted.reply.send(Err(Error::QueueOverflow));
                }
                self.update_queue_depth();
            },
        }
    }

    fn send_call(&mut self, call: CallRequest) {
        let response_topic = format!("{}_{}", call.action, call.token);
        let error_topic = format!("{}_{}_error", call.action, call.token);
        let frame = Frame::request(
            call.action.as_str(),
            response_topic.as_str(),
            error_topic.as_str(),
            call.data,
        );
        self.topics.insert(response_topic.clone(), call.token.clone());
        self.topics.insert(error_topic.clone(), call.token.clone());
        self.pending.insert(call.token, Pending {
            action: call.action,
            response_topic,
            error_topic,
            reply: call.reply,
            started: Instant::now(),
        });
        self.socket.send(frame.encode());
        self.stats.lock().unwrap().messages_sent += 1;
    }

    fn forget(&mut self, token: &str) {
        if let Some(pending) = self.pending.remove(token) {
            self.topics.remove(&pending.response_topic);
            self.topics.remove(&pending.error_topic);
        }
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Open => self.on_open(),
            SocketEvent::Message(bytes) => self.dispatch(&bytes),
            SocketEvent::Error(err) => {
                warn!(%err, "socket error");
                self.stats.lock().unwrap().errors += 1;
                self.bus.emit(TOPIC_ERROR, &Value::Str(err));
            },
            SocketEvent::Close { code, reason } => self.on_close(code, reason),
        }
    }

    fn on_open(&mut self) {
        {
            let mut stats = self.stats.lock().unwrap();
            stats.connected = true;
            if self.ever_connected {
                stats.reconnects += 1;
            }
            stats.last_ping = None;
            stats.last_pong = None;
        }
        self.ever_connected = true;
        self.bus.emit(TOPIC_OPEN, &Value::Null);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.flush_queue();
    }

    fn flush_queue(&mut self) {
        let now = Instant::now();
        let (fresh, expired) = self.queue.flush(now);
        for call in expired {
            let _ = call.reply.send(Err(Error::QueueExpired));
        }
        for call in fresh {
            if self.limiter.try_acquire(now) {
                self.send_call(call);
            } else {
                let _ = call
                    .reply
                    .send(Err(Error::RateLimited("client rate limit window saturated".into())));
            }
        }
        self.update_queue_depth();
    }

    fn on_close(&mut self, code: u16, reason: String) {
        self.stats.lock().unwrap().connected = false;
        self.bus.emit(
            TOPIC_CLOSE,
            &Value::map([
                ("code", Value::Int(i64::from(code))),
                ("reason", Value::from(reason.as_str())),
            ]),
        );
        match code {
            1000 => {
                debug!("normal close; transport stops");
                self.stopped = true;
                self.socket.close(1000, "normal closure");
                self.reject_in_flight(|| Error::connection_lost(Some(1000), reason.clone()));
                self.reject_queued(|| Error::connection_lost(Some(1000), reason.clone()));
                self.reject_waiters(|| Error::connection_lost(Some(1000), reason.clone()));
            },
            1008 => {
                warn!(%reason, "policy close; transport stops until explicit reconnect");
                self.rate_limited = Some(reason.clone());
                self.socket.close(1008, reason.clone());
                self.reject_in_flight(|| Error::RateLimited(reason.clone()));
                self.reject_queued(|| Error::RateLimited(reason.clone()));
                self.reject_waiters(|| Error::RateLimited(reason.clone()));
            },
            code => {
                // 1001, 1006 and anything unknown: the socket is already
                // reconnecting; in-flight requests are retried by the caller
                // side of `invoke`.
                debug!(code, %reason, "close; socket will reconnect");
                self.reject_in_flight(|| Error::connection_lost(Some(code), reason.clone()));
            },
        }
    }

    fn reject_in_flight(&mut self, err: impl Fn() -> Error) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(err()));
        }
        self.topics.clear();
    }

    fn reject_queued(&mut self, err: impl Fn() -> Error) {
        for call in self.queue.drain_all() {
            let _ = call.reply.send(Err(err()));
        }
        self.update_queue_depth();
    }

    fn reject_waiters(&mut self, err: impl Fn() -> Error) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(err()));
        }
    }

    fn on_keepalive(&mut self) {
        if self.disposed {
            return;
        }
        // Queue maintenance runs even while disconnected.
        let now = Instant::now();
        for call in self.queue.expire(now) {
            let _ = call.reply.send(Err(Error::QueueExpired));
        }
        self.update_queue_depth();
        if self.socket.state() != ReadyState::Open {
            return;
        }

        if self.pings_unanswered >= 3 {
            warn!("no pong within three ping intervals; forcing reconnect");
            self.pings_unanswered = 0;
            {
                let mut stats = self.stats.lock().unwrap();
                stats.last_ping = None;
                stats.last_pong = None;
            }
            self.socket.reconnect();
            return;
        }

        let (reply, _discarded) = oneshot::channel();
        let token = format!("keepalive{}", rand::thread_rng().gen::<u32>());
        self.send_call(CallRequest {
            action: "ping".to_owned(),
            token,
            data: Value::Null,
            reply,
        });
        self.pings_unanswered += 1;
        self.stats.lock().unwrap().last_ping = Some(now);
    }

    fn dispatch(&mut self, bytes: &[u8]) {
        self.stats.lock().unwrap().messages_received += 1;
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "dropping malformed frame");
                self.stats.lock().unwrap().errors += 1;
                self.bus.emit(TOPIC_ERROR, &Value::Str(err.to_string()));
                return;
            },
        };
        trace!(kind = %frame.kind, event = ?frame.event, "frame");
        match frame.kind {
            FrameKind::Response => match frame.response_event {
                Some(topic) => self.resolve_response(&topic, frame.data),
                None => self.invalid_frame("response frame without responseEvent"),
            },
            FrameKind::Error => match frame.error_event {
                Some(topic) => self.resolve_error(&topic, &frame.data),
                None => self.invalid_frame("error frame without errorEvent"),
            },
            FrameKind::Event => match frame.event.as_deref() {
                // Some deployments wrap replies as events named `response`
                // and `error`, with the addressed topic inside the data.
                Some("response") => {
                    match frame.data.get("responseEvent").and_then(Value::as_str) {
                        Some(topic) => {
                            let topic = topic.to_owned();
                            let data = frame.data.get("data").cloned().unwrap_or(Value::Null);
                            self.resolve_response(&topic, data);
                        },
                        None => self.invalid_frame("response event without responseEvent"),
                    }
                },
                Some("error") => {
                    match frame.data.get("errorEvent").and_then(Value::as_str) {
                        Some(topic) => {
                            let topic = topic.to_owned();
                            let data = frame.data.get("data").cloned().unwrap_or(Value::Null);
                            self.resolve_error(&topic, &data);
                        },
                        None => self.invalid_frame("error event without errorEvent"),
                    }
                },
                Some(EVENT_CLIENT_ID) => {
                    let id = frame
                        .data
                        .get("clientId")
                        .and_then(Value::as_str)
                        .or_else(|| frame.data.as_str())
                        .map(str::to_owned);
                    debug!(?id, "client id assigned");
                    *self.client_id.lock().unwrap() = id;
                    self.bus.emit(EVENT_CLIENT_ID, &frame.data);
                },
                Some(EVENT_BOOT_ERROR) => {
                    error!(data = ?frame.data, "notebook boot error");
                },
                Some(event) => {
                    let topic = frame.alias.as_deref().unwrap_or(event);
                    self.bus.emit(topic, &frame.data);
                },
                None => self.invalid_frame("event frame without event"),
            },
            FrameKind::Request => self.invalid_frame("unexpected request frame from server"),
        }
    }

    fn resolve_response(&mut self, topic: &str, data: Value) {
        let Some(token) = self.topics.remove(topic) else {
            trace!(topic, "response for unknown request");
            return;
        };
        if let Some(pending) = self.pending.remove(&token) {
            self.topics.remove(&pending.error_topic);
            let elapsed = pending.started.elapsed();
            if pending.action == "ping" {
                self.pings_unanswered = 0;
            }
            let mut stats = self.stats.lock().unwrap();
            stats.record_response(elapsed);
            if pending.action == "ping" {
                stats.last_pong = Some(Instant::now());
            }
            drop(stats);
            let _ = pending.reply.send(Ok(data));
        }
    }

    fn resolve_error(&mut self, topic: &str, data: &Value) {
        let Some(token) = self.topics.remove(topic) else {
            trace!(topic, "error for unknown request");
            return;
        };
        if let Some(pending) = self.pending.remove(&token) {
            self.topics.remove(&pending.response_topic);
            self.stats.lock().unwrap().errors += 1;
            let _ = pending.reply.send(Err(Error::from_error_payload(data)));
        }
    }

    fn invalid_frame(&mut self, what: &str) {
        warn!(what, "dropping invalid frame");
        self.stats.lock().unwrap().errors += 1;
        self.bus.emit(TOPIC_ERROR, &Value::from(what));
    }

    fn update_queue_depth(&mut self) {
        self.stats.lock().unwrap().queue_depth = self.queue.len();
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.reject_in_flight(|| Error::connection_lost(None, "transport closed"));
        self.reject_queued(|| Error::connection_lost(None, "transport closed"));
        self.reject_waiters(|| Error::Closed);
        self.socket.close(1000, "transport disposed");
        self.stats.lock().unwrap().connected = false;
        self.bus.emit(TOPIC_CLOSED, &Value::Null);
        self.bus.clear();
    }
}
