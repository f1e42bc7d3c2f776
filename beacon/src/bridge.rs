//! The beacon bridge: handshake, verb-paired request/response, and the
//! debugging operations built on them.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use notebook_sdk::bus::{EventBus, Subscription};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, instrument, trace, warn};

use crate::{
    message::{verbs, BeaconMessage},
    navigator::Navigator,
    port::PreviewFrame,
    BeaconError, Result,
};

#[derive(Debug, Clone)]
pub struct BeaconOptions {
    /// Origin handed to the embedding for `postMessage`. The bridge itself
    /// does not enforce it.
    pub target_origin:     String,
    /// Full handshake attempts before giving up.
    pub handshake_tries:   u32,
    pub handshake_backoff: Duration,
    pub handshake_cap:     Duration,
    /// How long one `discover` waits for `ready`.
    pub ready_timeout:     Duration,
    /// Settle delay after the frame reports loaded.
    pub settle_delay:      Duration,
    pub request_timeout:   Duration,
    pub request_retries:   u32,
}

impl Default for BeaconOptions {
    fn default() -> Self {
        Self {
            target_origin:     "*".to_owned(),
            handshake_tries:   3,
            handshake_backoff: Duration::from_secs(1),
            handshake_cap:     Duration::from_secs(5),
            ready_timeout:     Duration::from_secs(2),
            settle_delay:      Duration::from_millis(100),
            request_timeout:   Duration::from_secs(10),
            request_retries:   3,
        }
    }
}

/// A capture request against a notebook preview path.
#[derive(Debug, Clone)]
pub struct DebugRequest {
    pub path:    String,
    /// Budget the child gets for its capture.
    pub timeout: Duration,
    /// Optional extra wait between navigation and capture.
    pub wait:    Option<Duration>,
}

impl DebugRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path:    path.into(),
            timeout: Duration::from_secs(10),
            wait:    None,
        }
    }
}

struct Inner {
    frame:       Arc<dyn PreviewFrame>,
    bus:         EventBus<Value>,
    navigator:   Navigator,
    ready:       AtomicBool,
    loaded:      watch::Receiver<bool>,
    outstanding: Mutex<HashSet<String>>,
    options:     BeaconOptions,
}

/// Parent-side bridge handle. Clones address the same frame.
#[derive(Clone)]
pub struct Beacon {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Beacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Beacon")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Beacon {
    /// Attaches the bridge to a frame.
    ///
    /// `incoming` carries every `postMessage` value the embedding received
    /// from the frame's window; non-beacon traffic is ignored here.
    /// `loaded` flips true when the frame's document is ready.
    pub fn attach(
        frame: Arc<dyn PreviewFrame>,
        incoming: mpsc::UnboundedReceiver<Value>,
        loaded: watch::Receiver<bool>,
        options: BeaconOptions,
    ) -> Beacon {
        let bus = EventBus::new();
        let navigator = Navigator::new(Arc::clone(&frame), bus.clone());
        let inner = Arc::new(Inner {
            frame,
            bus,
            navigator,
            ready: AtomicBool::new(false),
            loaded,
            outstanding: Mutex::new(HashSet::new()),
            options,
        });
        tokio::spawn(pump(incoming, Arc::downgrade(&inner)));
        Beacon { inner }
    }

    pub fn is_ready(&self) -> bool { self.inner.ready.load(Ordering::SeqCst) }

    /// Origin the embedding should pass to `postMessage`.
    pub fn target_origin(&self) -> &str { &self.inner.options.target_origin }

    pub fn navigator(&self) -> &Navigator { &self.inner.navigator }

    /// Registers a handler for pushes of `verb` (payload only).
    pub fn on(
        &self,
        verb: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.bus.on(verb, handler)
    }

    /// Completes the `discover`/`ready` handshake, retrying with backoff.
    /// A no-op once ready.
    #[instrument(level = "debug", skip(self))]
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        self.wait_loaded().await?;
        let mut attempt: u32 = 0;
        loop {
            self.inner.ready.store(false, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            let tx = Mutex::new(Some(tx));
            let sub = self.inner.bus.once(verbs::READY, move |_| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            });
            self.post(verbs::DISCOVER, Value::Null)?;
            match tokio::time::timeout(self.inner.options.ready_timeout, rx).await {
                Ok(Ok(())) => {
                    debug!("frame is ready");
                    self.inner.ready.store(true, Ordering::SeqCst);
                    return Ok(());
                },
                _ => {
                    sub.dispose();
                    attempt += 1;
                    if attempt >= self.inner.options.handshake_tries {
                        return Err(BeaconError::Handshake(format!(
                            "no ready response after {attempt} attempts"
                        )));
                    }
                    tokio::time::sleep(handshake_delay(&self.inner.options, attempt)).await;
                },
            }
        }
    }

    /// Sends `request` and resolves with the payload of the next
    /// `response` push. Responses are matched by verb, so only one call
    /// per response verb may be outstanding.
    #[instrument(level = "debug", skip(self, payload, timeout))]
    pub async fn send_and_wait_for(
        &self,
        request: &str,
        response: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.ensure_ready().await?;
        if !self
            .inner
            .outstanding
            .lock()
            .unwrap()
            .insert(response.to_owned())
        {
            return Err(BeaconError::Busy(response.to_owned()));
        }
        let result = self.request_once_per_try(request, response, payload, timeout).await;
        self.inner.outstanding.lock().unwrap().remove(response);
        result
    }

    async fn request_once_per_try(
        &self,
        request: &str,
        response: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.inner.options.request_timeout);
        for attempt in 0..self.inner.options.request_retries {
            let (tx, rx) = oneshot::channel();
            let tx = Mutex::new(Some(tx));
            let sub = self.inner.bus.once(response, move |payload| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(payload.clone());
                }
            });
            // A detached frame is fatal; only timeouts are worth retrying.
            self.post(request, payload.clone())?;
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(value)) => return Ok(value),
                _ => {
                    sub.dispose();
                    trace!(request, response, attempt, "no response; retrying");
                },
            }
        }
        Err(BeaconError::Timeout(response.to_owned()))
    }

    pub async fn ping(&self) -> Result<Value> {
        self.send_and_wait_for(verbs::PING, verbs::PONG, Value::Null, None)
            .await
    }

    pub async fn get_debug_info(&self) -> Result<Value> {
        self.send_and_wait_for(verbs::GET_DEBUG_INFO, verbs::DEBUG_INFO, Value::Null, None)
            .await
    }

    pub async fn get_console_events(&self) -> Result<Value> {
        self.send_and_wait_for(
            verbs::GET_CONSOLE_EVENTS,
            verbs::CONSOLE_EVENTS,
            Value::Null,
            None,
        )
        .await
    }

    pub async fn get_error_events(&self) -> Result<Value> {
        self.send_and_wait_for(
            verbs::GET_ERROR_EVENTS,
            verbs::ERROR_EVENTS,
            Value::Null,
            None,
        )
        .await
    }

    /// Fire-and-forget: the child acknowledges nothing.
    pub fn clear_console(&self) -> Result<()> { self.post(verbs::CLEAR_CONSOLE, Value::Null) }

    pub fn clear_errors(&self) -> Result<()> { self.post(verbs::CLEAR_ERRORS, Value::Null) }

    pub async fn execute_code(&self, code: &str) -> Result<Value> {
        self.send_and_wait_for(
            verbs::EXECUTE_CODE,
            verbs::CODE_EXECUTION_RESULT,
            json!({ "code": code }),
            None,
        )
        .await
    }

    pub async fn inspect_element(&self, selector: &str) -> Result<Value> {
        self.send_and_wait_for(
            verbs::INSPECT_ELEMENT,
            verbs::ELEMENT_INSPECTION_RESULT,
            json!({ "selector": selector }),
            None,
        )
        .await
    }

    /// Proxies an HTTP request through the frame's own origin.
    pub async fn fetch(&self, request: Value) -> Result<Value> {
        self.send_and_wait_for(verbs::FETCH, verbs::FETCH_RESULT, request, None)
            .await
    }

    /// Captures debug information for a preview path, navigating there
    /// first when necessary.
    #[instrument(level = "debug", skip(self, request), fields(path = %request.path))]
    pub async fn debug(&self, request: DebugRequest) -> Result<Value> {
        let needs_navigation =
            self.inner.frame.current_url().as_deref() != Some(request.path.as_str());
        if needs_navigation {
            // Navigation reloads the child, so the handshake starts over.
            self.inner.ready.store(false, Ordering::SeqCst);
            self.inner.navigator.visit(&request.path);
        }
        self.ensure_ready().await?;
        if let Some(wait) = request.wait {
            tokio::time::sleep(wait).await;
        }
        // The child gets its full budget plus slack for the reply itself.
        let reply_timeout = request.timeout + Duration::from_secs(5);
        self.send_and_wait_for(
            verbs::DEBUG,
            verbs::DEBUG_RESULT,
            json!({
                "path": request.path,
                "options": { "timeout": request.timeout.as_millis() as u64 },
            }),
            Some(reply_timeout),
        )
        .await
    }

    /// Drops every handler registration. Idempotent; the pump ends when
    /// the embedding drops its sender.
    pub fn dispose(&self) {
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.bus.clear();
    }

    fn post(&self, verb: &str, payload: Value) -> Result<()> {
        let message = BeaconMessage::parent(verb, payload);
        self.inner.frame.post(message.to_value()?)
    }

    async fn wait_loaded(&self) -> Result<()> {
        let mut loaded = self.inner.loaded.clone();
        loaded
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| BeaconError::Detached)?;
        // Brief settle so a just-loaded document gets its listeners up.
        tokio::time::sleep(self.inner.options.settle_delay).await;
        Ok(())
    }
}

fn handshake_delay(options: &BeaconOptions, attempt: u32) -> Duration {
    let exp = 2f64.powi(attempt.saturating_sub(1) as i32);
    let raw = options.handshake_backoff.as_millis() as f64 * exp;
    let capped = raw.min(options.handshake_cap.as_millis() as f64);
    let jittered = capped / 2.0 + rand::thread_rng().gen_range(0.0..capped / 2.0);
    Duration::from_millis(jittered as u64)
}

/// Dispatches frame traffic into the bus until the embedding hangs up.
async fn pump(
    mut incoming: mpsc::UnboundedReceiver<Value>,
    inner: std::sync::Weak<Inner>,
) {
    while let Some(raw) = incoming.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        if !BeaconMessage::is_beacon(&raw) {
            continue;
        }
        let message = match BeaconMessage::from_value(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "dropping malformed beacon message");
                continue;
            },
        };
        let Some(verb) = message.verb().map(str::to_owned) else {
            continue;
        };
        if verb == verbs::READY {
            inner.ready.store(true, Ordering::SeqCst);
        }
        if verb == verbs::URL_CHANGE {
            if let Some(url) = message.payload.get("url").and_then(Value::as_str) {
                inner.navigator.mirror_url_change(url);
            }
        }
        inner.bus.emit(&verb, &message.payload);
    }
}
