//! Per-notebook session facade.
//!
//! A session owns one transport bound to one notebook URL plus the
//! subsystem adapters. Constructing a session performs no I/O; the first
//! `ready()` (or any invoke) starts the lazily closed socket.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::{
    bus::Subscription,
    container::Container,
    error::Error,
    filesystem::Filesystem,
    frame::Value,
    lsp::Lsp,
    terminal::Terminal,
    transport::{CallOptions, Transport, TransportOptions},
    Result, Topic,
};

/// Payload of the server's `notebook.initialized` event.
#[derive(Debug, Clone)]
pub struct InitPayload {
    pub env:         BTreeMap<String, String>,
    pub preview_url: Option<String>,
    pub ports:       Vec<i64>,
    pub raw:         Value,
}

impl InitPayload {
    pub fn from_value(value: &Value) -> Result<InitPayload> {
        if value.get("kind").and_then(Value::as_str) == Some("error") {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified init error")
                .to_owned();
            return Err(Error::Init(message));
        }
        let env = match value.get("env") {
            Some(Value::Map(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_owned())))
                .collect(),
            _ => BTreeMap::new(),
        };
        Ok(InitPayload {
            env,
            preview_url: value
                .get("previewUrl")
                .and_then(Value::as_str)
                .map(str::to_owned),
            ports: value
                .get("ports")
                .and_then(Value::as_array)
                .unwrap_or(&[])
                .iter()
                .filter_map(Value::as_i64)
                .collect(),
            raw: value.clone(),
        })
    }
}

/// Client-side facade for one notebook.
pub struct Session {
    transport:  Transport,
    filesystem: Filesystem,
    terminal:   Terminal,
    lsp:        Lsp,
    container:  Container,
    init:       Arc<Mutex<Option<InitPayload>>>,
    _init_sub:  Subscription,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.transport.state())
            .field("initialized", &self.init.lock().unwrap().is_some())
            .finish()
    }
}

impl Session {
    /// Builds a session over a fresh transport for `url`.
    pub fn open(url: impl Into<String>, options: TransportOptions) -> Result<Session> {
        let transport = Transport::spawn(url, options)?;
        Ok(Session::over(transport))
    }

    fn over(transport: Transport) -> Session {
        let init: Arc<Mutex<Option<InitPayload>>> = Arc::new(Mutex::new(None));
        // Cache every init payload as it arrives, so ready() observes a
        // handshake that completed before it was called.
        let init_sub = {
            let init = Arc::clone(&init);
            transport.listen("notebook.initialized", move |value| {
                if let Ok(payload) = InitPayload::from_value(value) {
                    debug!("notebook initialized");
                    init.lock().unwrap().replace(payload);
                }
            })
        };
        Session {
            filesystem: Filesystem::new(transport.clone()),
            terminal: Terminal::new(transport.clone()),
            lsp: Lsp::new(transport.clone()),
            container: Container::new(transport.clone()),
            transport,
            init,
            _init_sub: init_sub,
        }
    }

    /// Lazily completes the init handshake.
    ///
    /// Forces a connection with a `ping`, then resolves with the
    /// `notebook.initialized` payload — or an init error when the server
    /// reports one. The result is cached until [`reconnect`](Self::reconnect).
    #[instrument(level = "debug", skip(self))]
    pub async fn ready(&self) -> Result<InitPayload> {
        if let Some(cached) = self.init.lock().unwrap().clone() {
            return Ok(cached);
        }
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let sub = self
            .transport
            .listen_once("notebook.initialized", move |value| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(value.clone());
                }
            });
        self.transport.ping().await?;
        if let Some(cached) = self.init.lock().unwrap().clone() {
            // The handshake completed while the ping was in flight.
            sub.dispose();
            return Ok(cached);
        }
        let value = rx
            .await
            .map_err(|_| Error::connection_lost(None, "transport closed during init"))?;
        let payload = InitPayload::from_value(&value)?;
        self.init.lock().unwrap().replace(payload.clone());
        Ok(payload)
    }

    /// Reconnects the underlying socket, preserving all listeners, then
    /// re-runs the init handshake.
    #[instrument(level = "debug", skip(self))]
    pub async fn reconnect(&self) -> Result<InitPayload> {
        self.init.lock().unwrap().take();
        self.transport.reconnect().await?;
        self.ready().await
    }

    pub async fn invoke(&self, action: &str, data: Value) -> Result<Value> {
        self.transport.invoke(action, data).await
    }

    pub async fn invoke_with(
        &self,
        action: &str,
        data: Value,
        options: CallOptions,
    ) -> Result<Value> {
        self.transport.invoke_with(action, data, options).await
    }

    pub fn listen(
        &self,
        topic: impl Into<Topic>,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.transport.listen(topic, handler)
    }

    pub async fn ping(&self) -> Result<Value> { self.transport.ping().await }

    /// Pushes notebook metadata changes to the server.
    pub async fn update(&self, data: Value) -> Result<Value> {
        self.transport.invoke("notebook.update", data).await
    }

    pub fn fs(&self) -> &Filesystem { &self.filesystem }

    pub fn terminal(&self) -> &Terminal { &self.terminal }

    pub fn lsp(&self) -> &Lsp { &self.lsp }

    pub fn container(&self) -> &Container { &self.container }

    pub fn transport(&self) -> &Transport { &self.transport }

    /// Releases adapter subscriptions and closes the transport for good.
    #[instrument(level = "debug", skip(self))]
    pub async fn dispose(&self) {
        self.filesystem.release_local();
        self.transport.close().await;
    }
}
