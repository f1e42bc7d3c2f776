//! Language-server connections multiplexed by session id.
//!
//! Every connection shares the one transport; its traffic is isolated by
//! the `lsp.response.<id>`, `lsp.closed.<id>` and `lsp.error.<id>` topics.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use tracing::instrument;

use crate::{
    bus::Subscription,
    error::Error,
    frame::Value,
    transport::Transport,
    Result,
};

/// LSP subsystem facade.
#[derive(Clone)]
pub struct Lsp {
    transport: Transport,
    active:    Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for Lsp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lsp")
            .field("active", &self.active.lock().unwrap().len())
            .finish()
    }
}

impl Lsp {
    pub(crate) fn new(transport: Transport) -> Self {
        Self {
            transport,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Starts a language server under the caller-chosen `id`.
    ///
    /// Ids must be unique per notebook; reusing a live one is a
    /// configuration error.
    #[instrument(level = "debug", skip(self))]
    pub async fn start(&self, id: &str) -> Result<LspConnection> {
        {
            let mut active = self.active.lock().unwrap();
            if !active.insert(id.to_owned()) {
                return Err(Error::InvalidConfig(format!(
                    "lsp session id {id:?} is already in use"
                )));
            }
        }
        let started = self
            .transport
            .invoke("lsp.start", Value::map([("id", Value::from(id))]))
            .await;
        if let Err(err) = started {
            self.active.lock().unwrap().remove(id);
            return Err(err);
        }
        Ok(LspConnection {
            id:        id.to_owned(),
            transport: self.transport.clone(),
            active:    Arc::clone(&self.active),
            disposed:  AtomicBool::new(false),
        })
    }
}

/// One language-server session.
pub struct LspConnection {
    id:        String,
    transport: Transport,
    active:    Arc<Mutex<HashSet<String>>>,
    disposed:  AtomicBool,
}

impl std::fmt::Debug for LspConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspConnection")
            .field("id", &self.id)
            .finish()
    }
}

impl LspConnection {
    pub fn id(&self) -> &str { &self.id }

    /// Server → client messages for this session.
    pub fn on_message(&self, handler: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.transport
            .listen(format!("lsp.response.{}", self.id), handler)
    }

    /// Fired when the server ends the session.
    pub fn on_close(&self, handler: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.transport
            .listen(format!("lsp.closed.{}", self.id), handler)
    }

    pub fn on_error(&self, handler: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.transport
            .listen(format!("lsp.error.{}", self.id), handler)
    }

    /// Forwards one client → server message.
    pub async fn message(&self, payload: &str) -> Result<()> {
        self.transport
            .invoke(
                "lsp.message",
                Value::map([
                    ("id", Value::from(self.id.as_str())),
                    ("message", Value::from(payload)),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Ends the session server-side and frees the id. Idempotent.
    #[instrument(level = "debug", skip(self), fields(id = %self.id))]
    pub async fn close(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.active.lock().unwrap().remove(&self.id);
        self.transport
            .invoke("lsp.close", Value::map([("id", Value::from(self.id.as_str()))]))
            .await?;
        Ok(())
    }
}
