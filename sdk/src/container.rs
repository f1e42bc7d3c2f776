//! Container lifecycle facade.

use crate::{bus::Subscription, frame::Value, transport::Transport, Result};

/// Typed wrappers over the notebook's container actions and the
/// `container.stats` push stream.
#[derive(Debug, Clone)]
pub struct Container {
    transport: Transport,
}

impl Container {
    pub(crate) fn new(transport: Transport) -> Self { Self { transport } }

    pub async fn start(&self) -> Result<Value> {
        self.transport.invoke("container.start", Value::Null).await
    }

    pub async fn stop(&self) -> Result<Value> {
        self.transport.invoke("container.stop", Value::Null).await
    }

    pub async fn state(&self) -> Result<Value> {
        self.transport.invoke("container.state", Value::Null).await
    }

    /// Ports the container currently exposes.
    pub async fn opened_ports(&self) -> Result<Vec<i64>> {
        let value = self
            .transport
            .invoke("container.opened-ports", Value::Null)
            .await?;
        Ok(value
            .as_array()
            .unwrap_or(&[])
            .iter()
            .filter_map(Value::as_i64)
            .collect())
    }

    /// Periodic resource statistics pushed by the server.
    pub fn on_stats(&self, handler: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        self.transport.listen("container.stats", handler)
    }
}
