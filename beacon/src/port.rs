//! Host-side surface of the preview frame.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::{BeaconError, Result};

/// What the bridge needs from its embedding: a way to post messages into
/// the frame and a way to steer its location.
///
/// The embedding is responsible for delivering only messages whose source
/// is the frame's own window, and for applying its target-origin policy on
/// `post` (the bridge defaults to `*`).
pub trait PreviewFrame: Send + Sync + 'static {
    /// Parent → child `postMessage`.
    fn post(&self, message: Value) -> Result<()>;

    /// Point the frame at `url`.
    fn navigate(&self, url: &str);

    /// The URL the frame is currently showing, when known.
    fn current_url(&self) -> Option<String>;
}

/// A [`PreviewFrame`] over plain channels, for embeddings without a DOM
/// and for tests. Posted messages and navigations are observable on the
/// receivers returned by [`ChannelFrame::new`].
#[derive(Debug)]
pub struct ChannelFrame {
    outgoing:    mpsc::UnboundedSender<Value>,
    navigations: mpsc::UnboundedSender<String>,
    url:         Mutex<Option<String>>,
}

impl ChannelFrame {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (
        ChannelFrame,
        mpsc::UnboundedReceiver<Value>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (outgoing, posted) = mpsc::unbounded_channel();
        let (navigations, navigated) = mpsc::unbounded_channel();
        (
            ChannelFrame {
                outgoing,
                navigations,
                url: Mutex::new(None),
            },
            posted,
            navigated,
        )
    }
}

impl PreviewFrame for ChannelFrame {
    fn post(&self, message: Value) -> Result<()> {
        self.outgoing
            .send(message)
            .map_err(|_| BeaconError::Detached)
    }

    fn navigate(&self, url: &str) {
        *self.url.lock().unwrap() = Some(url.to_owned());
        let _ = self.navigations.send(url.to_owned());
    }

    fn current_url(&self) -> Option<String> { self.url.lock().unwrap().clone() }
}
