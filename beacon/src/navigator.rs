//! Internal navigation history for the preview frame.
//!
//! The SDK keeps its own back/forward history rather than trusting the
//! iframe's, which it cannot read. Child-initiated navigation is mirrored
//! in via `urlChange` pushes; the derived `canGoBack`/`canGoForward` flags
//! therefore describe SDK history, which can drift from the frame's own.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use notebook_sdk::bus::EventBus;
use serde_json::{json, Value};
use tracing::debug;

use crate::{message::verbs, port::PreviewFrame};

#[derive(Debug, Default)]
struct History {
    entries: Vec<String>,
    index:   Option<usize>,
}

impl History {
    fn push(&mut self, url: &str) {
        if let Some(index) = self.index {
            // A new visit discards the forward tail.
            self.entries.truncate(index + 1);
        }
        self.entries.push(url.to_owned());
        self.index = Some(self.entries.len() - 1);
    }

    fn current(&self) -> Option<&str> {
        self.index.map(|i| self.entries[i].as_str())
    }
}

struct NavInner {
    frame:   Arc<dyn PreviewFrame>,
    bus:     EventBus<Value>,
    history: Mutex<History>,
}

/// URL history with a current index, driving the frame on every move.
#[derive(Clone)]
pub struct Navigator {
    inner: Arc<NavInner>,
}

impl std::fmt::Debug for Navigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let history = self.inner.history.lock().unwrap();
        f.debug_struct("Navigator")
            .field("length", &history.entries.len())
            .field("index", &history.index)
            .finish()
    }
}

impl Navigator {
    pub(crate) fn new(frame: Arc<dyn PreviewFrame>, bus: EventBus<Value>) -> Navigator {
        Navigator {
            inner: Arc::new(NavInner {
                frame,
                bus,
                history: Mutex::new(History::default()),
            }),
        }
    }

    /// Navigates to `url`, appending it to history and truncating any
    /// forward tail.
    pub fn visit(&self, url: &str) {
        self.inner.history.lock().unwrap().push(url);
        self.inner.frame.navigate(url);
        self.emit_change(url, "push");
    }

    pub fn go_back(&self) -> bool {
        let url = {
            let mut history = self.inner.history.lock().unwrap();
            match history.index {
                Some(index) if index > 0 => {
                    history.index = Some(index - 1);
                    history.entries[index - 1].clone()
                },
                _ => return false,
            }
        };
        self.inner.frame.navigate(&url);
        self.emit_change(&url, "back");
        true
    }

    pub fn go_forward(&self) -> bool {
        let url = {
            let mut history = self.inner.history.lock().unwrap();
            match history.index {
                Some(index) if index + 1 < history.entries.len() => {
                    history.index = Some(index + 1);
                    history.entries[index + 1].clone()
                },
                _ => return false,
            }
        };
        self.inner.frame.navigate(&url);
        self.emit_change(&url, "forward");
        true
    }

    /// Re-navigates to the current entry. Not a history mutation.
    pub fn reload(&self) -> bool {
        let url = {
            let history = self.inner.history.lock().unwrap();
            match history.current() {
                Some(url) => url.to_owned(),
                None => return false,
            }
        };
        self.inner.frame.navigate(&url);
        true
    }

    /// Mirrors a child-initiated navigation into local history.
    pub(crate) fn mirror_url_change(&self, url: &str) {
        {
            let mut history = self.inner.history.lock().unwrap();
            if history.current() == Some(url) {
                return;
            }
            debug!(%url, "mirroring child navigation");
            history.push(url);
        }
        self.emit_change(url, "push");
    }

    pub fn current(&self) -> Option<String> {
        self.inner
            .history
            .lock()
            .unwrap()
            .current()
            .map(str::to_owned)
    }

    pub fn can_go_back(&self) -> bool {
        self.inner
            .history
            .lock()
            .unwrap()
            .index
            .is_some_and(|i| i > 0)
    }

    pub fn can_go_forward(&self) -> bool {
        let history = self.inner.history.lock().unwrap();
        history
            .index
            .is_some_and(|i| i + 1 < history.entries.len())
    }

    pub fn history_length(&self) -> usize {
        self.inner.history.lock().unwrap().entries.len()
    }

    /// Emits `historyChange` and `navigationStateChange`, outside the
    /// history lock so handlers may call back in.
    fn emit_change(&self, url: &str, direction: &str) {
        let timestamp = Utc::now().timestamp_millis();
        let (index, length) = {
            let history = self.inner.history.lock().unwrap();
            (history.index, history.entries.len())
        };
        self.inner.bus.emit(
            verbs::HISTORY_CHANGE,
            &json!({
                "url": url,
                "direction": direction,
                "timestamp": timestamp,
            }),
        );
        self.inner.bus.emit(
            verbs::NAVIGATION_STATE_CHANGE,
            &json!({
                "canGoBack": index.is_some_and(|i| i > 0),
                "canGoForward": index.is_some_and(|i| i + 1 < length),
                "currentIndex": index.map_or(-1, |i| i as i64),
                "historyLength": length,
                "timestamp": timestamp,
            }),
        );
    }
}
