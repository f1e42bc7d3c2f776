//! Beacon message framing.
//!
//! Every message is a JSON object `{type: "beacon:<verb>", payload,
//! timestamp, source, id}`. Request/response pairs are matched by verb
//! (`ping`/`pong`, `debug`/`debugResult`), not by id; the id exists for
//! logging and dedup on the child side.

use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type prefix that marks traffic as ours amid other `postMessage` noise.
pub const TYPE_PREFIX: &str = "beacon:";

/// Well-known verbs.
pub mod verbs {
    pub const DISCOVER: &str = "discover";
    pub const READY: &str = "ready";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const GET_DEBUG_INFO: &str = "getDebugInfo";
    pub const DEBUG_INFO: &str = "debugInfo";
    pub const GET_CONSOLE_EVENTS: &str = "getConsoleEvents";
    pub const CONSOLE_EVENTS: &str = "consoleEvents";
    pub const GET_ERROR_EVENTS: &str = "getErrorEvents";
    pub const ERROR_EVENTS: &str = "errorEvents";
    pub const CLEAR_CONSOLE: &str = "clearConsole";
    pub const CLEAR_ERRORS: &str = "clearErrors";
    pub const EXECUTE_CODE: &str = "executeCode";
    pub const CODE_EXECUTION_RESULT: &str = "codeExecutionResult";
    pub const INSPECT_ELEMENT: &str = "inspectElement";
    pub const ELEMENT_INSPECTION_RESULT: &str = "elementInspectionResult";
    pub const FETCH: &str = "fetch";
    pub const FETCH_RESULT: &str = "fetchResult";
    pub const DEBUG: &str = "debug";
    pub const DEBUG_RESULT: &str = "debugResult";
    pub const URL_CHANGE: &str = "urlChange";
    pub const HISTORY_CHANGE: &str = "historyChange";
    pub const NAVIGATION_STATE_CHANGE: &str = "navigationStateChange";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Parent,
    Child,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeaconMessage {
    #[serde(rename = "type")]
    pub kind:      String,
    #[serde(default)]
    pub payload:   Value,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub source:    Source,
    pub id:        String,
}

impl BeaconMessage {
    /// A parent-originated message for `verb`.
    pub fn parent(verb: &str, payload: Value) -> BeaconMessage {
        BeaconMessage {
            kind: format!("{TYPE_PREFIX}{verb}"),
            payload,
            timestamp: Utc::now().timestamp_millis(),
            source: Source::Parent,
            id: random_message_id(),
        }
    }

    pub fn verb(&self) -> Option<&str> { self.kind.strip_prefix(TYPE_PREFIX) }

    /// Whether a raw `postMessage` value is beacon traffic at all.
    pub fn is_beacon(value: &Value) -> bool {
        value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| kind.starts_with(TYPE_PREFIX))
    }

    pub fn to_value(&self) -> serde_json::Result<Value> { serde_json::to_value(self) }

    pub fn from_value(value: Value) -> serde_json::Result<BeaconMessage> {
        serde_json::from_value(value)
    }
}

fn random_message_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}
