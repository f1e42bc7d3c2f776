//! Error taxonomy shared by the transport, session and subsystem adapters.
//!
//! The transport recovers transient connection trouble on its own (reconnect
//! plus retry); everything else is surfaced to the caller as one of the
//! variants below.

use std::{str::FromStr, time::Duration};

use crate::frame::{ParseError, Value};

/// A typed application error relayed by the notebook inside an `error` frame.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// One of 400, 401, 403, 404, 409, 422, 429, 500 or 5000.
    pub code:    u16,
    pub message: String,
    /// The untouched error payload, for callers that need more than the code.
    pub raw:     Value,
}

impl ApiError {
    pub fn from_value(value: &Value) -> Self {
        let code = value
            .get("code")
            .and_then(Value::as_i64)
            .map_or(500, |c| c as u16);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown server error")
            .to_owned();
        Self {
            code,
            message,
            raw: value.clone(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)
    }
}

/// The filesystem error names the notebook is known to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum FsErrorKind {
    Unavailable,
    NoPermissions,
    FileExists,
    FileNotFound,
    FileIsADirectory,
    FileNotADirectory,
}

/// An [`ApiError`] whose payload carried a recognised filesystem `name`.
#[derive(Debug, Clone)]
pub struct FsError {
    pub kind:    FsErrorKind,
    pub code:    u16,
    pub message: String,
}

impl FsError {
    /// Re-types an application error when its payload names a known
    /// filesystem failure. Returns `None` for everything else.
    pub fn from_api(err: &ApiError) -> Option<Self> {
        let name = err.raw.get("name").and_then(Value::as_str)?;
        let kind = FsErrorKind::from_str(name).ok()?;
        Some(Self {
            kind,
            code: err.code,
            message: err.message.clone(),
        })
    }
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "filesystem error {} ({})", self.kind, self.code)
    }
}

/// Error returned by most functions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection dropped while a request was outstanding. Retriable.
    #[error("connection lost{}", reason_suffix(.code, .reason))]
    ConnectionLost {
        code:   Option<u16>,
        reason: String,
    },

    /// A connection attempt did not complete in time. Retriable.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A request exceeded its per-call timeout. Not retried automatically.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The caller cancelled the request. Never retried.
    #[error("request aborted")]
    Aborted,

    /// The server closed with 1008 or the client-side window was saturated.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A typed error frame from the server.
    #[error("{0}")]
    Api(ApiError),

    /// An application error with a recognised filesystem `name`.
    #[error("{0}")]
    Filesystem(FsError),

    /// The notebook init handshake reported an error payload.
    #[error("notebook init failed: {0}")]
    Init(String),

    /// A malformed frame from the server. Logged, dropped, surfaced as a
    /// `transport.error` event.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] ParseError),

    /// Constructor-time validation failure. Not retried.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The offline queue was full; the oldest entry is dropped with this.
    #[error("request queue overflow")]
    QueueOverflow,

    /// A queued request outlived the queue max age before a flush.
    #[error("queued request expired")]
    QueueExpired,

    /// The transport was disposed and accepts no further work.
    #[error("transport closed")]
    Closed,

    /// Failure talking to the notebook management HTTP API.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether the transport may transparently retry a failed attempt.
    ///
    /// Application errors, rate limits, timeouts, aborts and configuration
    /// problems are surfaced to the caller untouched.
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost { .. } | Error::ConnectTimeout(_)
        )
    }

    pub(crate) fn connection_lost(code: Option<u16>, reason: impl Into<String>) -> Self {
        Error::ConnectionLost {
            code,
            reason: reason.into(),
        }
    }

    /// Wraps a server error payload, upgrading it to a typed filesystem
    /// error when the payload names one.
    pub(crate) fn from_error_payload(value: &Value) -> Self {
        let api = ApiError::from_value(value);
        match FsError::from_api(&api) {
            Some(fs) => Error::Filesystem(fs),
            None => Error::Api(api),
        }
    }
}

fn reason_suffix(code: &Option<u16>, reason: &str) -> String {
    match (code, reason.is_empty()) {
        (Some(code), false) => format!(" ({code}: {reason})"),
        (Some(code), true) => format!(" ({code})"),
        (None, false) => format!(" ({reason})"),
        (None, true) => String::new(),
    }
}
