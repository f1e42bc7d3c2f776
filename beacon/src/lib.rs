#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

//! Parent-side bridge for driving an in-browser preview frame.
//!
//! The wire protocol is `postMessage` traffic with a `beacon:` type prefix.
//! This crate implements the protocol logic — ready handshake with retry,
//! verb-paired request/response, navigation history — over the host-agnostic
//! [`PreviewFrame`] trait, so the same bridge runs against a real iframe
//! embedding or an in-memory pipe.

pub mod bridge;
pub mod message;
pub mod navigator;
pub mod port;

pub use bridge::{Beacon, BeaconOptions, DebugRequest};
pub use message::{BeaconMessage, Source};
pub use navigator::Navigator;
pub use port::{ChannelFrame, PreviewFrame};

/// Error returned by bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    /// The frame never answered `discover` within the retry budget.
    #[error("beacon handshake failed: {0}")]
    Handshake(String),

    /// A request verb is already awaiting its response verb.
    #[error("a {0} request is already outstanding")]
    Busy(String),

    /// The response verb did not arrive in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The host side of the frame is gone.
    #[error("preview frame is detached")]
    Detached,

    #[error("malformed beacon payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BeaconError>;
