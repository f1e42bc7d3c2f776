#![warn(
    // missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]
#![deny(clippy::all)]
// #![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::upper_case_acronyms)]

use chrono::{DateTime, Utc};

pub mod bus;
pub mod client;
pub mod container;
pub mod error;
pub mod filesystem;
pub mod frame;
pub mod lsp;
pub mod session;
pub mod socket;
pub mod terminal;
pub mod transport;

pub type ClientId = String;
pub type NotebookId = String;
pub type RequestToken = String;
pub type Topic = String;
pub type TimeStamp = DateTime<Utc>;

pub use error::{ApiError, Error, FsError, FsErrorKind};

/// A specialized `Result` type for notebook SDK operations.
///
/// This is defined as a convenience.
pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        bus::{EventBus, Subscription},
        client::{ClientOptions, CreateNotebook, NotebookClient, NotebookData},
        container::Container,
        error::{ApiError, Error, FsError, FsErrorKind},
        filesystem::{
            ChangeType, DirEntry, FileChange, FileRange, FileStat, Filesystem, FindOptions,
            SearchMatch, SearchOptions, SearchQuery, SearchResults, WatchHandle, WatchOptions,
        },
        frame::{Frame, FrameKind, Value},
        lsp::{Lsp, LspConnection},
        session::{InitPayload, Session},
        socket::ReadyState,
        terminal::{OutputStream, Process, SpawnOptions, Task, Terminal},
        transport::{CallOptions, Health, Transport, TransportOptions, TransportStats},
        ClientId, NotebookId, RequestToken, Result, TimeStamp, Topic,
    };
}

/// Current wire-protocol version reported to the notebook on connect via the
/// `sdk_version` query parameter.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
