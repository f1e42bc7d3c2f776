//! Filesystem adapter: CRUD, streaming text search, recursive watch and
//! chunked download.
//!
//! Watches live in a map keyed by path so the adapter can re-issue every
//! server-side watch when the transport reopens after an outage; the
//! caller's handler keeps firing without re-registration.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use lazy_static::lazy_static;
use rand::{distributions::Alphanumeric, Rng};
use tracing::{instrument, warn};

use crate::{
    bus::Subscription,
    error::Error,
    frame::Value,
    transport::{Transport, TOPIC_OPEN},
    FsErrorKind, Result,
};

lazy_static! {
    /// Directories never worth searching or shipping.
    pub static ref DEFAULT_EXCLUDES: Vec<&'static str> = vec![
        "**/.git",
        "**/.svn",
        "**/.hg",
        "**/CVS",
        "**/.DS_Store",
        "**/node_modules",
        "**/vendor",
        "**/storage/framework",
        "**/bootstrap/cache",
    ];
}

/// Change kinds reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum ChangeType {
    Added,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub change_type:    ChangeType,
    pub path:           String,
    pub is_file:        bool,
    pub exists:         bool,
    pub correlation_id: Option<String>,
}

impl FileChange {
    pub fn from_value(value: &Value) -> Option<FileChange> {
        let change_type = value
            .get("type")
            .and_then(Value::as_str)?
            .parse::<ChangeType>()
            .ok()?;
        Some(FileChange {
            change_type,
            path: value.get("path").and_then(Value::as_str)?.to_owned(),
            is_file: value.get("isFile").and_then(Value::as_bool).unwrap_or(true),
            exists: value
                .get("exists")
                .and_then(Value::as_bool)
                .unwrap_or(change_type != ChangeType::Deleted),
            correlation_id: value
                .get("correlationId")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub recursive:      bool,
    pub exclude:        Vec<String>,
    /// Client tag echoed back in change events.
    pub correlation_id: Option<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            recursive:      true,
            exclude:        DEFAULT_EXCLUDES.iter().map(|s| (*s).to_owned()).collect(),
            correlation_id: None,
        }
    }
}

impl WatchOptions {
    fn to_value(&self) -> Value {
        let mut entries = vec![
            ("recursive", Value::Bool(self.recursive)),
            (
                "exclude",
                Value::Array(self.exclude.iter().map(|s| Value::from(s.as_str())).collect()),
            ),
        ];
        if let Some(id) = &self.correlation_id {
            entries.push(("correlationId", Value::from(id.as_str())));
        }
        Value::map(entries)
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub pattern: String,
    /// Restricts the search to a subtree when set.
    pub path:    Option<String>,
}

impl SearchQuery {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            path:    None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub regex:            bool,
    pub case_insensitive: bool,
    pub max_results:      usize,
    pub before_context:   usize,
    pub after_context:    usize,
    pub exclude:          Vec<String>,
    pub preview_lines:    usize,
    pub preview_chars:    usize,
    /// Correlation id for the incremental result channel; generated when
    /// not set.
    pub id:               Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            regex:            false,
            case_insensitive: false,
            max_results:      5,
            before_context:   2,
            after_context:    2,
            exclude:          DEFAULT_EXCLUDES.iter().map(|s| (*s).to_owned()).collect(),
            preview_lines:    5,
            preview_chars:    1000,
            id:               None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub path:    String,
    pub line:    Option<i64>,
    pub preview: Option<String>,
}

impl SearchMatch {
    pub fn from_value(value: &Value) -> Option<SearchMatch> {
        Some(SearchMatch {
            path:    value.get("path").and_then(Value::as_str)?.to_owned(),
            line:    value.get("line").and_then(Value::as_i64),
            preview: value
                .get("preview")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearchResults {
    pub has_more: bool,
    pub matches:  Vec<SearchMatch>,
}

#[derive(Debug, Clone)]
pub struct FindOptions {
    pub exclude:     Vec<String>,
    pub max_results: Option<usize>,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            exclude:     DEFAULT_EXCLUDES.iter().map(|s| (*s).to_owned()).collect(),
            max_results: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStat {
    pub path:         String,
    pub is_file:      bool,
    pub is_directory: bool,
    pub size:         Option<i64>,
}

impl FileStat {
    fn from_value(value: &Value, fallback_path: &str) -> FileStat {
        FileStat {
            path:         value
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or(fallback_path)
                .to_owned(),
            is_file:      value.get("isFile").and_then(Value::as_bool).unwrap_or(false),
            is_directory: value
                .get("isDirectory")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            size:         value.get("size").and_then(Value::as_i64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name:         String,
    pub path:         Option<String>,
    pub is_file:      bool,
    pub is_directory: bool,
}

/// A line-bounded slice of a file.
#[derive(Debug, Clone)]
pub struct FileRange {
    pub line_start: i64,
    pub line_end:   i64,
    pub content:    String,
    pub error:      Option<String>,
}

struct WatchState {
    token:   u64,
    options: WatchOptions,
    sub:     Subscription,
}

struct FsInner {
    transport:     Transport,
    watches:       Mutex<HashMap<String, WatchState>>,
    next_watch_id: AtomicU64,
    reopen_sub:    Mutex<Option<Subscription>>,
}

/// Filesystem subsystem facade.
#[derive(Clone)]
pub struct Filesystem {
    inner: Arc<FsInner>,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("watches", &self.inner.watches.lock().unwrap().len())
            .finish()
    }
}

impl Filesystem {
    pub(crate) fn new(transport: Transport) -> Self {
        let inner = Arc::new(FsInner {
            transport,
            watches: Mutex::new(HashMap::new()),
            next_watch_id: AtomicU64::new(0),
            reopen_sub: Mutex::new(None),
        });
        // Every reconnect re-issues the live watches, without the callers'
        // involvement. The first open never has map entries: a watch is
        // recorded only after its fs.watch request succeeded.
        let weak = Arc::downgrade(&inner);
        let sub = inner.transport.listen(TOPIC_OPEN, move |_| {
            let Some(inner) = weak.upgrade() else { return };
            let snapshot: Vec<(String, WatchOptions)> = inner
                .watches
                .lock()
                .unwrap()
                .iter()
                .map(|(path, state)| (path.clone(), state.options.clone()))
                .collect();
            if snapshot.is_empty() {
                return;
            }
            let transport = inner.transport.clone();
            tokio::spawn(async move {
                for (path, options) in snapshot {
                    let payload = Value::map([
                        ("path", Value::from(path.as_str())),
                        ("options", options.to_value()),
                    ]);
                    if let Err(err) = transport.invoke("fs.watch", payload).await {
                        warn!(%err, %path, "re-issuing watch after reconnect failed");
                    }
                }
            });
        });
        inner.reopen_sub.lock().unwrap().replace(sub);
        Self { inner }
    }

    /// Watches `path` for changes. The watch survives reconnects until the
    /// returned handle is disposed.
    #[instrument(level = "debug", skip(self, options, on_change))]
    pub async fn watch(
        &self,
        path: &str,
        options: WatchOptions,
        on_change: impl Fn(FileChange) + Send + Sync + 'static,
    ) -> Result<WatchHandle> {
        let topic = format!("fs.watch.{path}");
        let sub = self.inner.transport.listen(topic, move |value| {
            match FileChange::from_value(value) {
                Some(change) => on_change(change),
                None => warn!(?value, "unparseable watch event"),
            }
        });
        self.inner
            .transport
            .invoke(
                "fs.watch",
                Value::map([
                    ("path", Value::from(path)),
                    ("options", options.to_value()),
                ]),
            )
            .await?;
        let token = self.inner.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let previous = self.inner.watches.lock().unwrap().insert(
            path.to_owned(),
            WatchState {
                token,
                options,
                sub,
            },
        );
        if let Some(previous) = previous {
            // A second watch on the same path replaces the first locally;
            // the server-side watch is shared.
            previous.sub.dispose();
        }
        Ok(WatchHandle {
            fs:       self.clone(),
            path:     path.to_owned(),
            token,
            disposed: AtomicBool::new(false),
        })
    }

    /// Streaming text search. `on_match` sees each partial result as it
    /// arrives and may return `false` to stop listening early; cancellation
    /// is local and best-effort, the server is not told. The returned
    /// results are the server's final batch.
    #[instrument(level = "debug", skip(self, options, on_match))]
    pub async fn search(
        &self,
        query: SearchQuery,
        options: Option<SearchOptions>,
        on_match: Option<Box<dyn Fn(&SearchMatch) -> bool + Send + Sync>>,
    ) -> Result<SearchResults> {
        let options = options.unwrap_or_default();
        let id = options.id.clone().unwrap_or_else(random_correlation_id);
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let sub = {
            let slot = Arc::clone(&slot);
            self.inner
                .transport
                .listen(format!("fs.text.search.{id}"), move |value| {
                    // `false` is the server's end-of-stream sentinel.
                    if value.as_bool() == Some(false) {
                        if let Some(sub) = slot.lock().unwrap().take() {
                            sub.dispose();
                        }
                        return;
                    }
                    let Some(result) = SearchMatch::from_value(value) else {
                        return;
                    };
                    if let Some(callback) = &on_match {
                        if !callback(&result) {
                            if let Some(sub) = slot.lock().unwrap().take() {
                                sub.dispose();
                            }
                        }
                    }
                })
        };
        slot.lock().unwrap().replace(sub);

        let mut payload = vec![
            ("pattern", Value::from(query.pattern.as_str())),
            ("id", Value::from(id.as_str())),
            ("regex", Value::Bool(options.regex)),
            ("caseInsensitive", Value::Bool(options.case_insensitive)),
            ("maxResults", Value::Int(options.max_results as i64)),
            ("beforeContext", Value::Int(options.before_context as i64)),
            ("afterContext", Value::Int(options.after_context as i64)),
            (
                "exclude",
                Value::Array(
                    options
                        .exclude
                        .iter()
                        .map(|s| Value::from(s.as_str()))
                        .collect(),
                ),
            ),
            ("previewLines", Value::Int(options.preview_lines as i64)),
            ("previewChars", Value::Int(options.preview_chars as i64)),
        ];
        if let Some(path) = &query.path {
            payload.push(("path", Value::from(path.as_str())));
        }
        let result = self
            .inner
            .transport
            .invoke("fs.textSearch", Value::map(payload))
            .await;
        if let Some(sub) = slot.lock().unwrap().take() {
            sub.dispose();
        }
        let value = result?;
        Ok(SearchResults {
            has_more: value.get("hasMore").and_then(Value::as_bool).unwrap_or(false),
            matches:  value
                .get("matches")
                .and_then(Value::as_array)
                .unwrap_or(&[])
                .iter()
                .filter_map(SearchMatch::from_value)
                .collect(),
        })
    }

    /// One-shot file-name glob.
    pub async fn find(&self, query: &str, options: FindOptions) -> Result<Vec<String>> {
        let mut payload = vec![
            ("query", Value::from(query)),
            (
                "exclude",
                Value::Array(
                    options
                        .exclude
                        .iter()
                        .map(|s| Value::from(s.as_str()))
                        .collect(),
                ),
            ),
        ];
        if let Some(max) = options.max_results {
            payload.push(("maxResults", Value::Int(max as i64)));
        }
        let value = self
            .inner
            .transport
            .invoke("fs.find", Value::map(payload))
            .await?;
        Ok(value
            .as_array()
            .unwrap_or(&[])
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .or_else(|| item.get("path").and_then(Value::as_str).map(str::to_owned))
            })
            .collect())
    }

    /// Downloads the workspace as concatenated chunks, in arrival order.
    /// With a chunk callback the chunks are forwarded instead of collected
    /// and the returned buffer is empty.
    #[instrument(level = "debug", skip(self, exclude, on_chunk))]
    pub async fn download(
        &self,
        exclude: Option<Vec<String>>,
        on_chunk: Option<Box<dyn Fn(Bytes) + Send + Sync>>,
    ) -> Result<Bytes> {
        let id = random_correlation_id();
        let collected: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let collected = Arc::clone(&collected);
            self.inner
                .transport
                .listen(format!("fs.download.{id}"), move |value| {
                    let chunk = value
                        .get("chunk")
                        .and_then(Value::to_chunk)
                        .or_else(|| value.to_chunk());
                    if let Some(chunk) = chunk {
                        match &on_chunk {
                            Some(callback) => callback(chunk),
                            None => collected.lock().unwrap().push(chunk),
                        }
                    }
                })
        };
        let mut payload = vec![("id", Value::from(id.as_str()))];
        if let Some(exclude) = &exclude {
            payload.push((
                "exclude",
                Value::Array(exclude.iter().map(|s| Value::from(s.as_str())).collect()),
            ));
        }
        let result = self
            .inner
            .transport
            .invoke("fs.download", Value::map(payload))
            .await;
        sub.dispose();
        result?;
        let chunks = std::mem::take(&mut *collected.lock().unwrap());
        let total: usize = chunks.iter().map(Bytes::len).sum();
        let mut blob = Vec::with_capacity(total);
        for chunk in chunks {
            blob.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(blob))
    }

    /// Whole-file read, returned as raw bytes.
    pub async fn read_file(&self, path: &str) -> Result<Bytes> {
        let value = self
            .inner
            .transport
            .invoke("fs.readFile", Value::map([("path", Value::from(path))]))
            .await?;
        value
            .get("content")
            .and_then(Value::to_chunk)
            .or_else(|| value.to_chunk())
            .ok_or_else(|| Error::InvalidConfig(format!("unexpected readFile payload for {path}")))
    }

    /// Line-bounded read.
    pub async fn read_file_range(
        &self,
        path: &str,
        line_start: i64,
        line_end: i64,
    ) -> Result<FileRange> {
        let value = self
            .inner
            .transport
            .invoke(
                "fs.readFile",
                Value::map([
                    ("path", Value::from(path)),
                    ("lineStart", Value::Int(line_start)),
                    ("lineEnd", Value::Int(line_end)),
                ]),
            )
            .await?;
        Ok(FileRange {
            line_start: value
                .get("lineStart")
                .and_then(Value::as_i64)
                .unwrap_or(line_start),
            line_end:   value
                .get("lineEnd")
                .and_then(Value::as_i64)
                .unwrap_or(line_end),
            content:    value
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            error:      value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }

    pub async fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.put(path, contents, "fs.write").await
    }

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.put(path, contents, "fs.writeFile").await
    }

    async fn put(&self, path: &str, contents: &[u8], action: &str) -> Result<()> {
        self.inner
            .transport
            .invoke(
                action,
                Value::map([
                    ("path", Value::from(path)),
                    ("content", Value::Bytes(Bytes::copy_from_slice(contents))),
                ]),
            )
            .await?;
        Ok(())
    }

    pub async fn info(&self, path: &str) -> Result<FileStat> {
        let value = self
            .inner
            .transport
            .invoke("fs.info", Value::map([("path", Value::from(path))]))
            .await?;
        Ok(FileStat::from_value(&value, path))
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        let value = self
            .inner
            .transport
            .invoke("fs.stat", Value::map([("path", Value::from(path))]))
            .await?;
        Ok(FileStat::from_value(&value, path))
    }

    /// Existence check, expressed through `stat` and its typed error.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(Error::Filesystem(err)) if err.kind == FsErrorKind::FileNotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.path_only("fs.mkdir", path).await
    }

    pub async fn create_directory(&self, path: &str) -> Result<()> {
        self.path_only("fs.createDirectory", path).await
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        self.path_only("fs.remove", path).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.path_only("fs.delete", path).await
    }

    pub async fn move_entry(&self, from: &str, to: &str) -> Result<()> {
        self.from_to("fs.move", from, to).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.from_to("fs.rename", from, to).await
    }

    pub async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.from_to("fs.copy", from, to).await
    }

    pub async fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let value = self
            .inner
            .transport
            .invoke("fs.readDirectory", Value::map([("path", Value::from(path))]))
            .await?;
        Ok(value
            .as_array()
            .unwrap_or(&[])
            .iter()
            .filter_map(|item| {
                Some(DirEntry {
                    name:         item.get("name").and_then(Value::as_str)?.to_owned(),
                    path:         item.get("path").and_then(Value::as_str).map(str::to_owned),
                    is_file:      item.get("isFile").and_then(Value::as_bool).unwrap_or(false),
                    is_directory: item
                        .get("isDirectory")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                })
            })
            .collect())
    }

    /// Workspace tree listing, as the server renders it.
    pub async fn tree(&self, path: Option<&str>) -> Result<Value> {
        let payload = match path {
            Some(path) => Value::map([("path", Value::from(path))]),
            None => Value::Null,
        };
        self.inner.transport.invoke("fs.tree", payload).await
    }

    async fn path_only(&self, action: &str, path: &str) -> Result<()> {
        self.inner
            .transport
            .invoke(action, Value::map([("path", Value::from(path))]))
            .await?;
        Ok(())
    }

    async fn from_to(&self, action: &str, from: &str, to: &str) -> Result<()> {
        self.inner
            .transport
            .invoke(
                action,
                Value::map([("from", Value::from(from)), ("to", Value::from(to))]),
            )
            .await?;
        Ok(())
    }

    /// Detaches local watch listeners without talking to the server. Used
    /// on session dispose, where the transport is going away anyway.
    pub(crate) fn release_local(&self) {
        for (_, state) in self.inner.watches.lock().unwrap().drain() {
            state.sub.dispose();
        }
    }
}

/// Live watch registration. `dispose` detaches the local listener and
/// issues `fs.unwatch`; it is idempotent.
#[derive(Debug)]
pub struct WatchHandle {
    fs:       Filesystem,
    path:     String,
    token:    u64,
    disposed: AtomicBool,
}

impl WatchHandle {
    pub fn path(&self) -> &str { &self.path }

    #[instrument(level = "debug", skip(self), fields(path = %self.path))]
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let removed = {
            let mut watches = self.fs.inner.watches.lock().unwrap();
            // Only remove the registration this handle created; a newer
            // watch on the same path stays live.
            match watches.get(&self.path) {
                Some(state) if state.token == self.token => watches.remove(&self.path),
                _ => None,
            }
        };
        if let Some(state) = removed {
            state.sub.dispose();
            if let Err(err) = self
                .fs
                .inner
                .transport
                .invoke(
                    "fs.unwatch",
                    Value::map([("path", Value::from(self.path.as_str()))]),
                )
                .await
            {
                warn!(%err, path = %self.path, "fs.unwatch failed");
            }
        }
    }
}

fn random_correlation_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}
