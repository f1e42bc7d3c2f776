//! Process and terminal adapter.
//!
//! `spawn` registers its per-id listeners before the spawn request goes out,
//! so no output or close event can slip through the gap. A spawned process
//! owns exactly the subscriptions for its own subtopics
//! (`terminal.output.<id>`, `terminal.close.<id>`); they are released on
//! every termination path.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    bus::Subscription,
    frame::Value,
    transport::Transport,
    Result, TimeStamp,
};

/// Exit code reported when a process is terminated locally (kill or abort)
/// before the server reported one.
pub const SYNTHETIC_EXIT: i32 = -1;

/// The server-side task record returned by spawn/create/list.
#[derive(Debug, Clone)]
pub struct Task {
    pub id:      String,
    pub command: Option<String>,
    pub kind:    Option<String>,
    pub created: Option<TimeStamp>,
}

impl Task {
    pub fn from_value(value: &Value, fallback_id: &str) -> Task {
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_owned);
        Task {
            id:      field("id").unwrap_or_else(|| fallback_id.to_owned()),
            command: field("command"),
            kind:    field("kind"),
            created: field("created")
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SpawnOptions {
    /// Client-side process id; generated when not set.
    pub id:    Option<String>,
    pub kind:  Option<String>,
    /// Firing the token kills the process. A token that is already
    /// cancelled resolves the exit future synthetically and subscribes to
    /// nothing.
    pub abort: Option<CancellationToken>,
}

/// Lazy, non-restartable sequence of output chunks.
#[derive(Debug)]
pub struct OutputStream {
    rx: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl OutputStream {
    /// Next chunk, or `None` once the process closed and the buffer drained.
    pub async fn next(&mut self) -> Option<Bytes> {
        match &mut self.rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Collects the remaining output into one buffer.
    pub async fn collect(mut self) -> Bytes {
        let mut all = Vec::new();
        while let Some(chunk) = self.next().await {
            all.extend_from_slice(&chunk);
        }
        Bytes::from(all)
    }
}

struct ProcessInner {
    id:         String,
    command:    String,
    kind:       Option<String>,
    created:    TimeStamp,
    transport:  Transport,
    output_rx:  Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    output_tx:  Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
    exit_tx:    Arc<watch::Sender<Option<i32>>>,
    exit_rx:    watch::Receiver<Option<i32>>,
    subs:       Mutex<Vec<Subscription>>,
    terminated: AtomicBool,
}

impl ProcessInner {
    /// Releases per-process subscriptions and closes the output stream.
    /// Safe to call from any termination path, any number of times.
    fn release(&self) {
        for sub in self.subs.lock().unwrap().drain(..) {
            sub.dispose();
        }
        self.output_tx.lock().unwrap().take();
    }

    fn settle_exit(&self, code: i32) {
        self.exit_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        });
    }
}

/// Handle to one spawned process. Clones address the same process.
#[derive(Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.inner.id)
            .field("command", &self.inner.command)
            .finish()
    }
}

impl Process {
    pub fn id(&self) -> &str { &self.inner.id }

    pub fn command(&self) -> &str { &self.inner.command }

    pub fn kind(&self) -> Option<&str> { self.inner.kind.as_deref() }

    pub fn created(&self) -> TimeStamp { self.inner.created }

    /// The output source. May be taken once; later calls yield a stream
    /// that is already closed.
    pub fn output(&self) -> OutputStream {
        OutputStream {
            rx: self.inner.output_rx.lock().unwrap().take(),
        }
    }

    /// Resolves with the exit code the server reported, or
    /// [`SYNTHETIC_EXIT`] when the process was terminated locally.
    pub async fn exit(&self) -> i32 {
        let mut rx = self.inner.exit_rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.expect("guarded by wait_for"),
            Err(_) => SYNTHETIC_EXIT,
        };
        result
    }

    /// Forwards one input chunk to the process.
    pub async fn write_input(&self, chunk: &[u8]) -> Result<()> {
        self.inner
            .transport
            .invoke(
                "terminal.input",
                Value::map([
                    ("id", Value::from(self.inner.id.as_str())),
                    ("input", Value::Bytes(Bytes::copy_from_slice(chunk))),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Closes the input sink, releasing the process subscriptions.
    pub fn close_input(&self) { self.inner.release(); }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.inner
            .transport
            .invoke(
                "terminal.resize",
                Value::map([
                    ("id", Value::from(self.inner.id.as_str())),
                    ("cols", Value::Int(i64::from(cols))),
                    ("rows", Value::Int(i64::from(rows))),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Terminates the process server-side and settles the exit future.
    /// Idempotent.
    #[instrument(level = "debug", skip(self), fields(id = %self.inner.id))]
    pub async fn kill(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self
            .inner
            .transport
            .invoke(
                "terminal.close",
                Value::map([("id", Value::from(self.inner.id.as_str()))]),
            )
            .await
        {
            warn!(%err, "terminal.close failed during kill");
        }
        self.inner.settle_exit(SYNTHETIC_EXIT);
        self.inner.release();
    }
}

/// Terminal subsystem facade.
#[derive(Debug, Clone)]
pub struct Terminal {
    transport: Transport,
}

impl Terminal {
    pub(crate) fn new(transport: Transport) -> Self { Self { transport } }

    /// Spawns `command` in the notebook and returns a process handle wired
    /// to its output and exit events.
    #[instrument(level = "debug", skip(self, options))]
    pub async fn spawn(
        &self,
        command: &str,
        args: &[&str],
        options: SpawnOptions,
    ) -> Result<Process> {
        let id = options.id.clone().unwrap_or_else(random_task_id);
        let full_command = if args.is_empty() {
            command.to_owned()
        } else {
            format!("{} {}", command, args.join(" "))
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);

        if let Some(abort) = &options.abort {
            if abort.is_cancelled() {
                debug!(%id, "spawn aborted before any subscription");
                let (_, output_rx) = mpsc::unbounded_channel();
                exit_tx.send_replace(Some(SYNTHETIC_EXIT));
                return Ok(Process {
                    inner: Arc::new(ProcessInner {
                        id,
                        command: full_command,
                        kind: options.kind,
                        created: Utc::now(),
                        transport: self.transport.clone(),
                        output_rx: Mutex::new(Some(output_rx)),
                        output_tx: Arc::new(Mutex::new(None)),
                        exit_tx,
                        exit_rx,
                        subs: Mutex::new(Vec::new()),
                        terminated: AtomicBool::new(true),
                    }),
                });
            }
        }

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let output_tx = Arc::new(Mutex::new(Some(output_tx)));

        // Listeners go in before the spawn request so no early event is lost.
        let output_sub = {
            let output_tx = Arc::clone(&output_tx);
            self.transport
                .listen(format!("terminal.output.{id}"), move |value| {
                    let chunk = value
                        .get("output")
                        .and_then(Value::to_chunk)
                        .or_else(|| value.to_chunk());
                    if let (Some(chunk), Some(tx)) = (chunk, output_tx.lock().unwrap().as_ref()) {
                        let _ = tx.send(chunk);
                    }
                })
        };
        let close_sub = {
            let output_tx = Arc::clone(&output_tx);
            let exit_tx = Arc::clone(&exit_tx);
            self.transport
                .listen(format!("terminal.close.{id}"), move |value| {
                    let code = value
                        .get("exitCode")
                        .and_then(Value::as_i64)
                        .unwrap_or(0) as i32;
                    exit_tx.send_if_modified(|current| {
                        if current.is_none() {
                            *current = Some(code);
                            true
                        } else {
                            false
                        }
                    });
                    // Dropping the sender ends the output stream once the
                    // already-buffered chunks drain.
                    output_tx.lock().unwrap().take();
                })
        };

        let spawned = self
            .transport
            .invoke(
                "terminal.spawn",
                Value::map([
                    ("command", Value::from(full_command.as_str())),
                    ("id", Value::from(id.as_str())),
                ]),
            )
            .await;
        let task = match spawned {
            Ok(value) => Task::from_value(&value, &id),
            Err(err) => {
                output_sub.dispose();
                close_sub.dispose();
                return Err(err);
            },
        };

        // The client-side id stays authoritative: the subscriptions above
        // are bound to it.
        let inner = Arc::new(ProcessInner {
            id,
            command: task.command.unwrap_or(full_command),
            kind: task.kind.or(options.kind),
            created: task.created.unwrap_or_else(Utc::now),
            transport: self.transport.clone(),
            output_rx: Mutex::new(Some(output_rx)),
            output_tx,
            exit_tx,
            exit_rx,
            subs: Mutex::new(vec![output_sub, close_sub]),
            terminated: AtomicBool::new(false),
        });

        // Release subscriptions as soon as any path settles the exit code.
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut rx = inner.exit_rx.clone();
                if rx.wait_for(Option::is_some).await.is_ok() {
                    inner.release();
                }
            });
        }
        let process = Process { inner };
        if let Some(abort) = options.abort {
            let handle = process.clone();
            tokio::spawn(async move {
                let mut exit = handle.inner.exit_rx.clone();
                tokio::select! {
                    _ = abort.cancelled() => handle.kill().await,
                    _ = async { let _ = exit.wait_for(Option::is_some).await; } => {},
                }
            });
        }
        Ok(process)
    }

    /// Creates a server-side terminal without wiring a process handle.
    pub async fn create(&self, id: Option<String>) -> Result<Task> {
        let id = id.unwrap_or_else(random_task_id);
        let value = self
            .transport
            .invoke(
                "terminal.create",
                Value::map([("id", Value::from(id.as_str()))]),
            )
            .await?;
        Ok(Task::from_value(&value, &id))
    }

    /// Starts a previously created terminal.
    pub async fn start(&self, id: &str) -> Result<Task> {
        let value = self
            .transport
            .invoke("terminal.start", Value::map([("id", Value::from(id))]))
            .await?;
        Ok(Task::from_value(&value, id))
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        let value = self.transport.invoke("terminal.list", Value::Null).await?;
        Ok(value
            .as_array()
            .unwrap_or(&[])
            .iter()
            .map(|item| Task::from_value(item, ""))
            .collect())
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        self.transport
            .invoke(
                "terminal.resize",
                Value::map([
                    ("id", Value::from(id)),
                    ("cols", Value::Int(i64::from(cols))),
                    ("rows", Value::Int(i64::from(rows))),
                ]),
            )
            .await?;
        Ok(())
    }

    pub async fn input(&self, id: &str, chunk: &[u8]) -> Result<()> {
        self.transport
            .invoke(
                "terminal.input",
                Value::map([
                    ("id", Value::from(id)),
                    ("input", Value::Bytes(Bytes::copy_from_slice(chunk))),
                ]),
            )
            .await?;
        Ok(())
    }

    pub async fn close(&self, id: &str) -> Result<()> {
        self.transport
            .invoke("terminal.close", Value::map([("id", Value::from(id))]))
            .await?;
        Ok(())
    }
}

fn random_task_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("task-{}", suffix.to_lowercase())
}
