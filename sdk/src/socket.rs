//! Reconnecting duplex byte channel.
//!
//! A background task owns the WebSocket stream and reconnects on unexpected
//! closes with randomised exponential backoff. The socket knows nothing of
//! frames, actions or topics; the transport layers policy on top of the raw
//! `open` / `message` / `error` / `close` events surfaced here.

use std::{borrow::Cow, time::Duration};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{net::TcpStream, sync::{mpsc, watch}};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state as observed by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ReadyState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// Raw socket notifications pushed to the owner.
#[derive(Debug)]
pub enum SocketEvent {
    Open,
    Message(Bytes),
    Error(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// When true, no connection attempt occurs until [`ReconnectingSocket::reconnect`].
    pub start_closed:    bool,
    pub backoff_initial: Duration,
    pub backoff_cap:     Duration,
    pub backoff_factor:  f64,
    /// Per-attempt bound on the WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            start_closed:    true,
            backoff_initial: Duration::from_millis(200),
            backoff_cap:     Duration::from_secs(2),
            backoff_factor:  2.0,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

enum Command {
    Send(Bytes),
    Reconnect,
    Close { code: u16, reason: String },
}

/// Handle to the socket task.
#[derive(Debug, Clone)]
pub struct ReconnectingSocket {
    cmd_tx:   mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ReadyState>,
}

impl ReconnectingSocket {
    /// Spawns the socket task for `url`. Events arrive on the returned
    /// receiver in socket order.
    pub fn spawn(
        url: impl Into<String>,
        options: SocketOptions,
    ) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ReadyState::Closed);
        let url = url.into();
        tokio::spawn(async move {
            Driver {
                url,
                options,
                cmd_rx,
                event_tx,
                state_tx,
            }
            .run()
            .await;
        });
        (Self { cmd_tx, state_rx }, event_rx)
    }

    /// Queues `bytes` for the open connection. Sends while not open are
    /// dropped so stale writes cannot pile up during an outage.
    pub fn send(&self, bytes: Bytes) {
        if self.state() != ReadyState::Open {
            warn!(state = %self.state(), "dropping send while socket is not open");
            return;
        }
        let _ = self.cmd_tx.send(Command::Send(bytes));
    }

    /// Forces a (re)connection attempt, also used to start a lazily closed
    /// socket.
    pub fn reconnect(&self) { let _ = self.cmd_tx.send(Command::Reconnect); }

    /// Closes the connection and stops reconnecting until the next
    /// [`reconnect`](Self::reconnect).
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Close {
            code,
            reason: reason.into(),
        });
    }

    pub fn state(&self) -> ReadyState { *self.state_rx.borrow() }

    pub fn state_stream(&self) -> watch::Receiver<ReadyState> { self.state_rx.clone() }
}

struct Driver {
    url:      String,
    options:  SocketOptions,
    cmd_rx:   mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    state_tx: watch::Sender<ReadyState>,
}

impl Driver {
    async fn run(mut self) {
        let mut want_connect = !self.options.start_closed;
        let mut attempt: u32 = 0;

        loop {
            if !want_connect {
                match self.cmd_rx.recv().await {
                    Some(Command::Reconnect) => {
                        want_connect = true;
                        attempt = 0;
                    },
                    Some(Command::Close { .. }) => {},
                    Some(Command::Send(_)) => {
                        warn!("dropping send while socket is closed");
                    },
                    None => return,
                }
                continue;
            }

            if attempt > 0 {
                let delay = self.backoff_delay(attempt);
                debug!(?delay, attempt, "backing off before reconnect");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(Command::Close { .. }) => { want_connect = false; continue; },
                        Some(Command::Reconnect) => { attempt = 0; continue; },
                        Some(Command::Send(_)) => {
                            warn!("dropping send while socket is reconnecting");
                            continue;
                        },
                        None => return,
                    },
                }
            }

            self.set_state(ReadyState::Connecting);
            match self.connect_once().await {
                ConnectOutcome::Stop => return,
                ConnectOutcome::Cancelled => {
                    self.set_state(ReadyState::Closed);
                    want_connect = false;
                },
                ConnectOutcome::Failed(err) => {
                    self.set_state(ReadyState::Closed);
                    self.emit(SocketEvent::Error(err));
                    attempt += 1;
                },
                ConnectOutcome::Connected(stream) => {
                    attempt = 0;
                    self.set_state(ReadyState::Open);
                    self.emit(SocketEvent::Open);
                    match self.drive(stream).await {
                        SessionEnd::Stop => return,
                        SessionEnd::Reconnect => {
                            self.set_state(ReadyState::Closed);
                            attempt = 1;
                        },
                        SessionEnd::Stay => {
                            self.set_state(ReadyState::Closed);
                            want_connect = false;
                        },
                    }
                },
            }
        }
    }

    async fn connect_once(&mut self) -> ConnectOutcome {
        let connect =
            tokio::time::timeout(self.options.connect_timeout, connect_async(self.url.clone()));
        tokio::select! {
            result = connect => match result {
                Ok(Ok((stream, _response))) => ConnectOutcome::Connected(stream),
                Ok(Err(err)) => ConnectOutcome::Failed(err.to_string()),
                Err(_) => ConnectOutcome::Failed(format!(
                    "connect timed out after {:?}",
                    self.options.connect_timeout
                )),
            },
            cmd = self.cmd_rx.recv() => match cmd {
                Some(Command::Close { .. }) => ConnectOutcome::Cancelled,
                Some(Command::Reconnect) => ConnectOutcome::Failed("superseded".to_owned()),
                Some(Command::Send(_)) => {
                    warn!("dropping send while socket is connecting");
                    ConnectOutcome::Failed("send during connect".to_owned())
                },
                None => ConnectOutcome::Stop,
            },
        }
    }

    /// Runs one established connection until it ends. The returned value
    /// says whether to reconnect, stay closed, or shut the task down.
    async fn drive(&mut self, stream: WsStream) -> SessionEnd {
        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Binary(raw))) => {
                        trace!(len = raw.len(), "socket message");
                        self.emit(SocketEvent::Message(Bytes::from(raw)));
                    },
                    // Text frames are forwarded as raw bytes; the transport
                    // decides whether they decode.
                    Some(Ok(Message::Text(text))) => {
                        self.emit(SocketEvent::Message(Bytes::from(text.into_bytes())));
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    },
                    Some(Ok(Message::Pong(_))) => {},
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = extract_close(frame.as_ref());
                        debug!(code, %reason, "socket closed by peer");
                        self.emit(SocketEvent::Close { code, reason });
                        return SessionEnd::Reconnect;
                    },
                    Some(Ok(_)) => {},
                    Some(Err(err)) => {
                        self.emit(SocketEvent::Error(err.to_string()));
                        self.emit(SocketEvent::Close {
                            code:   1006,
                            reason: "abnormal closure".to_owned(),
                        });
                        return SessionEnd::Reconnect;
                    },
                    None => {
                        self.emit(SocketEvent::Close {
                            code:   1006,
                            reason: "abnormal closure".to_owned(),
                        });
                        return SessionEnd::Reconnect;
                    },
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send(bytes)) => {
                        if let Err(err) = sink.send(Message::Binary(bytes.to_vec())).await {
                            self.emit(SocketEvent::Error(err.to_string()));
                        }
                    },
                    Some(Command::Reconnect) => {
                        let _ = sink.send(close_message(1000, "reconnect")).await;
                        // Surfaced as a going-away close so in-flight
                        // requests fail over to the new connection.
                        self.emit(SocketEvent::Close {
                            code:   1001,
                            reason: "client reconnect".to_owned(),
                        });
                        return SessionEnd::Reconnect;
                    },
                    Some(Command::Close { code, reason }) => {
                        self.set_state(ReadyState::Closing);
                        let _ = sink.send(close_message(code, &reason)).await;
                        return SessionEnd::Stay;
                    },
                    None => {
                        let _ = sink.send(close_message(1000, "dropped")).await;
                        return SessionEnd::Stop;
                    },
                },
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .options
            .backoff_factor
            .powi(attempt.saturating_sub(1) as i32);
        let raw = self.options.backoff_initial.as_millis() as f64 * exp;
        let capped = raw.min(self.options.backoff_cap.as_millis() as f64);
        // half fixed, half jitter
        let jittered = capped / 2.0 + rand::thread_rng().gen_range(0.0..capped / 2.0);
        Duration::from_millis(jittered as u64)
    }

    fn set_state(&self, state: ReadyState) { let _ = self.state_tx.send(state); }

    fn emit(&self, event: SocketEvent) { let _ = self.event_tx.send(event); }
}

enum ConnectOutcome {
    Connected(WsStream),
    Failed(String),
    Cancelled,
    Stop,
}

enum SessionEnd {
    Reconnect,
    Stay,
    Stop,
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code:   CloseCode::from(code),
        reason: Cow::Owned(reason.to_owned()),
    }))
}

fn extract_close(frame: Option<&CloseFrame<'_>>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
        None => (1005, String::new()),
    }
}
