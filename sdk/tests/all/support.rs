//! In-process notebook stand-in: a real WebSocket server whose behaviour
//! each test scripts by hand.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use notebook_sdk::prelude::*;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    WebSocketStream,
};

pub struct TestServer {
    pub url: String,
    conns:   mpsc::Receiver<ServerConn>,
}

impl TestServer {
    /// Binds an ephemeral port and accepts connections until dropped.
    pub async fn listen() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::channel(8);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                if tx.send(ServerConn { ws }).await.is_err() {
                    break;
                }
            }
        });
        TestServer {
            url: format!("ws://{addr}"),
            conns,
        }
    }

    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(Duration::from_secs(5), self.conns.recv())
            .await
            .expect("no connection within 5s")
            .expect("listener gone")
    }
}

pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    /// Next request frame from the client; `None` once the peer is gone.
    pub async fn next_request(&mut self) -> Option<Frame> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Binary(raw)) => {
                    return Some(Frame::decode(&raw).expect("client sent an invalid frame"))
                },
                Ok(Message::Ping(payload)) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                },
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {},
            }
        }
    }

    /// Like [`next_request`](Self::next_request) but fails the test after
    /// `secs` seconds of silence.
    pub async fn expect_request(&mut self, secs: u64) -> Frame {
        tokio::time::timeout(Duration::from_secs(secs), self.next_request())
            .await
            .expect("timed out waiting for a request")
            .expect("connection closed while waiting for a request")
    }

    /// Asserts that no request arrives for `millis` milliseconds.
    pub async fn expect_silence(&mut self, millis: u64) {
        let quiet =
            tokio::time::timeout(Duration::from_millis(millis), self.next_request()).await;
        assert!(quiet.is_err(), "expected silence, got {quiet:?}");
    }

    pub async fn send_frame(&mut self, frame: &Frame) {
        self.ws
            .send(Message::Binary(frame.encode().to_vec()))
            .await
            .unwrap();
    }

    /// Sends a raw text message, which the client must reject as malformed.
    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_owned())).await.unwrap();
    }

    pub async fn reply_ok(&mut self, request: &Frame, data: Value) {
        let topic = request
            .response_event
            .clone()
            .expect("request without responseEvent");
        self.send_frame(&Frame::response(topic, data)).await;
    }

    pub async fn reply_err(&mut self, request: &Frame, data: Value) {
        let topic = request
            .error_event
            .clone()
            .expect("request without errorEvent");
        self.send_frame(&Frame::error(topic, data)).await;
    }

    pub async fn push(&mut self, topic: &str, data: Value) {
        self.send_frame(&Frame::event(topic, data)).await;
    }

    pub async fn close_with(&mut self, code: u16, reason: &str) {
        let _ = self
            .ws
            .send(Message::Close(Some(CloseFrame {
                code:   CloseCode::from(code),
                reason: reason.to_owned().into(),
            })))
            .await;
    }

    /// Serves one `ping` and completes the init handshake.
    pub async fn serve_ready(&mut self) {
        let ping = self.expect_request(5).await;
        assert_eq!(ping.action.as_deref(), Some("ping"));
        self.reply_ok(&ping, Value::from("pong")).await;
        self.push(
            "notebook.initialized",
            Value::map([
                ("previewUrl", Value::from("https://preview.test")),
                ("ports", Value::Array(vec![Value::Int(8080)])),
            ]),
        )
        .await;
    }
}

/// Transport options tuned for fast tests: quick backoff, short connect
/// timeout, lazy socket.
pub fn fast_options() -> TransportOptions {
    TransportOptions {
        retry_base: Duration::from_millis(50),
        retry_cap: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(2),
        socket: notebook_sdk::socket::SocketOptions {
            start_closed:    true,
            backoff_initial: Duration::from_millis(20),
            backoff_cap:     Duration::from_millis(100),
            backoff_factor:  2.0,
            connect_timeout: Duration::from_secs(2),
        },
        ..TransportOptions::default()
    }
}
