use std::{sync::Arc, time::Duration};

use notebook_sdk::prelude::*;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use crate::support::{fast_options, TestServer};

async fn ready_session(server: &mut TestServer) -> (Arc<Session>, crate::support::ServerConn) {
    let session = Arc::new(Session::open(server.url.clone(), fast_options()).unwrap());
    let ready = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.ready().await })
    };
    let mut conn = server.accept().await;
    conn.serve_ready().await;
    ready.await.unwrap().unwrap();
    (session, conn)
}

#[tokio::test]
async fn spawn_collects_output_and_exit_code() {
    let mut server = TestServer::listen().await;
    let (session, mut conn) = ready_session(&mut server).await;

    let spawn = {
        let terminal = session.terminal().clone();
        tokio::spawn(async move {
            terminal
                .spawn("printf", &["%s", "hi"], SpawnOptions::default())
                .await
        })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("terminal.spawn"));
    assert_eq!(
        request.data.get("command").and_then(Value::as_str),
        Some("printf %s hi")
    );
    let id = request
        .data
        .get("id")
        .and_then(Value::as_str)
        .unwrap()
        .to_owned();
    conn.reply_ok(
        &request,
        Value::map([
            ("id", Value::from(id.as_str())),
            ("kind", Value::from("process")),
            ("created", Value::from("2026-08-01T10:00:00Z")),
        ]),
    )
    .await;
    let process = spawn.await.unwrap().unwrap();
    assert_eq!(process.id(), id);
    assert_eq!(process.kind(), Some("process"));

    conn.push(
        &format!("terminal.output.{id}"),
        Value::map([("output", Value::from("hi"))]),
    )
    .await;
    conn.push(
        &format!("terminal.close.{id}"),
        Value::map([("exitCode", Value::Int(0))]),
    )
    .await;

    let output = process.output().collect().await;
    assert_eq!(&output[..], b"hi");
    assert_eq!(process.exit().await, 0);

    // All per-process listeners are gone once the exit settled.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        session
            .transport()
            .listener_count(&format!("terminal.output.{id}")),
        0
    );
    assert_eq!(
        session
            .transport()
            .listener_count(&format!("terminal.close.{id}")),
        0
    );
    session.dispose().await;
}

#[tokio::test]
async fn pre_aborted_spawn_never_subscribes() {
    let server = TestServer::listen().await;
    let session = Session::open(server.url.clone(), fast_options()).unwrap();

    let abort = CancellationToken::new();
    abort.cancel();
    let process = session
        .terminal()
        .spawn(
            "sleep",
            &["60"],
            SpawnOptions {
                abort: Some(abort),
                ..SpawnOptions::default()
            },
        )
        .await
        .unwrap();

    // Exit is synthetic, output is empty, and nothing ever hit the wire:
    // the socket is still lazily closed.
    assert_eq!(process.exit().await, -1);
    assert!(process.output().next().await.is_none());
    assert_eq!(session.transport().state(), ReadyState::Closed);
    assert_eq!(
        session
            .transport()
            .listener_count(&format!("terminal.output.{}", process.id())),
        0
    );
    session.dispose().await;
}

#[tokio::test]
async fn firing_the_abort_token_kills_the_process() {
    let mut server = TestServer::listen().await;
    let (session, mut conn) = ready_session(&mut server).await;

    let abort = CancellationToken::new();
    let spawn = {
        let terminal = session.terminal().clone();
        let abort = abort.clone();
        tokio::spawn(async move {
            terminal
                .spawn(
                    "sleep",
                    &["60"],
                    SpawnOptions {
                        abort: Some(abort),
                        ..SpawnOptions::default()
                    },
                )
                .await
        })
    };
    let request = conn.expect_request(5).await;
    let id = request
        .data
        .get("id")
        .and_then(Value::as_str)
        .unwrap()
        .to_owned();
    conn.reply_ok(&request, Value::map([("id", Value::from(id.as_str()))]))
        .await;
    let process = spawn.await.unwrap().unwrap();

    abort.cancel();
    let close = conn.expect_request(5).await;
    assert_eq!(close.action.as_deref(), Some("terminal.close"));
    assert_eq!(close.data.get("id").and_then(Value::as_str), Some(id.as_str()));
    conn.reply_ok(&close, Value::Null).await;

    assert_eq!(process.exit().await, -1);
    session.dispose().await;
}

#[tokio::test]
async fn kill_is_idempotent() {
    let mut server = TestServer::listen().await;
    let (session, mut conn) = ready_session(&mut server).await;

    let spawn = {
        let terminal = session.terminal().clone();
        tokio::spawn(async move {
            terminal
                .spawn("tail", &["-f", "log"], SpawnOptions::default())
                .await
        })
    };
    let request = conn.expect_request(5).await;
    conn.reply_ok(&request, Value::Null).await;
    let process = spawn.await.unwrap().unwrap();

    let kill = {
        let process = process.clone();
        tokio::spawn(async move { process.kill().await })
    };
    let close = conn.expect_request(5).await;
    assert_eq!(close.action.as_deref(), Some("terminal.close"));
    conn.reply_ok(&close, Value::Null).await;
    kill.await.unwrap();

    // The second kill sends nothing.
    process.kill().await;
    conn.expect_silence(200).await;
    assert_eq!(process.exit().await, -1);
    session.dispose().await;
}

#[tokio::test]
async fn multiplexed_terminal_operations() {
    let mut server = TestServer::listen().await;
    let (session, mut conn) = ready_session(&mut server).await;

    let list = {
        let terminal = session.terminal().clone();
        tokio::spawn(async move { terminal.list().await })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("terminal.list"));
    conn.reply_ok(
        &request,
        Value::Array(vec![
            Value::map([("id", Value::from("t1")), ("kind", Value::from("shell"))]),
            Value::map([("id", Value::from("t2"))]),
        ]),
    )
    .await;
    let tasks = list.await.unwrap().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, "t1");
    assert_eq!(tasks[0].kind.as_deref(), Some("shell"));

    let resize = {
        let terminal = session.terminal().clone();
        tokio::spawn(async move { terminal.resize("t1", 120, 40).await })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("terminal.resize"));
    assert_eq!(request.data.get("cols").and_then(Value::as_i64), Some(120));
    assert_eq!(request.data.get("rows").and_then(Value::as_i64), Some(40));
    conn.reply_ok(&request, Value::Null).await;
    resize.await.unwrap().unwrap();

    let input = {
        let terminal = session.terminal().clone();
        tokio::spawn(async move { terminal.input("t1", b"ls\n").await })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("terminal.input"));
    assert_eq!(
        request.data.get("input").and_then(Value::as_bytes).map(|b| &b[..]),
        Some(&b"ls\n"[..])
    );
    conn.reply_ok(&request, Value::Null).await;
    input.await.unwrap().unwrap();
    session.dispose().await;
}
