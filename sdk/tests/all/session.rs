use std::sync::{Arc, Mutex};

use notebook_sdk::prelude::*;
use pretty_assertions::assert_eq;

use crate::support::{fast_options, TestServer};

#[tokio::test]
async fn ready_completes_the_init_handshake_lazily() {
    let mut server = TestServer::listen().await;
    let session = Arc::new(Session::open(server.url.clone(), fast_options()).unwrap());

    // Nothing has connected yet.
    assert_eq!(session.transport().state(), ReadyState::Closed);

    let ready = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.ready().await })
    };
    let mut conn = server.accept().await;
    conn.serve_ready().await;

    let init = ready.await.unwrap().unwrap();
    assert_eq!(init.preview_url.as_deref(), Some("https://preview.test"));
    assert_eq!(init.ports, vec![8080]);

    // A second ready() is answered from cache, with no further traffic.
    let cached = session.ready().await.unwrap();
    assert_eq!(cached.preview_url, init.preview_url);
    conn.expect_silence(200).await;
    session.dispose().await;
}

#[tokio::test]
async fn init_error_payload_fails_ready() {
    let mut server = TestServer::listen().await;
    let session = Arc::new(Session::open(server.url.clone(), fast_options()).unwrap());

    let ready = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.ready().await })
    };
    let mut conn = server.accept().await;
    let ping = conn.expect_request(5).await;
    conn.reply_ok(&ping, Value::from("pong")).await;
    conn.push(
        "notebook.initialized",
        Value::map([
            ("kind", Value::from("error")),
            ("message", Value::from("container failed to boot")),
        ]),
    )
    .await;

    match ready.await.unwrap() {
        Err(Error::Init(message)) => assert!(message.contains("boot")),
        other => panic!("expected init error, got {other:?}"),
    }
    session.dispose().await;
}

#[tokio::test]
async fn live_watches_are_reissued_after_reconnect() {
    let mut server = TestServer::listen().await;
    let session = Arc::new(Session::open(server.url.clone(), fast_options()).unwrap());

    let ready = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.ready().await })
    };
    let mut conn = server.accept().await;
    conn.serve_ready().await;
    ready.await.unwrap().unwrap();

    // Register a watch and let the server acknowledge it.
    let changes: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let watch = {
        let fs = session.fs().clone();
        let sink = Arc::clone(&changes);
        tokio::spawn(async move {
            fs.watch("/app", WatchOptions::default(), move |change| {
                sink.lock().unwrap().push(change.path);
            })
            .await
        })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("fs.watch"));
    assert_eq!(
        request.data.get("path").and_then(Value::as_str),
        Some("/app")
    );
    conn.reply_ok(&request, Value::Null).await;
    let watch = watch.await.unwrap().unwrap();

    conn.push(
        "fs.watch./app",
        Value::map([
            ("type", Value::from("Updated")),
            ("path", Value::from("/app/routes.php")),
        ]),
    )
    .await;

    // The server goes away (1001); the socket reconnects on its own.
    conn.close_with(1001, "going away").await;
    let mut conn = server.accept().await;

    // Without any caller involvement the client re-issues the watch.
    let rewatch = conn.expect_request(5).await;
    assert_eq!(rewatch.action.as_deref(), Some("fs.watch"));
    assert_eq!(
        rewatch.data.get("path").and_then(Value::as_str),
        Some("/app")
    );
    conn.reply_ok(&rewatch, Value::Null).await;

    // The original handler still fires.
    conn.push(
        "fs.watch./app",
        Value::map([
            ("type", Value::from("Added")),
            ("path", Value::from("/app/new.php")),
        ]),
    )
    .await;

    // Wait for both events to land.
    for _ in 0..50 {
        if changes.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(*changes.lock().unwrap(), vec![
        "/app/routes.php".to_owned(),
        "/app/new.php".to_owned(),
    ]);

    watch.dispose().await;
    let unwatch = conn.expect_request(5).await;
    assert_eq!(unwatch.action.as_deref(), Some("fs.unwatch"));
    conn.reply_ok(&unwatch, Value::Null).await;
    session.dispose().await;
}

#[tokio::test]
async fn reconnect_reruns_the_handshake() {
    let mut server = TestServer::listen().await;
    let session = Arc::new(Session::open(server.url.clone(), fast_options()).unwrap());

    let ready = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.ready().await })
    };
    let mut conn = server.accept().await;
    conn.serve_ready().await;
    ready.await.unwrap().unwrap();

    let reconnect = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.reconnect().await })
    };
    let mut conn = server.accept().await;
    conn.serve_ready().await;
    let init = reconnect.await.unwrap().unwrap();
    assert_eq!(init.preview_url.as_deref(), Some("https://preview.test"));
    // The first connection is dead by now.
    drop(conn);
    session.dispose().await;
}

#[tokio::test]
async fn dispose_is_idempotent_and_final() {
    let server = TestServer::listen().await;
    let session = Session::open(server.url.clone(), fast_options()).unwrap();
    session.dispose().await;
    session.dispose().await;
    assert!(matches!(
        session.invoke("ping", Value::Null).await,
        Err(Error::Closed)
    ));
}
