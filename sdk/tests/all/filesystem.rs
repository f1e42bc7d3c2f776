use std::sync::{Arc, Mutex};

use bytes::Bytes;
use notebook_sdk::prelude::*;
use pretty_assertions::assert_eq;

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
async fn streaming_search_with_early_cancel() {
    let mut server = TestServer::listen().await;
    let (session, mut conn) = ready_session(&mut server).await;

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let search = {
        let fs = session.fs().clone();
        let sink = Arc::clone(&seen);
        tokio::spawn(async move {
            fs.search(
                SearchQuery::new("foo"),
                None,
                Some(Box::new(move |result| {
                    sink.lock().unwrap().push(result.path.clone());
                    result.path != "a.txt"
                })),
            )
            .await
        })
    };

    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("fs.textSearch"));
    assert_eq!(
        request.data.get("pattern").and_then(Value::as_str),
        Some("foo")
    );
    // Default options travel with the query.
    assert_eq!(
        request.data.get("maxResults").and_then(Value::as_i64),
        Some(5)
    );
    assert_eq!(request.data.get("regex").and_then(Value::as_bool), Some(false));
    let id = request
        .data
        .get("id")
        .and_then(Value::as_str)
        .unwrap()
        .to_owned();
    let topic = format!("fs.text.search.{id}");

    // Three incremental results, then the end sentinel. The handler bails
    // at a.txt, so b.txt must not reach it.
    for path in ["z.txt", "a.txt", "b.txt"] {
        conn.push(&topic, Value::map([("path", Value::from(path))])).await;
    }
    conn.push(&topic, Value::Bool(false)).await;
    conn.reply_ok(
        &request,
        Value::map([
            ("hasMore", Value::Bool(false)),
            (
                "matches",
                Value::Array(vec![
                    Value::map([("path", Value::from("z.txt"))]),
                    Value::map([("path", Value::from("a.txt"))]),
                    Value::map([("path", Value::from("b.txt"))]),
                ]),
            ),
        ]),
    )
    .await;

    let results = search.await.unwrap().unwrap();
    assert!(!results.has_more);
    assert_eq!(results.matches.len(), 3);
    assert_eq!(*seen.lock().unwrap(), vec!["z.txt".to_owned(), "a.txt".to_owned()]);
    // The incremental channel is released.
    assert_eq!(session.transport().listener_count(&topic), 0);
    session.dispose().await;
}

#[tokio::test]
async fn download_concatenates_chunks_in_arrival_order() {
    let mut server = TestServer::listen().await;
    let (session, mut conn) = ready_session(&mut server).await;

    let download = {
        let fs = session.fs().clone();
        tokio::spawn(async move { fs.download(None, None).await })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("fs.download"));
    let id = request
        .data
        .get("id")
        .and_then(Value::as_str)
        .unwrap()
        .to_owned();
    let topic = format!("fs.download.{id}");

    conn.push(
        &topic,
        Value::map([("chunk", Value::Bytes(Bytes::from_static(b"PK\x03\x04")))]),
    )
    .await;
    conn.push(&topic, Value::map([("chunk", Value::from("tail"))])).await;
    conn.reply_ok(&request, Value::Null).await;

    let blob = download.await.unwrap().unwrap();
    assert_eq!(&blob[..], b"PK\x03\x04tail");
    session.dispose().await;
}

#[tokio::test]
async fn recognised_error_names_become_fs_errors() {
    let mut server = TestServer::listen().await;
    let (session, mut conn) = ready_session(&mut server).await;

    let stat = {
        let fs = session.fs().clone();
        tokio::spawn(async move { fs.stat("/missing").await })
    };
    let request = conn.expect_request(5).await;
    conn.reply_err(
        &request,
        Value::map([
            ("code", Value::Int(404)),
            ("message", Value::from("not found")),
            ("name", Value::from("FileNotFound")),
        ]),
    )
    .await;
    match stat.await.unwrap() {
        Err(Error::Filesystem(err)) => assert_eq!(err.kind, FsErrorKind::FileNotFound),
        other => panic!("expected fs error, got {other:?}"),
    }

    // exists() folds that same error into `false`.
    let exists = {
        let fs = session.fs().clone();
        tokio::spawn(async move { fs.exists("/missing").await })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("fs.stat"));
    conn.reply_err(
        &request,
        Value::map([
            ("code", Value::Int(404)),
            ("message", Value::from("not found")),
            ("name", Value::from("FileNotFound")),
        ]),
    )
    .await;
    assert_eq!(exists.await.unwrap().unwrap(), false);
    session.dispose().await;
}

#[tokio::test]
async fn read_file_returns_bytes_or_a_line_range() {
    let mut server = TestServer::listen().await;
    let (session, mut conn) = ready_session(&mut server).await;

    let read = {
        let fs = session.fs().clone();
        tokio::spawn(async move { fs.read_file("/app/a.txt").await })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("fs.readFile"));
    conn.reply_ok(
        &request,
        Value::map([("content", Value::Bytes(Bytes::from_static(b"<?php\n")))]),
    )
    .await;
    assert_eq!(&read.await.unwrap().unwrap()[..], b"<?php\n");

    let read = {
        let fs = session.fs().clone();
        tokio::spawn(async move { fs.read_file_range("/app/a.txt", 10, 20).await })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(
        request.data.get("lineStart").and_then(Value::as_i64),
        Some(10)
    );
    conn.reply_ok(
        &request,
        Value::map([
            ("lineStart", Value::Int(10)),
            ("lineEnd", Value::Int(20)),
            ("content", Value::from("function handle() {}")),
        ]),
    )
    .await;
    let range = read.await.unwrap().unwrap();
    assert_eq!(range.line_start, 10);
    assert_eq!(range.line_end, 20);
    assert_eq!(range.content, "function handle() {}");
    assert!(range.error.is_none());
    session.dispose().await;
}

#[tokio::test]
async fn watch_dispose_detaches_and_unwatches_once() {
    let mut server = TestServer::listen().await;
    let (session, mut conn) = ready_session(&mut server).await;

    let watch = {
        let fs = session.fs().clone();
        tokio::spawn(async move {
            fs.watch("/app", WatchOptions::default(), |_| {}).await
        })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("fs.watch"));
    conn.reply_ok(&request, Value::Null).await;
    let watch = watch.await.unwrap().unwrap();

    let dispose = {
        let watch = Arc::new(watch);
        let first = Arc::clone(&watch);
        tokio::spawn(async move {
            first.dispose().await;
            // Second dispose must not send another unwatch.
            first.dispose().await;
            watch
        })
    };
    let unwatch = conn.expect_request(5).await;
    assert_eq!(unwatch.action.as_deref(), Some("fs.unwatch"));
    assert_eq!(
        unwatch.data.get("path").and_then(Value::as_str),
        Some("/app")
    );
    conn.reply_ok(&unwatch, Value::Null).await;
    let _watch = dispose.await.unwrap();
    conn.expect_silence(200).await;
    assert_eq!(session.transport().listener_count("fs.watch./app"), 0);
    session.dispose().await;
}

#[tokio::test]
async fn directory_listing_and_find() {
    let mut server = TestServer::listen().await;
    let (session, mut conn) = ready_session(&mut server).await;

    let list = {
        let fs = session.fs().clone();
        tokio::spawn(async move { fs.read_directory("/app").await })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("fs.readDirectory"));
    conn.reply_ok(
        &request,
        Value::Array(vec![
            Value::map([
                ("name", Value::from("routes.php")),
                ("isFile", Value::Bool(true)),
            ]),
            Value::map([
                ("name", Value::from("Models")),
                ("isDirectory", Value::Bool(true)),
            ]),
        ]),
    )
    .await;
    let entries = list.await.unwrap().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].is_file);
    assert!(entries[1].is_directory);

    let find = {
        let fs = session.fs().clone();
        tokio::spawn(async move { fs.find("*.php", FindOptions::default()).await })
    };
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("fs.find"));
    // The default exclude list rides along.
    let excludes = request.data.get("exclude").and_then(Value::as_array).unwrap();
    assert!(excludes.iter().any(|v| v.as_str() == Some("**/node_modules")));
    conn.reply_ok(
        &request,
        Value::Array(vec![Value::from("a.php"), Value::from("b.php")]),
    )
    .await;
    assert_eq!(find.await.unwrap().unwrap(), vec!["a.php".to_owned(), "b.php".to_owned()]);
    session.dispose().await;
}
