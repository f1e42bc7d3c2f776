use std::time::Duration;

use notebook_sdk::{prelude::*, transport::TOPIC_ERROR};
use pretty_assertions::assert_eq;

use crate::support::{fast_options, TestServer};

#[tokio::test]
async fn invoke_resolves_with_the_response_payload() {
    let mut server = TestServer::listen().await;
    let transport = Transport::spawn(server.url.clone(), fast_options()).unwrap();

    let call = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport
                .invoke("fs.stat", Value::map([("path", Value::from("/a"))]))
                .await
        })
    };

    let mut conn = server.accept().await;
    let request = conn.expect_request(5).await;
    assert_eq!(request.action.as_deref(), Some("fs.stat"));
    assert_eq!(
        request.data.get("path").and_then(Value::as_str),
        Some("/a")
    );
    // Response and error topics are derived from the action and token.
    let response_topic = request.response_event.clone().unwrap();
    assert!(response_topic.starts_with("fs.stat_"));
    assert_eq!(
        request.error_event.as_deref().unwrap(),
        format!("{response_topic}_error")
    );

    conn.reply_ok(&request, Value::map([("isFile", Value::Bool(true))]))
        .await;
    let value = call.await.unwrap().unwrap();
    assert_eq!(value.get("isFile").and_then(Value::as_bool), Some(true));
    transport.close().await;
}

#[tokio::test]
async fn queued_request_is_sent_after_the_lazy_socket_opens() {
    let mut server = TestServer::listen().await;
    let transport = Transport::spawn(server.url.clone(), fast_options()).unwrap();

    // No connection exists yet; the invoke must queue and force a connect.
    let call = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport
                .invoke_with(
                    "ping",
                    Value::Null,
                    CallOptions {
                        timeout: Some(Duration::from_secs(5)),
                        abort:   None,
                    },
                )
                .await
        })
    };

    let mut conn = server.accept().await;
    let ping = conn.expect_request(5).await;
    assert_eq!(ping.action.as_deref(), Some("ping"));
    conn.reply_ok(&ping, Value::from("pong")).await;

    let value = call.await.unwrap().unwrap();
    assert_eq!(value.as_str(), Some("pong"));
    transport.close().await;
}

#[tokio::test]
async fn server_error_frames_become_typed_errors() {
    let mut server = TestServer::listen().await;
    let transport = Transport::spawn(server.url.clone(), fast_options()).unwrap();

    let call = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport
                .invoke("fs.readFile", Value::map([("path", Value::from("/gone"))]))
                .await
        })
    };

    let mut conn = server.accept().await;
    let request = conn.expect_request(5).await;
    conn.reply_err(
        &request,
        Value::map([
            ("code", Value::Int(404)),
            ("message", Value::from("no such file")),
            ("name", Value::from("FileNotFound")),
        ]),
    )
    .await;

    match call.await.unwrap() {
        Err(Error::Filesystem(err)) => {
            assert_eq!(err.kind, FsErrorKind::FileNotFound);
            assert_eq!(err.code, 404);
        },
        other => panic!("expected a filesystem error, got {other:?}"),
    }

    // An unrecognised name surfaces as a plain application error.
    let call = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.invoke("composer.invoke", Value::Null).await })
    };
    let request = conn.expect_request(5).await;
    conn.reply_err(
        &request,
        Value::map([
            ("code", Value::Int(422)),
            ("message", Value::from("nope")),
        ]),
    )
    .await;
    match call.await.unwrap() {
        Err(Error::Api(err)) => assert_eq!(err.code, 422),
        other => panic!("expected an api error, got {other:?}"),
    }
    transport.close().await;
}

#[tokio::test]
async fn close_1008_fails_fast_until_explicit_reconnect() {
    let mut server = TestServer::listen().await;
    let transport = Transport::spawn(server.url.clone(), fast_options()).unwrap();

    let call = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.invoke("ping", Value::Null).await })
    };
    let mut conn = server.accept().await;
    let _ping = conn.expect_request(5).await;
    conn.close_with(1008, "rate limit exceeded").await;

    match call.await.unwrap() {
        Err(Error::RateLimited(reason)) => assert!(reason.contains("rate limit")),
        other => panic!("expected rate limit, got {other:?}"),
    }

    // Fail fast now: no reconnection attempt is scheduled.
    match transport.invoke("ping", Value::Null).await {
        Err(Error::RateLimited(_)) => {},
        other => panic!("expected fail-fast rate limit, got {other:?}"),
    }

    // An explicit reconnect clears the stop.
    let reconnect = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.reconnect().await })
    };
    let mut conn = server.accept().await;
    reconnect.await.unwrap().unwrap();

    let call = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.invoke("ping", Value::Null).await })
    };
    let ping = conn.expect_request(5).await;
    conn.reply_ok(&ping, Value::from("pong")).await;
    assert_eq!(call.await.unwrap().unwrap().as_str(), Some("pong"));
    transport.close().await;
}

#[tokio::test]
async fn disposing_rejects_in_flight_requests() {
    let mut server = TestServer::listen().await;
    let transport = Transport::spawn(server.url.clone(), fast_options()).unwrap();

    let call = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.invoke("fs.tree", Value::Null).await })
    };
    let mut conn = server.accept().await;
    let _request = conn.expect_request(5).await;

    transport.close().await;
    match call.await.unwrap() {
        Err(Error::ConnectionLost { .. } | Error::Closed) => {},
        other => panic!("expected connection-lost on dispose, got {other:?}"),
    }

    // The transport is gone for good.
    assert!(matches!(
        transport.invoke("ping", Value::Null).await,
        Err(Error::Closed)
    ));
    // close() is a no-op the second time.
    transport.close().await;
}

#[tokio::test]
async fn queue_overflow_drops_the_oldest_request() {
    // Nothing listens on this port, so every request queues.
    let options = TransportOptions {
        queue_limit: 2,
        ..fast_options()
    };
    let transport = Transport::spawn("ws://127.0.0.1:9".to_owned(), options).unwrap();

    let first = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.invoke("first", Value::Null).await })
    };
    // Give the first invoke time to enqueue before the others.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _second = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.invoke("second", Value::Null).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _third = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.invoke("third", Value::Null).await })
    };

    match tokio::time::timeout(Duration::from_secs(2), first).await {
        Ok(result) => match result.unwrap() {
            Err(Error::QueueOverflow) => {},
            other => panic!("expected queue overflow, got {other:?}"),
        },
        Err(_) => panic!("oldest queued request was not rejected"),
    }
    transport.close().await;
}

#[tokio::test]
async fn request_timeout_and_abort_are_not_retried() {
    let mut server = TestServer::listen().await;
    let transport = Transport::spawn(server.url.clone(), fast_options()).unwrap();

    let call = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport
                .invoke_with(
                    "slow.op",
                    Value::Null,
                    CallOptions {
                        timeout: Some(Duration::from_millis(100)),
                        abort:   None,
                    },
                )
                .await
        })
    };
    let mut conn = server.accept().await;
    let _request = conn.expect_request(5).await;
    // Never reply.
    assert!(matches!(
        call.await.unwrap(),
        Err(Error::RequestTimeout(_))
    ));

    let abort = tokio_util::sync::CancellationToken::new();
    abort.cancel();
    assert!(matches!(
        transport
            .invoke_with(
                "ping",
                Value::Null,
                CallOptions {
                    timeout: None,
                    abort:   Some(abort),
                },
            )
            .await,
        Err(Error::Aborted)
    ));
    transport.close().await;
}

#[tokio::test]
async fn malformed_frames_are_dropped_and_reported() {
    let mut server = TestServer::listen().await;
    let transport = Transport::spawn(server.url.clone(), fast_options()).unwrap();

    let errors = std::sync::Arc::new(std::sync::Mutex::new(0usize));
    let seen = std::sync::Arc::clone(&errors);
    let _sub = transport.listen(TOPIC_ERROR, move |_| {
        *seen.lock().unwrap() += 1;
    });

    transport.connect().await.unwrap();
    let mut conn = server.accept().await;
    conn.send_text("not a frame").await;

    // The connection survives; a later request still round-trips.
    let call = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.invoke("ping", Value::Null).await })
    };
    let ping = conn.expect_request(5).await;
    conn.reply_ok(&ping, Value::from("pong")).await;
    call.await.unwrap().unwrap();

    assert_eq!(*errors.lock().unwrap(), 1);
    let stats = transport.stats();
    assert!(stats.errors >= 1);
    assert!(stats.connected);
    transport.close().await;
}

#[tokio::test]
async fn stats_track_traffic_and_health() {
    let mut server = TestServer::listen().await;
    let transport = Transport::spawn(server.url.clone(), fast_options()).unwrap();

    assert_eq!(transport.health(), Health::Unhealthy); // not connected yet

    let call = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.invoke("ping", Value::Null).await })
    };
    let mut conn = server.accept().await;
    let ping = conn.expect_request(5).await;
    conn.reply_ok(&ping, Value::from("pong")).await;
    call.await.unwrap().unwrap();

    let stats = transport.stats();
    assert!(stats.connected);
    assert_eq!(stats.messages_sent, 1);
    assert!(stats.messages_received >= 1);
    assert!(stats.avg_response.is_some());
    assert_eq!(transport.health(), Health::Healthy);
    transport.close().await;
}

#[tokio::test]
async fn invalid_configuration_is_rejected_up_front() {
    let options = TransportOptions {
        ping_interval: Duration::from_secs(1),
        ..TransportOptions::default()
    };
    assert!(matches!(
        Transport::spawn("ws://127.0.0.1:9".to_owned(), options),
        Err(Error::InvalidConfig(_))
    ));

    let options = TransportOptions {
        max_retries: 100,
        ..TransportOptions::default()
    };
    assert!(matches!(
        Transport::spawn("ws://127.0.0.1:9".to_owned(), options),
        Err(Error::InvalidConfig(_))
    ));
}
