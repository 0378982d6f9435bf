#![allow(missing_docs)]

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt as _;
use http::StatusCode;
use parking_lot::Mutex;
use steadfast::client::conn::mock::{respond, MockDialer, MockError};
use steadfast::client::log::LogKind;
use steadfast::client::{Builder, Client, Error, RequestOptions};
use steadfast::{Body, BoxError, CancelToken};
use tower::ServiceExt as _;

fn client(dialer: &MockDialer) -> Client {
    Builder::new().with_dialer(dialer.clone()).build()
}

#[tokio::test]
async fn retries_until_exhausted() {
    let (dialer, state) =
        MockDialer::with_handler(|_| async { Err(MockError::boxed("connection reset")) }.boxed());
    let client = client(&dialer);

    let error = client
        .get(
            "http://example.test/",
            RequestOptions::new().with_max_retries(2),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, Error::RoundTrip(_)), "{error:?}");
    assert_eq!(state.calls(), 3);
    assert_eq!(dialer.dials(), 3);
}

#[tokio::test]
async fn retry_ceiling_caps_requests() {
    let (dialer, state) =
        MockDialer::with_handler(|_| async { Err(MockError::boxed("reset")) }.boxed());
    let client = Builder::new()
        .with_dialer(dialer.clone())
        .with_retry_ceiling(1)
        .build();

    let _ = client
        .get("http://example.test/", RequestOptions::new().with_max_retries(10))
        .await
        .unwrap_err();
    assert_eq!(state.calls(), 2);
}

#[tokio::test]
async fn success_after_failure() {
    let (dialer, state) = MockDialer::with_handler(|call| {
        async move {
            if call.index == 0 {
                Err(MockError::boxed("reset"))
            } else {
                respond(StatusCode::OK, "recovered")
            }
        }
        .boxed()
    });
    let client = client(&dialer);

    let response = client
        .get("http://example.test/", RequestOptions::new().with_max_retries(3))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.content(), Some(&Bytes::from_static(b"recovered")));
    assert_eq!(state.calls(), 2);
}

#[tokio::test]
async fn single_use_body_is_not_retried() {
    let (dialer, state) =
        MockDialer::with_handler(|_| async { Err(MockError::boxed("reset")) }.boxed());
    let client = client(&dialer);

    let body = Body::wrap_stream(futures_util::stream::iter(vec![Ok::<_, BoxError>(
        Bytes::from_static(b"chunk"),
    )]));
    let error = client
        .post(
            "http://example.test/",
            RequestOptions::new().with_body(body).with_max_retries(5),
        )
        .await
        .unwrap_err();

    assert!(error.is_retryable());
    assert_eq!(state.calls(), 1);
}

#[tokio::test]
async fn replayable_body_is_sent_every_attempt() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let (dialer, _state) = MockDialer::with_handler(move |call| {
        let record = record.clone();
        async move {
            use http_body_util::BodyExt as _;
            let body = call.request.into_body().collect().await?.to_bytes();
            record.lock().push(body);
            Err(MockError::boxed("reset"))
        }
        .boxed()
    });
    let client = client(&dialer);

    let _ = client
        .post(
            "http://example.test/",
            RequestOptions::new().with_body("payload").with_max_retries(1),
        )
        .await
        .unwrap_err();

    assert_eq!(
        seen.lock().as_slice(),
        [Bytes::from_static(b"payload"), Bytes::from_static(b"payload")]
    );
}

#[tokio::test]
async fn veto_stops_retries() {
    let (dialer, state) =
        MockDialer::with_handler(|_| async { Err(MockError::boxed("reset")) }.boxed());
    let client = client(&dialer);

    let error = client
        .get(
            "http://example.test/",
            RequestOptions::new()
                .with_max_retries(5)
                .with_on_failure(|_| Some(BoxError::from("blocked"))),
        )
        .await
        .unwrap_err();

    assert_eq!(error.to_string(), "blocked");
    assert!(error.is_fatal());
    assert!(matches!(error.original(), Some(Error::RoundTrip(_))));
    assert_eq!(state.calls(), 1);
}

#[tokio::test]
async fn failure_callback_sees_every_attempt() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let record = attempts.clone();
    let (dialer, _state) =
        MockDialer::with_handler(|_| async { Err(MockError::boxed("reset")) }.boxed());
    let client = client(&dialer);

    let _ = client
        .get(
            "http://example.test/",
            RequestOptions::new()
                .with_max_retries(2)
                .with_on_failure(move |ctx| {
                    record.lock().push(ctx.attempt);
                    None
                }),
        )
        .await
        .unwrap_err();

    assert_eq!(attempts.lock().as_slice(), [0, 1, 2]);
}

#[tokio::test]
async fn invalid_requests_never_dial() {
    let (dialer, _state) = MockDialer::with_handler(|_| async { respond(StatusCode::OK, "") }.boxed());
    let client = client(&dialer);

    let error = client
        .get("mailto:someone@example.test", RequestOptions::new().with_max_retries(3))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidUrl(_)));

    let error = client
        .get(
            "http://example.test/",
            RequestOptions::new().with_proxy("not a proxy"),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidProxy(_)));

    assert_eq!(dialer.dials(), 0);
}

#[tokio::test]
async fn dial_failures_are_retried() {
    let dialer = MockDialer::failing(Error::connect("refused"));
    let client = client(&dialer);

    let error = client
        .get("http://example.test/", RequestOptions::new().with_max_retries(2))
        .await
        .unwrap_err();

    assert!(error.is_connect(), "{error:?}");
    assert_eq!(dialer.dials(), 3);
    assert!(client.pools().is_empty());
}

#[tokio::test]
async fn dial_request_carries_destination() {
    let (dialer, _state) = MockDialer::with_handler(|_| async { respond(StatusCode::OK, "") }.boxed());
    let client = client(&dialer);

    client
        .get(
            "http://example.test:8080/path",
            RequestOptions::new()
                .with_force_http1()
                .with_proxy("socks5h://127.0.0.1:1080"),
        )
        .await
        .unwrap();

    let requests = dialer.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].key.as_str(),
        "http1|socks5h://127.0.0.1:1080|http://example.test:8080"
    );
    assert_eq!(requests[0].proxies.len(), 1);
    assert_eq!(client.pools(), vec![requests[0].key.clone()]);
}

#[tokio::test]
async fn logger_sees_lifecycle() {
    let logs = Arc::new(Mutex::new(Vec::new()));
    let record = logs.clone();
    let (dialer, _state) = MockDialer::with_handler(|call| {
        async move {
            if call.index == 0 {
                Err(MockError::boxed("reset"))
            } else {
                respond(StatusCode::OK, "ok")
            }
        }
        .boxed()
    });
    let client = client(&dialer);

    let response = client
        .get(
            "http://example.test/",
            RequestOptions::new()
                .with_max_retries(1)
                .with_logger(move |log| record.lock().push(log)),
        )
        .await
        .unwrap();

    let logs = logs.lock();
    let kinds: Vec<_> = logs.iter().map(|log| log.kind).collect();
    assert_eq!(
        kinds,
        [LogKind::Retry, LogKind::ResponseHeader, LogKind::ResponseBody]
    );
    assert!(logs.iter().all(|log| log.id == response.id()));
}

#[tokio::test(start_paused = true)]
async fn deadline_is_per_attempt() {
    let (dialer, state) = MockDialer::with_handler(|call| {
        async move {
            if call.index == 0 {
                pending::<()>().await;
            }
            respond(StatusCode::OK, "second")
        }
        .boxed()
    });
    let client = client(&dialer);

    let response = client
        .get(
            "http://example.test/",
            RequestOptions::new()
                .with_timeout(Duration::from_millis(100))
                .with_max_retries(1),
        )
        .await
        .unwrap();

    assert_eq!(response.content(), Some(&Bytes::from_static(b"second")));
    assert_eq!(state.calls(), 2);
    assert!(state
        .closes()
        .iter()
        .any(|close| matches!(close.cause, Error::Timeout(_))));
}

#[tokio::test(start_paused = true)]
async fn caller_cancellation_stops_retries() {
    let (dialer, state) = MockDialer::with_handler(|_| pending().boxed());
    let client = client(&dialer);
    let token = CancelToken::new();

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel(Error::Canceled);
    });

    let error = client
        .get(
            "http://example.test/",
            RequestOptions::new()
                .with_cancel_token(&token)
                .with_max_retries(5),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Canceled), "{error:?}");
    assert_eq!(state.calls(), 1);
}

#[tokio::test]
async fn result_callback_rejects() {
    let (dialer, state) =
        MockDialer::with_handler(|_| async { respond(StatusCode::FORBIDDEN, "no") }.boxed());
    let client = client(&dialer);

    let error = client
        .get(
            "http://example.test/",
            RequestOptions::new().with_on_result(|response| {
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(format!("status {}", response.status()).into())
                }
            }),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Callback(_)), "{error:?}");
    assert_eq!(state.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn connection_limit_serializes() {
    let (dialer, state) = MockDialer::with_handler(|_| {
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            respond(StatusCode::OK, "")
        }
        .boxed()
    });
    let client = Builder::new()
        .with_dialer(dialer.clone())
        .with_max_connections_per_pool(Some(1))
        .build();

    let (a, b, c) = tokio::join!(
        client.get("http://example.test/a", RequestOptions::new()),
        client.get("http://example.test/b", RequestOptions::new()),
        client.get("http://example.test/c", RequestOptions::new()),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(dialer.dials(), 1);
    assert_eq!(state.max_in_flight(), 1);
}

#[tokio::test]
async fn streaming_body_holds_connection() {
    let (dialer, _state) =
        MockDialer::with_handler(|_| async { respond(StatusCode::OK, "streamed") }.boxed());
    let client = client(&dialer);

    let first = client
        .get("http://example.test/", RequestOptions::new().with_stream())
        .await
        .unwrap();
    let second = client
        .get("http://example.test/", RequestOptions::new().with_stream())
        .await
        .unwrap();
    assert_eq!(dialer.dials(), 2);

    assert_eq!(first.text().await.unwrap(), "streamed");
    assert_eq!(second.text().await.unwrap(), "streamed");
}

#[tokio::test]
async fn closed_client_fails_requests() {
    let (dialer, _state) = MockDialer::with_handler(|_| async { respond(StatusCode::OK, "") }.boxed());
    let client = client(&dialer);

    client.get("http://example.test/", RequestOptions::new()).await.unwrap();
    assert_eq!(client.pools().len(), 1);

    client.close();
    assert!(client.pools().is_empty());

    let error = client
        .get("http://example.test/", RequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::ClientClosed));
}

#[tokio::test]
async fn tower_service() {
    let (dialer, state) = MockDialer::with_handler(|call| {
        async move {
            let value = call.request.headers()["x-test"].clone();
            let mut exchange = respond(StatusCode::OK, "")?;
            if let Some(response) = exchange.response.as_mut() {
                response.headers_mut().insert("x-test", value);
            }
            Ok(exchange)
        }
        .boxed()
    });
    let client = client(&dialer);

    let request = http::Request::get("http://example.test/")
        .header("x-test", "1")
        .body(Body::empty())
        .unwrap();
    let response = client.oneshot(request).await.unwrap();

    assert_eq!(response.headers()["x-test"], "1");
    assert_eq!(state.calls(), 1);
}
