use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use http::Request;
use http::StatusCode;
use http_body_util::BodyExt;
use http_body_util::Full;
use more_asserts::assert_ge;
use more_asserts::assert_le;
use tokio::time::Instant;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::service_fn;

use super::*;

/// Paused-clock timers fire on the first millisecond tick at or after their
/// deadline, never before it.
pub(crate) fn assert_fired_at(elapsed: Duration, deadline: Duration) {
    assert_ge!(elapsed, deadline);
    assert_le!(elapsed, deadline + Duration::from_millis(1));
}

fn concurrency(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

/// Answers 200 after `work`, or 408 as soon as its scope stops.
async fn patient(req: Request<()>, work: Duration) -> Result<StatusCode, BoxError> {
    let scope = request_scope(&req);
    tokio::select! {
        _ = scope.cancelled() => Ok(StatusCode::REQUEST_TIMEOUT),
        _ = sleep(work) => Ok(StatusCode::OK),
    }
}

/// Maps lifecycle outcomes to status codes the way an HTTP front end would.
fn status(result: Result<StatusCode, BoxError>) -> StatusCode {
    match result.map_err(ServeError::from_box) {
        Ok(code) => code,
        Err(ServeError::TooManyRequests | ServeError::RateLimited { .. }) => {
            StatusCode::TOO_MANY_REQUESTS
        }
        Err(ServeError::PayloadTooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
        Err(ServeError::Panicked(_) | ServeError::Inner(_)) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[tokio::test]
async fn runtime_bounded_throttle_rejects_the_waiting_request() {
    tokio::time::pause();

    let handler = compose([
        Link::Stage(Stage::layer(
            RuntimeLayer::new(Duration::ZERO, Duration::from_millis(5)).unwrap(),
        )),
        Link::Stage(Stage::layer(ThrottleLayer::new(concurrency(1)))),
        Link::handler(service_fn(|_req: Request<()>| async {
            sleep(Duration::from_millis(10)).await;
            Ok::<_, BoxError>(StatusCode::OK)
        })),
    ])
    .unwrap();

    let first = tokio::spawn(handler.clone().oneshot(Request::new(())));
    sleep(Duration::from_millis(1)).await;

    let second = handler.oneshot(Request::new(())).await;
    assert_eq!(status(second), StatusCode::TOO_MANY_REQUESTS);
    // The handler ignores its scope and completes.
    assert_eq!(status(first.await.unwrap()), StatusCode::OK);
}

#[tokio::test]
async fn handler_observes_caller_cancellation_after_min_runtime() {
    tokio::time::pause();

    let shutdown = Scope::new();
    let svc = ServiceBuilder::new()
        .layer(ScopeLayer::new(shutdown.clone()))
        .layer(RuntimeLayer::new(Duration::from_millis(100), Duration::from_secs(1)).unwrap())
        .service(service_fn(|req| patient(req, Duration::from_secs(10))));

    let start = Instant::now();
    let request = tokio::spawn(svc.clone().oneshot(Request::new(())));
    tokio::task::yield_now().await;
    shutdown.cancel();

    assert_eq!(status(request.await.unwrap()), StatusCode::REQUEST_TIMEOUT);
    assert_fired_at(start.elapsed(), Duration::from_millis(100));

    // Requests arriving after shutdown still get their minimum runtime.
    let start = Instant::now();
    let late = svc.oneshot(Request::new(())).await;
    assert_eq!(status(late), StatusCode::REQUEST_TIMEOUT);
    assert_fired_at(start.elapsed(), Duration::from_millis(100));
}

#[tokio::test]
async fn fast_handler_is_unaffected_by_lifecycle_layers() {
    tokio::time::pause();

    let svc = ServiceBuilder::new()
        .layer(TimeoutLayer::new(Duration::from_millis(50)))
        .layer(RuntimeLayer::new(Duration::from_millis(5), Duration::from_millis(20)).unwrap())
        .layer(ThrottleLayer::new(concurrency(2)))
        .service(service_fn(|req| patient(req, Duration::from_millis(10))));

    let start = Instant::now();
    assert_eq!(status(svc.oneshot(Request::new(())).await), StatusCode::OK);
    assert_fired_at(start.elapsed(), Duration::from_millis(10));
}

#[tokio::test]
async fn recovered_panic_releases_scope_and_token() {
    let reported = Arc::new(Mutex::new(Vec::new()));
    let seen_scope = Arc::new(Mutex::new(None));
    let throttle = ThrottleLayer::new(concurrency(1));

    let svc = ServiceBuilder::new()
        .layer(RecoverLayer::new({
            let reported = reported.clone();
            move |err: &ServeError| reported.lock().unwrap().push(err.to_string())
        }))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(throttle.clone())
        .service(service_fn({
            let seen_scope = seen_scope.clone();
            move |req: Request<&'static str>| {
                *seen_scope.lock().unwrap() = Some(request_scope(&req));
                async move {
                    if *req.body() == "POST" {
                        panic!("foo");
                    }
                    Ok::<_, BoxError>(StatusCode::OK)
                }
            }
        }));

    let crashed = svc.clone().oneshot(Request::new("POST")).await;
    assert_eq!(status(crashed), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        reported.lock().unwrap().as_slice(),
        ["Handler panicked: foo"]
    );
    assert_eq!(throttle.pool().available(), 1);
    let scope = seen_scope.lock().unwrap().take().unwrap();
    assert!(scope.is_cancelled(), "scope survived the panic");

    assert_eq!(
        status(svc.oneshot(Request::new("GET")).await),
        StatusCode::OK
    );
    assert_eq!(throttle.pool().available(), 1);
}

#[tokio::test]
async fn protect_allows_the_burst_then_rejects() {
    let svc = ProtectLayer::new(concurrency(10), Duration::from_secs(1))
        .with_key(|_, _| Some(String::from("client")))
        .layer(service_fn(|_req: Request<()>| async {
            Ok::<_, BoxError>(StatusCode::OK)
        }));

    let mut codes = Vec::new();
    for _ in 0..12 {
        codes.push(status(svc.clone().oneshot(Request::new(())).await));
    }
    assert_eq!(codes[..10], [StatusCode::OK; 10]);
    assert_eq!(codes[10..], [StatusCode::TOO_MANY_REQUESTS; 2]);
}

#[tokio::test]
async fn body_limit_maps_to_payload_too_large() {
    let read = service_fn(|req: Request<BodyLimiter>| async move {
        let body = req.into_body().collect().await?.to_bytes();
        Ok::<_, BoxError>((StatusCode::OK, body))
    });
    let svc = ServiceBuilder::new()
        .layer(LimitLayer::new(ByteSize::must("1K")))
        .service(read);

    let small = Request::new(Full::new(Bytes::from_static(b"Hello!")));
    let (code, body) = svc.clone().oneshot(small).await.unwrap();
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body, "Hello!");

    let large = Request::new(Full::new(Bytes::from(vec![b'x'; 1001])));
    let err = svc.oneshot(large).await.unwrap_err();
    assert!(matches!(
        ServeError::from_box(err),
        ServeError::PayloadTooLarge
    ));
}

#[tokio::test]
async fn throttle_forwards_inner_readiness() {
    let (mock, mut handle) = tower_test::mock::pair::<Request<()>, &'static str>();
    let mut svc = ThrottleLayer::new(concurrency(1)).layer(mock);

    handle.allow(0);
    assert!(futures::poll!(ServiceExt::<Request<()>>::ready(&mut svc)).is_pending());

    handle.allow(1);
    let ready = ServiceExt::<Request<()>>::ready(&mut svc).await.unwrap();
    let response = tokio::spawn(ready.call(Request::new(())));

    let (_req, send) = handle.next_request().await.unwrap();
    send.send_response("done");
    assert_eq!(response.await.unwrap().unwrap(), "done");
}
