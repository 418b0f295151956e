use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    Router, error_handling::HandleErrorLayer, extract::Request, http::StatusCode,
    response::IntoResponse, routing::get,
};
use tokio::time::sleep;
use tower::BoxError;
use tower::ServiceBuilder;
use tower_serve::{
    ProtectLayer, RecoverLayer, RuntimeLayer, ServeError, ThrottleLayer, request_scope,
};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 1. Lifecycle layers
    let protect = ProtectLayer::new(10.try_into()?, Duration::from_secs(1));
    let runtime = RuntimeLayer::new(Duration::from_millis(100), Duration::from_secs(2))?;
    let throttle = ThrottleLayer::new(4.try_into()?);

    // 2. Build the Router
    let app = Router::new()
        .route("/", get(|| async { "Hello, Serve!" }))
        .route("/slow", get(slow))
        .layer(
            ServiceBuilder::new()
                // 1. The outermost layer: catches BoxError and returns Response
                .layer(HandleErrorLayer::new(handle_serve_error))
                // 2. Panics anywhere below become 500s
                .layer(RecoverLayer::new(|err| eprintln!("recovered: {err}")))
                .layer(protect)
                .layer(runtime)
                .layer(throttle)
                // 3. Converts the Route's Infallible to BoxError for the layers above.
                .map_err(BoxError::from),
        );

    // 3. Serve, exposing the peer address to ProtectLayer
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    println!("📡 Listening on http://127.0.0.1:3000");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Works for a second unless the request's scope stops first.
async fn slow(req: Request) -> impl IntoResponse {
    let scope = request_scope(&req);
    tokio::select! {
        _ = sleep(Duration::from_secs(1)) => (StatusCode::OK, "done"),
        _ = scope.cancelled() => (StatusCode::REQUEST_TIMEOUT, "gave up"),
    }
}

/// The signature must match BoxError -> IntoResponse
async fn handle_serve_error(err: BoxError) -> impl IntoResponse {
    ServeError::from_box(err).into_response()
}
