//! HTTP-level middleware (cross-cutting concerns).
//!
//! Applied to every route, including the forward-auth fallback.
//!
//! Responsibility:
//! - Request-Id generation + propagation (X-Request-Id)
//! - Access logging / request tracing (TraceLayer)
//! - Request latency histogram
//! - Body size limits
//! - Global timeouts
//!
//! Notes:
//! - The proxy forwards the original request, but only headers matter here, so
//!   the body limit is small.

use std::time::{Duration, Instant};

use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::extract::Request;
use axum::http::{StatusCode, header::HeaderName};
use axum::middleware::{self, Next};
use axum::response::Response;
use tower::timeout::TimeoutLayer;
use tower::{BoxError, ServiceBuilder};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub const REQUEST_DURATION_METRIC: &str = "jwt_forward_auth_http_server_request_duration_seconds";

/// Apply HTTP-level middleware to the given Router.
///
/// Defaults:
/// - Request-Id header: `x-request-id`
/// - Body limit: 64 KiB
/// - Timeout: 30 seconds (must stay above the key-set fetch timeout)
pub fn apply<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let request_id_header = HeaderName::from_static("x-request-id");

    let layers = ServiceBuilder::new()
        // Make the service error `Infallible` by converting errors into responses.
        .layer(HandleErrorLayer::new(|err: BoxError| async move {
            if err.is::<tower::timeout::error::Elapsed>() {
                StatusCode::REQUEST_TIMEOUT
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }))
        // Generate a request id if missing, then propagate it to the response.
        .layer(SetRequestIdLayer::new(
            request_id_header.clone(),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header))
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        // Access log / tracing for all requests.
        .layer(TraceLayer::new_for_http());

    // Outermost, so it sees the plain request body and times the whole stack.
    router
        .layer(layers)
        .layer(middleware::from_fn(record_latency))
}

async fn record_latency(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let started = Instant::now();

    let res = next.run(req).await;

    metrics::histogram!(
        REQUEST_DURATION_METRIC,
        "method" => method.to_string(),
        "status" => res.status().as_u16().to_string(),
    )
    .record(started.elapsed().as_secs_f64());

    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::Request,
        routing::{get, post},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn request_id_is_generated_and_propagated() {
        let app = apply(Router::new().route("/", get(|| async { "ok" })));

        let res = app
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key("x-request-id"));

        let res = app
            .oneshot(
                Request::get("/")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.headers()["x-request-id"], "abc-123");
    }

    #[tokio::test]
    async fn bodies_pass_through_the_stack_up_to_the_limit() {
        let app = apply(Router::new().route("/", post(|body: String| async move { body })));

        let res = app
            .clone()
            .oneshot(Request::post("/").body(Body::from("hello")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello");

        let res = app
            .oneshot(
                Request::post("/")
                    .body(Body::from(vec![b'a'; 65 * 1024]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
