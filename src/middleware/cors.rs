//! CORS policy for browser clients that call the service directly.
//!
//! Note:
//! - In the usual deployment the proxy answers preflights itself; this layer
//!   matters only when the service is reachable from a browser.
//!
//! Policy:
//! - Empty allowlist: permissive (Allow-Origin: *), WITHOUT credentials.
//! - Otherwise: allowlist origins from Config (exact match), WITHOUT credentials.

use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method, header};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::Config;

/// Apply CORS policy to the given Router.
///
/// IMPORTANT:
/// - Do not combine wildcard origin (`Any`) with `allow_credentials(true)`.
pub fn apply<S>(router: Router<S>, config: &Config) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(layer(&config.cors_allowed_origins, config.auth_header.clone()))
}

fn layer(allowed_origins: &[String], auth_header: HeaderName) -> CorsLayer {
    let cors = if allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        let allowed: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|s| HeaderValue::from_str(s).ok())
            .collect();

        let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _req| {
            allowed.iter().any(|v| v == origin)
        });

        CorsLayer::new().allow_origin(allow_origin)
    };

    let mut allow_headers = vec![
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        HeaderName::from_static("x-request-id"),
    ];
    if !allow_headers.contains(&auth_header) {
        allow_headers.push(auth_header);
    }

    cors.allow_methods([
        Method::GET,
        Method::HEAD,
        Method::POST,
        Method::PUT,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ])
    .allow_headers(allow_headers)
    .max_age(std::time::Duration::from_secs(60 * 10))
}
