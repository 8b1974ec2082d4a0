/*
 * Responsibility
 * - forward-auth の判定 (proxy から来たリクエストの header を検証)
 * - OPTIONS -> 200 / header なし -> 401 or 200(marker=false)
 * - 検証成功 -> claim header + marker=true / 失敗 -> 401 (body なし)
 */
use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};

use crate::error::AppError;
use crate::services::auth::decoder::{DecodeError, VerifiedToken, fingerprint};
use crate::state::AppState;

const BEARER_PREFIX: &str = "Bearer ";

pub async fn decide(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if method == Method::OPTIONS {
        record_decision("preflight");
        return Ok(StatusCode::OK.into_response());
    }

    let settings = &state.decision;

    let Some(value) = headers.get(&settings.auth_header) else {
        if settings.auth_header_required {
            tracing::debug!(header = %settings.auth_header, "auth header missing, rejecting");
            record_decision("rejected");
            return Err(AppError::Unauthorized("missing_header"));
        }
        record_decision("passthrough");
        return Ok(marked(StatusCode::OK, &settings.validated_header, false));
    };

    let Ok(value) = value.to_str() else {
        let e = DecodeError::Malformed("auth header is not visible ASCII".to_string());
        tracing::warn!(kind = e.kind(), error = %e, "token rejected");
        return Err(reject(e));
    };

    // Exact, case-sensitive prefix. Anything else is handed over as-is.
    let raw = value.strip_prefix(BEARER_PREFIX).unwrap_or(value);

    match state.decoder.decode(raw).await {
        Ok(token) => {
            let res = accepted(&token, &settings.validated_header)?;
            tracing::debug!(
                token = %fingerprint(raw),
                claims = token.claims.len(),
                "token accepted"
            );
            record_decision("accepted");
            Ok(res)
        }
        Err(e) => {
            tracing::warn!(token = %fingerprint(raw), kind = e.kind(), error = %e, "token rejected");
            Err(reject(e))
        }
    }
}

fn accepted(token: &VerifiedToken, validated_header: &HeaderName) -> Result<Response, AppError> {
    let mut res = marked(StatusCode::OK, validated_header, true);

    for (name, value) in &token.claims {
        // Both sides were checked when the mapping was applied.
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            return Err(reject(DecodeError::ClaimType {
                claim: name.clone(),
                reason: "not representable as a header".to_string(),
            }));
        };
        res.headers_mut().insert(name, value);
    }

    Ok(res)
}

fn marked(status: StatusCode, validated_header: &HeaderName, validated: bool) -> Response {
    let marker = HeaderValue::from_static(if validated { "true" } else { "false" });
    (status, [(validated_header.clone(), marker)]).into_response()
}

fn reject(e: DecodeError) -> AppError {
    metrics::counter!("jwt_forward_auth_verification_failures_total", "kind" => e.kind())
        .increment(1);
    record_decision("rejected");
    AppError::from(e)
}

fn record_decision(result: &'static str) {
    metrics::counter!("jwt_forward_auth_decisions_total", "result" => result).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::auth::decoder::{DecodeResult, TokenDecoder};
    use crate::state::{AppState, DecisionSettings};
    use async_trait::async_trait;
    use axum::{Router, body::Body, http::Request};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    /// Records every raw token it sees and answers with a fixed outcome.
    struct RecordingDecoder {
        seen: Mutex<Vec<String>>,
        outcome: DecodeResult,
    }

    #[async_trait]
    impl TokenDecoder for RecordingDecoder {
        async fn decode(&self, raw: &str) -> DecodeResult {
            self.seen.lock().unwrap().push(raw.to_string());
            self.outcome.clone()
        }
    }

    fn settings(required: bool) -> DecisionSettings {
        DecisionSettings {
            auth_header: HeaderName::from_static("authorization"),
            validated_header: HeaderName::from_static("jwt-token-validated"),
            auth_header_required: required,
        }
    }

    fn router(outcome: DecodeResult, required: bool) -> (Router, Arc<RecordingDecoder>) {
        let decoder = Arc::new(RecordingDecoder {
            seen: Mutex::new(Vec::new()),
            outcome,
        });
        let state = AppState::new(decoder.clone(), settings(required));
        (crate::api::routes().with_state(state), decoder)
    }

    fn accepted_token() -> DecodeResult {
        let mut claims = BTreeMap::new();
        claims.insert("claim-email".to_string(), "a@b.com".to_string());
        Ok(Arc::new(VerifiedToken::new(None, claims)))
    }

    fn request(method: Method, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri("/some/upstream/path");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn accepted_token_sets_claims_and_marker() {
        let (app, decoder) = router(accepted_token(), false);

        let res = app
            .oneshot(request(Method::GET, Some("Bearer abc.def.ghi")))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["claim-email"], "a@b.com");
        assert_eq!(res.headers()["jwt-token-validated"], "true");
        assert_eq!(*decoder.seen.lock().unwrap(), vec!["abc.def.ghi".to_string()]);
    }

    #[tokio::test]
    async fn rejected_token_is_401_without_claims() {
        let (app, _) = router(Err(DecodeError::SignatureInvalid("bad".into())), false);

        let res = app
            .oneshot(request(Method::POST, Some("Bearer abc.def.ghi")))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(res.headers().get("claim-email").is_none());
        assert!(res.headers().get("jwt-token-validated").is_none());
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn missing_header_passes_through_when_optional() {
        let (app, decoder) = router(accepted_token(), false);

        let res = app.oneshot(request(Method::GET, None)).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["jwt-token-validated"], "false");
        assert!(res.headers().get("claim-email").is_none());
        assert!(decoder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_header_is_rejected_when_required() {
        let (app, _) = router(accepted_token(), true);

        let res = app.oneshot(request(Method::GET, None)).await.unwrap();

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn preflight_skips_verification() {
        let (app, decoder) = router(Err(DecodeError::Interrupted), true);

        let res = app
            .oneshot(request(Method::OPTIONS, Some("Bearer abc")))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert!(decoder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bearer_prefix_is_case_sensitive() {
        let (app, decoder) = router(accepted_token(), false);

        app.oneshot(request(Method::GET, Some("bearer abc")))
            .await
            .unwrap();

        assert_eq!(*decoder.seen.lock().unwrap(), vec!["bearer abc".to_string()]);
    }

    #[tokio::test]
    async fn non_ascii_header_is_rejected_without_decoding() {
        let (app, decoder) = router(accepted_token(), false);
        let req = Request::builder()
            .uri("/")
            .header("authorization", HeaderValue::from_bytes(b"Bearer \xff").unwrap())
            .body(Body::empty())
            .unwrap();

        let res = app.oneshot(req).await.unwrap();

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(decoder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ping_answers_any_method() {
        let (app, decoder) = router(Err(DecodeError::Interrupted), true);

        for method in [Method::OPTIONS, Method::HEAD, Method::POST] {
            let req = Request::builder()
                .method(method.clone())
                .uri("/ping")
                .body(Body::empty())
                .unwrap();
            let res = app.clone().oneshot(req).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK, "{method}");
        }
        assert!(decoder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ping_is_not_a_decision() {
        let (app, decoder) = router(Err(DecodeError::Interrupted), true);

        let res = app
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert!(decoder.seen.lock().unwrap().is_empty());
    }
}
