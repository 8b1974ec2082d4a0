//! Shared fixtures: Ed25519 signing keys, a mock JWKS endpoint and router setup.
#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use jwt_forward_auth::app::{build_router, build_state};
use jwt_forward_auth::config::Config;

pub const JWKS_PATH: &str = "/.well-known/jwks.json";

pub struct TestKey {
    pub kid: String,
    signing: SigningKey,
}

impl TestKey {
    /// Deterministic key: the seed byte is repeated 32 times.
    pub fn new(kid: &str, seed: u8) -> Self {
        Self {
            kid: kid.to_string(),
            signing: SigningKey::from_bytes(&[seed; 32]),
        }
    }

    pub fn jwk(&self) -> Value {
        json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "use": "sig",
            "alg": "EdDSA",
            "kid": self.kid,
            "x": URL_SAFE_NO_PAD.encode(self.signing.verifying_key().to_bytes()),
        })
    }

    pub fn sign(&self, claims: &Value) -> String {
        self.sign_as(&self.kid, claims)
    }

    /// Sign with this key but advertise another `kid` in the header.
    pub fn sign_as(&self, kid: &str, claims: &Value) -> String {
        let der = self.signing.to_pkcs8_der().expect("encode pkcs8");
        let key = EncodingKey::from_ed_der(der.as_bytes());

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(kid.to_string());

        jsonwebtoken::encode(&header, claims, &key).expect("sign test token")
    }
}

pub fn jwks(keys: &[&TestKey]) -> Value {
    json!({ "keys": keys.iter().map(|k| k.jwk()).collect::<Vec<_>>() })
}

/// Serve `keys` as the JWKS document for every request.
pub async fn jwks_server(keys: &[&TestKey]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks(keys)))
        .mount(&server)
        .await;
    server
}

pub fn jwks_url(server: &MockServer) -> String {
    format!("{}{}", server.uri(), JWKS_PATH)
}

pub async fn jwks_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map(|reqs| reqs.len())
        .unwrap_or_default()
}

pub fn config(server: &MockServer, vars: &[(&str, &str)]) -> Config {
    let url = jwks_url(server);
    let vars: Vec<(String, String)> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Config::from_lookup(move |key| {
        if key == "JWKS_URL" {
            return Some(url.clone());
        }
        vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    })
    .expect("valid test config")
}

pub async fn app(config: &Config) -> Router {
    let state = build_state(config).await.expect("build state");
    build_router(state, config)
}

pub fn exp_in(seconds: i64) -> i64 {
    Utc::now().timestamp() + seconds
}

pub fn request(auth: Option<&str>) -> Request<Body> {
    request_with(Method::GET, "authorization", auth)
}

pub fn request_with(method: Method, header: &str, value: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri("/api/orders/42");
    if let Some(value) = value {
        builder = builder.header(header, value);
    }
    builder.body(Body::empty()).expect("request")
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}
