/*
 * Responsibility
 * - Router に紐づける共有コンテキスト (AppState)
 *   - ex: decoder (cache 付き verifier), header 設定, metrics handle など
 * - Clone 前提で持つ (内部は Arc/Clone cheap)
 */
use std::sync::Arc;

use axum::http::HeaderName;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::services::auth::TokenDecoder;

/// Header names and policy the decision handler reads on every request.
#[derive(Debug, Clone)]
pub struct DecisionSettings {
    pub auth_header: HeaderName,
    pub validated_header: HeaderName,
    pub auth_header_required: bool,
}

impl DecisionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            auth_header: config.auth_header.clone(),
            validated_header: config.validated_header.clone(),
            auth_header_required: config.auth_header_required,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub decoder: Arc<dyn TokenDecoder>,
    pub decision: Arc<DecisionSettings>,
    pub metrics: Option<PrometheusHandle>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("decision", &self.decision)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(decoder: Arc<dyn TokenDecoder>, decision: DecisionSettings) -> Self {
        Self {
            decoder,
            decision: Arc::new(decision),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
