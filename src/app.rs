/*
 * Responsibility
 * - Config読み込み → tracing / panic hook / metrics recorder 初期化
 * - 依存生成 (JWKS → verifier → cache) → Router 組み立て
 * - Middleware の適用 (HTTP / CORS)
 * - axum::serve() で起動 (graceful shutdown)
 */
use std::{panic, process, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::api;
use crate::config::{Config, LogFormat};
use crate::middleware;
use crate::services::auth::{HttpKeySource, JwsVerifier, KeyResolver, TokenDecoder};
use crate::services::cache::CachedDecoder;
use crate::state::{AppState, DecisionSettings};

const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

fn init_tracing(config: &Config) {
    // Prefer RUST_LOG if set; otherwise use LOG_LEVEL.
    // Ex:
    // RUST_LOG=info,jwt_forward_auth=debug,tower_http=debug cargo run
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn init_panic_hook(abort_on_panic: bool) {
    // Keep the default hook as a fallback (prints to stderr with location/payload).
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        // Always surface panics via tracing so they don't get "lost"
        // (stderr can be hidden depending on how the process is launched.)
        tracing::error!(?info, "panic");

        // In development, fail fast: crash the whole process so we notice immediately.
        // In production, prefer the default behavior (stderr) and let the server keep running.
        if abort_on_panic {
            process::abort();
        } else {
            default_hook(info);
        }
    }))
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(middleware::http::REQUEST_DURATION_METRIC.to_string()),
            LATENCY_BUCKETS,
        )
        .context("configuring latency buckets")?
        .install_recorder()
        .context("installing metrics recorder")
}

pub async fn run() -> Result<()> {
    let config = Config::from_env().context("loading configuration")?;

    init_tracing(&config);
    init_panic_hook(!config.app_env.is_production());

    tracing::info!(
        "starting forward-auth in {:?} mode on {}",
        config.app_env,
        config.addr
    );
    log_claim_mapping(&config);

    let metrics = install_metrics_recorder()?;
    let state = build_state(&config).await?.with_metrics(metrics);
    let app = build_router(state, &config);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    tracing::info!("shut down");
    Ok(())
}

/// Build the decoder chain and the shared state.
///
/// With `force_jwks_on_start` the first key-set fetch must succeed; otherwise
/// a failure is logged and the key set is loaded lazily on the first request.
pub async fn build_state(config: &Config) -> Result<AppState> {
    let source = HttpKeySource::new(config.jwks_url.clone(), config.jwks_fetch_timeout)
        .context("building JWKS client")?;
    let keys = Arc::new(KeyResolver::new(
        Arc::new(source),
        config.jwks_min_refresh_interval,
    ));

    match keys.refresh().await {
        Ok(set) => tracing::info!(url = %config.jwks_url, keys = set.len(), "key set loaded"),
        Err(e) if config.force_jwks_on_start => {
            return Err(e).with_context(|| format!("fetching key set from {}", config.jwks_url));
        }
        Err(e) => tracing::warn!(
            url = %config.jwks_url,
            error = %e,
            "key set unavailable at startup, will retry on first use"
        ),
    }

    let verifier: Arc<dyn TokenDecoder> = Arc::new(JwsVerifier::new(
        keys,
        Arc::new(config.claim_mapping.clone()),
    ));

    let decoder: Arc<dyn TokenDecoder> = if config.cache.enabled {
        Arc::new(
            CachedDecoder::new(verifier, config.cache.max_keys, config.cache.policy)
                .context("building result cache")?,
        )
    } else {
        tracing::info!("result cache disabled");
        verifier
    };

    Ok(AppState::new(decoder, DecisionSettings::from_config(config)))
}

pub fn build_router(state: AppState, config: &Config) -> Router {
    let router = api::routes().with_state(state);
    let router = middleware::cors::apply(router, config);
    middleware::http::apply(router)
}

fn log_claim_mapping(config: &Config) {
    if config.claim_mapping.is_empty() {
        tracing::warn!("no claim mappings configured, only the validation marker will be set");
        return;
    }
    for (claim, header) in config.claim_mapping.entries() {
        tracing::info!(claim, header, "mapping claim to header");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
