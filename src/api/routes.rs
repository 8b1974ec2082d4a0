/*
 * Responsibility
 * - URL 構造を定義
 * - /ping は全メソッドで 200 (proxy の health check は GET 以外も来る)
 * - /ping, /metrics 以外のすべてのパス・メソッドを forward-auth の判定に回す
 *   (proxy は元リクエストのパスのまま転送してくるため fallback で受ける)
 */
use axum::{
    Router,
    routing::{any, get},
};

use crate::state::AppState;

use crate::api::handlers::{decision::decide, health::ping, metrics::render};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ping", any(ping))
        .route("/metrics", get(render))
        .fallback(decide)
}
