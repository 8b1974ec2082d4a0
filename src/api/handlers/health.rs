/*
 * Responsibility
 * - /ping (疎通用, 全メソッド, 鍵や cache の状態は見ない)
 */
use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;

pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}
