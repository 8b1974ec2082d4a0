/*
 * Responsibility
 * - HTTP 向けの AppError 定義
 * - IntoResponse 実装 (status のみ, body は書かない)
 * - forward-auth の呼び出し側 (proxy) には 200/401 以外の詳細を見せない
 */
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::services::auth::DecodeError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.status().into_response()
    }
}

impl From<DecodeError> for AppError {
    fn from(e: DecodeError) -> Self {
        AppError::Unauthorized(e.kind())
    }
}
