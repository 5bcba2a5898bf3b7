use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::error;

use super::types::ErrorResponse;
use crate::embedding::EmbeddingError;
use crate::error::Error;

pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// API错误类型
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(Error::InvalidInput(message.into()).into())
    }

    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<Error>() {
            Some(err) => status_of(err),
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// 根据错误类型选择 HTTP 状态码
pub fn status_of(err: &Error) -> StatusCode {
    match err {
        err if err.is_not_found() => StatusCode::NOT_FOUND,
        Error::InvalidInput(_)
        | Error::DimensionMismatch { .. }
        | Error::Embedding(EmbeddingError::Rejected(_)) => StatusCode::BAD_REQUEST,
        err if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.0.downcast_ref::<Error>().map(Error::kind).unwrap_or("internal");
        if status.is_server_error() {
            error!("请求处理失败: {:#}", self.0);
        }
        let body = ErrorResponse { kind: kind.to_string(), error: format!("{:#}", self.0) };
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
