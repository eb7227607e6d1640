//! HTTP error mapping for handler results.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use gateway_core::GatewayError;

#[derive(Debug)]
pub enum AppError {
    Gateway(GatewayError),
    NotFound(String),
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        Self::Gateway(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, format!("not found: {what}")),
            AppError::Gateway(err) => {
                let status = match &err {
                    GatewayError::ModelNotFound(_) | GatewayError::BadRequest(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    GatewayError::UpstreamUnavailable(_)
                    | GatewayError::ModelTemplateMissing(_)
                    | GatewayError::TemplateMalformed(_)
                    | GatewayError::UpstreamStream(_)
                    | GatewayError::StoreCommit(_)
                    | GatewayError::Consolidation(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                error!("request failed: {err}");
                (status, err.to_string())
            }
        };
        (status, body).into_response()
    }
}
