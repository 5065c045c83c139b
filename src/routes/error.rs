//! Error mapping for HTTP handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::booster::types::{StartRejection, WithdrawRejection};

/// Error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Rejected(#[from] StartRejection),

    #[error(transparent)]
    Withdraw(#[from] WithdrawRejection),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Rejected(rejection) => match rejection {
                StartRejection::UnknownOwner(_) => StatusCode::NOT_FOUND,
                StartRejection::UsageExpired => StatusCode::PAYMENT_REQUIRED,
                StartRejection::DuplicateActive { .. } | StartRejection::OwnerBusy { .. } => StatusCode::CONFLICT,
                StartRejection::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                StartRejection::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Withdraw(rejection) => match rejection {
                WithdrawRejection::UnknownOwner(_) => StatusCode::NOT_FOUND,
                WithdrawRejection::BoosterActive { .. } => StatusCode::CONFLICT,
                WithdrawRejection::NoAddress | WithdrawRejection::NothingToWithdraw { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                WithdrawRejection::Unconfirmed(_) => StatusCode::GATEWAY_TIMEOUT,
                WithdrawRejection::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(e) = &self {
            error!("Request failed: {:#}", e);
        }
        let status = self.status();
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;
