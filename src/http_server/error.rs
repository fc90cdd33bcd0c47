use crate::coordination::StoreError;
use crate::normalize::NormalizationError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Every rejection the HTTP surface can produce.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("request body could not be read: {0}")]
    UnreadableBody(String),

    #[error("missing or invalid signature")]
    InvalidSignature,

    #[error("unknown payload format hint: {0:?}")]
    UnknownFormat(String),

    #[error(transparent)]
    Malformed(#[from] NormalizationError),

    #[error("work queue is at capacity; retry later")]
    OverCapacity,

    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("missing or invalid admin token")]
    Unauthorized,

    #[error("not found")]
    NotFound,
}

impl IngressError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngressError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            IngressError::UnreadableBody(_)
            | IngressError::UnknownFormat(_)
            | IngressError::Malformed(_) => StatusCode::BAD_REQUEST,
            IngressError::InvalidSignature | IngressError::Unauthorized => StatusCode::UNAUTHORIZED,
            IngressError::OverCapacity | IngressError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            IngressError::NotFound => StatusCode::NOT_FOUND,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            IngressError::PayloadTooLarge(_) => "payload_too_large",
            IngressError::UnreadableBody(_) => "unreadable_body",
            IngressError::InvalidSignature => "invalid_signature",
            IngressError::UnknownFormat(_) => "unknown_format",
            IngressError::Malformed(_) => "malformed_payload",
            IngressError::OverCapacity => "over_capacity",
            IngressError::StoreUnavailable(_) => "store_unavailable",
            IngressError::Unauthorized => "unauthorized",
            IngressError::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (
            status,
            Json(ErrorResponse {
                error: self.code(),
                message: self.to_string(),
            }),
        )
            .into_response();

        // Tell well-behaved senders to back off before redelivering.
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}
