//! HTTP surface for the approval workflow.
//!
//! Authentication happens upstream. The caller's identity arrives in the
//! `x-user-id` header and is trusted as-is.

pub mod approval;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::error::{ErrorCode, ServerError};
use crate::workflow::WorkflowError;

pub use approval::router;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The user acting on a request, taken from [`USER_ID_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub String);

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Self(value.to_owned()))
            .ok_or_else(|| {
                ServerError::from_status(
                    StatusCode::BAD_REQUEST,
                    format!("{USER_ID_HEADER} header is required"),
                )
            })
    }
}

impl IntoResponse for WorkflowError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound(message) => ServerError::new(ErrorCode::NotFound, message),
            Self::BadRequest(message) => ServerError::new(ErrorCode::ValidationFailed, message),
            Self::Forbidden(message) => ServerError::new(ErrorCode::Forbidden, message),
            Self::Conflict(message) => ServerError::new(ErrorCode::Conflict, message),
            Self::Store(error) => {
                error!(?error, "approval api internal error");
                ServerError::from_code(ErrorCode::InternalError)
            }
        }
        .into_response()
    }
}
