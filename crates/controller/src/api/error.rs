//! Mapping of controller errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

use crate::error::{BuildServerError, CredentialError, Error, ValidationError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<String>,
    /// Classified job-name rejection, e.g. `uppercase-present`
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

/// Error returned by HTTP handlers.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        ApiError(error.into())
    }
}

#[must_use]
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::JobNotFound(_)
        | Error::Credential(CredentialError::NotFound(_))
        | Error::BuildServer(BuildServerError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::JobExists(_)
        | Error::InvalidState { .. }
        | Error::BuildInProgress { .. }
        | Error::BuildRejected { .. }
        | Error::CredentialInUse { .. }
        | Error::Credential(CredentialError::NameTaken(_)) => StatusCode::CONFLICT,
        Error::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Interrupted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::BuildServer(_)
        | Error::Orchestrator(_)
        | Error::Credential(_)
        | Error::Store(_)
        | Error::PartialFailure { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        let status = status_for(&error);
        if status.is_server_error() {
            error!("Request failed: {}", error);
        } else {
            warn!("Request rejected: {}", error);
        }

        let step = match &error {
            Error::PartialFailure { step, .. } => Some(step.to_string()),
            _ => None,
        };
        let reason = match &error {
            Error::Validation(ValidationError::Name { reason, .. }) => Some(reason.code()),
            _ => None,
        };
        let body = ErrorBody {
            error: error.code(),
            message: error.to_string(),
            system: error.system().map(|system| system.to_string()),
            kind: error.resource_kind().map(|kind| kind.as_str()),
            step,
            reason,
        };

        (status, Json(body)).into_response()
    }
}
