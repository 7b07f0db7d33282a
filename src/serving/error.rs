//! Request failures and how they are reported to clients

use super::ErrorPolicy;
use crate::models::InferenceError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Closed set of request failures. The variant decides the status code and
/// the client-facing message; the payload is logged server side only.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request body is empty")]
    MissingPayload,
    #[error("field {0:?} is missing")]
    MissingField(&'static str),
    #[error("malformed request: {0}")]
    MalformedType(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("no model loaded")]
    ModelUnavailable,
}

impl ApiError {
    /// Stable identifier of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::MissingPayload => "missing_payload",
            ApiError::MissingField(_) => "missing_field",
            ApiError::MalformedType(_) => "malformed_type",
            ApiError::Validation(_) => "validation_error",
            ApiError::Inference(_) => "inference_error",
            ApiError::ModelUnavailable => "model_unavailable",
        }
    }

    /// Fixed message returned to the client
    pub fn public_message(&self) -> String {
        match self {
            ApiError::MissingPayload => "Request body with JSON payload is required".to_string(),
            ApiError::MissingField(field) => format!("Field '{field}' is required"),
            ApiError::MalformedType(_) => "Payload has the wrong type or is not valid JSON".to_string(),
            ApiError::Validation(_) => "Feature vector does not match the model input".to_string(),
            ApiError::Inference(_) => "Prediction failed".to_string(),
            ApiError::ModelUnavailable => "Model is not loaded".to_string(),
        }
    }

    pub fn status(&self, policy: ErrorPolicy) -> StatusCode {
        match policy {
            ErrorPolicy::Generic => StatusCode::BAD_REQUEST,
            ErrorPolicy::Detailed => match self {
                ApiError::MissingPayload
                | ApiError::MissingField(_)
                | ApiError::MalformedType(_)
                | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
                ApiError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }

    /// Bind the failure to the policy it will be reported under
    pub fn under(self, policy: ErrorPolicy) -> Rejection {
        Rejection {
            error: self,
            policy,
        }
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::WidthMismatch { .. } => ApiError::Validation(err.to_string()),
            InferenceError::Model(_) => ApiError::Inference(err.to_string()),
        }
    }
}

/// An [`ApiError`] ready to be turned into a response
#[derive(Debug)]
pub struct Rejection {
    pub error: ApiError,
    pub policy: ErrorPolicy,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.error.status(self.policy);
        if status.is_server_error() {
            error!(kind = self.error.kind(), error = %self.error, "Request failed");
        } else {
            warn!(kind = self.error.kind(), error = %self.error, "Request rejected");
        }

        let body = match self.policy {
            ErrorPolicy::Detailed => json!({
                "error": self.error.public_message(),
                "kind": self.error.kind(),
            }),
            ErrorPolicy::Generic => json!({ "error": "Invalid request" }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detailed_status_mapping() {
        let policy = ErrorPolicy::Detailed;
        assert_eq!(ApiError::MissingPayload.status(policy), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::MissingField("features").status(policy), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::MalformedType("x".into()).status(policy),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Validation("x".into()).status(policy), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Inference("x".into()).status(policy),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::ModelUnavailable.status(policy),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_generic_policy_is_always_client_error() {
        for err in [
            ApiError::Inference("boom".into()),
            ApiError::ModelUnavailable,
            ApiError::MissingPayload,
        ] {
            assert_eq!(err.status(ErrorPolicy::Generic), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn test_public_message_hides_details() {
        let err = ApiError::Inference("tree 3 index out of range".into());
        assert!(!err.public_message().contains("tree 3"));
    }

    #[test]
    fn test_width_mismatch_is_validation() {
        let err = ApiError::from(InferenceError::WidthMismatch {
            expected: 29,
            found: 3,
        });
        assert_eq!(err.kind(), "validation_error");
    }
}
