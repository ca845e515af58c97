use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Failures surfaced at the webhook boundary.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid webhook signature")]
    SignatureInvalid,

    /// Answered 200 `ignored` so the provider does not keep redelivering.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Another delivery holds the conversation. The claim was released, so
    /// a redelivery is processed normally.
    #[error("conversation busy: {0}")]
    Busy(String),

    /// Detail is logged, never returned to the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON body of every webhook answer.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}

impl WebhookResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success",
            message: message.into(),
            conversation_status: None,
            pr_number: None,
        }
    }

    pub fn ignored(message: impl Into<String>) -> Self {
        Self {
            status: "ignored",
            ..Self::success(message)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            ..Self::success(message)
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (code, body) = match self {
            GatewayError::SignatureInvalid => (
                StatusCode::UNAUTHORIZED,
                WebhookResponse::error("Invalid signature"),
            ),
            GatewayError::MalformedEvent(reason) => {
                (StatusCode::OK, WebhookResponse::ignored(reason))
            }
            GatewayError::Busy(_) => (
                StatusCode::CONFLICT,
                WebhookResponse::error("Conversation is busy, retry later"),
            ),
            GatewayError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                WebhookResponse::error("Internal server error"),
            ),
        };
        (code, Json(body)).into_response()
    }
}
