use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error as ThisError;

use super::IsRetryable;

/// Upstream overload marker ("heavy load"). The upstream exposes no
/// structured code for this condition; the predicate is centralised here so
/// retry policy degrades to "never" if the wording ever changes.
pub(crate) const OVERLOAD_MARKER: &str = "heavy load";

#[derive(Debug, ThisError)]
pub enum SorapoolError {
    #[error("{0}")]
    NotFound(String),

    /// Validation or business-rule violation (bad duration, dispatch
    /// rejection, invalid share URL, ...).
    #[error("{0}")]
    Service(String),

    #[error("Broker unreachable: {0}")]
    Connection(String),

    /// Broker returned a non-zero code.
    #[error("Broker error {code}: {message}")]
    Api { code: i64, message: String },

    /// Upstream served a Cloudflare challenge; caller should fall back to
    /// the in-browser fetch path.
    #[error("Cloudflare challenge: {0}")]
    CfChallenge(String),

    /// Upstream rejected the stored credentials (401/403, token_expired).
    #[error("Upstream auth failure: {0}")]
    TokenAuth(String),

    /// Upstream heavy-load rejection; auto-retry on another profile is
    /// permitted during the submit phase only.
    #[error("{0}")]
    Overload(String),

    #[error("任务已取消")]
    Canceled,

    #[error("HTTP request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Debug channel error: {0}")]
    DebugChannel(String),

    #[error("Ractor error: {0}")]
    RactorError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Unexpected error: {0}")]
    Internal(String),
}

impl SorapoolError {
    /// Heavy-load classification over an arbitrary error text.
    pub fn text_is_overload(text: &str) -> bool {
        text.to_lowercase().contains(OVERLOAD_MARKER)
    }

    pub fn is_overload(&self) -> bool {
        match self {
            SorapoolError::Overload(_) => true,
            other => Self::text_is_overload(&other.to_string()),
        }
    }

    /// Error-family tag surfaced in API bodies and event messages.
    pub fn kind(&self) -> &'static str {
        match self {
            SorapoolError::NotFound(_) => "not_found",
            SorapoolError::Service(_) => "service_error",
            SorapoolError::Connection(_) | SorapoolError::ReqwestError(_) => "connection_error",
            SorapoolError::Api { .. } => "api_error",
            SorapoolError::CfChallenge(_) => "cf_challenge",
            SorapoolError::TokenAuth(_) => "token_auth_failure",
            SorapoolError::Overload(_) => "overload",
            SorapoolError::Canceled => "cancellation",
            SorapoolError::JsonError(_)
            | SorapoolError::UrlError(_)
            | SorapoolError::DebugChannel(_)
            | SorapoolError::RactorError(_)
            | SorapoolError::DatabaseError(_)
            | SorapoolError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for SorapoolError {
    fn into_response(self) -> axum::response::Response {
        let kind = self.kind();
        let (status, code, detail) = match &self {
            SorapoolError::NotFound(msg) => (StatusCode::NOT_FOUND, None, msg.clone()),

            SorapoolError::Service(msg) | SorapoolError::Overload(msg) => {
                (StatusCode::BAD_REQUEST, None, msg.clone())
            }

            SorapoolError::Canceled => (StatusCode::BAD_REQUEST, None, self.to_string()),

            SorapoolError::Connection(_)
            | SorapoolError::ReqwestError(_)
            | SorapoolError::CfChallenge(_)
            | SorapoolError::TokenAuth(_) => (StatusCode::BAD_GATEWAY, None, self.to_string()),

            SorapoolError::Api { code, .. } => {
                (StatusCode::BAD_GATEWAY, Some(*code), self.to_string())
            }

            SorapoolError::JsonError(_) | SorapoolError::UrlError(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, None, self.to_string())
            }

            SorapoolError::DebugChannel(_)
            | SorapoolError::RactorError(_)
            | SorapoolError::DatabaseError(_)
            | SorapoolError::Internal(_) => {
                // No internals leak to the client; details go to the log.
                tracing::error!("internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    None,
                    "An internal server error occurred.".to_string(),
                )
            }
        };

        let body = ApiErrorBody {
            detail: detail.clone(),
            error: ApiErrorObject {
                r#type: kind.to_string(),
                code,
                meta: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Standardized API error response payload: `{detail, error: {type, code?, meta?}}`.
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub detail: String,
    pub error: ApiErrorObject,
}

#[derive(Serialize)]
pub struct ApiErrorObject {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl IsRetryable for SorapoolError {
    fn is_retryable(&self) -> bool {
        match self {
            SorapoolError::ReqwestError(_)
            | SorapoolError::Connection(_)
            | SorapoolError::DebugChannel(_) => true,
            SorapoolError::Api { code, .. } => {
                // Idempotent broker codes are handled in place by the open
                // discipline; anything else is not worth blind retries.
                !matches!(*code, 111003 | 1009 | 2007 | 2012)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_detection_is_substring_based() {
        assert!(SorapoolError::text_is_overload(
            "We're under heavy load, please try again later."
        ));
        assert!(!SorapoolError::text_is_overload("rate limited"));

        let err = SorapoolError::Service("Heavy Load detected".to_string());
        assert!(err.is_overload());
    }

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(SorapoolError::NotFound(String::new()).kind(), "not_found");
        assert_eq!(
            SorapoolError::Api {
                code: 1009,
                message: String::new()
            }
            .kind(),
            "api_error"
        );
        assert_eq!(SorapoolError::Canceled.kind(), "cancellation");
    }
}
