use lipa_engine::EngineError;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Stable public error codes. Every failure leaving the facade carries
/// exactly one of these; internal details never cross this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    Unauthenticated,
    Forbidden,
    NotFound,
    ConflictIdempotency,
    InsufficientFunds,
    RiskRejected,
    SystemPaused,
    RateUnavailable,
    DownstreamTimeout,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Validation => 400,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::ConflictIdempotency => 409,
            ErrorCode::InsufficientFunds | ErrorCode::RiskRejected => 422,
            ErrorCode::SystemPaused | ErrorCode::RateUnavailable => 503,
            ErrorCode::DownstreamTimeout => 504,
            ErrorCode::Internal => 500,
        }
    }

    /// Whether a client may retry the same request later. Timeout retries
    /// are safe because every mutating route is idempotency-keyed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::SystemPaused | ErrorCode::RateUnavailable | ErrorCode::DownstreamTimeout
        )
    }
}

/// The wire shape of an error: `{error, message, request_id, details?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: request_id.to_string(),
            details: None,
        }
    }

    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.code,
            message: self.message.clone(),
            request_id: self.request_id.clone(),
            details: self.details.clone(),
        }
    }

    /// Maps engine failures onto the public taxonomy. INTERNAL deliberately
    /// swallows the underlying message.
    #[must_use]
    pub fn from_engine(err: EngineError, request_id: &str) -> Self {
        let (code, message) = match &err {
            EngineError::Validation(message) => (ErrorCode::Validation, message.clone()),
            EngineError::NotFound(what) => (ErrorCode::NotFound, format!("{what} not found")),
            EngineError::IdempotencyConflict => (
                ErrorCode::ConflictIdempotency,
                "idempotency key was reused with a different request body".into(),
            ),
            EngineError::RequestInFlight => (
                ErrorCode::ConflictIdempotency,
                "an identical request is still being processed".into(),
            ),
            EngineError::Forbidden { actor } => (
                ErrorCode::Forbidden,
                format!("{actor} may not perform this operation"),
            ),
            EngineError::SystemPaused => (
                ErrorCode::SystemPaused,
                "the system is temporarily paused; retry later".into(),
            ),
            EngineError::RateUnavailable { base, target } => (
                ErrorCode::RateUnavailable,
                format!("no exchange rate available for {base}->{target}"),
            ),
            EngineError::DownstreamTimeout(what) => (
                ErrorCode::DownstreamTimeout,
                format!("{what} timed out; the request may be retried"),
            ),
            EngineError::Internal(_) => (
                ErrorCode::Internal,
                "an internal error occurred".into(),
            ),
        };
        Self::new(code, message, request_id)
    }

    /// Maps a transaction that failed on business grounds (stored on the
    /// row as a machine-readable reason prefix) onto the taxonomy.
    #[must_use]
    pub fn from_status_reason(reason: &str, request_id: &str) -> Self {
        let code = match reason.split(':').next().unwrap_or(reason).trim() {
            "INSUFFICIENT_FUNDS" => ErrorCode::InsufficientFunds,
            "RISK_REJECTED" => ErrorCode::RiskRejected,
            "WALLET_NOT_ACTIVE" => ErrorCode::Validation,
            _ => ErrorCode::Internal,
        };
        let message = match code {
            ErrorCode::InsufficientFunds => "available balance does not cover amount plus fee",
            ErrorCode::RiskRejected => "payment was rejected by risk controls",
            ErrorCode::Validation => "the sender wallet is not active",
            _ => "an internal error occurred",
        };
        Self::new(code, message, request_id)
    }
}
