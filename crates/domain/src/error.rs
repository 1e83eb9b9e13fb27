//! Cross-crate error taxonomy.
//!
//! Each failure class maps to the HTTP status the worker synthesizes on the
//! job response, so the mapping lives next to the variants instead of being
//! re-derived at every call site.

use thiserror::Error;

/// Convenience alias used across the workspace.
pub type CourierResult<T> = Result<T, CourierError>;

/// Failure classes surfaced by the worker.
#[derive(Debug, Error)]
pub enum CourierError {
    /// Job payload failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Provider registry initialization failed; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A job with the same correlation id is already in flight.
    #[error("duplicate request: {0}")]
    DuplicateRequest(String),

    /// Outbound request exceeded its deadline.
    #[error("transport timeout: {0}")]
    TransportTimeout(String),

    /// Outbound request failed below HTTP (DNS, TLS, connect, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The expression sandbox raised while templating or intercepting.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// The provider's grant configuration cannot be executed.
    #[error("unsupported grant: {0}")]
    UnsupportedGrant(String),

    /// A refresh/restart cycle could not produce usable tokens.
    #[error("token renewal failed: {0}")]
    TokenRenewal(String),

    /// Serialization or deserialization of a wire shape failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invariant violation; a bug, not an operational condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// HTTP status code synthesized on the job response for this failure.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::DuplicateRequest(_) => 409,
            Self::TransportTimeout(_) => 504,
            Self::Config(_)
            | Self::Transport(_)
            | Self::Evaluation(_)
            | Self::UnsupportedGrant(_)
            | Self::TokenRenewal(_)
            | Self::Serialization(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Whether retrying the same job could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportTimeout(_) | Self::Transport(_))
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
