//! Typed domain error shared by every core crate.
//!
//! Each `EngineError` carries a discriminant `ErrorKind` so callers can
//! branch on category (retry? terminal? per-record?) without string
//! matching.

use std::fmt;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Terminal: requires human reauth. Never retried.
    OAuth,
    /// Retryable with 2x base backoff.
    RateLimit,
    /// Retryable with standard backoff.
    Network,
    /// Per-record, not retried.
    Validation,
    Fetch,
    Write,
    Transform,
    Config,
    Database,
    Unknown,
}

impl ErrorKind {
    /// §7: OAuth is terminal and never retried; everything else in the
    /// FETCH/WRITE/TRANSFORM/NETWORK/RATE_LIMIT family is retried per policy.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::OAuth | ErrorKind::Validation)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorKind::OAuth)
    }
}

#[derive(Debug, Clone, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("{message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub provider: Option<String>,
    pub record_key: Option<String>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            record_key: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_record_key(mut self, record_key: impl Into<String>) -> Self {
        self.record_key = Some(record_key.into());
        self
    }

    pub fn oauth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OAuth, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
