use std::time::Duration;

use thiserror::Error;

/// Whether retrying a failed delivery can plausibly succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Permanent => "permanent",
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Destination rejected by egress policy: {0}")]
    EgressDenied(String),

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Destination responded with HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid rule configuration: {0}")]
    InvalidConfig(String),

    #[error("Payload signing failed: {0}")]
    Signing(String),

    #[error("No adapter registered for channel {0}")]
    NoAdapter(String),
}

impl DeliveryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeliveryError::HttpStatus { status, .. } => match *status {
                408 | 429 => FailureKind::Retryable,
                400..=499 => FailureKind::Permanent,
                _ => FailureKind::Retryable,
            },
            DeliveryError::EgressDenied(_)
            | DeliveryError::InvalidConfig(_)
            | DeliveryError::Signing(_)
            | DeliveryError::NoAdapter(_) => FailureKind::Permanent,
            DeliveryError::Timeout(_) | DeliveryError::Network(_) => FailureKind::Retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Retryable
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Network(format!("request timed out: {}", e))
        } else {
            DeliveryError::Network(e.to_string())
        }
    }
}
