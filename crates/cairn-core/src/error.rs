//! Error types for the Cairn system.
//!
//! Every error maps to exactly one [`ErrorKind`], and every kind renders
//! with a stable message prefix so collaborators can match on the kind
//! rather than on message text.

use thiserror::Error;

/// Coarse classification of a [`CairnError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidIdentifier,
    InvalidLocator,
    CapabilityViolation,
    InvalidTemplateSyntax,
    NotFound,
    Conflict,
    Forbidden,
    PoolExhausted,
    UpstreamFailure,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// The stable prefix every message of this kind starts with.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::InvalidIdentifier => "invalid identifier",
            Self::InvalidLocator => "invalid locator",
            Self::CapabilityViolation => "capability violation",
            Self::InvalidTemplateSyntax => "invalid template syntax",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Forbidden => "forbidden",
            Self::PoolExhausted => "pool exhausted",
            Self::UpstreamFailure => "upstream failure",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal error",
        }
    }
}

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("invalid identifier: {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("invalid locator: {value:?}: {reason}")]
    InvalidLocator { value: String, reason: String },

    #[error("capability violation: {reason}")]
    CapabilityViolation { reason: String },

    #[error("invalid template syntax: {template:?}: {reason}")]
    InvalidTemplateSyntax { template: String, reason: String },

    #[error("not found: {entity} {id}")]
    NotFound { entity: String, id: String },

    #[error("conflict: {entity} {id} was modified concurrently")]
    Conflict { entity: String, id: String },

    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("pool exhausted: all {capacity} connection slots hold unexpired clients")]
    PoolExhausted { capacity: usize },

    #[error("upstream failure: {service}: {message}")]
    Upstream { service: String, message: String },

    #[error("cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CairnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidIdentifier { .. } => ErrorKind::InvalidIdentifier,
            Self::InvalidLocator { .. } => ErrorKind::InvalidLocator,
            Self::CapabilityViolation { .. } => ErrorKind::CapabilityViolation,
            Self::InvalidTemplateSyntax { .. } => ErrorKind::InvalidTemplateSyntax,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::Upstream { .. } => ErrorKind::UpstreamFailure,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the same operation after re-reading.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::UpstreamFailure)
    }

    pub fn capability(reason: impl Into<String>) -> Self {
        Self::CapabilityViolation {
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::Conflict {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn upstream(service: impl Into<String>, message: impl ToString) -> Self {
        Self::Upstream {
            service: service.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for CairnError {
    fn from(err: serde_json::Error) -> Self {
        CairnError::Internal(format!("document serialization: {err}"))
    }
}

pub type CairnResult<T> = Result<T, CairnError>;
