//! Agent client error types.

use cairn_core::error::CairnError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid trust anchor: {0}")]
    TrustAnchor(String),
}

impl From<AgentError> for CairnError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Http(_) | AgentError::Status { .. } => {
                CairnError::upstream("agent", err)
            }
            AgentError::TrustAnchor(msg) => CairnError::Internal(msg),
        }
    }
}
