//! Error type of the agent run.

use cmk_azure::{AzureError, AzureErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Azure(#[from] AzureError),

    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Config(String),

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AgentError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Kind of the wrapped API error, if any.
    pub fn azure_kind(&self) -> Option<&AzureErrorKind> {
        match self {
            Self::Azure(e) => Some(&e.kind),
            _ => None,
        }
    }

    pub fn is_kind(&self, kind: AzureErrorKind) -> bool {
        self.azure_kind() == Some(&kind)
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azure_errors_keep_their_kind() {
        let err: AgentError = AzureError::missing_data("Vault properties must be present").into();
        assert!(err.is_kind(AzureErrorKind::MissingData));
        assert_eq!(err.to_string(), "[Missing data] Vault properties must be present");
    }

    #[test]
    fn config_errors_display_plain() {
        let err = AgentError::config("missing arg: group=<name>");
        assert_eq!(err.azure_kind(), None);
        assert_eq!(err.to_string(), "missing arg: group=<name>");
    }
}
