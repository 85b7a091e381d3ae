use thiserror::Error;

/// Errors surfaced by lifecycle operations.
///
/// Only `ExternalTool` failures are retried by the step executor; every other
/// variant aborts the calling operation before it mutates anything.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),

    #[error("illegal {entity} transition {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{context}: {detail}")]
    ExternalTool { context: String, detail: String },

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    NotFound(String),

    #[error("run {run_id} {operation} operation is already in progress; holder={holder}")]
    MutationInProgress {
        run_id: String,
        operation: String,
        holder: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Wrap a failed collaborator call, keeping the full anyhow chain.
    pub fn external(context: impl Into<String>, err: anyhow::Error) -> Self {
        Self::ExternalTool {
            context: context.into(),
            detail: format!("{err:#}"),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalTool { .. } | Self::Internal(_))
    }
}
