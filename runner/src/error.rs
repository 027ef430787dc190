//! Error taxonomy at the pipeline seam.
//!
//! Adapters return `anyhow::Result`; the driver lifts those into
//! [`PipelineError`] so every failure maps onto a [`FailureKind`].
//!
//! Recoverable conditions are not errors here: a failed token exchange yields
//! a fallback credential, a failed callback yields `DeliveryResult::Failed`,
//! and timeouts or unreadable logs are classified by output extraction.

use thiserror::Error;

use crate::core::types::FailureKind;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or missing input. Raised before any external call.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("pull request #{number} not found")]
    BranchNotFound { number: u64 },

    #[error("agent crashed: {0}")]
    AgentCrash(String),

    #[error("hosting api: {0:#}")]
    Hosting(anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Validation(_) => FailureKind::Validation,
            PipelineError::BranchNotFound { .. } => FailureKind::BranchNotFound,
            PipelineError::AgentCrash(_) => FailureKind::AgentCrash,
            PipelineError::Hosting(_) => FailureKind::Hosting,
            PipelineError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Message suitable for action outputs and callbacks (no backtraces).
    pub fn report(&self) -> String {
        match self {
            PipelineError::Internal(err) => format!("{err:#}"),
            other => other.to_string(),
        }
    }
}
