//! Runtime errors.

use berth_core::BerthError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    /// A stage reported failure. The run halts and nothing it produced is kept.
    #[error("stage {stage} failed in action {action}: {reason}")]
    StageFailure {
        stage: String,
        action: String,
        reason: String,
    },

    /// The executor or a publisher could not do its job at all.
    #[error("executor error: {0}")]
    Executor(#[from] anyhow::Error),

    #[error("invalid run: {0}")]
    InvalidRun(String),

    #[error(transparent)]
    Core(#[from] BerthError),
}

pub type Result<T> = std::result::Result<T, RunError>;
