use thiserror::Error;

/// Failure classes the pipeline distinguishes when deciding whether to retry.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// RPC timeout, rate limit, connection reset.
    #[error("upstream call failed: {0}")]
    Upstream(String),

    /// The AMM indexer has not seen the pool yet.
    #[error("pool {0} not yet indexed")]
    NotYetIndexed(String),

    #[error("transaction {signature} failed: {reason}")]
    TransactionFailed { signature: String, reason: String },

    /// Confirmation reported `ProgramFailedToComplete` and the finalized logs
    /// carried no success marker either.
    #[error("transaction {signature} reported ProgramFailedToComplete")]
    AmbiguousProgramFailure {
        signature: String,
        logs: Vec<String>,
    },

    /// The request may have been applied remotely, so repeating it is unsafe.
    #[error("outcome of {0} unknown")]
    OutcomeUnknown(String),

    #[error("lock percentages must sum to 100 (primary {primary} + secondary {secondary})")]
    LockSplit { primary: u64, secondary: u64 },

    #[error("missing state for {mint}: {what}")]
    MissingState { mint: String, what: &'static str },

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Upstream(_) | PipelineError::NotYetIndexed(_)
        )
    }
}

/// Returns true when the chain of `err` contains a retryable pipeline error,
/// or no classified error at all (unknown failures are retried).
pub fn is_retryable(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(p) = cause.downcast_ref::<PipelineError>() {
            return match p {
                PipelineError::LockSplit { .. }
                | PipelineError::OutcomeUnknown(_)
                | PipelineError::MissingState { .. }
                | PipelineError::Config(_) => false,
                _ => true,
            };
        }
    }
    true
}

#[derive(Debug, Error)]
#[error("migration step {step} failed for {mint}: {source:#}")]
pub struct MigrationError {
    pub mint: String,
    pub step: &'static str,
    #[source]
    pub source: anyhow::Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_config_errors_are_not_retried() {
        let err = anyhow::Error::new(PipelineError::LockSplit {
            primary: 80,
            secondary: 10,
        });
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_classification_survives_context() {
        let err: anyhow::Error = Err::<(), _>(PipelineError::NotYetIndexed("pool".into()))
            .context("polling pool")
            .unwrap_err();
        assert!(is_retryable(&err));
        let unknown = anyhow::anyhow!("socket closed");
        assert!(is_retryable(&unknown));
    }
}
