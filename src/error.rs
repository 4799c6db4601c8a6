//! Error handling for the attribution pipeline
//!
//! This module provides idiomatic Rust error types using thiserror. The
//! taxonomy deliberately separates validation failures (never retried),
//! transactional-phase failures (wrapped with original-event context and
//! surfaced to the at-least-once transport) and retry-loop outcomes.
//!
//! Two things are intentionally *not* errors here: "attribution pending"
//! (conversion data has not arrived yet, expressed as a context flag) and
//! postback delivery failures (absorbed by the notifier, recorded only in
//! the audit comment trail).

use thiserror::Error;

/// Main error type for the transactional pipeline path.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required field was missing from the inbound lifecycle event.
    /// Returned immediately; never retried.
    #[error("validation failed: missing required field '{field}'")]
    Validation { field: &'static str },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The external operation-type classifier could not map the operation id.
    #[error("operation classification failed: {0}")]
    Classification(String),

    /// Retry-task scheduling failed while the transaction was open.
    #[error("retry scheduling failed: {0}")]
    Scheduling(String),

    /// No handler registered for the delivered trigger.
    #[error("no handler registered for trigger '{0}'")]
    Dispatch(String),

    /// Wrapper carrying the original event's discriminants so the upstream
    /// redelivery mechanism can log something actionable.
    #[error("failed to process lifecycle event (msisdn={msisdn}, correlation_key={correlation_key}): {source}")]
    EventProcessing {
        msisdn: String,
        correlation_key: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Wrap a transactional-phase failure with the originating event's
    /// identifying fields. Validation failures and already-wrapped errors
    /// pass through untouched.
    pub fn with_event_context(self, msisdn: &str, correlation_key: &str) -> Self {
        match self {
            PipelineError::Validation { .. } | PipelineError::EventProcessing { .. } => self,
            other => PipelineError::EventProcessing {
                msisdn: msisdn.to_string(),
                correlation_key: correlation_key.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, PipelineError::Validation { .. })
    }
}

/// Outcome of one retry-task delivery attempt.
///
/// `Transient` asks the scheduler to redeliver after its fixed backoff;
/// `Exhausted` marks the task permanently failed (expected when the
/// conversion feed simply never produces a record for an untracked click,
/// not a bug signal). Pipeline errors inside the worker are terminal.
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("conversion record not yet available (attempt {attempt} of {max})")]
    Transient { attempt: u32, max: u32 },

    #[error("conversion record missing after {max} retries, processing incomplete")]
    Exhausted { max: u32 },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl RetryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RetryError::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_rewrapped() {
        let err = PipelineError::Validation { field: "service_id" };
        let wrapped = err.with_event_context("2348000000001", "MKT1-a-b");
        assert!(wrapped.is_validation());
    }

    #[test]
    fn database_errors_gain_event_context() {
        let err = PipelineError::Database(sqlx::Error::RowNotFound);
        let wrapped = err.with_event_context("2348000000001", "MKT1-a-b");
        let msg = wrapped.to_string();
        assert!(msg.contains("msisdn=2348000000001"));
        assert!(msg.contains("correlation_key=MKT1-a-b"));
    }

    #[test]
    fn double_wrapping_is_a_no_op() {
        let err = PipelineError::Database(sqlx::Error::RowNotFound)
            .with_event_context("111", "k-1")
            .with_event_context("222", "k-2");
        assert!(err.to_string().contains("msisdn=111"));
    }

    #[test]
    fn transient_classification() {
        assert!(RetryError::Transient { attempt: 1, max: 3 }.is_transient());
        assert!(!RetryError::Exhausted { max: 3 }.is_transient());
    }
}
