//! Pipeline tunables
//!
//! Retry and postback knobs gathered in one place. Values mirror what the
//! delayed-queue contract expects: three delivery attempts, fixed 5s
//! backoff, and a capped failure history for operational inspection.

use std::time::Duration;

/// Tunables for retry scheduling and postback delivery.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum delivery attempts for an attribution retry task.
    pub retry_max_attempts: u32,
    /// Delay before the first delivery attempt.
    pub retry_initial_delay: Duration,
    /// Fixed delay between redeliveries.
    pub retry_backoff: Duration,
    /// How many terminally-failed tasks the queue keeps for inspection.
    pub failed_history_cap: usize,
    /// Timeout for the outbound postback GET.
    pub postback_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_initial_delay: Duration::from_millis(5000),
            retry_backoff: Duration::from_millis(5000),
            failed_history_cap: 50,
            postback_timeout: Duration::from_secs(10),
        }
    }
}
