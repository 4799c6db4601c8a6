//! Delayed retry-task scheduling.
//!
//! The scheduler contract: `enqueue(payload, delay, max_attempts, backoff)`
//! plus a worker loop that dequeues, invokes a handler, and re-enqueues
//! with an incremented attempt count on transient failure. Attempts for a
//! given task are serialized with the fixed inter-attempt backoff; there
//! are never concurrent attempts for the same task. Completed tasks are
//! dropped; terminally-failed ones land in a capped failure history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::RetryError;
use crate::models::RetryPayload;

/// One scheduled retry task.
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub payload: RetryPayload,
    /// Delay before the first delivery attempt.
    pub delay: Duration,
    pub max_attempts: u32,
    /// Fixed delay between redeliveries.
    pub backoff: Duration,
    pub drop_on_complete: bool,
    pub failed_history_cap: usize,
}

/// Scheduling seam. The pipeline only ever enqueues; delivery mechanics
/// belong to the implementation behind this trait.
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    async fn enqueue(&self, task: RetryTask) -> anyhow::Result<()>;
}

/// Consumer of delivered retry tasks. The scheduler embeds the attempt
/// count; `Err(Transient)` asks for redelivery, anything else is terminal.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn handle(
        &self,
        payload: &RetryPayload,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<(), RetryError>;
}

/// A task that consumed its attempt budget or failed terminally.
#[derive(Debug, Clone)]
pub struct FailedDelivery {
    pub payload: RetryPayload,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

struct Delivery {
    task: RetryTask,
    attempt: u32,
}

/// In-process scheduler over a tokio channel.
///
/// Each enqueued task gets its own sequential delivery chain: sleep the
/// delay, hand the payload to the handler, and on a transient failure
/// re-enqueue with `attempt + 1` until the budget runs out.
pub struct TokioRetryQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    failed: Arc<Mutex<VecDeque<FailedDelivery>>>,
}

impl TokioRetryQueue {
    /// Spawn the delivery loop feeding the given handler.
    pub fn start(handler: Arc<dyn RetryHandler>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let failed = Arc::new(Mutex::new(VecDeque::new()));

        let loop_tx = tx.clone();
        let loop_failed = Arc::clone(&failed);
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let handler = Arc::clone(&handler);
                let tx = loop_tx.clone();
                let failed = Arc::clone(&loop_failed);
                tokio::spawn(async move {
                    deliver(delivery, handler, tx, failed).await;
                });
            }
        });

        Self { tx, failed }
    }

    /// Snapshot of the terminally-failed task history (newest last).
    pub fn failed_history(&self) -> Vec<FailedDelivery> {
        self.failed
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RetryScheduler for TokioRetryQueue {
    async fn enqueue(&self, task: RetryTask) -> anyhow::Result<()> {
        debug!(
            audit_record_id = %task.payload.audit_record_id,
            correlation_key = %task.payload.correlation_key,
            max_attempts = task.max_attempts,
            "scheduling attribution retry"
        );
        self.tx
            .send(Delivery { task, attempt: 1 })
            .map_err(|_| anyhow!("retry queue is shut down"))
    }
}

async fn deliver(
    delivery: Delivery,
    handler: Arc<dyn RetryHandler>,
    tx: mpsc::UnboundedSender<Delivery>,
    failed: Arc<Mutex<VecDeque<FailedDelivery>>>,
) {
    let Delivery { task, attempt } = delivery;

    let wait = if attempt == 1 { task.delay } else { task.backoff };
    tokio::time::sleep(wait).await;

    match handler.handle(&task.payload, attempt, task.max_attempts).await {
        Ok(()) => {
            debug!(
                audit_record_id = %task.payload.audit_record_id,
                attempt,
                "retry task completed"
            );
            // drop_on_complete: nothing to keep.
        }
        Err(err) if err.is_transient() && attempt < task.max_attempts => {
            debug!(
                audit_record_id = %task.payload.audit_record_id,
                attempt,
                "retry attempt inconclusive, redelivering"
            );
            let next = attempt + 1;
            let _ = tx.send(Delivery {
                task,
                attempt: next,
            });
        }
        Err(err) => {
            warn!(
                audit_record_id = %task.payload.audit_record_id,
                attempts = attempt,
                error = %err,
                "retry task failed terminally"
            );
            record_failure(&failed, task, attempt, &err);
        }
    }
}

fn record_failure(
    failed: &Mutex<VecDeque<FailedDelivery>>,
    task: RetryTask,
    attempts: u32,
    err: &RetryError,
) {
    if let Ok(mut history) = failed.lock() {
        history.push_back(FailedDelivery {
            payload: task.payload,
            attempts,
            error: err.to_string(),
            failed_at: Utc::now(),
        });
        while history.len() > task.failed_history_cap {
            history.pop_front();
        }
    }
}
