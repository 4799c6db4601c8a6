//! Subscription event attribution & audit pipeline
//!
//! Reconciles two independently-arriving event streams - carrier billing
//! lifecycle notifications (subscribe/renew/unsubscribe) and a third-party
//! marketing-conversion feed - into an attributed, auditable record per
//! billing event, and notifies affiliate marketers of confirmed
//! conversions exactly once.
//!
//! ## Flow
//!
//! transport -> [`EventOrchestrator`] -> [`AuditRecordProcessor`] ->
//! [`ContextBuilder`] -> {attribution resolver, acquisition/churn
//! classifier} -> persisted audit record -> (if unattributed) retry task ->
//! [`RetryWorker`] -> postback.
//!
//! The transactional phase (validate, classify, build context, create the
//! audit record, mark the source event processed) commits atomically; flag
//! recomputation and the marketer postback deliberately run after commit.
//! Late-arriving conversion data is correlated by a bounded retry (3
//! attempts, fixed 5s backoff); exhaustion annotates the record and marks
//! the task failed without ever deleting anything.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use attribution_pipeline::{
//!     AuditRecordProcessor, ContextBuilder, DatabaseManager, EventOrchestrator,
//!     PipelineConfig, PostbackNotifier, RetryWorker, TokioRetryQueue,
//!     pipeline::{PlanPrefixCatalog, StaticOperationClassifier},
//!     OperationType,
//! };
//!
//! # async fn wire() -> anyhow::Result<()> {
//! let db = DatabaseManager::with_default_config().await?;
//! let config = PipelineConfig::default();
//!
//! let notifier = Arc::new(PostbackNotifier::new(db.pool().clone(), &config)?);
//! let worker = Arc::new(RetryWorker::new(db.pool().clone(), Arc::clone(&notifier)));
//! let queue = Arc::new(TokioRetryQueue::start(worker));
//!
//! let processor = Arc::new(AuditRecordProcessor::new(
//!     db.pool().clone(),
//!     Arc::new(StaticOperationClassifier::new([
//!         ("OP-SUB-1", OperationType::Subscription),
//!     ])),
//!     Arc::new(PlanPrefixCatalog),
//!     ContextBuilder::new(queue, config.clone()),
//!     notifier,
//! ));
//! let orchestrator = EventOrchestrator::new(processor);
//! # let _ = orchestrator;
//! # Ok(())
//! # }
//! ```

pub mod attribution;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod postback;
pub mod retry;

pub use attribution::{AttributionContext, ContextBuilder, FlagMode};
pub use config::PipelineConfig;
pub use database::{DatabaseConfig, DatabaseManager};
pub use error::{PipelineError, RetryError};
pub use models::{
    AuditRecord, AuditTrail, ConversionRecord, LifecycleEvent, Marketer, NewAuditRecord,
    OperationType, RetryPayload, Subscriber,
};
pub use pipeline::{AuditRecordProcessor, EventKind, EventOrchestrator, ProcessOutcome};
pub use postback::{PostbackNotifier, PostbackOutcome};
pub use retry::{FailedDelivery, RetryHandler, RetryScheduler, RetryTask, RetryWorker, TokioRetryQueue};
