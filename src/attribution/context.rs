//! Attribution context assembly for one lifecycle event.
//!
//! Builds `{operation type, marketer, flags, comment}` without persisting
//! anything. The main pipeline runs this in deferred mode (flag
//! placeholders false, recomputed after commit); immediate mode evaluates
//! the flags in place for callers that already know the subscriber.

use std::sync::Arc;

use sqlx::PgConnection;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::database::conversion_repository;
use crate::error::PipelineError;
use crate::models::{ConversionRecord, LifecycleEvent, Marketer, OperationType, RetryPayload};
use crate::retry::{RetryScheduler, RetryTask};

use super::{classifier, resolver};

/// How the acquisition/churn flags should be filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagMode {
    /// Leave both flags false; the caller recomputes them post-commit.
    Deferred,
    /// Evaluate both flags now, inside the caller's scope.
    Immediate,
}

/// Assembled attribution context. Nothing here has touched storage yet.
#[derive(Debug, Clone)]
pub struct AttributionContext {
    pub operation_type: OperationType,
    pub marketer: Option<Marketer>,
    pub conversion: Option<ConversionRecord>,
    pub is_acquisition: bool,
    pub is_churned: bool,
    /// Tracked channel whose marketer could not be resolved yet. Tells the
    /// caller to schedule a correlation retry.
    pub attribution_pending: bool,
    pub comment: String,
}

pub struct ContextBuilder {
    scheduler: Arc<dyn RetryScheduler>,
    config: PipelineConfig,
}

impl ContextBuilder {
    pub fn new(scheduler: Arc<dyn RetryScheduler>, config: PipelineConfig) -> Self {
        Self { scheduler, config }
    }

    /// Build the attribution context for one event.
    ///
    /// Tracked channel: look up the most recent conversion record for the
    /// (subscriber, product, correlation key) triple and resolve its
    /// marketer. A missing conversion, or a conversion whose prefix matches
    /// no marketer, falls back to the untracked path with the comment
    /// annotated "attribution pending". Conversion-lookup failures are
    /// transient: logged and treated as "not found".
    pub async fn build(
        &self,
        conn: &mut PgConnection,
        event: &LifecycleEvent,
        operation_type: OperationType,
        product_id: &str,
        mode: FlagMode,
        comment_hint: Option<&str>,
        subscriber_id: Option<Uuid>,
    ) -> Result<AttributionContext, PipelineError> {
        if !event.is_tracked_channel() {
            return Ok(untracked_context(operation_type, &event.bearer_id, comment_hint));
        }

        let conversion = match conversion_repository::latest_conversion(
            conn,
            &event.subscriber_msisdn,
            product_id,
            &event.correlation_key,
        )
        .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    correlation_key = %event.correlation_key,
                    error = %e,
                    "conversion lookup failed, treating as not found"
                );
                None
            }
        };

        let Some(conversion) = conversion else {
            debug!(
                correlation_key = %event.correlation_key,
                "no conversion record yet, attribution pending"
            );
            let mut ctx = untracked_context(operation_type, &event.bearer_id, comment_hint);
            ctx.comment = annotate_pending(&ctx.comment);
            ctx.attribution_pending = true;
            return Ok(ctx);
        };

        let marketer = resolver::resolve_marketer(conn, &conversion).await?;

        let is_churned = classifier::is_churned(operation_type);
        let is_acquisition = match (mode, &marketer, subscriber_id) {
            (FlagMode::Immediate, Some(marketer), Some(subscriber_id)) => {
                classifier::is_acquisition(
                    conn,
                    operation_type,
                    Some(marketer.name.as_str()),
                    subscriber_id,
                    &event.correlation_key,
                )
                .await?
            }
            _ => false,
        };

        let base_comment = comment_hint
            .map(str::to_string)
            .unwrap_or_else(|| format!("Tracked subscription event via {}", event.bearer_id));
        let (comment, attribution_pending) = if marketer.is_some() {
            (base_comment, false)
        } else {
            (annotate_pending(&base_comment), true)
        };

        Ok(AttributionContext {
            operation_type,
            marketer,
            conversion: Some(conversion),
            is_acquisition,
            is_churned,
            attribution_pending,
            comment,
        })
    }

    /// Schedule a bounded correlation retry for an audit record whose
    /// conversion data has not arrived yet.
    pub async fn queue_retry(
        &self,
        audit_record_id: Uuid,
        product_id: &str,
        subscriber_msisdn: &str,
        correlation_key: &str,
        operation_type: OperationType,
        original_comment: &str,
    ) -> Result<(), PipelineError> {
        let task = RetryTask {
            payload: RetryPayload {
                audit_record_id,
                product_id: product_id.to_string(),
                subscriber_msisdn: subscriber_msisdn.to_string(),
                correlation_key: correlation_key.to_string(),
                operation_type,
                original_comment: original_comment.to_string(),
            },
            delay: self.config.retry_initial_delay,
            max_attempts: self.config.retry_max_attempts,
            backoff: self.config.retry_backoff,
            drop_on_complete: true,
            failed_history_cap: self.config.failed_history_cap,
        };

        self.scheduler
            .enqueue(task)
            .await
            .map_err(|e| PipelineError::Scheduling(e.to_string()))
    }
}

/// Untracked channel: no marketer, acquisition forced false, churn from the
/// operation type, default comment unless the caller supplied one.
pub fn untracked_context(
    operation_type: OperationType,
    bearer_id: &str,
    comment_hint: Option<&str>,
) -> AttributionContext {
    let comment = comment_hint
        .map(str::to_string)
        .unwrap_or_else(|| format!("Direct subscription event via {bearer_id}"));

    AttributionContext {
        operation_type,
        marketer: None,
        conversion: None,
        is_acquisition: false,
        is_churned: classifier::is_churned(operation_type),
        attribution_pending: false,
        comment,
    }
}

fn annotate_pending(comment: &str) -> String {
    format!("{comment} (attribution pending)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_defaults_the_comment_to_the_bearer() {
        let ctx = untracked_context(OperationType::Subscription, "SecureD", None);
        assert_eq!(ctx.comment, "Direct subscription event via SecureD");
        assert!(ctx.marketer.is_none());
        assert!(!ctx.is_acquisition);
        assert!(!ctx.is_churned);
        assert!(!ctx.attribution_pending);
    }

    #[test]
    fn untracked_honors_a_caller_comment() {
        let ctx = untracked_context(OperationType::Renewal, "USSD", Some("Renewal via USSD menu"));
        assert_eq!(ctx.comment, "Renewal via USSD menu");
    }

    #[test]
    fn untracked_unsubscription_is_churned() {
        let ctx = untracked_context(OperationType::Unsubscription, "SMS", None);
        assert!(ctx.is_churned);
        assert!(!ctx.is_acquisition);
    }

    #[test]
    fn pending_annotation_is_additive() {
        let annotated = annotate_pending("Direct subscription event via SecureD");
        assert!(annotated.starts_with("Direct subscription event via SecureD"));
        assert!(annotated.contains("attribution pending"));
    }
}
