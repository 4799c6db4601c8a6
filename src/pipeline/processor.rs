//! Core audit pipeline.
//!
//! One entry point per lifecycle event: validate, classify, build the
//! attribution context, persist the audit record transactionally, then
//! recompute flags and fire the postback after commit. The transactional
//! phase leaves no partial state behind on failure; the post-commit phase
//! deliberately runs outside the transaction because the acquisition check
//! must observe the just-committed row and outbound HTTP must never hold a
//! database transaction open.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use crate::attribution::{classifier, ContextBuilder, FlagMode};
use crate::database::{audit_record_repository, lifecycle_event_repository, subscriber_repository};
use crate::error::PipelineError;
use crate::models::{AuditRecord, LifecycleEvent, NewAuditRecord, OperationType};
use crate::postback::PostbackNotifier;

use super::collaborators::{OperationClassifier, ProductCatalog};

/// Result of processing one lifecycle event.
#[derive(Debug)]
pub enum ProcessOutcome {
    Completed(AuditRecord),
    /// The subscriber directory has no entry for this msisdn: nothing to
    /// audit. A benign skip, not a failure.
    SkippedUnknownSubscriber,
    /// The matched source event row is already marked processed: a
    /// redelivered event. The guard is a plain field-equality read with
    /// no row lock, so concurrent deliveries can still race past it.
    SkippedDuplicateDelivery,
}

pub struct AuditRecordProcessor {
    pool: PgPool,
    classifier: Arc<dyn OperationClassifier>,
    catalog: Arc<dyn ProductCatalog>,
    context_builder: ContextBuilder,
    notifier: Arc<PostbackNotifier>,
}

impl AuditRecordProcessor {
    pub fn new(
        pool: PgPool,
        classifier: Arc<dyn OperationClassifier>,
        catalog: Arc<dyn ProductCatalog>,
        context_builder: ContextBuilder,
        notifier: Arc<PostbackNotifier>,
    ) -> Self {
        Self {
            pool,
            classifier,
            catalog,
            context_builder,
            notifier,
        }
    }

    /// Process one classified lifecycle event end to end.
    ///
    /// Errors are wrapped with the originating event's discriminants so the
    /// upstream at-least-once transport can log and redeliver.
    pub async fn process_subscription_event(
        &self,
        event: &LifecycleEvent,
        comment_hint: Option<&str>,
    ) -> Result<ProcessOutcome, PipelineError> {
        self.run(event, comment_hint)
            .await
            .map_err(|e| e.with_event_context(&event.subscriber_msisdn, &event.correlation_key))
    }

    async fn run(
        &self,
        event: &LifecycleEvent,
        comment_hint: Option<&str>,
    ) -> Result<ProcessOutcome, PipelineError> {
        validate(event)?;

        let operation_type = self
            .classifier
            .classify(&event.operation_id)
            .map_err(|e| PipelineError::Classification(e.to_string()))?;
        let product_id = self
            .catalog
            .product_for_plan(&event.requested_plan)
            .unwrap_or_else(|| event.requested_plan.clone());

        let mut tx = self.pool.begin().await?;

        let ctx = self
            .context_builder
            .build(
                &mut tx,
                event,
                operation_type,
                &product_id,
                FlagMode::Deferred,
                comment_hint,
                None,
            )
            .await?;
        let marketer_name = ctx.marketer.as_ref().map(|m| m.name.clone());
        let comment = compose_final_comment(&ctx.comment, operation_type, marketer_name.as_deref());

        let subscriber =
            subscriber_repository::find_by_msisdn(&mut tx, &event.subscriber_msisdn).await?;
        let Some(subscriber) = subscriber else {
            info!(
                msisdn = %event.subscriber_msisdn,
                "unknown subscriber, nothing to audit"
            );
            tx.rollback().await?;
            return Ok(ProcessOutcome::SkippedUnknownSubscriber);
        };

        let source_event_id = match lifecycle_event_repository::find_matching(&mut tx, event).await? {
            Some(source) if source.processed => {
                info!(
                    correlation_key = %event.correlation_key,
                    source_event_id = %source.id,
                    "source event already marked processed, skipping redelivered event"
                );
                tx.rollback().await?;
                return Ok(ProcessOutcome::SkippedDuplicateDelivery);
            }
            Some(source) => Some(source.id),
            None => {
                warn!(
                    correlation_key = %event.correlation_key,
                    "no persisted lifecycle event matches; audit record will carry no source link"
                );
                None
            }
        };

        let record = audit_record_repository::create(
            &mut tx,
            &NewAuditRecord {
                subscriber_id: Some(subscriber.id),
                operation_type,
                service_id: event.service_id.clone(),
                product_id: product_id.clone(),
                charged_amount: event.charge_amount.clone(),
                bearer_id: event.bearer_id.clone(),
                correlation_key: event.correlation_key.clone(),
                marketer_id: ctx.marketer.as_ref().map(|m| m.id),
                converted: ctx
                    .conversion
                    .as_ref()
                    .map(|c| c.is_confirmed_activation())
                    .unwrap_or(false),
                comment: comment.clone(),
                lifecycle_event_id: source_event_id,
                conversion_record_id: ctx.conversion.as_ref().map(|c| c.id),
            },
        )
        .await?;

        if event.is_tracked_channel() && ctx.marketer.is_none() {
            self.context_builder
                .queue_retry(
                    record.id,
                    &product_id,
                    &event.subscriber_msisdn,
                    &event.correlation_key,
                    operation_type,
                    &comment,
                )
                .await?;
        }

        if let Some(source_event_id) = source_event_id {
            lifecycle_event_repository::mark_processed(&mut tx, source_event_id).await?;
        }

        tx.commit().await?;

        // Post-commit phase. Failures from here on propagate; only the
        // postback absorbs its own.
        let mut conn = self.pool.acquire().await?;
        let churned = classifier::is_churned(operation_type);
        let acquired = classifier::is_acquisition(
            &mut conn,
            operation_type,
            marketer_name.as_deref(),
            subscriber.id,
            &event.correlation_key,
        )
        .await?;
        audit_record_repository::update_business_intelligence_flags(
            &mut conn,
            record.id,
            acquired,
            churned,
        )
        .await?;

        let trail = audit_record_repository::fetch_with_relations(&mut conn, record.id)
            .await?
            .ok_or(PipelineError::Database(sqlx::Error::RowNotFound))?;

        if event.is_tracked_channel() && trail.record.converted {
            if let (Some(marketer), Some(conversion)) = (&trail.marketer, &trail.conversion) {
                self.notifier
                    .process_postback(&trail.record, marketer, conversion)
                    .await;
            }
        }

        let final_record = audit_record_repository::fetch(&mut conn, record.id)
            .await?
            .ok_or(PipelineError::Database(sqlx::Error::RowNotFound))?;

        Ok(ProcessOutcome::Completed(final_record))
    }
}

/// Required-field validation. Missing fields fail immediately and are
/// never retried.
fn validate(event: &LifecycleEvent) -> Result<(), PipelineError> {
    if event.subscriber_msisdn.trim().is_empty() {
        return Err(PipelineError::Validation {
            field: "subscriber_msisdn",
        });
    }
    if event.service_id.trim().is_empty() {
        return Err(PipelineError::Validation { field: "service_id" });
    }
    if event.operation_id.trim().is_empty() {
        return Err(PipelineError::Validation {
            field: "operation_id",
        });
    }
    Ok(())
}

/// Final comment: append "No Marketer Attribution" for subscription and
/// unsubscription events that carry no marketer name.
fn compose_final_comment(
    base: &str,
    operation_type: OperationType,
    marketer_name: Option<&str>,
) -> String {
    let has_marketer = marketer_name.map(|n| !n.trim().is_empty()).unwrap_or(false);
    let flag_missing = matches!(
        operation_type,
        OperationType::Subscription | OperationType::Unsubscription
    ) && !has_marketer;

    if flag_missing {
        format!("{base} - No Marketer Attribution")
    } else {
        base.to_string()
    }
}
