//! Worker for delivered attribution retry tasks.
//!
//! State machine per task: `PENDING_LOOKUP` -> `RESOLVED` (conversion
//! found, attribution attached) | `EXHAUSTED` (budget consumed, record
//! annotated) | `PENDING_LOOKUP` again (transient, scheduler redelivers).

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};

use crate::attribution::{classifier, resolver};
use crate::database::{audit_record_repository, conversion_repository};
use crate::error::{PipelineError, RetryError};
use crate::models::RetryPayload;
use crate::postback::PostbackNotifier;
use crate::retry::queue::RetryHandler;

pub struct RetryWorker {
    pool: PgPool,
    notifier: Arc<PostbackNotifier>,
}

impl RetryWorker {
    pub fn new(pool: PgPool, notifier: Arc<PostbackNotifier>) -> Self {
        Self { pool, notifier }
    }

    /// Conversion data arrived: attach attribution and the conversion link,
    /// recompute flags, and notify the marketer if the activation is a
    /// confirmed success.
    async fn resolve(
        &self,
        conn: &mut PgConnection,
        payload: &RetryPayload,
        conversion: crate::models::ConversionRecord,
    ) -> Result<(), PipelineError> {
        let marketer = resolver::resolve_marketer(conn, &conversion).await?;
        let converted = conversion.is_confirmed_activation();

        audit_record_repository::attach_attribution(
            conn,
            payload.audit_record_id,
            marketer.as_ref().map(|m| m.id),
            conversion.id,
            converted,
        )
        .await?;

        let record = audit_record_repository::fetch(conn, payload.audit_record_id)
            .await?
            .ok_or(PipelineError::Database(sqlx::Error::RowNotFound))?;

        let churned = classifier::is_churned(payload.operation_type);
        let acquired = match (record.subscriber_id, &marketer) {
            (Some(subscriber_id), Some(marketer)) => {
                classifier::is_acquisition(
                    conn,
                    payload.operation_type,
                    Some(marketer.name.as_str()),
                    subscriber_id,
                    &payload.correlation_key,
                )
                .await?
            }
            _ => false,
        };
        audit_record_repository::update_business_intelligence_flags(
            conn,
            record.id,
            acquired,
            churned,
        )
        .await?;

        info!(
            audit_record_id = %payload.audit_record_id,
            marketer = marketer.as_ref().map(|m| m.name.as_str()).unwrap_or("<none>"),
            converted,
            "late attribution resolved"
        );

        if converted {
            if let Some(marketer) = &marketer {
                let record = audit_record_repository::fetch(conn, payload.audit_record_id)
                    .await?
                    .ok_or(PipelineError::Database(sqlx::Error::RowNotFound))?;
                self.notifier
                    .process_postback(&record, marketer, &conversion)
                    .await;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl RetryHandler for RetryWorker {
    async fn handle(
        &self,
        payload: &RetryPayload,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<(), RetryError> {
        let mut conn = self.pool.acquire().await.map_err(PipelineError::from)?;

        // Transient lookup failures count as "not found"; the attempt
        // budget decides whether that is retried or terminal.
        let conversion = match conversion_repository::latest_conversion(
            &mut conn,
            &payload.subscriber_msisdn,
            &payload.product_id,
            &payload.correlation_key,
        )
        .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    audit_record_id = %payload.audit_record_id,
                    error = %e,
                    "conversion lookup failed, treating as not found"
                );
                None
            }
        };

        match conversion {
            Some(conversion) => {
                self.resolve(&mut conn, payload, conversion).await?;
                Ok(())
            }
            None if attempt >= max_attempts => {
                let terminal = terminal_comment(&payload.original_comment, max_attempts);
                audit_record_repository::set_comment(
                    &mut conn,
                    payload.audit_record_id,
                    &terminal,
                )
                .await
                .map_err(PipelineError::from)?;
                Err(RetryError::Exhausted { max: max_attempts })
            }
            None => Err(RetryError::Transient {
                attempt,
                max: max_attempts,
            }),
        }
    }
}

fn terminal_comment(original: &str, max_attempts: u32) -> String {
    format!(
        "{original} - conversion record missing after {max_attempts} retries, processing incomplete"
    )
}
