//! Cross-referencing of persisted raw lifecycle notifications.
//!
//! The ingestion layer writes `billing.lifecycle_events`; this module only
//! locates the row matching an in-flight event and flips its `processed`
//! flag. The match is by field equality, not a unique key, and the
//! `processed` read takes no row lock, so the duplicate-redelivery guard
//! is best-effort (a known-weak guarantee, preserved as-is).

use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::LifecycleEvent;

/// Identity and processed state of the persisted row matching an
/// in-flight event.
#[derive(Debug, Clone, Copy)]
pub struct SourceEventMatch {
    pub id: Uuid,
    pub processed: bool,
}

/// Locate the persisted row for this event by exact discriminant-field
/// match. Newest wins if ingestion wrote duplicates. The caller uses the
/// `processed` flag to recognize a redelivered event.
pub async fn find_matching(
    conn: &mut PgConnection,
    event: &LifecycleEvent,
) -> Result<Option<SourceEventMatch>, sqlx::Error> {
    let row = sqlx::query_as::<_, (Uuid, bool)>(
        r#"
        SELECT id, processed
        FROM billing.lifecycle_events
        WHERE subscriber_msisdn = $1
          AND service_id = $2
          AND operation_id = $3
          AND correlation_key = $4
          AND processing_time = $5
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(&event.subscriber_msisdn)
    .bind(&event.service_id)
    .bind(&event.operation_id)
    .bind(&event.correlation_key)
    .bind(event.processing_time)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|(id, processed)| SourceEventMatch { id, processed }))
}

/// Mark a source event row processed. Returns the number of rows touched.
pub async fn mark_processed(conn: &mut PgConnection, id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE billing.lifecycle_events
        SET processed = TRUE
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}
