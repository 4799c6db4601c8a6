//! Read-only access to the externally-populated conversion feed.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::ConversionRecord;

type ConversionRow = (Uuid, String, String, String, String, String, DateTime<Utc>);

fn from_row(
    (id, subscriber_msisdn, product_id, trx_id, activation, description, created_at): ConversionRow,
) -> ConversionRecord {
    ConversionRecord {
        id,
        subscriber_msisdn,
        product_id,
        trx_id,
        activation,
        description,
        created_at,
    }
}

/// Most recent conversion record for a (subscriber, product, correlation key)
/// triple, or `None` if the feed has not produced one yet.
///
/// Duplicates are expected from the tracking integration; `created_at DESC`
/// makes the newest row win.
pub async fn latest_conversion(
    conn: &mut PgConnection,
    subscriber_msisdn: &str,
    product_id: &str,
    correlation_key: &str,
) -> Result<Option<ConversionRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, ConversionRow>(
        r#"
        SELECT id, subscriber_msisdn, product_id, trx_id, activation, description, created_at
        FROM billing.conversion_records
        WHERE subscriber_msisdn = $1
          AND product_id = $2
          AND trx_id = $3
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(subscriber_msisdn)
    .bind(product_id)
    .bind(correlation_key)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(from_row))
}

pub async fn find_by_id(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<ConversionRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, ConversionRow>(
        r#"
        SELECT id, subscriber_msisdn, product_id, trx_id, activation, description, created_at
        FROM billing.conversion_records
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(from_row))
}
