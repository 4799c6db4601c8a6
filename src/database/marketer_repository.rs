//! Read-only marketer lookups.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::Marketer;

type MarketerRow = (Uuid, String, String, BigDecimal, String, DateTime<Utc>);

fn from_row((id, prefix, name, payout, postback_url, created_at): MarketerRow) -> Marketer {
    Marketer {
        id,
        prefix,
        name,
        payout,
        postback_url,
        created_at,
    }
}

/// Exact-match lookup by correlation-key prefix.
pub async fn find_by_prefix(
    conn: &mut PgConnection,
    prefix: &str,
) -> Result<Option<Marketer>, sqlx::Error> {
    let row = sqlx::query_as::<_, MarketerRow>(
        r#"
        SELECT id, prefix, name, payout, postback_url, created_at
        FROM billing.marketers
        WHERE prefix = $1
        "#,
    )
    .bind(prefix)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(from_row))
}

pub async fn find_by_id(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Marketer>, sqlx::Error> {
    let row = sqlx::query_as::<_, MarketerRow>(
        r#"
        SELECT id, prefix, name, payout, postback_url, created_at
        FROM billing.marketers
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(from_row))
}
