//! Subscriber directory lookups.
//!
//! The directory itself (find-or-create, provisioning) is owned by an
//! external component; the pipeline only resolves msisdn -> subscriber.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::Subscriber;

pub async fn find_by_msisdn(
    conn: &mut PgConnection,
    msisdn: &str,
) -> Result<Option<Subscriber>, sqlx::Error> {
    let row = sqlx::query_as::<_, (Uuid, String, DateTime<Utc>)>(
        r#"
        SELECT id, msisdn, created_at
        FROM billing.subscribers
        WHERE msisdn = $1
        "#,
    )
    .bind(msisdn)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|(id, msisdn, created_at)| Subscriber {
        id,
        msisdn,
        created_at,
    }))
}

pub async fn find_by_id(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Subscriber>, sqlx::Error> {
    let row = sqlx::query_as::<_, (Uuid, String, DateTime<Utc>)>(
        r#"
        SELECT id, msisdn, created_at
        FROM billing.subscribers
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|(id, msisdn, created_at)| Subscriber {
        id,
        msisdn,
        created_at,
    }))
}
