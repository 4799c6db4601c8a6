//! Persistence for the central subscription audit trail.
//!
//! One row per lifecycle event. `create` runs inside the caller's
//! transaction; the single-field mutations are idempotent overwrites used
//! by post-commit flag recomputation, late attribution and postback
//! comment appends.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use crate::models::{AuditRecord, AuditTrail, NewAuditRecord, OperationType};

use super::{conversion_repository, marketer_repository, subscriber_repository};

#[derive(FromRow)]
struct AuditRecordRow {
    id: Uuid,
    subscriber_id: Option<Uuid>,
    operation_type: String,
    service_id: String,
    product_id: String,
    charged_amount: BigDecimal,
    bearer_id: String,
    correlation_key: String,
    marketer_id: Option<Uuid>,
    acquired: bool,
    churned: bool,
    converted: bool,
    comment: String,
    lifecycle_event_id: Option<Uuid>,
    conversion_record_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AuditRecordRow {
    fn into_record(self) -> Result<AuditRecord, sqlx::Error> {
        let operation_type =
            OperationType::from_code(&self.operation_type).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "operation_type".to_string(),
                source: format!("unknown operation type code '{}'", self.operation_type).into(),
            })?;

        Ok(AuditRecord {
            id: self.id,
            subscriber_id: self.subscriber_id,
            operation_type,
            service_id: self.service_id,
            product_id: self.product_id,
            charged_amount: self.charged_amount,
            bearer_id: self.bearer_id,
            correlation_key: self.correlation_key,
            marketer_id: self.marketer_id,
            acquired: self.acquired,
            churned: self.churned,
            converted: self.converted,
            comment: self.comment,
            lifecycle_event_id: self.lifecycle_event_id,
            conversion_record_id: self.conversion_record_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    id, subscriber_id, operation_type, service_id, product_id, charged_amount,
    bearer_id, correlation_key, marketer_id, acquired, churned, converted,
    comment, lifecycle_event_id, conversion_record_id, created_at, updated_at
"#;

/// Insert the audit record. Acquisition/churn flags start false; the
/// post-commit recomputation overwrites them once the row is visible.
pub async fn create(
    conn: &mut PgConnection,
    new: &NewAuditRecord,
) -> Result<AuditRecord, sqlx::Error> {
    let sql = format!(
        r#"
        INSERT INTO billing.subscription_audit (
            subscriber_id, operation_type, service_id, product_id, charged_amount,
            bearer_id, correlation_key, marketer_id, acquired, churned, converted,
            comment, lifecycle_event_id, conversion_record_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, FALSE, $9, $10, $11, $12)
        RETURNING {SELECT_COLUMNS}
        "#
    );

    let row = sqlx::query_as::<_, AuditRecordRow>(&sql)
        .bind(new.subscriber_id)
        .bind(new.operation_type.code())
        .bind(&new.service_id)
        .bind(&new.product_id)
        .bind(&new.charged_amount)
        .bind(&new.bearer_id)
        .bind(&new.correlation_key)
        .bind(new.marketer_id)
        .bind(new.converted)
        .bind(&new.comment)
        .bind(new.lifecycle_event_id)
        .bind(new.conversion_record_id)
        .fetch_one(&mut *conn)
        .await?;

    row.into_record()
}

pub async fn fetch(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<AuditRecord>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {SELECT_COLUMNS}
        FROM billing.subscription_audit
        WHERE id = $1
        "#
    );

    let row = sqlx::query_as::<_, AuditRecordRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(AuditRecordRow::into_record).transpose()
}

/// Reload a record together with its subscriber, marketer and conversion
/// relations.
pub async fn fetch_with_relations(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<AuditTrail>, sqlx::Error> {
    let Some(record) = fetch(conn, id).await? else {
        return Ok(None);
    };

    let subscriber = match record.subscriber_id {
        Some(subscriber_id) => subscriber_repository::find_by_id(conn, subscriber_id).await?,
        None => None,
    };
    let marketer = match record.marketer_id {
        Some(marketer_id) => marketer_repository::find_by_id(conn, marketer_id).await?,
        None => None,
    };
    let conversion = match record.conversion_record_id {
        Some(conversion_id) => conversion_repository::find_by_id(conn, conversion_id).await?,
        None => None,
    };

    Ok(Some(AuditTrail {
        record,
        subscriber,
        marketer,
        conversion,
    }))
}

/// Whether any audit record is already on file for this subscriber,
/// operation and correlation key.
///
/// Best-effort read under default isolation: there is no row lock, so
/// concurrent events for the same subscriber can race. The post-commit
/// caller relies on this seeing the row it just committed.
pub async fn prior_record_exists(
    conn: &mut PgConnection,
    subscriber_id: Uuid,
    operation_type: OperationType,
    correlation_key: &str,
) -> Result<bool, sqlx::Error> {
    let (exists,): (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM billing.subscription_audit
            WHERE subscriber_id = $1
              AND operation_type = $2
              AND correlation_key = $3
        )
        "#,
    )
    .bind(subscriber_id)
    .bind(operation_type.code())
    .bind(correlation_key)
    .fetch_one(&mut *conn)
    .await?;

    Ok(exists)
}

/// Overwrite the business-intelligence flags. Idempotent: repeated calls
/// with the same inputs leave identical state.
pub async fn update_business_intelligence_flags(
    conn: &mut PgConnection,
    id: Uuid,
    acquired: bool,
    churned: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE billing.subscription_audit
        SET acquired = $2, churned = $3, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(acquired)
    .bind(churned)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Attach late-resolved attribution: marketer (when matched), the
/// conversion link, and the converted flag. Idempotent overwrite.
pub async fn attach_attribution(
    conn: &mut PgConnection,
    id: Uuid,
    marketer_id: Option<Uuid>,
    conversion_record_id: Uuid,
    converted: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE billing.subscription_audit
        SET marketer_id = $2, conversion_record_id = $3, converted = $4, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(marketer_id)
    .bind(conversion_record_id)
    .bind(converted)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Replace the comment wholesale (terminal annotations).
pub async fn set_comment(
    conn: &mut PgConnection,
    id: Uuid,
    comment: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE billing.subscription_audit
        SET comment = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(comment)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Append a suffix to the comment trail without touching prior content.
pub async fn append_comment(
    conn: &mut PgConnection,
    id: Uuid,
    suffix: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE billing.subscription_audit
        SET comment = comment || $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(suffix)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
