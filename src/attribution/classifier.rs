//! Acquisition/churn predicates.
//!
//! Pure, read-only evaluation of the two business-intelligence flags.
//! Churn is a function of the operation type alone. Acquisition requires a
//! subscription operation with a named marketer, and then asks whether an
//! audit record for the same subscriber/operation/correlation is already
//! on file; presence of such a record yields `true`. That polarity reads
//! backwards for "first-time acquisition" but matches the analytics
//! contract this pipeline feeds (it counts on the post-commit call seeing
//! the row just written); kept pending product confirmation.

use sqlx::PgConnection;
use uuid::Uuid;

use crate::database::audit_record_repository;
use crate::models::OperationType;

/// An event churns a subscriber iff it is an unsubscription.
pub fn is_churned(operation_type: OperationType) -> bool {
    operation_type == OperationType::Unsubscription
}

/// Acquisition decision given the prior-record answer. Split out so the
/// predicate itself is testable without a database.
pub fn acquisition_decision(
    operation_type: OperationType,
    marketer_name: Option<&str>,
    prior_record_exists: bool,
) -> bool {
    if operation_type != OperationType::Subscription {
        return false;
    }
    let has_marketer = marketer_name.map(|n| !n.trim().is_empty()).unwrap_or(false);
    has_marketer && prior_record_exists
}

/// Evaluate the acquisition flag against the store.
///
/// Accepts the caller's connection so it runs inside whatever transaction
/// scope the caller holds (or the top-level scope when handed a pooled
/// connection). Performs reads only.
pub async fn is_acquisition(
    conn: &mut PgConnection,
    operation_type: OperationType,
    marketer_name: Option<&str>,
    subscriber_id: Uuid,
    correlation_key: &str,
) -> Result<bool, sqlx::Error> {
    // Short-circuit before touching the database.
    if operation_type != OperationType::Subscription
        || !marketer_name.map(|n| !n.trim().is_empty()).unwrap_or(false)
    {
        return Ok(false);
    }

    let prior = audit_record_repository::prior_record_exists(
        conn,
        subscriber_id,
        operation_type,
        correlation_key,
    )
    .await?;

    Ok(acquisition_decision(operation_type, marketer_name, prior))
}
