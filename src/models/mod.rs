//! Core data model for the attribution pipeline
//!
//! The persisted rows live in the `billing` Postgres schema (see
//! `sql/schema.sql`). `LifecycleEvent` is the ephemeral inbound payload;
//! everything else maps 1:1 onto a table. Monetary values use
//! `BigDecimal` end to end so payout rates survive with their scale
//! intact ("2.50" stays "2.50" in the postback query string).

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classified kind of a billing lifecycle operation.
///
/// Classification from raw carrier operation ids is owned by an external
/// collaborator (`OperationClassifier`); this enum is only the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Subscription,
    Renewal,
    Unsubscription,
    AuditOnly,
}

impl OperationType {
    /// Stable string code used for persistence.
    pub fn code(&self) -> &'static str {
        match self {
            OperationType::Subscription => "SUBSCRIPTION",
            OperationType::Renewal => "RENEWAL",
            OperationType::Unsubscription => "UNSUBSCRIPTION",
            OperationType::AuditOnly => "AUDIT_ONLY",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "SUBSCRIPTION" => Some(OperationType::Subscription),
            "RENEWAL" => Some(OperationType::Renewal),
            "UNSUBSCRIPTION" => Some(OperationType::Unsubscription),
            "AUDIT_ONLY" => Some(OperationType::AuditOnly),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Inbound carrier lifecycle notification, as delivered by the transport
/// after webhook parsing. Ephemeral: the ingestion layer has already
/// persisted its own copy as a `billing.lifecycle_events` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub subscriber_msisdn: String,
    pub service_id: String,
    pub operation_id: String,
    pub requested_plan: String,
    pub correlation_key: String,
    pub bearer_id: String,
    pub charge_amount: BigDecimal,
    pub result_code: String,
    pub processing_time: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Whether this event arrived through a tracked marketing channel.
    ///
    /// Tracked events carry a correlation key that the conversion feed can
    /// be joined on; direct carrier events carry none.
    pub fn is_tracked_channel(&self) -> bool {
        !self.correlation_key.trim().is_empty()
    }
}

/// Persisted copy of a raw lifecycle notification (`billing.lifecycle_events`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEventRecord {
    pub id: Uuid,
    pub subscriber_msisdn: String,
    pub service_id: String,
    pub operation_id: String,
    pub correlation_key: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

/// Externally-sourced conversion confirmation (`billing.conversion_records`).
///
/// Read-only here. The feed may deliver a record late, never, or several
/// times; readers always take the most recent row by `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub id: Uuid,
    pub subscriber_msisdn: String,
    pub product_id: String,
    /// The correlation key as the tracking integration calls it.
    pub trx_id: String,
    pub activation: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl ConversionRecord {
    /// A conversion counts as confirmed when the feed reports a successful
    /// activation. The description match is deliberately loose (the feed
    /// sends "Success", "success", trailing whitespace, ...).
    pub fn is_confirmed_activation(&self) -> bool {
        self.activation == "1" && self.description.trim().eq_ignore_ascii_case("success")
    }
}

/// Affiliate marketer, keyed by correlation-key prefix (`billing.marketers`).
/// Read-only from this pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marketer {
    pub id: Uuid,
    pub prefix: String,
    pub name: String,
    pub payout: BigDecimal,
    pub postback_url: String,
    pub created_at: DateTime<Utc>,
}

/// Subscriber directory row (`billing.subscribers`). Find-or-create is
/// owned by an external component; lookup only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: Uuid,
    pub msisdn: String,
    pub created_at: DateTime<Utc>,
}

/// Central persisted audit record (`billing.subscription_audit`).
///
/// Created exactly once per lifecycle event, inside the same transaction
/// that marks the source event processed. Mutated in place afterwards by
/// flag recomputation, late attribution, and postback comment appends.
/// Never recreated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub subscriber_id: Option<Uuid>,
    pub operation_type: OperationType,
    pub service_id: String,
    pub product_id: String,
    pub charged_amount: BigDecimal,
    pub bearer_id: String,
    pub correlation_key: String,
    pub marketer_id: Option<Uuid>,
    pub acquired: bool,
    pub churned: bool,
    pub converted: bool,
    pub comment: String,
    pub lifecycle_event_id: Option<Uuid>,
    pub conversion_record_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field set for inserting a new audit record.
#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub subscriber_id: Option<Uuid>,
    pub operation_type: OperationType,
    pub service_id: String,
    pub product_id: String,
    pub charged_amount: BigDecimal,
    pub bearer_id: String,
    pub correlation_key: String,
    pub marketer_id: Option<Uuid>,
    pub converted: bool,
    pub comment: String,
    pub lifecycle_event_id: Option<Uuid>,
    pub conversion_record_id: Option<Uuid>,
}

/// Audit record reloaded together with its relations.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    pub record: AuditRecord,
    pub subscriber: Option<Subscriber>,
    pub marketer: Option<Marketer>,
    pub conversion: Option<ConversionRecord>,
}

/// Payload carried by an attribution retry task through the delayed queue.
///
/// Round-trips as JSON; the queue owns scheduling, we own the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPayload {
    pub audit_record_id: Uuid,
    pub product_id: String,
    pub subscriber_msisdn: String,
    pub correlation_key: String,
    pub operation_type: OperationType,
    pub original_comment: String,
}
