//! Outbound conversion postbacks to affiliate marketers.
//!
//! Best effort, single attempt, at most once per conversion: one GET to
//! the marketer's postback URL with `click_id`, `payout` and `source_id`.
//! Receipt of any response object counts as delivered; status codes are
//! not inspected (a deliberately weak guarantee, kept as-is). Nothing in
//! here ever propagates an error to the surrounding pipeline; the only
//! durable trace is a `Postback: Success|Failed` suffix on the audit
//! record's comment.

use std::fmt;

use anyhow::Context;
use reqwest::Client;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::database::audit_record_repository;
use crate::models::{AuditRecord, ConversionRecord, Marketer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostbackOutcome {
    Success,
    Failed,
}

impl fmt::Display for PostbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostbackOutcome::Success => f.write_str("Success"),
            PostbackOutcome::Failed => f.write_str("Failed"),
        }
    }
}

pub struct PostbackNotifier {
    http: Client,
    pool: PgPool,
}

impl PostbackNotifier {
    pub fn new(pool: PgPool, config: &PipelineConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(config.postback_timeout)
            .build()
            .context("Failed to create postback HTTP client")?;
        Ok(Self { http, pool })
    }

    /// Fire the postback for a confirmed conversion and record the outcome
    /// on the audit record's comment trail. Never fails the caller.
    pub async fn process_postback(
        &self,
        record: &AuditRecord,
        marketer: &Marketer,
        conversion: &ConversionRecord,
    ) -> PostbackOutcome {
        let outcome = match self.deliver(marketer, conversion).await {
            Ok(()) => {
                info!(
                    audit_record_id = %record.id,
                    marketer = %marketer.name,
                    "postback delivered"
                );
                PostbackOutcome::Success
            }
            Err(e) => {
                warn!(
                    audit_record_id = %record.id,
                    marketer = %marketer.name,
                    error = %e,
                    "postback delivery failed"
                );
                PostbackOutcome::Failed
            }
        };

        if let Err(e) = self.append_outcome(record.id, outcome).await {
            error!(
                audit_record_id = %record.id,
                error = %e,
                "failed to record postback outcome"
            );
        }

        outcome
    }

    async fn deliver(
        &self,
        marketer: &Marketer,
        conversion: &ConversionRecord,
    ) -> anyhow::Result<()> {
        let (click_id, source_id) = postback_params(&conversion.trx_id, &marketer.prefix);
        let payout = marketer.payout.to_string();

        let _response = self
            .http
            .get(&marketer.postback_url)
            .query(&[
                ("click_id", click_id.as_str()),
                ("payout", payout.as_str()),
                ("source_id", source_id.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("postback GET to {} failed", marketer.postback_url))?;

        Ok(())
    }

    async fn append_outcome(&self, record_id: Uuid, outcome: PostbackOutcome) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        audit_record_repository::append_comment(&mut conn, record_id, &format!(" | Postback: {outcome}"))
            .await?;
        Ok(())
    }
}

/// Extract `{click_id, source_id}` from a conversion correlation key.
///
/// Preferred split: strip the marketer's own prefix. When the key does not
/// start with the prefix verbatim, fall back to a positional hyphen split
/// (segment 2 is the click, the rest is the source).
pub fn postback_params(trx_id: &str, prefix: &str) -> (String, String) {
    let rest = match trx_id
        .strip_prefix(prefix)
        .and_then(|r| r.strip_prefix('-'))
    {
        Some(rest) if !prefix.is_empty() => rest,
        _ => trx_id.splitn(2, '-').nth(1).unwrap_or(""),
    };

    let mut parts = rest.splitn(2, '-');
    let click_id = parts.next().unwrap_or("").to_string();
    let source_id = parts.next().unwrap_or("").to_string();
    (click_id, source_id)
}
