//! End-to-end pipeline tests against Postgres.
//!
//! These exercise the full transactional path: context building, audit
//! record creation, post-commit flag recomputation, bounded retry and the
//! marketer postback. They need a provisioned database with
//! `sql/schema.sql` applied and are ignored by default:
//!
//! ```text
//! TEST_DATABASE_URL=postgresql://localhost/billing cargo test -- --ignored
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::Utc;
use sqlx::PgPool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use attribution_pipeline::{
    pipeline::{PlanPrefixCatalog, StaticOperationClassifier},
    AuditRecordProcessor, ContextBuilder, FlagMode, LifecycleEvent, OperationType,
    PipelineConfig, PostbackNotifier, ProcessOutcome, RetryWorker, TokioRetryQueue,
};

// =========================================================================
// TEST INFRASTRUCTURE
// =========================================================================

struct TestDb {
    pool: PgPool,
    /// Unique per-run marketer prefix; doubles as the cleanup discriminator.
    prefix: String,
    msisdn: String,
}

impl TestDb {
    async fn new() -> Result<Self> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let url = std::env::var("TEST_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "postgresql://localhost:5432/billing".into());

        let pool = PgPool::connect(&url).await?;
        let run = Uuid::new_v4().simple().to_string();
        let prefix = format!("TM{}", &run[..8]);
        let msisdn = format!("234{}", &run[..10]);
        Ok(Self {
            pool,
            prefix,
            msisdn,
        })
    }

    fn correlation_key(&self, click: &str, source: &str) -> String {
        format!("{}-{}-{}", self.prefix, click, source)
    }

    async fn insert_subscriber(&self) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO billing.subscribers (msisdn) VALUES ($1) RETURNING id",
        )
        .bind(&self.msisdn)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_lifecycle_event(&self, event: &LifecycleEvent) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing.lifecycle_events
                (subscriber_msisdn, service_id, operation_id, requested_plan,
                 correlation_key, bearer_id, charge_amount, result_code, processing_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&event.subscriber_msisdn)
        .bind(&event.service_id)
        .bind(&event.operation_id)
        .bind(&event.requested_plan)
        .bind(&event.correlation_key)
        .bind(&event.bearer_id)
        .bind(&event.charge_amount)
        .bind(&event.result_code)
        .bind(event.processing_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_marketer(&self, postback_url: &str) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing.marketers (prefix, name, payout, postback_url)
            VALUES ($1, $1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(&self.prefix)
        .bind(BigDecimal::from_str("2.50").unwrap())
        .bind(postback_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_conversion(
        &self,
        correlation_key: &str,
        activation: &str,
        description: &str,
    ) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing.conversion_records
                (subscriber_msisdn, product_id, trx_id, activation, description)
            VALUES ($1, 'P100', $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&self.msisdn)
        .bind(correlation_key)
        .bind(activation)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn audit_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM billing.subscription_audit WHERE correlation_key LIKE $1",
        )
        .bind(format!("{}%", self.prefix))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn cleanup(&self) -> Result<()> {
        let pattern = format!("{}%", self.prefix);
        sqlx::query("DELETE FROM billing.subscription_audit WHERE correlation_key LIKE $1")
            .bind(&pattern)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM billing.conversion_records WHERE trx_id LIKE $1")
            .bind(&pattern)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM billing.lifecycle_events WHERE correlation_key LIKE $1")
            .bind(&pattern)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM billing.marketers WHERE prefix = $1")
            .bind(&self.prefix)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM billing.subscribers WHERE msisdn = $1")
            .bind(&self.msisdn)
            .execute(&self.pool)
            .await
            .ok();
        Ok(())
    }
}

fn pipeline_config(fast: bool) -> PipelineConfig {
    if fast {
        PipelineConfig {
            retry_initial_delay: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(100),
            postback_timeout: Duration::from_secs(2),
            ..PipelineConfig::default()
        }
    } else {
        PipelineConfig::default()
    }
}

fn wire_pipeline(
    pool: &PgPool,
    config: PipelineConfig,
) -> Result<(Arc<AuditRecordProcessor>, Arc<TokioRetryQueue>)> {
    let notifier = Arc::new(PostbackNotifier::new(pool.clone(), &config)?);
    let worker = Arc::new(RetryWorker::new(pool.clone(), Arc::clone(&notifier)));
    let queue = Arc::new(TokioRetryQueue::start(worker));

    let classifier = Arc::new(StaticOperationClassifier::new([
        ("OP-SUB-1", OperationType::Subscription),
        ("OP-REN-1", OperationType::Renewal),
        ("OP-UNSUB-1", OperationType::Unsubscription),
    ]));

    let processor = Arc::new(AuditRecordProcessor::new(
        pool.clone(),
        classifier,
        Arc::new(PlanPrefixCatalog),
        ContextBuilder::new(Arc::clone(&queue) as _, config),
        notifier,
    ));

    Ok((processor, queue))
}

fn subscription_event(db: &TestDb, correlation_key: &str) -> LifecycleEvent {
    LifecycleEvent {
        subscriber_msisdn: db.msisdn.clone(),
        service_id: "SVC-7".to_string(),
        operation_id: "OP-SUB-1".to_string(),
        requested_plan: "P100_promo".to_string(),
        correlation_key: correlation_key.to_string(),
        bearer_id: "SecureD".to_string(),
        charge_amount: BigDecimal::from_str("50.00").unwrap(),
        result_code: "0".to_string(),
        processing_time: Utc::now(),
    }
}

/// One-connection HTTP sink capturing the request it receives.
async fn postback_sink() -> (String, tokio::task::JoinHandle<String>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        String::from_utf8_lossy(&request).to_string()
    });
    (format!("http://{addr}/pb"), handle)
}

// =========================================================================
// TESTS
// =========================================================================

#[tokio::test]
#[ignore = "requires a provisioned database"]
async fn validation_failure_creates_no_audit_record() -> Result<()> {
    let db = TestDb::new().await?;
    let (processor, _queue) = wire_pipeline(&db.pool, pipeline_config(false))?;

    let mut event = subscription_event(&db, &db.correlation_key("click123", "src9"));
    event.service_id = String::new();

    let result = processor.process_subscription_event(&event, None).await;
    assert!(matches!(
        result,
        Err(attribution_pipeline::PipelineError::Validation { field: "service_id" })
    ));
    assert_eq!(db.audit_count().await?, 0);

    db.cleanup().await
}

#[tokio::test]
#[ignore = "requires a provisioned database"]
async fn unknown_subscriber_is_a_benign_skip() -> Result<()> {
    let db = TestDb::new().await?;
    let (processor, _queue) = wire_pipeline(&db.pool, pipeline_config(false))?;

    // No subscriber row inserted.
    let event = subscription_event(&db, &db.correlation_key("click123", "src9"));
    let outcome = processor.process_subscription_event(&event, None).await?;

    assert!(matches!(outcome, ProcessOutcome::SkippedUnknownSubscriber));
    assert_eq!(db.audit_count().await?, 0);

    db.cleanup().await
}

/// Example A: tracked event, no conversion record yet.
#[tokio::test]
#[ignore = "requires a provisioned database"]
async fn unmatched_tracked_event_goes_pending() -> Result<()> {
    let db = TestDb::new().await?;
    let (processor, _queue) = wire_pipeline(&db.pool, pipeline_config(false))?;

    db.insert_subscriber().await?;
    let event = subscription_event(&db, &db.correlation_key("click123", "src9"));
    let source_id = db.insert_lifecycle_event(&event).await?;

    let outcome = processor.process_subscription_event(&event, None).await?;
    let ProcessOutcome::Completed(record) = outcome else {
        panic!("expected a completed audit record");
    };

    assert_eq!(record.product_id, "P100");
    assert!(record.marketer_id.is_none());
    assert!(!record.converted);
    assert!(record.comment.contains("attribution pending"));
    assert!(record.comment.contains("No Marketer Attribution"));
    assert_eq!(record.lifecycle_event_id, Some(source_id));
    assert_eq!(db.audit_count().await?, 1);

    let (processed,): (bool,) =
        sqlx::query_as("SELECT processed FROM billing.lifecycle_events WHERE id = $1")
            .bind(source_id)
            .fetch_one(&db.pool)
            .await?;
    assert!(processed);

    db.cleanup().await
}

/// Example B: conversion and marketer already present; postback fires once.
#[tokio::test]
#[ignore = "requires a provisioned database"]
async fn matched_tracked_event_attributes_and_posts_back() -> Result<()> {
    let db = TestDb::new().await?;
    let (processor, queue) = wire_pipeline(&db.pool, pipeline_config(false))?;

    let (postback_url, sink) = postback_sink().await;
    db.insert_subscriber().await?;
    let marketer_id = db.insert_marketer(&postback_url).await?;

    let key = db.correlation_key("click123", "src9");
    let conversion_id = db.insert_conversion(&key, "1", "Success").await?;

    let event = subscription_event(&db, &key);
    db.insert_lifecycle_event(&event).await?;

    let outcome = processor.process_subscription_event(&event, None).await?;
    let ProcessOutcome::Completed(record) = outcome else {
        panic!("expected a completed audit record");
    };

    assert_eq!(record.marketer_id, Some(marketer_id));
    assert_eq!(record.conversion_record_id, Some(conversion_id));
    assert!(record.converted);
    assert!(record.comment.contains("Postback: Success"));

    let request = sink.await?;
    assert!(request.contains("GET /pb?click_id=click123&payout=2.50&source_id=src9"));

    // Marketer resolved immediately, so nothing was scheduled for retry.
    assert!(queue.failed_history().is_empty());

    db.cleanup().await
}

/// Redelivering an already-processed event must not create a second audit
/// record; the processed flag on the source row is the (best-effort) guard.
#[tokio::test]
#[ignore = "requires a provisioned database"]
async fn redelivered_event_does_not_duplicate_the_audit_record() -> Result<()> {
    let db = TestDb::new().await?;
    let (processor, _queue) = wire_pipeline(&db.pool, pipeline_config(false))?;

    db.insert_subscriber().await?;
    let event = subscription_event(&db, &db.correlation_key("click123", "src9"));
    db.insert_lifecycle_event(&event).await?;

    let first = processor.process_subscription_event(&event, None).await?;
    assert!(matches!(first, ProcessOutcome::Completed(_)));
    assert_eq!(db.audit_count().await?, 1);

    let second = processor.process_subscription_event(&event, None).await?;
    assert!(matches!(second, ProcessOutcome::SkippedDuplicateDelivery));
    assert_eq!(db.audit_count().await?, 1);

    db.cleanup().await
}

/// Immediate flag mode evaluates acquisition in place: false before any
/// matching audit record exists, true once one is on file (the preserved
/// prior-record polarity). Deferred mode always leaves the placeholder.
#[tokio::test]
#[ignore = "requires a provisioned database"]
async fn immediate_flag_mode_observes_prior_records() -> Result<()> {
    let db = TestDb::new().await?;
    let config = pipeline_config(false);
    let (processor, queue) = wire_pipeline(&db.pool, config.clone())?;
    let builder = ContextBuilder::new(Arc::clone(&queue) as _, config);

    let subscriber_id = db.insert_subscriber().await?;
    // Postback target is irrelevant here; delivery failures are absorbed.
    db.insert_marketer("http://127.0.0.1:1/pb").await?;
    let key = db.correlation_key("click123", "src9");
    db.insert_conversion(&key, "1", "Success").await?;

    let event = subscription_event(&db, &key);
    let mut conn = db.pool.acquire().await?;

    let before = builder
        .build(
            &mut conn,
            &event,
            OperationType::Subscription,
            "P100",
            FlagMode::Immediate,
            None,
            Some(subscriber_id),
        )
        .await?;
    assert!(before.marketer.is_some());
    assert!(!before.is_acquisition);

    db.insert_lifecycle_event(&event).await?;
    let ProcessOutcome::Completed(_) =
        processor.process_subscription_event(&event, None).await?
    else {
        panic!("expected a completed audit record");
    };

    let after = builder
        .build(
            &mut conn,
            &event,
            OperationType::Subscription,
            "P100",
            FlagMode::Immediate,
            None,
            Some(subscriber_id),
        )
        .await?;
    assert!(after.is_acquisition);

    let deferred = builder
        .build(
            &mut conn,
            &event,
            OperationType::Subscription,
            "P100",
            FlagMode::Deferred,
            None,
            Some(subscriber_id),
        )
        .await?;
    assert!(!deferred.is_acquisition);

    db.cleanup().await
}

#[tokio::test]
#[ignore = "requires a provisioned database"]
async fn flag_update_is_an_idempotent_overwrite() -> Result<()> {
    use attribution_pipeline::database::audit_record_repository;

    let db = TestDb::new().await?;
    let (processor, _queue) = wire_pipeline(&db.pool, pipeline_config(false))?;

    db.insert_subscriber().await?;
    let event = subscription_event(&db, &db.correlation_key("click123", "src9"));
    db.insert_lifecycle_event(&event).await?;

    let ProcessOutcome::Completed(record) =
        processor.process_subscription_event(&event, None).await?
    else {
        panic!("expected a completed audit record");
    };

    let mut conn = db.pool.acquire().await?;
    audit_record_repository::update_business_intelligence_flags(&mut conn, record.id, true, false)
        .await?;
    audit_record_repository::update_business_intelligence_flags(&mut conn, record.id, true, false)
        .await?;

    let after = audit_record_repository::fetch(&mut conn, record.id)
        .await?
        .expect("record still present");
    assert!(after.acquired);
    assert!(!after.churned);

    db.cleanup().await
}

/// Conversion arrives between attempts: the retry attaches attribution and
/// the postback fires exactly once, from the retry path.
#[tokio::test]
#[ignore = "requires a provisioned database"]
async fn retry_converges_when_conversion_arrives_late() -> Result<()> {
    let db = TestDb::new().await?;
    let (processor, queue) = wire_pipeline(&db.pool, pipeline_config(true))?;

    let (postback_url, sink) = postback_sink().await;
    let marketer_id = db.insert_marketer(&postback_url).await?;
    db.insert_subscriber().await?;

    let key = db.correlation_key("click123", "src9");
    let event = subscription_event(&db, &key);
    db.insert_lifecycle_event(&event).await?;

    let ProcessOutcome::Completed(record) =
        processor.process_subscription_event(&event, None).await?
    else {
        panic!("expected a completed audit record");
    };
    assert!(record.marketer_id.is_none());

    // Feed catches up before the retry budget runs out.
    db.insert_conversion(&key, "1", "Success").await?;

    let request = sink.await?;
    assert!(request.contains("click_id=click123"));

    let mut conn = db.pool.acquire().await?;
    let after = attribution_pipeline::database::audit_record_repository::fetch(&mut conn, record.id)
        .await?
        .expect("record still present");
    assert_eq!(after.marketer_id, Some(marketer_id));
    assert!(after.converted);
    assert!(after.comment.contains("Postback: Success"));
    assert!(queue.failed_history().is_empty());

    db.cleanup().await
}

#[tokio::test]
#[ignore = "requires a provisioned database"]
async fn retry_exhaustion_annotates_the_record() -> Result<()> {
    let db = TestDb::new().await?;
    let (processor, queue) = wire_pipeline(&db.pool, pipeline_config(true))?;

    db.insert_subscriber().await?;
    let key = db.correlation_key("click123", "src9");
    let event = subscription_event(&db, &key);
    db.insert_lifecycle_event(&event).await?;

    let ProcessOutcome::Completed(record) =
        processor.process_subscription_event(&event, None).await?
    else {
        panic!("expected a completed audit record");
    };

    // No conversion ever arrives; three fast attempts then exhaustion.
    for _ in 0..100 {
        if !queue.failed_history().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let history = queue.failed_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].attempts, 3);

    let mut conn = db.pool.acquire().await?;
    let after = attribution_pipeline::database::audit_record_repository::fetch(&mut conn, record.id)
        .await?
        .expect("record still present");
    assert!(after
        .comment
        .ends_with("conversion record missing after 3 retries, processing incomplete"));
    assert!(after.marketer_id.is_none());

    db.cleanup().await
}
