//! Typed dispatch of classified lifecycle events.
//!
//! Whatever transport delivers the event (queue consumer, webhook handler)
//! names one of the known triggers; the orchestrator maps it through an
//! explicit dispatch table to a handler driving the processor. Failures
//! are logged with the originating event's discriminants and returned, so
//! the upstream at-least-once mechanism can redeliver.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{error, info};

use crate::error::PipelineError;
use crate::models::LifecycleEvent;

use super::processor::{AuditRecordProcessor, ProcessOutcome};

/// The named triggers the transport can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Process,
    Renewal,
    Unsubscription,
    AuditOnly,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Process,
        EventKind::Renewal,
        EventKind::Unsubscription,
        EventKind::AuditOnly,
    ];

    pub fn from_trigger(trigger: &str) -> Option<Self> {
        match trigger {
            "process" => Some(EventKind::Process),
            "renewal" => Some(EventKind::Renewal),
            "unsubscription" => Some(EventKind::Unsubscription),
            "audit-only" => Some(EventKind::AuditOnly),
            _ => None,
        }
    }

    pub fn trigger(&self) -> &'static str {
        match self {
            EventKind::Process => "process",
            EventKind::Renewal => "renewal",
            EventKind::Unsubscription => "unsubscription",
            EventKind::AuditOnly => "audit-only",
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<ProcessOutcome, PipelineError>> + Send>>;
type EventHandler =
    Box<dyn Fn(Arc<AuditRecordProcessor>, LifecycleEvent) -> HandlerFuture + Send + Sync>;

pub struct EventOrchestrator {
    processor: Arc<AuditRecordProcessor>,
    handlers: HashMap<EventKind, EventHandler>,
}

impl EventOrchestrator {
    pub fn new(processor: Arc<AuditRecordProcessor>) -> Self {
        let mut handlers: HashMap<EventKind, EventHandler> = HashMap::new();
        for kind in EventKind::ALL {
            handlers.insert(
                kind,
                Box::new(move |processor, event| {
                    Box::pin(async move {
                        processor.process_subscription_event(&event, None).await
                    })
                }),
            );
        }
        Self {
            processor,
            handlers,
        }
    }

    /// Dispatch by trigger name as delivered by the transport.
    pub async fn dispatch_trigger(
        &self,
        trigger: &str,
        event: LifecycleEvent,
    ) -> Result<ProcessOutcome, PipelineError> {
        let kind = EventKind::from_trigger(trigger)
            .ok_or_else(|| PipelineError::Dispatch(trigger.to_string()))?;
        self.dispatch(kind, event).await
    }

    /// Dispatch an already-typed event kind.
    pub async fn dispatch(
        &self,
        kind: EventKind,
        event: LifecycleEvent,
    ) -> Result<ProcessOutcome, PipelineError> {
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| PipelineError::Dispatch(kind.trigger().to_string()))?;

        let msisdn = event.subscriber_msisdn.clone();
        let correlation_key = event.correlation_key.clone();

        match handler(Arc::clone(&self.processor), event).await {
            Ok(outcome) => {
                info!(
                    trigger = kind.trigger(),
                    msisdn = %msisdn,
                    "lifecycle event processed"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    trigger = kind.trigger(),
                    msisdn = %msisdn,
                    correlation_key = %correlation_key,
                    error = %e,
                    "lifecycle event processing failed"
                );
                Err(e)
            }
        }
    }
}
