//! Pipeline entry points: the audit processor and the event orchestrator,
//! plus the seams to externally-owned collaborators.

pub mod collaborators;
pub mod orchestrator;
pub mod processor;

pub use collaborators::{
    OperationClassifier, PlanPrefixCatalog, ProductCatalog, StaticOperationClassifier,
};
pub use orchestrator::{EventKind, EventOrchestrator};
pub use processor::{AuditRecordProcessor, ProcessOutcome};
