//! Interfaces to subsystems owned outside this pipeline.
//!
//! Operation-id classification and the product catalog are external
//! collaborators; only their seams live here. The shipped implementations
//! cover tests, demos and simple deployments.

use std::collections::HashMap;

use anyhow::anyhow;

use crate::models::OperationType;

/// Maps a raw carrier operation id to an operation type.
pub trait OperationClassifier: Send + Sync {
    fn classify(&self, operation_id: &str) -> anyhow::Result<OperationType>;
}

/// Derives the catalog product id behind a requested plan code.
pub trait ProductCatalog: Send + Sync {
    fn product_for_plan(&self, requested_plan: &str) -> Option<String>;
}

/// Exact-match classification table.
pub struct StaticOperationClassifier {
    table: HashMap<String, OperationType>,
}

impl StaticOperationClassifier {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, OperationType)>,
        S: Into<String>,
    {
        Self {
            table: entries
                .into_iter()
                .map(|(id, op)| (id.into(), op))
                .collect(),
        }
    }
}

impl OperationClassifier for StaticOperationClassifier {
    fn classify(&self, operation_id: &str) -> anyhow::Result<OperationType> {
        self.table
            .get(operation_id)
            .copied()
            .ok_or_else(|| anyhow!("unknown operation id '{operation_id}'"))
    }
}

/// Catalog convention: the product id is the plan code up to the first
/// underscore (`P100_promo` -> `P100`).
pub struct PlanPrefixCatalog;

impl ProductCatalog for PlanPrefixCatalog {
    fn product_for_plan(&self, requested_plan: &str) -> Option<String> {
        let head = requested_plan.split('_').next().unwrap_or("");
        if head.is_empty() {
            None
        } else {
            Some(head.to_string())
        }
    }
}
