//! Marketer attribution: prefix resolution, acquisition/churn
//! classification, and context assembly for one lifecycle event.

pub mod classifier;
pub mod context;
pub mod resolver;

pub use context::{AttributionContext, ContextBuilder, FlagMode};
