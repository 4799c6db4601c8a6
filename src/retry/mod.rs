//! Bounded-attempt correlation retry: scheduling abstraction, in-process
//! queue, and the worker that re-resolves attribution once conversion data
//! arrives.

pub mod queue;
pub mod worker;

pub use queue::{FailedDelivery, RetryHandler, RetryScheduler, RetryTask, TokioRetryQueue};
pub use worker::RetryWorker;
