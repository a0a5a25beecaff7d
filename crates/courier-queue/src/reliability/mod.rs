//! Reliability primitives: retry bound and stage timeouts

mod retry;
mod timeout;

pub use retry::RetryPolicy;
pub use timeout::{run_with_timeout, TimeoutError};
