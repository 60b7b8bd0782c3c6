//! Tower middleware stages for the filter chain.
//!
//! - [`observe`]: Observer notifications and the per-dispatch tracing span
//! - [`concurrency_limit`]: Semaphore-based load shedding
//! - [`retry`]: Re-runs the chain on transient failures
//! - [`outbox`]: Flushes produced messages only after success
//! - [`timeout`]: Per-dispatch timeout and cancellation

pub mod concurrency_limit;
pub mod observe;
pub mod outbox;
pub mod retry;
pub mod timeout;

pub use concurrency_limit::ConcurrencyLimitLayer;
pub use observe::ObserveLayer;
pub use outbox::OutboxLayer;
pub use retry::RetryLayer;
pub use timeout::TimeoutLayer;
