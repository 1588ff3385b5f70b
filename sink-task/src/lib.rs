//! Sink task runtime: consumes records from a partitioned log, hands them to a
//! [`sink::SinkTask`] and commits the offsets the sink has durably written.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` for the full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors, they only show the top-level message.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source. Avoid `anyhow!("...{e}")`, which formats the error into a string and drops the chain.

pub mod commit;
pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod offset_ledger;
pub mod pipeline;
pub mod rebalance;
pub mod redelivery;
pub mod serve;
pub mod sink;
pub mod sinks;
pub mod status;
pub mod task;
pub mod time;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

pub use error::{SinkError, TaskError, TaskFailure};
pub use sink::{RecordBatch, SinkTask};
pub use task::WorkerSinkTask;
