//! Plan execution.
//!
//! Applies a [`Plan`](crate::planner::Plan) concurrently, respecting its
//! ordering edges, retrying transient provider errors, and committing every
//! completed operation to state before its dependents may start.

mod lock_table;
mod result;
mod retry;
mod scheduler;

pub use lock_table::LockTable;
pub use result::{ApplyResult, FailedOperation, OperationReport, SkipReason, SkippedOperation};
pub use retry::RetryPolicy;
pub use scheduler::{DEFAULT_PARALLELISM, Executor};
