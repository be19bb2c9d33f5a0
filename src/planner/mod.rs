//! Planning module.
//!
//! This module compares desired configuration with the applied state and
//! produces ordered execution plans.

mod diff;
mod plan;
mod resolve;

pub use diff::{
    AttributeDiff, AttributePath, ChangeAction, Differ, InstanceAction, InstanceDiff,
};
pub use plan::{Operation, OperationKind, Plan, PlanBuilder, ReplaceOrder};
pub use resolve::{Output, Outputs, Resolution, outputs_from_state, resolve};
