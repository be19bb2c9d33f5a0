// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Converge
//!
//! A declarative state-diff-and-apply reconciliation engine for
//! infrastructure resources.
//!
//! ## Overview
//!
//! Converge takes a desired configuration of typed resource instances,
//! compares it with the last applied state, and drives resource adapters
//! until the two match:
//!
//! - Define your infrastructure as code in a YAML manifest
//! - Preview every create, update, replacement and destroy before it runs
//! - Apply changes concurrently in dependency order
//! - Survive crashes with a write-ahead state journal
//! - Detect and refresh drift made outside of converge
//!
//! ## Architecture
//!
//! 1. **Desired State**: the manifest, validated against the schema registry
//! 2. **Applied State**: the last committed snapshot plus its journal
//! 3. **Plan**: a dependency-ordered list of operations computed from the diff
//! 4. **Executor**: applies the plan on a bounded pool, committing each step
//!
//! ## Modules
//!
//! - [`schema`]: Resource types, attribute values and the schema registry
//! - [`config`]: Manifest parsing and validation
//! - [`state`]: Transactional state storage (local directory, memory)
//! - [`graph`]: Dependency graph construction and cycle detection
//! - [`planner`]: Diff computation and plan building
//! - [`executor`]: Concurrent plan execution with retries
//! - [`provider`]: Resource adapter interface and the sandbox provider
//! - [`reconciler`]: Plan/apply/refresh entry points
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: my-stack
//!   environment: dev
//!
//! resources:
//!   - type: network
//!     name: main
//!     attributes:
//!       cidr: 10.0.0.0/16
//!   - type: server
//!     name: web
//!     attributes:
//!       image: ubuntu-24.04
//!       network_id: "${network.main.id}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod schema;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DesiredState, Manifest};
pub use error::{ConvergeError, Result};
pub use executor::{ApplyResult, Executor, LockTable, RetryPolicy};
pub use graph::DependencyGraph;
pub use planner::{Differ, Plan, PlanBuilder};
pub use provider::{ResourceAdapter, SandboxCloud};
pub use reconciler::{DriftReport, ReconcileOptions, Reconciler, RefreshReport};
pub use schema::{InstanceId, ResourceType, SchemaRegistry, Value};
pub use state::{LocalStateStore, MemoryStateStore, StateStore, StateTransaction};
