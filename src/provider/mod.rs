//! Resource adapters.
//!
//! The [`ResourceAdapter`] trait is the engine's only view of a provider.
//! The built-in sandbox provider simulates a small cloud in process.

mod adapter;
pub mod catalog;
mod sandbox;

#[cfg(test)]
pub use adapter::MockResourceAdapter;
pub use adapter::{Created, ResourceAdapter};
pub use sandbox::{CLOUD_FILE, CallKind, CallRecord, Fault, SandboxAdapter, SandboxCloud};
