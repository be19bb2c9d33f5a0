//! Resource adapter capability interface.
//!
//! An adapter is the only code that talks to a provider. The engine never
//! inspects provider identifiers; it stores them and hands them back.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::planner::InstanceDiff;
use crate::schema::Attributes;

/// Result of a successful create call.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Opaque provider identifier.
    pub id: String,
    /// Attributes as reported by the provider, computed ones included.
    pub attributes: Attributes,
}

/// CRUD capability implemented once per resource type.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    /// Creates a new object from fully resolved attributes.
    async fn create(&self, attributes: &Attributes) -> Result<Created, ProviderError>;

    /// Reads an object back. `None` means it no longer exists.
    async fn read(&self, id: &str) -> Result<Option<Attributes>, ProviderError>;

    /// Applies an in-place update and returns the new attributes.
    async fn update(&self, id: &str, diff: &InstanceDiff) -> Result<Attributes, ProviderError>;

    /// Deletes an object.
    async fn delete(&self, id: &str) -> Result<(), ProviderError>;
}
