//! Resource schemas, attribute values and the schema registry.

mod registry;
mod types;
mod value;

pub use registry::{RegisteredType, SchemaRegistry, SchemaRegistryBuilder};
pub use types::{
    AttributeKind, AttributeSchema, DiffSuppress, InstanceId, Presence, PrimitiveType,
    ResourceType,
};
pub use value::{Attributes, Reference, Value};
