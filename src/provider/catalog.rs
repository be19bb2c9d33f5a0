//! Resource types offered by the sandbox cloud.

use std::sync::Arc;

use crate::error::ConfigError;
use crate::schema::{
    AttributeKind, AttributeSchema, DiffSuppress, PrimitiveType, ResourceType, SchemaRegistry,
    Value,
};

use super::sandbox::SandboxCloud;

fn tags() -> AttributeSchema {
    AttributeSchema::optional("tags", AttributeKind::Map(PrimitiveType::String))
}

/// `network`: an address space. Changing the CIDR replaces it.
#[must_use]
pub fn network() -> ResourceType {
    ResourceType::new("network")
        .with_attribute(AttributeSchema::required("cidr", AttributeKind::string()).force_new())
        .with_attribute(AttributeSchema::optional("name", AttributeKind::string()))
        .with_attribute(tags())
        .with_attribute(AttributeSchema::computed("arn", AttributeKind::string()))
}

/// `subnet`: a slice of a network, pinned to a zone.
#[must_use]
pub fn subnet() -> ResourceType {
    ResourceType::new("subnet")
        .with_attribute(
            AttributeSchema::required("network_id", AttributeKind::string()).force_new(),
        )
        .with_attribute(AttributeSchema::required("cidr", AttributeKind::string()).force_new())
        .with_attribute(
            AttributeSchema::optional_computed("zone", AttributeKind::string())
                .suppress(DiffSuppress::CaseInsensitive),
        )
}

/// `server`: replaced with create-before-destroy ordering.
#[must_use]
pub fn server() -> ResourceType {
    ResourceType::new("server")
        .with_create_before_destroy()
        .with_attribute(AttributeSchema::required("image", AttributeKind::string()).force_new())
        .with_attribute(
            AttributeSchema::optional("size", AttributeKind::string())
                .with_default(Value::string("small")),
        )
        .with_attribute(AttributeSchema::optional("network_id", AttributeKind::string()))
        .with_attribute(AttributeSchema::optional(
            "subnet_ids",
            AttributeKind::set(AttributeKind::string()),
        ))
        .with_attribute(tags())
        .with_attribute(AttributeSchema::computed("public_ip", AttributeKind::string()))
}

/// `volume`: block storage bound to a zone.
#[must_use]
pub fn volume() -> ResourceType {
    ResourceType::new("volume")
        .with_attribute(AttributeSchema::required("size", AttributeKind::int()))
        .with_attribute(
            AttributeSchema::required("zone", AttributeKind::string())
                .force_new()
                .suppress(DiffSuppress::TrimWhitespace),
        )
        .with_attribute(tags())
}

/// `floating_ip`: either reserved in a region or attached to a server.
#[must_use]
pub fn floating_ip() -> ResourceType {
    ResourceType::new("floating_ip")
        .with_attribute(AttributeSchema::optional("region", AttributeKind::string()).force_new())
        .with_attribute(AttributeSchema::optional("server_id", AttributeKind::string()))
        .with_attribute(AttributeSchema::computed("ip", AttributeKind::string()))
}

/// Builds a registry with every sandbox type bound to `cloud`.
///
/// # Errors
///
/// Returns an error if two types share a name.
pub fn registry(cloud: &Arc<SandboxCloud>) -> Result<SchemaRegistry, ConfigError> {
    [network(), subnet(), server(), volume(), floating_ip()]
        .into_iter()
        .fold(SchemaRegistry::builder(), |builder, schema| {
            let adapter = Arc::new(cloud.adapter_for(&schema.name));
            builder.register(schema, adapter)
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Presence;

    #[test]
    fn test_catalogue_types() {
        let cloud = Arc::new(SandboxCloud::new());
        let registry = registry(&cloud).expect("registry");
        let mut names: Vec<&str> = registry.type_names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["floating_ip", "network", "server", "subnet", "volume"]);
    }

    #[test]
    fn test_server_replacement_policy() {
        let server = server();
        assert!(server.create_before_destroy);
        assert!(server.attribute("image").is_some_and(|a| a.force_new));
        assert!(server.attribute("network_id").is_some_and(|a| !a.force_new));
        assert_eq!(
            server.attribute("public_ip").map(|a| a.presence),
            Some(Presence::Computed)
        );
    }
}
