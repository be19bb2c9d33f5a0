//! In-process simulated cloud.
//!
//! Objects live in memory, keyed by resource type and generated provider
//! id, and can optionally be persisted to a JSON file so separate CLI runs
//! see the same cloud. Faults and latency can be injected to exercise retry
//! and failure handling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, ProviderError, Result, StateError};
use crate::planner::InstanceDiff;
use crate::schema::{Attributes, Value};

use super::adapter::{Created, ResourceAdapter};

/// File name of the persisted cloud.
pub const CLOUD_FILE: &str = "cloud.json";

/// Provider call kinds, used for fault matching and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Create call.
    Create,
    /// Read call.
    Read,
    /// Update call.
    Update,
    /// Delete call.
    Delete,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Resource type.
    pub resource_type: String,
    /// Call kind.
    pub kind: CallKind,
    /// Target provider id, absent for creates.
    pub id: Option<String>,
}

/// An injected failure.
#[derive(Debug, Clone)]
pub struct Fault {
    resource_type: String,
    kind: CallKind,
    error: ProviderError,
    remaining: Option<u32>,
    id: Option<String>,
    attribute: Option<(String, Value)>,
}

impl Fault {
    /// Fails every matching call with `error`.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, kind: CallKind, error: ProviderError) -> Self {
        Self {
            resource_type: resource_type.into(),
            kind,
            error,
            remaining: None,
            id: None,
            attribute: None,
        }
    }

    /// Only the next `n` matching calls fail.
    #[must_use]
    pub const fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    /// Only calls on this provider id fail.
    #[must_use]
    pub fn on_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Only creates whose attributes carry this value fail.
    #[must_use]
    pub fn when(mut self, attribute: impl Into<String>, value: Value) -> Self {
        self.attribute = Some((attribute.into(), value));
        self
    }

    fn matches(
        &self,
        resource_type: &str,
        kind: CallKind,
        id: Option<&str>,
        attributes: Option<&Attributes>,
    ) -> bool {
        if self.resource_type != resource_type || self.kind != kind {
            return false;
        }
        if let Some(expected) = &self.id
            && id != Some(expected.as_str())
        {
            return false;
        }
        if let Some((key, value)) = &self.attribute
            && attributes.and_then(|a| a.get(key)) != Some(value)
        {
            return false;
        }
        self.remaining != Some(0)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Objects {
    next_id: u64,
    objects: BTreeMap<String, BTreeMap<String, Attributes>>,
}

#[derive(Debug, Default)]
struct Inner {
    store: Objects,
    faults: Vec<Fault>,
    calls: Vec<CallRecord>,
}

/// Simulated cloud shared by the sandbox adapters.
#[derive(Debug, Default)]
pub struct SandboxCloud {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SandboxCloud {
    /// Creates an empty, memory-only cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the cloud persisted in `dir`, creating an empty one if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CLOUD_FILE);
        let store = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content).map_err(|e| {
                ConvergeError::State(StateError::serialization(format!(
                    "Failed to parse {}: {e}",
                    path.display()
                )))
            })?
        } else {
            Objects::default()
        };
        debug!("Opened sandbox cloud at {}", path.display());
        Ok(Self {
            inner: Mutex::new(Inner {
                store,
                ..Inner::default()
            }),
            path: Some(path),
            ..Self::default()
        })
    }

    /// Adds artificial latency to every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Injects a fault.
    pub async fn inject(&self, fault: Fault) {
        self.inner.lock().await.faults.push(fault);
    }

    /// Removes all injected faults.
    pub async fn clear_faults(&self) {
        self.inner.lock().await.faults.clear();
    }

    /// Every call made so far.
    pub async fn calls(&self) -> Vec<CallRecord> {
        self.inner.lock().await.calls.clone()
    }

    /// Number of calls of one kind.
    pub async fn call_count(&self, kind: CallKind) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .count()
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Attributes of one object.
    pub async fn object(&self, resource_type: &str, id: &str) -> Option<Attributes> {
        self.inner
            .lock()
            .await
            .store
            .objects
            .get(resource_type)
            .and_then(|objects| objects.get(id))
            .cloned()
    }

    /// Provider ids of every object of a type.
    pub async fn ids(&self, resource_type: &str) -> Vec<String> {
        self.inner
            .lock()
            .await
            .store
            .objects
            .get(resource_type)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Changes an attribute behind the engine's back.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object does not exist.
    pub async fn set_attribute(
        &self,
        resource_type: &str,
        id: &str,
        key: &str,
        value: Value,
    ) -> std::result::Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        let object = inner
            .store
            .objects
            .get_mut(resource_type)
            .and_then(|objects| objects.get_mut(id))
            .ok_or_else(|| not_found(id))?;
        object.insert(key.to_string(), value);
        self.persist(&inner.store).await
    }

    /// Deletes an object behind the engine's back.
    pub async fn remove_object(&self, resource_type: &str, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner
            .store
            .objects
            .get_mut(resource_type)
            .and_then(|objects| objects.remove(id))
            .is_some();
        if removed && let Err(e) = self.persist(&inner.store).await {
            warn!("Failed to persist sandbox cloud: {e}");
        }
        removed
    }

    /// Returns an adapter for one resource type.
    #[must_use]
    pub fn adapter_for(self: &Arc<Self>, resource_type: &str) -> SandboxAdapter {
        SandboxAdapter {
            cloud: Arc::clone(self),
            resource_type: resource_type.to_string(),
        }
    }

    async fn persist(&self, store: &Objects) -> std::result::Result<(), ProviderError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(store)
            .map_err(|e| ProviderError::api(500, format!("serialize cloud: {e}")))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::network(format!("write cloud: {e}")))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ProviderError::network(format!("write cloud: {e}")))
    }

    /// Records the call, waits out the latency, then checks for faults.
    async fn enter(
        &self,
        resource_type: &str,
        kind: CallKind,
        id: Option<&str>,
        attributes: Option<&Attributes>,
    ) -> std::result::Result<InFlight<'_>, ProviderError> {
        let guard = InFlight::new(self);
        {
            let mut inner = self.inner.lock().await;
            inner.calls.push(CallRecord {
                resource_type: resource_type.to_string(),
                kind,
                id: id.map(ToString::to_string),
            });
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner
            .faults
            .iter_mut()
            .find(|f| f.matches(resource_type, kind, id, attributes))
        {
            if let Some(remaining) = fault.remaining.as_mut() {
                *remaining -= 1;
            }
            debug!(resource_type, ?kind, "Injected fault: {}", fault.error);
            return Err(fault.error.clone());
        }
        Ok(guard)
    }
}

/// Tracks calls in flight for the peak-concurrency probe.
struct InFlight<'a> {
    cloud: &'a SandboxCloud,
}

impl<'a> InFlight<'a> {
    fn new(cloud: &'a SandboxCloud) -> Self {
        let now = cloud.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        cloud.peak.fetch_max(now, Ordering::SeqCst);
        Self { cloud }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.cloud.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn not_found(id: &str) -> ProviderError {
    ProviderError::NotFound { id: id.to_string() }
}

fn id_prefix(resource_type: &str) -> &str {
    match resource_type {
        "network" => "net",
        "server" => "srv",
        "volume" => "vol",
        "floating_ip" => "fip",
        other => other,
    }
}

/// Adapter for one resource type of the sandbox cloud.
#[derive(Debug, Clone)]
pub struct SandboxAdapter {
    cloud: Arc<SandboxCloud>,
    resource_type: String,
}

impl SandboxAdapter {
    /// Checks cross-object rules before a create or update.
    fn check(inner: &Inner, resource_type: &str, attributes: &Attributes) -> std::result::Result<(), ProviderError> {
        let exists = |kind: &str, key: &str| -> std::result::Result<(), ProviderError> {
            match attributes.get(key).and_then(Value::as_str) {
                Some(id) if !inner.store.objects.get(kind).is_some_and(|o| o.contains_key(id)) => {
                    Err(ProviderError::validation(format!("{key} {id} does not exist")))
                }
                _ => Ok(()),
            }
        };
        match resource_type {
            "subnet" | "server" => exists("network", "network_id"),
            "floating_ip" => {
                if attributes.contains_key("region") && attributes.contains_key("server_id") {
                    return Err(ProviderError::validation(
                        "region and server_id are mutually exclusive",
                    ));
                }
                exists("server", "server_id")
            }
            _ => Ok(()),
        }
    }

    /// Objects whose attributes still point at `id`.
    fn users_of(inner: &Inner, id: &str) -> Vec<String> {
        let needle = Value::string(id);
        let needle = &needle;
        inner
            .store
            .objects
            .iter()
            .flat_map(|(kind, objects)| {
                objects.iter().filter_map(move |(user, attributes)| {
                    let uses = attributes.values().any(|v| match v {
                        Value::Set(items) | Value::List(items) => items.contains(needle),
                        scalar => scalar == needle,
                    });
                    uses.then(|| format!("{kind}/{user}"))
                })
            })
            .collect()
    }

    fn computed(&self, id: &str, serial: u64, attributes: &mut Attributes) {
        match self.resource_type.as_str() {
            "network" => {
                attributes.insert(
                    String::from("arn"),
                    Value::string(format!("arn:sandbox:network/{id}")),
                );
            }
            "subnet" => {
                attributes
                    .entry(String::from("zone"))
                    .or_insert_with(|| Value::string("zone-a"));
            }
            "server" => {
                attributes.insert(
                    String::from("public_ip"),
                    Value::string(format!("203.0.113.{}", serial % 250 + 1)),
                );
            }
            "floating_ip" => {
                attributes.insert(
                    String::from("ip"),
                    Value::string(format!("198.51.100.{}", serial % 250 + 1)),
                );
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ResourceAdapter for SandboxAdapter {
    async fn create(&self, attributes: &Attributes) -> std::result::Result<Created, ProviderError> {
        let _call = self
            .cloud
            .enter(&self.resource_type, CallKind::Create, None, Some(attributes))
            .await?;
        if !attributes.values().all(Value::is_known) {
            return Err(ProviderError::validation("create called with unresolved values"));
        }

        let mut inner = self.cloud.inner.lock().await;
        Self::check(&inner, &self.resource_type, attributes)?;

        inner.store.next_id += 1;
        let serial = inner.store.next_id;
        let id = format!("{}-{serial:04}", id_prefix(&self.resource_type));
        let mut stored = attributes.clone();
        self.computed(&id, serial, &mut stored);
        inner
            .store
            .objects
            .entry(self.resource_type.clone())
            .or_default()
            .insert(id.clone(), stored.clone());
        self.cloud.persist(&inner.store).await?;

        info!(resource_type = %self.resource_type, id = %id, "Sandbox object created");
        Ok(Created {
            id,
            attributes: stored,
        })
    }

    async fn read(&self, id: &str) -> std::result::Result<Option<Attributes>, ProviderError> {
        let _call = self
            .cloud
            .enter(&self.resource_type, CallKind::Read, Some(id), None)
            .await?;
        Ok(self.cloud.object(&self.resource_type, id).await)
    }

    async fn update(&self, id: &str, diff: &InstanceDiff) -> std::result::Result<Attributes, ProviderError> {
        let _call = self
            .cloud
            .enter(&self.resource_type, CallKind::Update, Some(id), None)
            .await?;

        let mut inner = self.cloud.inner.lock().await;
        let current = inner
            .store
            .objects
            .get(&self.resource_type)
            .and_then(|objects| objects.get(id))
            .ok_or_else(|| not_found(id))?;
        let updated = diff.apply_to(current);
        if !updated.values().all(Value::is_known) {
            return Err(ProviderError::validation("update called with unresolved values"));
        }
        Self::check(&inner, &self.resource_type, &updated)?;

        inner
            .store
            .objects
            .entry(self.resource_type.clone())
            .or_default()
            .insert(id.to_string(), updated.clone());
        self.cloud.persist(&inner.store).await?;

        info!(resource_type = %self.resource_type, id, changes = diff.attributes.len(), "Sandbox object updated");
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> std::result::Result<(), ProviderError> {
        let _call = self
            .cloud
            .enter(&self.resource_type, CallKind::Delete, Some(id), None)
            .await?;

        let mut inner = self.cloud.inner.lock().await;
        let exists = inner
            .store
            .objects
            .get(&self.resource_type)
            .is_some_and(|objects| objects.contains_key(id));
        if !exists {
            return Err(not_found(id));
        }
        let users = Self::users_of(&inner, id);
        if !users.is_empty() {
            return Err(ProviderError::validation(format!(
                "{id} is still in use by {}",
                users.join(", ")
            )));
        }
        if let Some(objects) = inner.store.objects.get_mut(&self.resource_type) {
            objects.remove(id);
        }
        self.cloud.persist(&inner.store).await?;

        info!(resource_type = %self.resource_type, id, "Sandbox object deleted");
        Ok(())
    }
}
