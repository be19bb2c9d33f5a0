//! Reconciler driving the plan/apply loop.
//!
//! Wires the pieces together: configuration is validated into a desired
//! state, planned against the stored state, and applied through the
//! executor inside a locked state transaction. Refresh and drift detection
//! read every recorded object back from its provider.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, DesiredState, EngineConfig, Manifest};
use crate::error::{ConvergeError, PlanError, Result, StateError};
use crate::executor::{ApplyResult, DEFAULT_PARALLELISM, Executor, LockTable, RetryPolicy};
use crate::graph::DependencyGraph;
use crate::planner::{Differ, Plan, PlanBuilder};
use crate::schema::{Attributes, InstanceId, SchemaRegistry};
use crate::state::{
    InstanceState, RunHistoryEntry, RunOperation, StateSnapshot, StateStore, StateTransaction,
    generate_holder_id,
};

/// Execution settings for a reconciler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileOptions {
    /// Concurrent provider operations.
    pub parallelism: usize,
    /// Retry policy for provider calls.
    pub retry: RetryPolicy,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            retry: RetryPolicy::default(),
        }
    }
}

impl ReconcileOptions {
    /// Builds options from the manifest's engine section.
    #[must_use]
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self {
            parallelism: engine.parallelism.max(1),
            retry: RetryPolicy::from_engine(engine),
        }
    }
}

/// Reconciler for one state.
pub struct Reconciler {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn StateStore>,
    locks: Arc<LockTable>,
    options: ReconcileOptions,
    holder: String,
    hasher: ConfigHasher,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("backend", &self.store.backend_type())
            .field("options", &self.options)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

/// How a recorded object compares with what its provider reports.
#[derive(Debug)]
enum Observation {
    Unchanged,
    Drifted {
        attributes: Attributes,
        changes: Vec<String>,
    },
    Vanished,
    Failed(String),
}

/// An instance whose provider-side attributes moved.
#[derive(Debug, Clone, Serialize)]
pub struct DriftedInstance {
    /// Instance address.
    pub instance: InstanceId,
    /// Changed attribute paths.
    pub changes: Vec<String>,
}

/// Result of a drift check.
#[derive(Debug, Default, Serialize)]
pub struct DriftReport {
    /// Instances checked.
    pub checked: usize,
    /// Instances whose attributes changed outside the engine.
    pub drifted: Vec<DriftedInstance>,
    /// Instances whose objects no longer exist.
    pub vanished: Vec<InstanceId>,
    /// Instances that could not be read.
    pub errors: Vec<(InstanceId, String)>,
}

impl DriftReport {
    /// Returns true if every object matches the state.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drifted.is_empty() && self.vanished.is_empty()
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_converged() {
            write!(f, "No drift detected - {} instance(s) match the state", self.checked)?;
        } else {
            writeln!(f, "Drift detected:")?;
            for d in &self.drifted {
                writeln!(f, "  ~ {} ({})", d.instance, d.changes.join(", "))?;
            }
            for v in &self.vanished {
                writeln!(f, "  - {v} (deleted outside of converge)")?;
            }
        }
        for (instance, message) in &self.errors {
            write!(f, "\n  ! {instance}: {message}")?;
        }
        Ok(())
    }
}

/// Result of a refresh.
#[derive(Debug, Default, Serialize)]
pub struct RefreshReport {
    /// What was found.
    #[serde(flatten)]
    pub drift: DriftReport,
    /// Serial of the finalized state.
    pub serial: Option<u64>,
}

impl fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Refreshed {} instance(s): {} updated, {} removed",
            self.drift.checked,
            self.drift.drifted.len(),
            self.drift.vanished.len()
        )?;
        if !self.drift.errors.is_empty() {
            write!(f, ", {} unreadable", self.drift.errors.len())?;
        }
        Ok(())
    }
}

impl Reconciler {
    /// Creates a reconciler over `store`.
    #[must_use]
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            locks: Arc::new(LockTable::new()),
            options: ReconcileOptions::default(),
            holder: generate_holder_id(),
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets execution options.
    #[must_use]
    pub const fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the identity recorded in the state lock.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// The registry in use.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// The state store in use.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Validates a manifest into a desired state.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn desired_state(&self, manifest: &Manifest) -> Result<DesiredState> {
        ConfigValidator::new(Arc::clone(&self.registry)).desired_state(manifest)
    }

    /// Plans a manifest.
    ///
    /// # Errors
    ///
    /// Returns validation, graph, or state errors.
    pub async fn plan_manifest(&self, manifest: &Manifest) -> Result<Plan> {
        let desired = self.desired_state(manifest)?;
        self.plan(&desired).await
    }

    /// Computes the operations that bring the stored state to `desired`.
    ///
    /// # Errors
    ///
    /// Returns a cycle or reference error from the graph, or a state load
    /// error. Nothing is mutated.
    pub async fn plan(&self, desired: &DesiredState) -> Result<Plan> {
        let snapshot = self.store.load().await?;
        let empty = StateSnapshot::new();
        let base = snapshot.as_ref().unwrap_or(&empty);
        debug!(
            desired = desired.len(),
            recorded = base.instances.len(),
            "Planning"
        );

        let graph = DependencyGraph::build(desired, base)?;
        let config_hash = self.hasher.hash_desired(desired);
        let plan = PlanBuilder::new(Arc::clone(&self.registry)).build(
            &graph,
            desired,
            snapshot.as_ref(),
            &config_hash,
        )?;

        info!(
            creates = plan.create_count(),
            updates = plan.update_count(),
            destroys = plan.destroy_count(),
            unchanged = plan.unchanged,
            "Plan computed"
        );
        Ok(plan)
    }

    /// Applies a plan.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentModification` if another run holds the state,
    /// `StalePlan` if the state moved since planning, or a fatal error
    /// raised during execution. Per-operation failures are reported in the
    /// result.
    pub async fn apply(&self, plan: &Plan, cancel: CancellationToken) -> Result<ApplyResult> {
        if plan.is_empty() {
            info!("No changes required - state is converged");
            return Ok(ApplyResult::default());
        }

        let txn = Arc::new(StateTransaction::begin(Arc::clone(&self.store), &self.holder, "apply").await?);
        let aborted = |e: &ConvergeError| {
            RunHistoryEntry::new(RunOperation::Apply, &plan.config_hash).failed(&e.to_string())
        };
        if let Err(e) = Self::check_base(plan, &txn.snapshot().await) {
            Self::abort(&txn, aborted(&e)).await;
            return Err(e);
        }

        let executor = Executor::new(Arc::clone(&self.registry), Arc::clone(&txn), Arc::clone(&self.locks))
            .with_parallelism(self.options.parallelism)
            .with_retry(self.options.retry)
            .with_cancellation(cancel);

        let mut result = match executor.apply(plan).await {
            Ok(result) => result,
            Err(e) => {
                error!("Apply stopped: {e}");
                Self::abort(&txn, aborted(&e)).await;
                return Err(e);
            }
        };

        let mut entry = RunHistoryEntry::new(RunOperation::Apply, &plan.config_hash).with_counts(
            result.completed.len(),
            result.failed.len(),
            result.skipped.len(),
        );
        if result.cancelled {
            entry = entry.failed("cancelled");
        } else if let Some(first) = result.failed.first() {
            entry = entry.failed(&first.message);
        }
        result.serial = Some(txn.finalize(entry).await?);

        info!(%result, "Apply finished");
        Ok(result)
    }

    /// Plans and applies in one step.
    ///
    /// # Errors
    ///
    /// See [`Self::plan`] and [`Self::apply`].
    pub async fn converge(&self, desired: &DesiredState, cancel: CancellationToken) -> Result<ApplyResult> {
        let plan = self.plan(desired).await?;
        self.apply(&plan, cancel).await
    }

    fn check_base(plan: &Plan, current: &StateSnapshot) -> Result<()> {
        match &plan.base_lineage {
            Some(lineage) if lineage != &current.lineage => {
                Err(ConvergeError::State(StateError::LineageMismatch {
                    expected: lineage.clone(),
                    found: current.lineage.clone(),
                }))
            }
            Some(_) if plan.base_serial != current.serial => Err(PlanError::StalePlan {
                planned_serial: plan.base_serial,
                current_serial: current.serial,
            }
            .into()),
            None if current.serial != 0 || !current.instances.is_empty() => {
                Err(PlanError::StalePlan {
                    planned_serial: 0,
                    current_serial: current.serial,
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    async fn abort(txn: &StateTransaction, entry: RunHistoryEntry) {
        if let Err(e) = txn.abort(entry).await {
            warn!("Failed to release state lock: {e}");
        }
    }

    /// Reads every recorded object back and commits what changed.
    ///
    /// Objects that no longer exist are removed from state. Unreadable
    /// objects are reported and left untouched.
    ///
    /// # Errors
    ///
    /// Returns lock or store errors.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let txn = StateTransaction::begin(Arc::clone(&self.store), &self.holder, "refresh").await?;
        let snapshot = txn.snapshot().await;

        let outcome = async {
            let mut report = DriftReport::default();
            for (id, recorded) in &snapshot.instances {
                match self.observe(id, recorded).await {
                    Observation::Unchanged => {}
                    Observation::Drifted { attributes, changes } => {
                        info!(instance = %id, ?changes, "Refreshed drifted attributes");
                        let mut state = recorded.clone();
                        state.attributes = attributes;
                        txn.refresh_instance(id, state).await?;
                        report.drifted.push(DriftedInstance {
                            instance: id.clone(),
                            changes,
                        });
                    }
                    Observation::Vanished => {
                        warn!(instance = %id, "Object vanished, removing from state");
                        txn.remove_instance(id).await?;
                        report.vanished.push(id.clone());
                    }
                    Observation::Failed(message) => report.errors.push((id.clone(), message)),
                }
                report.checked += 1;
            }
            Ok::<_, ConvergeError>(report)
        }
        .await;

        let drift = match outcome {
            Ok(drift) => drift,
            Err(e) => {
                Self::abort(&txn, RunHistoryEntry::new(RunOperation::Refresh, "").failed(&e.to_string())).await;
                return Err(e);
            }
        };

        let mut entry = RunHistoryEntry::new(RunOperation::Refresh, "")
            .with_counts(drift.drifted.len() + drift.vanished.len(), drift.errors.len(), 0);
        if let Some((id, message)) = drift.errors.first() {
            entry = entry.failed(&format!("{id}: {message}"));
        }
        let serial = txn.finalize(entry).await?;
        Ok(RefreshReport {
            drift,
            serial: Some(serial),
        })
    }

    /// Compares every recorded object with its provider without writing.
    ///
    /// # Errors
    ///
    /// Returns state load errors.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let Some(snapshot) = self.store.load().await? else {
            return Ok(DriftReport::default());
        };

        let mut report = DriftReport::default();
        for (id, recorded) in &snapshot.instances {
            match self.observe(id, recorded).await {
                Observation::Unchanged => {}
                Observation::Drifted { changes, .. } => report.drifted.push(DriftedInstance {
                    instance: id.clone(),
                    changes,
                }),
                Observation::Vanished => report.vanished.push(id.clone()),
                Observation::Failed(message) => report.errors.push((id.clone(), message)),
            }
            report.checked += 1;
        }
        info!(
            checked = report.checked,
            drifted = report.drifted.len(),
            vanished = report.vanished.len(),
            "Drift check finished"
        );
        Ok(report)
    }

    async fn observe(&self, id: &InstanceId, recorded: &InstanceState) -> Observation {
        let registered = match self.registry.require(id) {
            Ok(registered) => registered,
            Err(e) => return Observation::Failed(e.to_string()),
        };
        let adapter = registered.adapter.as_ref();
        let provider_id = recorded.id.as_str();
        let read = self
            .options
            .retry
            .run(&format!("read {id}"), move || adapter.read(provider_id))
            .await;

        match read {
            Ok((Some(observed), _)) => {
                let diff = Differ::new().diff(
                    &registered.schema,
                    id,
                    Some(&observed),
                    Some(recorded),
                    false,
                );
                if diff.has_changes() {
                    Observation::Drifted {
                        attributes: observed,
                        changes: diff.attributes.iter().map(|a| a.path.to_string()).collect(),
                    }
                } else {
                    Observation::Unchanged
                }
            }
            Ok((None, _)) => Observation::Vanished,
            Err((e, attempts)) => {
                warn!(instance = %id, attempts, "Read failed: {e}");
                Observation::Failed(e.to_string())
            }
        }
    }

    /// Marks an instance for replacement on the next apply.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the state does not record it.
    pub async fn taint(&self, id: &InstanceId) -> Result<u64> {
        self.edit(id, "taint", true).await
    }

    /// Clears a taint marker.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the state does not record it.
    pub async fn untaint(&self, id: &InstanceId) -> Result<u64> {
        self.edit(id, "untaint", false).await
    }

    async fn edit(&self, id: &InstanceId, operation: &str, taint: bool) -> Result<u64> {
        let txn = StateTransaction::begin(Arc::clone(&self.store), &self.holder, operation).await?;
        let edited = async {
            if txn.instance(id).await.is_none() {
                return Err(ConvergeError::State(StateError::InstanceNotFound {
                    instance: id.to_string(),
                }));
            }
            if taint {
                txn.taint(id).await
            } else {
                txn.untaint(id).await
            }
        }
        .await;

        if let Err(e) = edited {
            Self::abort(&txn, RunHistoryEntry::new(RunOperation::StateEdit, "").failed(&e.to_string())).await;
            return Err(e);
        }
        info!(instance = %id, operation, "State edited");
        txn.finalize(RunHistoryEntry::new(RunOperation::StateEdit, "")).await
    }

    /// Loads the stored state.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn state(&self) -> Result<Option<StateSnapshot>> {
        self.store.load().await
    }

    /// Removes the state lock regardless of its holder.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn force_unlock(&self) -> Result<()> {
        warn!("Force-unlocking state");
        self.store.force_unlock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DesiredInstance;
    use crate::provider::{SandboxCloud, catalog};
    use crate::schema::Value;
    use crate::state::MemoryStateStore;

    fn setup() -> (Arc<SandboxCloud>, Reconciler) {
        let cloud = Arc::new(SandboxCloud::new());
        let registry = Arc::new(catalog::registry(&cloud).expect("registry"));
        let reconciler = Reconciler::new(registry, Arc::new(MemoryStateStore::new()))
            .with_options(ReconcileOptions {
                parallelism: 2,
                retry: RetryPolicy::immediate(3),
            });
        (cloud, reconciler)
    }

    fn network(name: &str, cidr: &str) -> DesiredInstance {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("cidr"), Value::string(cidr));
        DesiredInstance {
            id: InstanceId::new("network", name),
            attributes,
            depends_on: vec![],
            create_before_destroy: None,
        }
    }

    #[tokio::test]
    async fn test_stale_plan_is_rejected() {
        let (_cloud, reconciler) = setup();
        let first: DesiredState = std::iter::once(network("a", "10.0.0.0/16")).collect();
        let stale = reconciler.plan(&first).await.expect("plan");
        reconciler
            .apply(&stale, CancellationToken::new())
            .await
            .expect("apply");

        let err = reconciler
            .apply(&stale, CancellationToken::new())
            .await
            .expect_err("stale");
        assert!(matches!(err, ConvergeError::Plan(PlanError::StalePlan { .. })));
    }

    #[tokio::test]
    async fn test_taint_requires_known_instance() {
        let (_cloud, reconciler) = setup();
        let err = reconciler
            .taint(&InstanceId::new("network", "ghost"))
            .await
            .expect_err("unknown");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::InstanceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_taint_forces_replacement() {
        let (_cloud, reconciler) = setup();
        let desired: DesiredState = std::iter::once(network("a", "10.0.0.0/16")).collect();
        reconciler
            .converge(&desired, CancellationToken::new())
            .await
            .expect("apply");

        reconciler
            .taint(&InstanceId::new("network", "a"))
            .await
            .expect("taint");
        let plan = reconciler.plan(&desired).await.expect("plan");
        assert_eq!(plan.replace_count(), 1);

        reconciler
            .untaint(&InstanceId::new("network", "a"))
            .await
            .expect("untaint");
        assert!(reconciler.plan(&desired).await.expect("plan").is_empty());
    }

    #[tokio::test]
    async fn test_drift_check_does_not_write() {
        let (cloud, reconciler) = setup();
        let desired: DesiredState = std::iter::once(network("a", "10.0.0.0/16")).collect();
        reconciler
            .converge(&desired, CancellationToken::new())
            .await
            .expect("apply");
        let id = cloud.ids("network").await.remove(0);
        cloud
            .set_attribute("network", &id, "name", Value::string("renamed"))
            .await
            .expect("drift");

        let serial = reconciler.state().await.expect("load").map(|s| s.serial);
        let report = reconciler.check_drift().await.expect("drift");
        assert_eq!(report.drifted.len(), 1);
        assert_eq!(report.drifted[0].changes, vec!["name"]);
        assert_eq!(
            reconciler.state().await.expect("load").map(|s| s.serial),
            serial
        );
    }
}
