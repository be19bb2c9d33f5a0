//! Plan executor.
//!
//! Runs plan operations on a bounded pool of tasks. An operation becomes
//! eligible once every operation it depends on has completed and its state
//! change has been committed. A failed operation taints its instance and
//! skips everything downstream of it; independent work carries on.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, ConvergeError, ProviderError, Result};
use crate::planner::{
    Differ, InstanceAction, Operation, OperationKind, Plan, ReplaceOrder, outputs_from_state,
    resolve,
};
use crate::schema::{Attributes, RegisteredType, SchemaRegistry};
use crate::state::{InstanceState, StateTransaction};

use super::lock_table::LockTable;
use super::result::{ApplyResult, FailedOperation, OperationReport, SkipReason, SkippedOperation};
use super::retry::RetryPolicy;

/// Default number of concurrent provider operations.
pub const DEFAULT_PARALLELISM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

/// What a finished operation reports back.
struct Done {
    attempts: u32,
    note: Option<String>,
}

/// Executes plans against the registered adapters.
#[derive(Debug)]
pub struct Executor {
    worker: Worker,
    parallelism: usize,
    cancel: CancellationToken,
}

/// Everything a task needs to run one operation.
#[derive(Debug, Clone)]
struct Worker {
    registry: Arc<SchemaRegistry>,
    txn: Arc<StateTransaction>,
    locks: Arc<LockTable>,
    retry: RetryPolicy,
}

impl Executor {
    /// Creates an executor writing through `txn`.
    #[must_use]
    pub fn new(
        registry: Arc<SchemaRegistry>,
        txn: Arc<StateTransaction>,
        locks: Arc<LockTable>,
    ) -> Self {
        Self {
            worker: Worker {
                registry,
                txn,
                locks,
                retry: RetryPolicy::default(),
            },
            parallelism: DEFAULT_PARALLELISM,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the number of concurrent operations.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.worker.retry = retry;
        self
    }

    /// Sets the token that stops scheduling.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Applies the plan.
    ///
    /// # Errors
    ///
    /// Returns a fatal error (state store unavailable, unregistered type)
    /// after in-flight operations have finished. Per-operation failures are
    /// reported in the [`ApplyResult`] instead.
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyResult> {
        let ops = &plan.operations;
        info!(
            operations = ops.len(),
            parallelism = self.parallelism,
            "Applying plan"
        );

        let mut pending: Vec<usize> = ops.iter().map(|op| op.depends_on.len()).collect();
        let mut followers: Vec<Vec<usize>> = vec![Vec::new(); ops.len()];
        for op in ops {
            for &earlier in &op.depends_on {
                followers[earlier].push(op.index);
            }
        }
        let mut status = vec![Status::Pending; ops.len()];
        let mut ready: BTreeSet<usize> = (0..ops.len()).filter(|&i| pending[i] == 0).collect();

        let mut tasks: JoinSet<(usize, Result<Done>)> = JoinSet::new();
        let mut result = ApplyResult::default();
        let mut fatal: Option<ConvergeError> = None;
        let mut cancel_seen = false;

        loop {
            while fatal.is_none() && !self.cancel.is_cancelled() && tasks.len() < self.parallelism {
                let Some(i) = ready.pop_first() else {
                    break;
                };
                status[i] = Status::Running;
                let worker = self.worker.clone();
                let op = ops[i].clone();
                debug!(index = i, operation = %op, "Operation scheduled");
                tasks.spawn(async move {
                    let outcome = worker.run(&op).await;
                    (op.index, outcome)
                });
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                () = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!(in_flight = tasks.len(), "Cancellation requested, waiting for in-flight operations");
                    continue;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (i, outcome) = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    error!("Operation task panicked: {e}");
                    fatal.get_or_insert(ConvergeError::internal(format!(
                        "operation task panicked: {e}"
                    )));
                    continue;
                }
            };
            let op = &ops[i];

            match outcome {
                Ok(done) => {
                    info!(instance = %op.instance, kind = %op.kind, attempts = done.attempts, "Operation completed");
                    status[i] = Status::Done;
                    result.completed.push(OperationReport {
                        index: i,
                        instance: op.instance.clone(),
                        kind: op.kind,
                        attempts: done.attempts,
                        note: done.note,
                    });
                    for &next in &followers[i] {
                        pending[next] -= 1;
                        if pending[next] == 0 && status[next] == Status::Pending {
                            ready.insert(next);
                        }
                    }
                }
                Err(ConvergeError::Apply(cause)) => {
                    status[i] = Status::Failed;
                    error!(instance = %op.instance, kind = %op.kind, "Operation failed: {cause}");
                    if let Err(e) = self.taint_after_failure(op, &cause).await {
                        fatal.get_or_insert(e);
                    }
                    let attempts = match &cause {
                        ApplyError::OperationFailed { attempts, .. } => *attempts,
                        _ => 0,
                    };
                    result.failed.push(FailedOperation {
                        index: i,
                        instance: op.instance.clone(),
                        kind: op.kind,
                        attempts,
                        message: cause.to_string(),
                        cause,
                    });
                    skip_downstream(ops, &followers, i, &mut status, &mut ready, &mut result);
                }
                Err(e) => {
                    error!(instance = %op.instance, "Fatal error, no further operations will start: {e}");
                    status[i] = Status::Failed;
                    fatal.get_or_insert(e);
                }
            }
        }

        let reason = if fatal.is_some() {
            SkipReason::Aborted
        } else {
            SkipReason::Cancelled
        };
        for (i, op) in ops.iter().enumerate() {
            if status[i] == Status::Pending {
                status[i] = Status::Skipped;
                result.skipped.push(SkippedOperation {
                    index: i,
                    instance: op.instance.clone(),
                    kind: op.kind,
                    reason: reason.clone(),
                });
            }
        }
        result.skipped.sort_by_key(|s| s.index);
        result.cancelled = cancel_seen || self.cancel.is_cancelled();

        if let Some(e) = fatal {
            return Err(e);
        }
        info!(%result, "Plan applied");
        Ok(result)
    }

    /// Provider failures taint the instance; a deposed object belongs to an
    /// older generation and leaves the current one alone.
    async fn taint_after_failure(&self, op: &Operation, cause: &ApplyError) -> Result<()> {
        if op.deposed || !matches!(cause, ApplyError::OperationFailed { .. }) {
            return Ok(());
        }
        self.worker.txn.taint(&op.instance).await.map(|_| ())
    }
}

/// Marks every operation downstream of `failed` as skipped.
fn skip_downstream(
    ops: &[Operation],
    followers: &[Vec<usize>],
    failed: usize,
    status: &mut [Status],
    ready: &mut BTreeSet<usize>,
    result: &mut ApplyResult,
) {
    let mut stack = followers[failed].clone();
    while let Some(i) = stack.pop() {
        if status[i] != Status::Pending {
            continue;
        }
        status[i] = Status::Skipped;
        ready.remove(&i);
        warn!(instance = %ops[i].instance, kind = %ops[i].kind, "Skipped: dependency {} failed", ops[failed].instance);
        result.skipped.push(SkippedOperation {
            index: i,
            instance: ops[i].instance.clone(),
            kind: ops[i].kind,
            reason: SkipReason::DependencyFailed {
                instance: ops[failed].instance.clone(),
            },
        });
        stack.extend(followers[i].iter().copied());
    }
}

fn failed(op: &Operation, attempts: u32, source: ProviderError) -> ConvergeError {
    ApplyError::OperationFailed {
        instance: op.instance.to_string(),
        attempts,
        source,
    }
    .into()
}

impl Worker {
    async fn run(&self, op: &Operation) -> Result<Done> {
        let registered = self.registry.require(&op.instance)?;
        match op.kind {
            OperationKind::Create => self.create(op, registered).await,
            OperationKind::Update => self.update(op, registered).await,
            OperationKind::Destroy => self.destroy(op, registered).await,
        }
    }

    /// Desired attributes with references resolved against committed state.
    async fn resolve_desired(&self, op: &Operation) -> Result<Attributes> {
        let Some(desired) = &op.desired else {
            return Err(ConvergeError::internal(format!(
                "{} has no desired configuration",
                op.instance
            )));
        };
        let outputs = outputs_from_state(&self.txn.snapshot().await);
        let resolution = resolve(&desired.attributes, &outputs);
        if let Some(reference) = resolution.unresolved.first() {
            return Err(ApplyError::UnresolvedReference {
                instance: op.instance.to_string(),
                reference: reference.to_string(),
            }
            .into());
        }
        Ok(resolution.attributes)
    }

    async fn create(&self, op: &Operation, registered: &RegisteredType) -> Result<Done> {
        let attributes = self.resolve_desired(op).await?;
        let adapter = registered.adapter.as_ref();
        let attrs = &attributes;
        let (created, attempts) = self
            .retry
            .run(&format!("create {}", op.instance), move || adapter.create(attrs))
            .await
            .map_err(|(e, attempts)| failed(op, attempts, e))?;

        let mut state = InstanceState::new(&op.instance, created.id.clone(), created.attributes);
        state.dependencies.clone_from(&op.dependencies);
        state.create_before_destroy = op.create_before_destroy;
        if let Some(previous) = self.txn.instance(&op.instance).await {
            state.deposed = previous.deposed;
            if op.replacement == Some(ReplaceOrder::CreateThenDestroy) {
                state.deposed.push(previous.id);
            }
        }
        self.txn.commit_instance(&op.instance, state).await?;

        Ok(Done {
            attempts,
            note: Some(format!("id {}", created.id)),
        })
    }

    async fn update(&self, op: &Operation, registered: &RegisteredType) -> Result<Done> {
        let Some(current) = self.txn.instance(&op.instance).await else {
            return Err(ApplyError::MissingState {
                instance: op.instance.to_string(),
            }
            .into());
        };
        let attributes = self.resolve_desired(op).await?;
        let tainted = self.txn.is_tainted(&op.instance).await;
        let diff = Differ::new().diff(
            &registered.schema,
            &op.instance,
            Some(&attributes),
            Some(&current),
            tainted,
        );

        match diff.action {
            InstanceAction::NoOp => {
                debug!(instance = %op.instance, "Nothing left to update once references resolved");
                return Ok(Done {
                    attempts: 0,
                    note: Some(String::from("no changes after resolution")),
                });
            }
            InstanceAction::DestroyCreate => {
                info!(instance = %op.instance, "Resolved values force replacement");
                return self.replace(op, registered, current, &attributes).await;
            }
            _ => {}
        }

        let _guard = self
            .locks
            .lock(&LockTable::key(&current.resource_type, &current.id))
            .await;
        let adapter = registered.adapter.as_ref();
        let (id, diff_ref) = (current.id.as_str(), &diff);
        let (updated, attempts) = self
            .retry
            .run(&format!("update {}", op.instance), move || {
                adapter.update(id, diff_ref)
            })
            .await
            .map_err(|(e, attempts)| failed(op, attempts, e))?;

        let mut state = current.clone();
        state.attributes = updated;
        state.dependencies.clone_from(&op.dependencies);
        state.create_before_destroy = op.create_before_destroy;
        state.updated_at = Utc::now();
        self.txn.commit_instance(&op.instance, state).await?;

        Ok(Done {
            attempts,
            note: None,
        })
    }

    /// Replacement decided at apply time, once upstream values are known.
    async fn replace(
        &self,
        op: &Operation,
        registered: &RegisteredType,
        current: InstanceState,
        attributes: &Attributes,
    ) -> Result<Done> {
        let adapter = registered.adapter.as_ref();
        let label = format!("replace {}", op.instance);
        let mut attempts = 0;

        if !op.create_before_destroy {
            attempts += self.delete(op, registered, &current.id).await?;
            self.txn.remove_instance(&op.instance).await?;
        }

        let (created, create_attempts) = self
            .retry
            .run(&label, move || adapter.create(attributes))
            .await
            .map_err(|(e, n)| failed(op, attempts + n, e))?;
        attempts += create_attempts;

        let mut state = InstanceState::new(&op.instance, created.id.clone(), created.attributes);
        state.dependencies.clone_from(&op.dependencies);
        state.create_before_destroy = op.create_before_destroy;
        state.deposed = current.deposed.clone();
        if op.create_before_destroy {
            state.deposed.push(current.id.clone());
        }
        self.txn.commit_instance(&op.instance, state.clone()).await?;

        if op.create_before_destroy {
            attempts += self.delete(op, registered, &current.id).await?;
            state.deposed.retain(|d| d != &current.id);
            self.txn.refresh_instance(&op.instance, state).await?;
        }

        Ok(Done {
            attempts,
            note: Some(format!("replaced {} with {}", current.id, created.id)),
        })
    }

    async fn destroy(&self, op: &Operation, registered: &RegisteredType) -> Result<Done> {
        let Some(target) = op.target_id.as_deref() else {
            return Err(ApplyError::MissingState {
                instance: op.instance.to_string(),
            }
            .into());
        };
        let attempts = self.delete(op, registered, target).await?;

        if op.deposed {
            if let Some(mut state) = self.txn.instance(&op.instance).await {
                state.deposed.retain(|d| d != target);
                self.txn.refresh_instance(&op.instance, state).await?;
            }
        } else {
            self.txn.remove_instance(&op.instance).await?;
        }

        Ok(Done {
            attempts,
            note: op.deposed.then(|| format!("deposed {target}")),
        })
    }

    /// Deletes one remote object; an object that is already gone counts as deleted.
    async fn delete(&self, op: &Operation, registered: &RegisteredType, target: &str) -> Result<u32> {
        let _guard = self
            .locks
            .lock(&LockTable::key(&registered.schema.name, target))
            .await;
        let adapter = registered.adapter.as_ref();
        match self
            .retry
            .run(&format!("destroy {}", op.instance), move || adapter.delete(target))
            .await
        {
            Ok(((), attempts)) => Ok(attempts),
            Err((ProviderError::NotFound { .. }, attempts)) => {
                info!(instance = %op.instance, id = target, "Object already gone");
                Ok(attempts)
            }
            Err((e, attempts)) => Err(failed(op, attempts, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DesiredInstance, DesiredState};
    use crate::graph::DependencyGraph;
    use crate::planner::PlanBuilder;
    use crate::provider::{Created, MockResourceAdapter};
    use crate::schema::{AttributeKind, AttributeSchema, InstanceId, Reference, ResourceType, Value};
    use crate::state::{MemoryStateStore, StateSnapshot, StateStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn network_type() -> ResourceType {
        ResourceType::new("network")
            .with_attribute(AttributeSchema::required("cidr", AttributeKind::string()).force_new())
    }

    fn server_type() -> ResourceType {
        ResourceType::new("server")
            .with_attribute(AttributeSchema::required("network_id", AttributeKind::string()))
    }

    fn desired() -> DesiredState {
        let mut net = Attributes::new();
        net.insert(String::from("cidr"), Value::string("10.0.0.0/16"));
        let mut srv = Attributes::new();
        srv.insert(
            String::from("network_id"),
            Value::Reference(Reference::parse("${network.x.id}").expect("reference")),
        );
        vec![
            DesiredInstance {
                id: InstanceId::new("network", "x"),
                attributes: net,
                depends_on: vec![],
                create_before_destroy: None,
            },
            DesiredInstance {
                id: InstanceId::new("server", "y"),
                attributes: srv,
                depends_on: vec![],
                create_before_destroy: None,
            },
        ]
        .into_iter()
        .collect()
    }

    struct Harness {
        executor: Executor,
        txn: Arc<StateTransaction>,
        memory: Arc<MemoryStateStore>,
        plan: Plan,
    }

    async fn harness(network: MockResourceAdapter, server: MockResourceAdapter) -> Harness {
        let registry = Arc::new(
            SchemaRegistry::builder()
                .register(network_type(), Arc::new(network))
                .register(server_type(), Arc::new(server))
                .build()
                .expect("registry"),
        );
        let desired = desired();
        let graph = DependencyGraph::build(&desired, &StateSnapshot::new()).expect("graph");
        let plan = PlanBuilder::new(Arc::clone(&registry))
            .build(&graph, &desired, None, "hash")
            .expect("plan");

        let memory = Arc::new(MemoryStateStore::new());
        let store: Arc<dyn StateStore> = memory.clone();
        let txn = Arc::new(
            StateTransaction::begin(store, "test", "apply")
                .await
                .expect("begin"),
        );
        let executor = Executor::new(registry, Arc::clone(&txn), Arc::new(LockTable::new()))
            .with_retry(RetryPolicy::immediate(3));
        Harness {
            executor,
            txn,
            memory,
            plan,
        }
    }

    fn created(id: &str, attributes: &Attributes) -> Created {
        Created {
            id: id.to_string(),
            attributes: attributes.clone(),
        }
    }

    #[tokio::test]
    async fn test_producer_id_reaches_consumer() {
        let mut network = MockResourceAdapter::new();
        network
            .expect_create()
            .times(1)
            .returning(|attrs| Ok(created("net-1", attrs)));
        let mut server = MockResourceAdapter::new();
        server
            .expect_create()
            .times(1)
            .withf(|attrs| attrs.get("network_id") == Some(&Value::string("net-1")))
            .returning(|attrs| Ok(created("srv-1", attrs)));

        let h = harness(network, server).await;
        let result = h.executor.apply(&h.plan).await.expect("apply");

        assert!(result.is_success(), "{result}");
        let order: Vec<String> = result.completed.iter().map(|r| r.instance.to_string()).collect();
        assert_eq!(order, vec!["network.x", "server.y"]);
        let server_state = h
            .txn
            .instance(&InstanceId::new("server", "y"))
            .await
            .expect("server state");
        assert_eq!(server_state.dependencies, vec![InstanceId::new("network", "x")]);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut network = MockResourceAdapter::new();
        let counter = Arc::clone(&calls);
        network.expect_create().times(3).returning(move |attrs| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::Timeout {
                    message: String::from("slow"),
                })
            } else {
                Ok(created("net-1", attrs))
            }
        });
        let mut server = MockResourceAdapter::new();
        server
            .expect_create()
            .returning(|attrs| Ok(created("srv-1", attrs)));

        let h = harness(network, server).await;
        let result = h.executor.apply(&h.plan).await.expect("apply");

        assert!(result.is_success());
        assert_eq!(result.completed[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_taints_and_skips_dependents() {
        let mut network = MockResourceAdapter::new();
        network.expect_create().times(1).returning(|_| {
            Err(ProviderError::PermissionDenied {
                message: String::from("no quota"),
            })
        });
        let mut server = MockResourceAdapter::new();
        server.expect_create().never();

        let h = harness(network, server).await;
        let result = h.executor.apply(&h.plan).await.expect("apply");

        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].attempts, 1);
        assert_eq!(
            result.skipped[0].reason,
            SkipReason::DependencyFailed {
                instance: InstanceId::new("network", "x")
            }
        );
        assert!(h.txn.is_tainted(&InstanceId::new("network", "x")).await);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let mut network = MockResourceAdapter::new();
        network.expect_create().never();
        let mut server = MockResourceAdapter::new();
        server.expect_create().never();

        let h = harness(network, server).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = h.executor.with_cancellation(cancel);
        let result = executor.apply(&h.plan).await.expect("apply");

        assert!(result.cancelled);
        assert_eq!(result.skipped.len(), 2);
        assert!(result.skipped.iter().all(|s| s.reason == SkipReason::Cancelled));
    }

    #[tokio::test]
    async fn test_store_outage_is_fatal() {
        let mut network = MockResourceAdapter::new();
        network
            .expect_create()
            .times(1)
            .returning(|attrs| Ok(created("net-1", attrs)));
        let mut server = MockResourceAdapter::new();
        server.expect_create().never();

        let h = harness(network, server).await;
        h.memory.fail_appends_after(0).await;
        let err = h.executor.apply(&h.plan).await.expect_err("fatal");
        assert!(err.is_fatal());
        assert!(h.txn.instance(&InstanceId::new("network", "x")).await.is_none());
    }
}
