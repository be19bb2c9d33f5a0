//! Execution plan types and construction.
//!
//! The [`PlanBuilder`] walks the dependency graph producers-first, diffs
//! every instance against the applied state and turns the results into an
//! ordered list of operations with explicit ordering constraints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{DesiredInstance, DesiredState};
use crate::error::{PlanError, Result};
use crate::graph::DependencyGraph;
use crate::schema::{InstanceId, SchemaRegistry};
use crate::state::StateSnapshot;

use super::diff::{Differ, InstanceAction, InstanceDiff};
use super::resolve::{Output, Outputs, resolve};

/// Provider call an operation makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a new object.
    Create,
    /// Update an existing object in place.
    Update,
    /// Delete an object.
    Destroy,
}

/// Order of the two halves of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceOrder {
    /// Destroy the old object, then create the new one.
    DestroyThenCreate,
    /// Create the new object, rewire dependents, then destroy the old one.
    CreateThenDestroy,
}

/// A single planned operation.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    /// Position in the plan.
    pub index: usize,
    /// Instance address.
    pub instance: InstanceId,
    /// Provider call.
    pub kind: OperationKind,
    /// Set when the operation is half of a replacement.
    pub replacement: Option<ReplaceOrder>,
    /// Provider id the operation acts on (update and destroy).
    pub target_id: Option<String>,
    /// The destroy removes a deposed object rather than the current one.
    pub deposed: bool,
    /// Diff computed at plan time.
    pub diff: InstanceDiff,
    /// Desired configuration, references unresolved.
    #[serde(skip)]
    pub desired: Option<DesiredInstance>,
    /// Instances recorded as dependencies once applied.
    pub dependencies: Vec<InstanceId>,
    /// Replacement policy recorded in state.
    pub create_before_destroy: bool,
    /// Human-readable reason.
    pub reason: String,
    /// Operations that must complete first.
    pub depends_on: Vec<usize>,
}

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the desired configuration.
    pub config_hash: String,
    /// Lineage of the state the plan was built from; `None` if no state existed.
    pub base_lineage: Option<String>,
    /// Serial of the state the plan was built from.
    pub base_serial: u64,
    /// Operations in execution order.
    pub operations: Vec<Operation>,
    /// Instances that need nothing.
    pub unchanged: usize,
}

impl Plan {
    /// Returns true if the plan has no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }

    /// Number of create operations.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(OperationKind::Create)
    }

    /// Number of update operations.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(OperationKind::Update)
    }

    /// Number of destroy operations.
    #[must_use]
    pub fn destroy_count(&self) -> usize {
        self.count(OperationKind::Destroy)
    }

    /// Number of instances being replaced.
    #[must_use]
    pub fn replace_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.replacement.is_some() && op.kind == OperationKind::Create)
            .count()
    }
}

impl Operation {
    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match (self.kind, self.deposed) {
            (OperationKind::Destroy, true) => format!(
                "Destroy deposed object {} of {}",
                self.target_id.as_deref().unwrap_or("?"),
                self.instance
            ),
            (kind, _) => format!("{kind} {}", self.instance),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.instance)?;
        if self.deposed {
            write!(f, " (deposed)")?;
        }
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operations.is_empty() {
            return write!(f, "No changes. Infrastructure matches the configuration.");
        }

        writeln!(f, "Plan ({} operations):", self.operations.len())?;
        for op in &self.operations {
            writeln!(f, "  {}. {op}", op.index)?;
        }
        write!(
            f,
            "{} to create, {} to update, {} to destroy",
            self.create_count(),
            self.update_count(),
            self.destroy_count()
        )
    }
}

/// Per-node result of the planning walk.
struct NodePlan {
    diff: InstanceDiff,
    create_before_destroy: bool,
}

/// Operation under construction.
struct Draft {
    op: Operation,
    node: usize,
    /// Deposed destroys first, then destroys, then creates and updates.
    rank: u8,
    after: BTreeSet<usize>,
}

#[derive(Default)]
struct Slots {
    change: Option<usize>,
    destroy: Option<usize>,
    deposed: Vec<usize>,
}

/// Builds plans from desired configuration and applied state.
#[derive(Debug)]
pub struct PlanBuilder {
    registry: Arc<SchemaRegistry>,
    differ: Differ,
}

impl PlanBuilder {
    /// Creates a plan builder.
    #[must_use]
    pub const fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            differ: Differ::new(),
        }
    }

    /// Builds the plan.
    ///
    /// `base` is the stored state, or `None` if nothing has been applied yet.
    ///
    /// # Errors
    ///
    /// Returns an error if an instance has an unregistered type or the
    /// operations cannot be ordered.
    pub fn build(
        &self,
        graph: &DependencyGraph,
        desired: &DesiredState,
        base: Option<&StateSnapshot>,
        config_hash: &str,
    ) -> Result<Plan> {
        let empty = StateSnapshot::new();
        let snapshot = base.unwrap_or(&empty);

        let mut nodes = self.walk(graph, desired, snapshot, &BTreeMap::new())?;
        propagate_create_before_destroy(graph, &mut nodes);
        let forced = consumers_replaced_along(graph, &nodes);
        if !forced.is_empty() {
            // Their new ids are unknown until apply; downstream diffs must see that.
            nodes = self.walk(graph, desired, snapshot, &forced)?;
            propagate_create_before_destroy(graph, &mut nodes);
        }

        let mut drafts = Vec::new();
        let mut slots: Vec<Slots> = (0..graph.len()).map(|_| Slots::default()).collect();
        let mut unchanged = 0;

        for (n, node) in nodes.iter().enumerate() {
            let id = graph.node(n);
            let instance = desired.get(id);
            let current = snapshot.get(id);
            let current_id = current.map(|c| c.id.clone());
            let template = |kind: OperationKind, reason: String| Operation {
                index: 0,
                instance: id.clone(),
                kind,
                replacement: None,
                target_id: None,
                deposed: false,
                diff: node.diff.clone(),
                desired: None,
                dependencies: Vec::new(),
                create_before_destroy: node.create_before_destroy,
                reason,
                depends_on: Vec::new(),
            };
            let with_desired = |mut op: Operation| {
                if let Some(instance) = instance {
                    op.dependencies = instance.dependencies().into_iter().collect();
                    op.desired = Some(instance.clone());
                }
                op
            };

            match node.diff.action {
                InstanceAction::NoOp => unchanged += 1,
                InstanceAction::Create => {
                    let op = with_desired(template(OperationKind::Create, String::from("not in state")));
                    slots[n].change = Some(push(&mut drafts, op, n, 2));
                }
                InstanceAction::Update | InstanceAction::UpdatePending => {
                    let mut op = with_desired(template(OperationKind::Update, update_reason(&node.diff)));
                    op.target_id.clone_from(&current_id);
                    slots[n].change = Some(push(&mut drafts, op, n, 2));
                }
                InstanceAction::Destroy => {
                    let mut op = template(
                        OperationKind::Destroy,
                        String::from("removed from configuration"),
                    );
                    op.target_id.clone_from(&current_id);
                    slots[n].destroy = Some(push(&mut drafts, op, n, 1));
                }
                InstanceAction::DestroyCreate => {
                    let order = if node.create_before_destroy {
                        ReplaceOrder::CreateThenDestroy
                    } else {
                        ReplaceOrder::DestroyThenCreate
                    };
                    let reason = match forced.get(&n) {
                        Some(&producer) => format!("replaced along with {}", graph.node(producer)),
                        None => replace_reason(&node.diff, snapshot.is_tainted(id)),
                    };

                    let mut destroy = template(OperationKind::Destroy, reason.clone());
                    destroy.replacement = Some(order);
                    destroy.target_id.clone_from(&current_id);
                    destroy.deposed = node.create_before_destroy;
                    let rank = if destroy.deposed { 0 } else { 1 };
                    let d = push(&mut drafts, destroy, n, rank);

                    let mut create = with_desired(template(OperationKind::Create, reason));
                    create.replacement = Some(order);
                    let c = push(&mut drafts, create, n, 2);

                    match order {
                        ReplaceOrder::DestroyThenCreate => after(&mut drafts, c, d),
                        ReplaceOrder::CreateThenDestroy => after(&mut drafts, d, c),
                    }
                    slots[n].change = Some(c);
                    slots[n].destroy = Some(d);
                }
            }

            for old in current.map(|c| c.deposed.as_slice()).unwrap_or_default() {
                let mut op = template(
                    OperationKind::Destroy,
                    String::from("deposed object left by an earlier replacement"),
                );
                op.target_id = Some(old.clone());
                op.deposed = true;
                let d = push(&mut drafts, op, n, 0);
                if let Some(c) = slots[n].change {
                    after(&mut drafts, d, c);
                }
                slots[n].deposed.push(d);
            }
        }

        add_dependency_edges(graph, &slots, &mut drafts);
        add_recorded_edges(graph, snapshot, &slots, &mut drafts);
        let operations = order_operations(drafts)?;

        let plan = Plan {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            base_lineage: base.map(|s| s.lineage.clone()),
            base_serial: base.map_or(0, |s| s.serial),
            operations,
            unchanged,
        };
        info!(
            creates = plan.create_count(),
            updates = plan.update_count(),
            destroys = plan.destroy_count(),
            unchanged = plan.unchanged,
            "Plan built"
        );
        Ok(plan)
    }

    /// Resolves and diffs every node, producers first. Nodes in `forced`
    /// are replaced destroy-then-create whatever their own diff says.
    fn walk(
        &self,
        graph: &DependencyGraph,
        desired: &DesiredState,
        snapshot: &StateSnapshot,
        forced: &BTreeMap<usize, usize>,
    ) -> Result<Vec<NodePlan>> {
        let mut outputs = Outputs::new();
        let mut nodes: Vec<Option<NodePlan>> = (0..graph.len()).map(|_| None).collect();

        for n in graph.topological_order() {
            let id = graph.node(n);
            let registered = self.registry.require(id)?;
            let instance = desired.get(id);
            let current = snapshot.get(id);
            let resolution = instance.map(|i| resolve(&i.attributes, &outputs));

            let diff = self.differ.diff(
                &registered.schema,
                id,
                resolution.as_ref().map(|r| &r.attributes),
                current,
                snapshot.is_tainted(id) || forced.contains_key(&n),
            );
            debug!(instance = %id, action = %diff.action, "Instance diffed");

            let create_before_destroy = match instance {
                _ if forced.contains_key(&n) => false,
                Some(instance) => instance
                    .create_before_destroy
                    .unwrap_or(registered.schema.create_before_destroy),
                None => current.is_some_and(|c| c.create_before_destroy),
            };

            if instance.is_some() {
                let provider_id = match diff.action {
                    InstanceAction::NoOp | InstanceAction::Update | InstanceAction::UpdatePending => {
                        current.map(|c| c.id.clone())
                    }
                    _ => None,
                };
                outputs.insert(
                    id.clone(),
                    Output {
                        id: provider_id,
                        attributes: diff.planned.clone(),
                    },
                );
            }

            nodes[n] = Some(NodePlan {
                diff,
                create_before_destroy,
            });
        }

        nodes.into_iter().collect::<Option<Vec<_>>>().ok_or_else(|| {
            PlanError::ConflictingOperations {
                message: String::from("dependency graph could not be fully ordered"),
            }
            .into()
        })
    }
}

/// A create-before-destroy replacement forces the same policy on the
/// replaced instances it depends on; mixing policies along an edge cannot
/// be ordered.
fn propagate_create_before_destroy(graph: &DependencyGraph, nodes: &mut [NodePlan]) {
    let mut changed = true;
    while changed {
        changed = false;
        for n in 0..nodes.len() {
            if !(nodes[n].create_before_destroy && nodes[n].diff.requires_replacement()) {
                continue;
            }
            let forced: Vec<usize> = graph
                .dependencies(n)
                .iter()
                .copied()
                .filter(|&d| nodes[d].diff.requires_replacement() && !nodes[d].create_before_destroy)
                .collect();
            for d in forced {
                debug!(
                    instance = %graph.node(d),
                    by = %graph.node(n),
                    "create_before_destroy propagated"
                );
                nodes[d].create_before_destroy = true;
                changed = true;
            }
        }
    }
}

/// Live consumers of an instance replaced destroy-then-create still point
/// at the object about to be deleted, so they are destroyed first and
/// created again after it. Maps each such consumer to the producer that
/// takes it along; consumers taken along take their own consumers too.
fn consumers_replaced_along(graph: &DependencyGraph, nodes: &[NodePlan]) -> BTreeMap<usize, usize> {
    let mut forced = BTreeMap::new();
    for n in graph.topological_order() {
        let live = matches!(
            nodes[n].diff.action,
            InstanceAction::NoOp | InstanceAction::Update | InstanceAction::UpdatePending
        );
        if !live {
            continue;
        }
        let producer = graph.dependencies(n).iter().copied().find(|&p| {
            forced.contains_key(&p)
                || (nodes[p].diff.requires_replacement() && !nodes[p].create_before_destroy)
        });
        if let Some(producer) = producer {
            debug!(
                instance = %graph.node(n),
                by = %graph.node(producer),
                "Replaced along with its dependency"
            );
            forced.insert(n, producer);
        }
    }
    forced
}

fn push(drafts: &mut Vec<Draft>, op: Operation, node: usize, rank: u8) -> usize {
    drafts.push(Draft {
        op,
        node,
        rank,
        after: BTreeSet::new(),
    });
    drafts.len() - 1
}

/// Records that `later` must wait for `earlier`.
fn after(drafts: &mut [Draft], later: usize, earlier: usize) {
    if later != earlier {
        drafts[later].after.insert(earlier);
    }
}

/// Ordering constraints along dependency edges (consumer depends on producer).
fn add_dependency_edges(graph: &DependencyGraph, slots: &[Slots], drafts: &mut [Draft]) {
    for consumer in 0..graph.len() {
        for &producer in graph.dependencies(consumer) {
            let (c, p) = (&slots[consumer], &slots[producer]);

            if let (Some(cc), Some(pc)) = (c.change, p.change) {
                after(drafts, cc, pc);
            }
            if let (Some(cd), Some(pd)) = (c.destroy, p.destroy) {
                after(drafts, pd, cd);
            }
            // Deposed producers go only once consumers point at the replacement.
            if let Some(cc) = c.change {
                let deposed = p.destroy.filter(|&d| drafts[d].op.deposed);
                for d in deposed.iter().chain(&p.deposed) {
                    after(drafts, *d, cc);
                }
            }
        }
    }
}

/// Declared instances whose recorded dependencies are being destroyed must
/// be rewired before the destroy runs.
fn add_recorded_edges(
    graph: &DependencyGraph,
    snapshot: &StateSnapshot,
    slots: &[Slots],
    drafts: &mut [Draft],
) {
    for consumer in 0..graph.len() {
        if !graph.is_declared(consumer) {
            continue;
        }
        let Some(state) = snapshot.get(graph.node(consumer)) else {
            continue;
        };
        for recorded in &state.dependencies {
            let Some(producer) = graph.index_of(recorded) else {
                continue;
            };
            if graph.is_declared(producer) || graph.dependencies(consumer).contains(&producer) {
                continue;
            }
            let Some(pd) = slots[producer].destroy else {
                continue;
            };
            let ops = [slots[consumer].change, slots[consumer].destroy];
            for op in ops.into_iter().flatten() {
                if !reaches(drafts, op, pd) {
                    after(drafts, pd, op);
                }
            }
        }
    }
}

/// Returns true if `from` already waits, directly or not, on `target`.
fn reaches(drafts: &[Draft], from: usize, target: usize) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(current) = stack.pop() {
        if current == target {
            return true;
        }
        if seen.insert(current) {
            stack.extend(drafts[current].after.iter().copied());
        }
    }
    false
}

/// Stable topological sort: node order, then rank within a node.
fn order_operations(drafts: Vec<Draft>) -> Result<Vec<Operation>> {
    let total = drafts.len();
    let mut pending: Vec<usize> = drafts.iter().map(|d| d.after.len()).collect();
    let mut followers: Vec<Vec<usize>> = vec![Vec::new(); total];
    for (i, draft) in drafts.iter().enumerate() {
        for &earlier in &draft.after {
            followers[earlier].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<(usize, u8, usize)>> = drafts
        .iter()
        .enumerate()
        .filter(|(i, _)| pending[*i] == 0)
        .map(|(i, d)| Reverse((d.node, d.rank, i)))
        .collect();

    let mut order = Vec::with_capacity(total);
    let mut position = vec![usize::MAX; total];
    while let Some(Reverse((_, _, i))) = ready.pop() {
        position[i] = order.len();
        order.push(i);
        for &next in &followers[i] {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push(Reverse((drafts[next].node, drafts[next].rank, next)));
            }
        }
    }

    if order.len() != total {
        let stuck: Vec<String> = drafts
            .iter()
            .enumerate()
            .filter(|(i, _)| position[*i] == usize::MAX)
            .map(|(_, d)| d.op.to_string())
            .collect();
        return Err(PlanError::ConflictingOperations {
            message: format!("operations wait on each other: {}", stuck.join(", ")),
        }
        .into());
    }

    let mut slots: Vec<Option<Draft>> = drafts.into_iter().map(Some).collect();
    let mut operations = Vec::with_capacity(total);
    for (index, i) in order.into_iter().enumerate() {
        let Some(draft) = slots[i].take() else {
            continue;
        };
        let mut op = draft.op;
        op.index = index;
        op.depends_on = draft.after.iter().map(|&e| position[e]).collect();
        op.depends_on.sort_unstable();
        operations.push(op);
    }
    Ok(operations)
}

fn update_reason(diff: &InstanceDiff) -> String {
    if diff.action == InstanceAction::UpdatePending {
        return String::from("depends on values known after apply");
    }
    let paths: Vec<String> = diff.attributes.iter().map(|a| a.path.to_string()).collect();
    format!("{} attribute(s) changed: {}", paths.len(), paths.join(", "))
}

fn replace_reason(diff: &InstanceDiff, tainted: bool) -> String {
    if tainted {
        return String::from("tainted");
    }
    let paths: Vec<String> = diff
        .replacement_paths()
        .iter()
        .map(ToString::to_string)
        .collect();
    format!("forces replacement: {}", paths.join(", "))
}
