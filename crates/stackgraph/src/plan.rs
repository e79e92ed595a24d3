//! Plan generator: diff the declared graph against persisted records
//!
//! Each declared node is classified by comparing its content hash with the
//! hash stored at its last successful apply. Records with no declared node
//! become deletes. Prerequisites follow the dependency relation: creates
//! and updates wait on their dependencies, deletes wait on everything that
//! depended on the deleted resource at its last apply.

use crate::error::{Error, Result};
use crate::graph::{ResourceGraph, topo_sort};
use crate::schema;
use crate::state::{RecordSet, RecordStatus, ResourceRecord};
use crate::types::{Properties, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What an operation does to its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Delete,
    NoOp,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        }
    }

    /// Diff marker used in plan output
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of an operation: one action on one logical id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpKey {
    pub action: PlanAction,
    pub id: String,
}

impl OpKey {
    pub fn new(action: PlanAction, id: impl Into<String>) -> Self {
        Self {
            action,
            id: id.into(),
        }
    }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action, self.id)
    }
}

/// Why the planner chose an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ChangeReason {
    /// No record exists
    New,
    /// Mutable fields changed
    Changed { fields: Vec<String> },
    /// Immutable fields changed
    Replaced { fields: Vec<String> },
    /// An upstream resource is being replaced
    DependencyReplaced { upstream: String },
    /// Recorded but no longer declared
    Removed,
    Unchanged,
    /// A previous run may have created it without recording the identity
    Unknown,
    /// The previous operation on this resource failed
    Retry,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("new resource"),
            Self::Changed { fields } => write!(f, "changed: {}", fields.join(", ")),
            Self::Replaced { fields } => write!(f, "forces replacement: {}", fields.join(", ")),
            Self::DependencyReplaced { upstream } => write!(f, "'{upstream}' is replaced"),
            Self::Removed => f.write_str("no longer declared"),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Unknown => f.write_str("interrupted create, will reconcile"),
            Self::Retry => f.write_str("previous apply failed"),
        }
    }
}

/// How to handle a change to an immutable field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplacePolicy {
    /// Fail planning
    #[default]
    Refuse,
    /// Delete the resource and its dependents, then recreate them
    DestroyThenCreate,
}

impl ReplacePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "refuse" => Some(Self::Refuse),
            "destroy-then-create" => Some(Self::DestroyThenCreate),
            _ => None,
        }
    }
}

/// Options for [`plan`]
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    pub replace_policy: ReplacePolicy,
    /// Restrict the plan to this node and what it depends on
    pub target: Option<String>,
}

/// One planned operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOperation {
    pub key: OpKey,
    pub kind: ResourceKind,
    pub reason: ChangeReason,
    /// Half of a delete/create replacement pair
    pub replacement: bool,
    /// Operations that must succeed before this one starts
    pub prerequisites: Vec<OpKey>,
    /// Length of the longest prerequisite chain
    pub wave: usize,
}

impl PlanOperation {
    pub fn action(&self) -> PlanAction {
        self.key.action
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// Whether executing this operation calls the provider
    pub fn touches_provider(&self) -> bool {
        self.kind.is_provisioned() && self.action() != PlanAction::NoOp
    }
}

/// Operation counts by action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    /// Resources deleted and recreated
    pub replace: usize,
    pub unchanged: usize,
}

impl PlanSummary {
    pub fn total_changes(&self) -> usize {
        self.create + self.update + self.delete + self.replace
    }

    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }
}

/// An ordered, dependency-annotated list of operations
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionPlan {
    operations: Vec<PlanOperation>,
}

impl ExecutionPlan {
    /// Operations ordered by wave, then deletes first, then id
    pub fn operations(&self) -> &[PlanOperation] {
        &self.operations
    }

    pub fn get(&self, key: &OpKey) -> Option<&PlanOperation> {
        self.operations.iter().find(|op| &op.key == key)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations grouped by wave; all operations in one wave are independent
    pub fn waves(&self) -> Vec<Vec<&PlanOperation>> {
        let mut waves: Vec<Vec<&PlanOperation>> = Vec::new();
        for op in &self.operations {
            if waves.len() <= op.wave {
                waves.resize_with(op.wave + 1, Vec::new);
            }
            waves[op.wave].push(op);
        }
        waves
    }

    /// Operations other than no-ops
    pub fn changes(&self) -> impl Iterator<Item = &PlanOperation> {
        self.operations
            .iter()
            .filter(|op| op.action() != PlanAction::NoOp)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.operations {
            match (op.action(), op.replacement) {
                (PlanAction::Create, true) => summary.replace += 1,
                (PlanAction::Create, false) => summary.create += 1,
                (PlanAction::Update, _) => summary.update += 1,
                (PlanAction::Delete, false) => summary.delete += 1,
                (PlanAction::Delete, true) => {}
                (PlanAction::NoOp, _) => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.summary().has_changes()
    }

    /// Number of groups of operations linked by prerequisites
    pub fn independent_groups(&self) -> usize {
        let mut adjacency: BTreeMap<&OpKey, Vec<&OpKey>> = BTreeMap::new();
        for op in &self.operations {
            adjacency.entry(&op.key).or_default();
            for p in &op.prerequisites {
                adjacency.entry(&op.key).or_default().push(p);
                adjacency.entry(p).or_default().push(&op.key);
            }
        }

        let mut seen = BTreeSet::new();
        let mut groups = 0;
        for start in adjacency.keys() {
            if !seen.insert(*start) {
                continue;
            }
            groups += 1;
            let mut stack = vec![*start];
            while let Some(current) = stack.pop() {
                for &next in &adjacency[current] {
                    if seen.insert(next) {
                        stack.push(next);
                    }
                }
            }
        }
        groups
    }

    /// Order operations and compute their waves
    fn assemble(ops: BTreeMap<OpKey, PlanOperation>) -> Result<Self> {
        let deps: BTreeMap<OpKey, BTreeSet<OpKey>> = ops
            .iter()
            .map(|(k, op)| (k.clone(), op.prerequisites.iter().cloned().collect()))
            .collect();

        let order = topo_sort(&deps).map_err(|cycle| Error::CyclicDependency {
            cycle: cycle.iter().map(ToString::to_string).collect(),
        })?;

        let mut waves: BTreeMap<OpKey, usize> = BTreeMap::new();
        for key in &order {
            let wave = deps[key]
                .iter()
                .filter_map(|p| waves.get(p))
                .map(|w| w + 1)
                .max()
                .unwrap_or(0);
            waves.insert(key.clone(), wave);
        }

        let mut operations: Vec<PlanOperation> = ops
            .into_values()
            .map(|mut op| {
                op.wave = waves.get(&op.key).copied().unwrap_or(0);
                op
            })
            .collect();
        operations.sort_by(|a, b| {
            (a.wave, a.action() != PlanAction::Delete, &a.key.id).cmp(&(
                b.wave,
                b.action() != PlanAction::Delete,
                &b.key.id,
            ))
        });

        Ok(Self { operations })
    }
}

enum Decision {
    Create(ChangeReason),
    Update(ChangeReason),
    Replace(ChangeReason),
    NoOp,
}

/// Fields whose values differ between two property bags
pub fn changed_fields(old: &Properties, new: &Properties) -> Vec<String> {
    old.keys()
        .chain(new.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|k| old.get(*k) != new.get(*k))
        .cloned()
        .collect()
}

fn immutable_changes(kind: ResourceKind, record: &ResourceRecord, fields: &[String]) -> Vec<String> {
    if record.kind != kind {
        return vec!["kind".to_string()];
    }
    fields
        .iter()
        .filter(|f| !schema::is_mutable(kind, f))
        .cloned()
        .collect()
}

fn operation(
    action: PlanAction,
    id: &str,
    kind: ResourceKind,
    reason: ChangeReason,
    replacement: bool,
) -> PlanOperation {
    PlanOperation {
        key: OpKey::new(action, id),
        kind,
        reason,
        replacement,
        prerequisites: Vec::new(),
        wave: 0,
    }
}

/// Compute the operations that converge recorded state to the declared graph
pub fn plan(graph: &ResourceGraph, records: &RecordSet, options: &PlanOptions) -> Result<ExecutionPlan> {
    let mut scope: BTreeSet<String> = match options.target.as_deref() {
        None => graph.nodes().map(|n| n.id().to_string()).collect(),
        Some(target) => {
            if !graph.contains(target) {
                return Err(Error::UnknownTarget(target.to_string()));
            }
            let mut scope = graph.transitive_dependencies(target);
            scope.insert(target.to_string());
            scope
        }
    };

    let mut decisions: BTreeMap<String, Decision> = BTreeMap::new();
    let mut replaced_roots: Vec<String> = Vec::new();

    for node in graph.ordered_nodes().filter(|n| scope.contains(n.id())) {
        let decision = match records.get(node.id()) {
            None => Decision::Create(ChangeReason::New),
            Some(record) if record.is_unknown() => Decision::Create(ChangeReason::Unknown),
            Some(record) if record.content_hash != node.content_hash() || record.kind != node.kind() => {
                let fields = changed_fields(&record.declared_properties, node.properties());
                let immutable = immutable_changes(node.kind(), record, &fields);
                if immutable.is_empty() {
                    Decision::Update(ChangeReason::Changed { fields })
                } else if options.replace_policy == ReplacePolicy::Refuse {
                    return Err(Error::ImmutableChange {
                        node: node.id().to_string(),
                        fields: immutable,
                    });
                } else {
                    replaced_roots.push(node.id().to_string());
                    Decision::Replace(ChangeReason::Replaced { fields: immutable })
                }
            }
            Some(record) if record.status == RecordStatus::Failed => Decision::Update(ChangeReason::Retry),
            Some(_) => Decision::NoOp,
        };
        decisions.insert(node.id().to_string(), decision);
    }

    // Replacing a resource invalidates everything built on top of it
    for root in &replaced_roots {
        for dependent in graph.transitive_dependents(root) {
            // Unknown dependents may exist too; their delete looks them up first
            let recorded = records.contains_key(&dependent);
            let already = matches!(decisions.get(&dependent), Some(Decision::Replace(_)));
            if recorded && !already {
                log::debug!("Replacement of {root} cascades to {dependent}");
                decisions.insert(
                    dependent.clone(),
                    Decision::Replace(ChangeReason::DependencyReplaced {
                        upstream: root.clone(),
                    }),
                );
                scope.insert(dependent);
            }
        }
    }

    let mut ops: BTreeMap<OpKey, PlanOperation> = BTreeMap::new();
    let mut primary: BTreeMap<String, OpKey> = BTreeMap::new();

    for node in graph.ordered_nodes().filter(|n| scope.contains(n.id())) {
        let id = node.id();
        let kind = node.kind();
        let Some(decision) = decisions.remove(id) else {
            continue;
        };
        let op = match decision {
            Decision::Create(reason) => operation(PlanAction::Create, id, kind, reason, false),
            Decision::Update(reason) => operation(PlanAction::Update, id, kind, reason, false),
            Decision::NoOp => operation(PlanAction::NoOp, id, kind, ChangeReason::Unchanged, false),
            Decision::Replace(reason) => {
                let recorded_kind = records.get(id).map_or(kind, |r| r.kind);
                let delete = operation(PlanAction::Delete, id, recorded_kind, reason.clone(), true);
                ops.insert(delete.key.clone(), delete);
                operation(PlanAction::Create, id, kind, reason, true)
            }
        };
        primary.insert(id.to_string(), op.key.clone());
        ops.insert(op.key.clone(), op);
    }

    if options.target.is_none() {
        for (id, record) in records {
            if !graph.contains(id) {
                let delete = operation(PlanAction::Delete, id, record.kind, ChangeReason::Removed, false);
                ops.insert(delete.key.clone(), delete);
            }
        }
    }

    // Prerequisites
    let keys: Vec<OpKey> = ops.keys().cloned().collect();
    for key in keys {
        let mut prereqs = BTreeSet::new();
        if key.action == PlanAction::Delete {
            for (other, record) in records {
                if other == &key.id || !record.dependencies.contains(&key.id) {
                    continue;
                }
                let delete = OpKey::new(PlanAction::Delete, other.clone());
                if ops.contains_key(&delete) {
                    prereqs.insert(delete);
                } else if let Some(p) = primary.get(other).filter(|p| p.action != PlanAction::Create) {
                    // A fresh create never points at the resource being deleted
                    prereqs.insert(p.clone());
                }
            }
        } else if let Some(node) = graph.get(&key.id) {
            prereqs.extend(node.dependencies().into_iter().filter_map(|d| primary.get(d).cloned()));
            let own_delete = OpKey::new(PlanAction::Delete, key.id.clone());
            if ops.contains_key(&own_delete) {
                prereqs.insert(own_delete);
            }
        }
        if let Some(op) = ops.get_mut(&key) {
            op.prerequisites = prereqs.into_iter().collect();
        }
    }

    let plan = ExecutionPlan::assemble(ops)?;
    let summary = plan.summary();
    log::info!(
        "Plan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged",
        summary.create,
        summary.update,
        summary.replace,
        summary.delete,
        summary.unchanged
    );
    Ok(plan)
}

/// Plan deletion of every recorded resource, dependents first
///
/// With a target, only the target and everything that depended on it are
/// deleted. No declaration is needed.
pub fn plan_destroy(records: &RecordSet, target: Option<&str>) -> Result<ExecutionPlan> {
    let scope: BTreeSet<&str> = match target {
        None => records.keys().map(String::as_str).collect(),
        Some(target) => {
            if !records.contains_key(target) {
                return Err(Error::UnknownTarget(target.to_string()));
            }
            let mut scope = BTreeSet::from([target]);
            let mut stack = vec![target];
            while let Some(current) = stack.pop() {
                for (id, record) in records {
                    if record.dependencies.contains(current) && scope.insert(id.as_str()) {
                        stack.push(id.as_str());
                    }
                }
            }
            scope
        }
    };

    let mut ops = BTreeMap::new();
    for id in &scope {
        let record = &records[*id];
        let mut op = operation(PlanAction::Delete, id, record.kind, ChangeReason::Removed, false);
        op.prerequisites = records
            .iter()
            .filter(|(other, r)| {
                other.as_str() != *id && scope.contains(other.as_str()) && r.dependencies.contains(*id)
            })
            .map(|(other, _)| OpKey::new(PlanAction::Delete, other.clone()))
            .collect();
        ops.insert(op.key.clone(), op);
    }

    let plan = ExecutionPlan::assemble(ops)?;
    log::info!("Destroy plan: {} resource(s)", plan.len());
    Ok(plan)
}
