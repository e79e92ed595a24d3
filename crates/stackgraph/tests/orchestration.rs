//! End-to-end plan/apply/destroy runs against an in-process fake provider

use stackgraph::{
    CancelToken, ChangeReason, Error, ExecuteOptions, ExecutionReport, FileStateStore,
    MemoryStateStore, NoProgress, OpKey, OpOutcome, OpReport, Outputs, PlanAction, PlanOptions,
    ProgressCallback, Properties, Provider, ProviderError, Realized, RecordSet, ReplacePolicy,
    ResourceGraph, ResourceKind, ResourceNode, ResourceRecord, RetryConfig, RollbackOutcome,
    RootCause, RunStatus, StateStore, Value, execute, plan, plan_destroy,
};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Live {
    kind: ResourceKind,
    logical_id: String,
    properties: Properties,
}

#[derive(Default)]
struct Inner {
    live: BTreeMap<String, Live>,
    calls: Vec<String>,
    next: u64,
    fatal: BTreeMap<String, ProviderError>,
    undeletable: BTreeMap<String, ProviderError>,
    throttled: BTreeMap<String, u32>,
}

/// Provider keeping resources in memory, with injectable failures
#[derive(Default)]
struct FakeProvider {
    inner: Mutex<Inner>,
}

impl FakeProvider {
    fn fail_create(&self, logical_id: &str, error: ProviderError) {
        self.inner
            .lock()
            .unwrap()
            .fatal
            .insert(logical_id.to_string(), error);
    }

    fn fail_delete(&self, logical_id: &str, error: ProviderError) {
        self.inner
            .lock()
            .unwrap()
            .undeletable
            .insert(logical_id.to_string(), error);
    }

    fn throttle(&self, logical_id: &str, times: u32) {
        self.inner
            .lock()
            .unwrap()
            .throttled
            .insert(logical_id.to_string(), times);
    }

    /// Simulate a resource created by a run that crashed before recording it
    fn seed(&self, kind: ResourceKind, logical_id: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next += 1;
        let identity = format!("{kind}-{}", inner.next);
        inner.live.insert(
            identity.clone(),
            Live {
                kind,
                logical_id: logical_id.to_string(),
                properties: Properties::new(),
            },
        );
        identity
    }

    fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .lock()
            .unwrap()
            .live
            .values()
            .map(|l| l.logical_id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn live_properties(&self, logical_id: &str) -> Option<Properties> {
        self.inner
            .lock()
            .unwrap()
            .live
            .values()
            .find(|l| l.logical_id == logical_id)
            .map(|l| l.properties.clone())
    }

    fn outputs(kind: ResourceKind, logical_id: &str, identity: &str) -> Outputs {
        Outputs::from([
            ("id".to_string(), identity.to_string()),
            ("arn".to_string(), format!("arn:fake:{kind}:{logical_id}")),
        ])
    }
}

impl Provider for FakeProvider {
    fn create(
        &self,
        kind: ResourceKind,
        logical_id: &str,
        properties: &Properties,
    ) -> Result<Realized, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("create:{logical_id}"));

        if let Some(remaining) = inner.throttled.get_mut(logical_id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ProviderError::Throttled("rate exceeded".into()));
        }
        if let Some(error) = inner.fatal.get(logical_id) {
            return Err(error.clone());
        }

        inner.next += 1;
        let identity = format!("{kind}-{}", inner.next);
        inner.live.insert(
            identity.clone(),
            Live {
                kind,
                logical_id: logical_id.to_string(),
                properties: properties.clone(),
            },
        );
        Ok(Realized::new(
            identity.clone(),
            Self::outputs(kind, logical_id, &identity),
        ))
    }

    fn update(
        &self,
        kind: ResourceKind,
        identity: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("update:{identity}"));
        let live = inner
            .live
            .get_mut(identity)
            .ok_or_else(|| ProviderError::NotFound(identity.to_string()))?;
        live.properties = properties.clone();
        Ok(Self::outputs(kind, &live.logical_id.clone(), identity))
    }

    fn delete(&self, _kind: ResourceKind, identity: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let logical_id = inner
            .live
            .get(identity)
            .map_or_else(|| identity.to_string(), |l| l.logical_id.clone());
        inner.calls.push(format!("delete:{logical_id}"));
        if let Some(error) = inner.undeletable.get(&logical_id) {
            return Err(error.clone());
        }
        inner
            .live
            .remove(identity)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(identity.to_string()))
    }

    fn lookup(
        &self,
        kind: ResourceKind,
        logical_id: &str,
    ) -> Result<Option<Realized>, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("lookup:{logical_id}"));
        Ok(inner
            .live
            .iter()
            .find(|(_, l)| l.logical_id == logical_id && l.kind == kind)
            .map(|(identity, _)| {
                Realized::new(identity.clone(), Self::outputs(kind, logical_id, identity))
            }))
    }
}

/// Progress sink that keeps every event as a string
#[derive(Default)]
struct Events(Vec<String>);

impl ProgressCallback for Events {
    fn on_run_start(&mut self, total: usize) {
        self.0.push(format!("start {total}"));
    }

    fn on_operation_start(&mut self, key: &str, _description: &str) {
        self.0.push(format!("begin {key}"));
    }

    fn on_retry(&mut self, key: &str, attempt: u32, _error: &ProviderError, _delay: Duration) {
        self.0.push(format!("retry {key} #{attempt}"));
    }

    fn on_operation_complete(&mut self, report: &OpReport) {
        self.0
            .push(format!("{} {}", report.outcome.label(), report.key));
    }

    fn on_rollback(&mut self, key: &str) {
        self.0.push(format!("rollback {key}"));
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn network(cidr: &str) -> ResourceNode {
    ResourceNode::builder("n", ResourceKind::Network)
        .prop("cidr", cidr)
        .build()
        .unwrap()
}

fn cluster() -> ResourceNode {
    ResourceNode::builder("c", ResourceKind::Cluster)
        .prop("name", "app")
        .prop("version", "1.29")
        .reference("network", "n", "id")
        .build()
        .unwrap()
}

fn compute() -> ResourceNode {
    ResourceNode::builder("r", ResourceKind::ComputeProfile)
        .reference("cluster", "c", "id")
        .prop("instance_type", "m5.large")
        .prop("min_size", 1i64)
        .prop("max_size", 3i64)
        .build()
        .unwrap()
}

fn registry() -> ResourceNode {
    ResourceNode::builder("s", ResourceKind::Registry)
        .prop("name", "images")
        .build()
        .unwrap()
}

fn endpoint_binding() -> ResourceNode {
    ResourceNode::builder("cluster-id", ResourceKind::OutputBinding)
        .prop("name", "cluster_id")
        .reference("value", "c", "id")
        .build()
        .unwrap()
}

fn ncr() -> ResourceGraph {
    ResourceGraph::build(vec![network("10.0.0.0/16"), cluster(), compute()]).unwrap()
}

fn fast_retry() -> ExecuteOptions {
    ExecuteOptions {
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(5),
        },
        ..Default::default()
    }
}

fn apply(
    graph: &ResourceGraph,
    provider: &FakeProvider,
    store: &mut dyn StateStore,
    options: &PlanOptions,
) -> ExecutionReport {
    let records = store.load().unwrap();
    let plan = plan(graph, &records, options).unwrap();
    execute(
        &plan,
        graph,
        &records,
        provider,
        store,
        &fast_retry(),
        &mut NoProgress,
    )
    .unwrap()
}

fn keys(report: &ExecutionReport, outcome: &str) -> Vec<String> {
    report
        .operations
        .iter()
        .filter(|r| r.outcome.label() == outcome)
        .map(|r| r.key.to_string())
        .collect()
}

// ============================================================================
// Apply
// ============================================================================

#[test]
fn test_apply_creates_in_dependency_order() {
    let graph = ncr();
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();

    let plan = plan(&graph, &RecordSet::new(), &PlanOptions::default()).unwrap();
    let waves: Vec<Vec<String>> = plan
        .waves()
        .iter()
        .map(|w| w.iter().map(|op| op.key.to_string()).collect())
        .collect();
    assert_eq!(waves, vec![vec!["create:n"], vec!["create:c"], vec!["create:r"]]);

    let report = execute(
        &plan,
        &graph,
        &RecordSet::new(),
        &provider,
        &mut store,
        &fast_retry(),
        &mut NoProgress,
    )
    .unwrap();

    assert!(report.is_success());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.created, 3);
    assert_eq!(provider.calls(), vec!["create:n", "create:c", "create:r"]);

    let records = store.load().unwrap();
    assert!(records.values().all(|r| r.identity.is_some()));
    assert_eq!(records["c"].dependencies.iter().collect::<Vec<_>>(), vec!["n"]);
}

#[test]
fn test_outputs_flow_into_dependents() {
    let graph = ncr();
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    apply(&graph, &provider, &mut store, &PlanOptions::default());

    let records = store.load().unwrap();
    let network_id = records["n"].identity.clone().unwrap();
    let cluster_props = provider.live_properties("c").unwrap();
    assert_eq!(cluster_props["network"], Value::String(network_id));
    assert!(cluster_props.values().all(Value::is_resolved));
}

#[test]
fn test_reapply_makes_no_provider_calls() {
    let graph = ncr();
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    apply(&graph, &provider, &mut store, &PlanOptions::default());
    let calls_after_first = provider.calls().len();

    let records = store.load().unwrap();
    let second = plan(&graph, &records, &PlanOptions::default()).unwrap();
    assert!(!second.has_changes());
    assert!(
        second
            .operations()
            .iter()
            .all(|op| op.reason == ChangeReason::Unchanged)
    );

    let report = apply(&graph, &provider, &mut store, &PlanOptions::default());
    assert!(report.is_success());
    assert_eq!(report.summary.no_change, 3);
    assert_eq!(provider.calls().len(), calls_after_first);
}

#[test]
fn test_removed_node_deleted_and_new_node_created() {
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    apply(&ncr(), &provider, &mut store, &PlanOptions::default());

    let next = ResourceGraph::build(vec![network("10.0.0.0/16"), cluster(), registry()]).unwrap();
    let records = store.load().unwrap();
    let plan = plan(&next, &records, &PlanOptions::default()).unwrap();
    let changes: Vec<String> = plan.changes().map(|op| op.key.to_string()).collect();
    assert_eq!(changes, vec!["delete:r", "create:s"]);

    let report = apply(&next, &provider, &mut store, &PlanOptions::default());
    assert!(report.is_success());
    assert_eq!(provider.live_ids(), vec!["c", "n", "s"]);
    assert!(!store.load().unwrap().contains_key("r"));
}

#[test]
fn test_independent_upstreams_run_before_shared_dependent() {
    let standalone = ResourceNode::builder("r", ResourceKind::Registry)
        .prop("name", "images")
        .build()
        .unwrap();
    let dependent = ResourceNode::builder("c", ResourceKind::Cluster)
        .prop("name", "app")
        .prop("version", "1.29")
        .reference("network", "n", "id")
        .depends_on("r")
        .build()
        .unwrap();
    let graph = ResourceGraph::build(vec![network("10.0.0.0/16"), dependent, standalone]).unwrap();

    let plan = plan(&graph, &RecordSet::new(), &PlanOptions::default()).unwrap();
    let waves: Vec<Vec<String>> = plan
        .waves()
        .iter()
        .map(|w| w.iter().map(|op| op.key.to_string()).collect())
        .collect();
    assert_eq!(waves, vec![vec!["create:n", "create:r"], vec!["create:c"]]);
    assert_eq!(
        plan.get(&OpKey::new(PlanAction::Create, "c")).unwrap().prerequisites,
        vec![OpKey::new(PlanAction::Create, "n"), OpKey::new(PlanAction::Create, "r")]
    );

    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    let report = execute(
        &plan,
        &graph,
        &RecordSet::new(),
        &provider,
        &mut store,
        &fast_retry(),
        &mut NoProgress,
    )
    .unwrap();

    assert!(report.is_success());
    let calls = provider.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2], "create:c");
    assert!(calls[..2].contains(&"create:n".to_string()));
    assert!(calls[..2].contains(&"create:r".to_string()));
    assert_eq!(
        store.load().unwrap()["c"].dependencies.iter().collect::<Vec<_>>(),
        vec!["n", "r"]
    );
}

#[test]
fn test_swap_standalone_for_network_dependent() {
    let standalone = ResourceNode::builder("r", ResourceKind::Registry)
        .prop("name", "images")
        .build()
        .unwrap();
    let before = ResourceGraph::build(vec![network("10.0.0.0/16"), cluster(), standalone]).unwrap();
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    assert!(apply(&before, &provider, &mut store, &PlanOptions::default()).is_success());

    let added = ResourceNode::builder("s", ResourceKind::Registry)
        .prop("name", "charts")
        .depends_on("n")
        .build()
        .unwrap();
    let after = ResourceGraph::build(vec![network("10.0.0.0/16"), cluster(), added]).unwrap();
    let records = store.load().unwrap();
    let plan = plan(&after, &records, &PlanOptions::default()).unwrap();

    let changes: Vec<String> = plan.changes().map(|op| op.key.to_string()).collect();
    assert_eq!(changes, vec!["delete:r", "create:s"]);
    let delete_r = plan.get(&OpKey::new(PlanAction::Delete, "r")).unwrap();
    let create_s = plan.get(&OpKey::new(PlanAction::Create, "s")).unwrap();
    assert!(delete_r.prerequisites.is_empty());
    assert!(!create_s.prerequisites.contains(&delete_r.key));
    assert_eq!(create_s.prerequisites, vec![OpKey::new(PlanAction::NoOp, "n")]);
    assert!(plan.get(&OpKey::new(PlanAction::NoOp, "n")).is_some());
    assert!(plan.get(&OpKey::new(PlanAction::NoOp, "c")).is_some());

    let calls_before = provider.calls().len();
    let report = apply(&after, &provider, &mut store, &PlanOptions::default());
    assert!(report.is_success());
    assert_eq!(report.summary.no_change, 2);
    assert_eq!(provider.calls().len(), calls_before + 2);
    assert_eq!(provider.live_ids(), vec!["c", "n", "s"]);
}

#[test]
fn test_mutable_change_updates_in_place() {
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    apply(&ncr(), &provider, &mut store, &PlanOptions::default());
    let before = store.load().unwrap()["c"].identity.clone();

    let upgraded = ResourceNode::builder("c", ResourceKind::Cluster)
        .prop("name", "app")
        .prop("version", "1.30")
        .reference("network", "n", "id")
        .build()
        .unwrap();
    let graph = ResourceGraph::build(vec![network("10.0.0.0/16"), upgraded, compute()]).unwrap();

    let records = store.load().unwrap();
    let plan = plan(&graph, &records, &PlanOptions::default()).unwrap();
    let update = plan.get(&OpKey::new(PlanAction::Update, "c")).unwrap();
    assert_eq!(
        update.reason,
        ChangeReason::Changed {
            fields: vec!["version".into()]
        }
    );

    let report = apply(&graph, &provider, &mut store, &PlanOptions::default());
    assert_eq!(report.summary.updated, 1);
    assert_eq!(store.load().unwrap()["c"].identity, before);
    assert_eq!(
        provider.live_properties("c").unwrap()["version"],
        Value::from("1.30")
    );
}

#[test]
fn test_cycle_rejected_before_any_provider_call() {
    let a = ResourceNode::builder("a", ResourceKind::Registry)
        .prop("name", "a")
        .depends_on("b")
        .build()
        .unwrap();
    let b = ResourceNode::builder("b", ResourceKind::Registry)
        .prop("name", "b")
        .depends_on("a")
        .build()
        .unwrap();

    match ResourceGraph::build(vec![a, b]) {
        Err(Error::CyclicDependency { cycle }) => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

// ============================================================================
// Failure handling
// ============================================================================

#[test]
fn test_transient_errors_are_retried() {
    let graph = ncr();
    let provider = FakeProvider::default();
    provider.throttle("n", 2);
    let mut store = MemoryStateStore::new();
    let mut events = Events::default();

    let plan = plan(&graph, &RecordSet::new(), &PlanOptions::default()).unwrap();
    let report = execute(
        &plan,
        &graph,
        &RecordSet::new(),
        &provider,
        &mut store,
        &fast_retry(),
        &mut events,
    )
    .unwrap();

    assert!(report.is_success());
    let n = report.get(&OpKey::new(PlanAction::Create, "n")).unwrap();
    assert_eq!(n.attempts, 3);
    assert!(events.0.contains(&"retry create:n #1".to_string()));
    assert!(events.0.contains(&"retry create:n #2".to_string()));
    assert_eq!(events.0.first().map(String::as_str), Some("start 3"));
}

#[test]
fn test_fatal_failure_blocks_dependents_and_rolls_back() {
    let graph = ncr();
    let provider = FakeProvider::default();
    provider.fail_create("c", ProviderError::Invalid("unsupported version".into()));
    let mut store = MemoryStateStore::new();

    let report = apply(&graph, &provider, &mut store, &PlanOptions::default());

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(keys(&report, "failed"), vec!["create:c"]);
    let blocked = report.get(&OpKey::new(PlanAction::Create, "r")).unwrap();
    assert_eq!(
        blocked.outcome,
        OpOutcome::Blocked {
            root_cause: RootCause::Op(OpKey::new(PlanAction::Create, "c"))
        }
    );

    // The network was undone; nothing is left behind
    assert_eq!(report.rollback.len(), 1);
    assert_eq!(report.rollback[0].key, OpKey::new(PlanAction::Create, "n"));
    assert_eq!(report.rollback[0].outcome, RollbackOutcome::Undone);
    assert!(provider.live_ids().is_empty());
    assert!(report.outputs.is_empty());

    let records = store.load().unwrap();
    assert!(!records.contains_key("n"));
    assert!(records["c"].is_unknown());
}

#[test]
fn test_failed_create_retried_on_next_run() {
    let graph = ncr();
    let provider = FakeProvider::default();
    provider.fail_create("c", ProviderError::Conflict("name in use".into()));
    let mut store = MemoryStateStore::new();
    let first = apply(&graph, &provider, &mut store, &PlanOptions::default());
    assert!(!first.is_success());

    provider.inner.lock().unwrap().fatal.clear();
    let records = store.load().unwrap();
    let plan = plan(&graph, &records, &PlanOptions::default()).unwrap();
    let c = plan.get(&OpKey::new(PlanAction::Create, "c")).unwrap();
    assert_eq!(c.reason, ChangeReason::Unknown);

    let second = apply(&graph, &provider, &mut store, &PlanOptions::default());
    assert!(second.is_success());
    assert_eq!(provider.live_ids(), vec!["c", "n", "r"]);
}

#[test]
fn test_cancelled_run_starts_nothing() {
    let graph = ncr();
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    let cancel = CancelToken::new();
    cancel.cancel();
    let options = ExecuteOptions {
        cancel,
        ..fast_retry()
    };

    let plan = plan(&graph, &RecordSet::new(), &PlanOptions::default()).unwrap();
    let report = execute(
        &plan,
        &graph,
        &RecordSet::new(),
        &provider,
        &mut store,
        &options,
        &mut NoProgress,
    )
    .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.exit_code(), 2);
    assert!(report.operations.iter().all(|r| r.outcome
        == OpOutcome::Skipped {
            root_cause: RootCause::Cancelled
        }));
    assert!(provider.calls().is_empty());
    assert_eq!(store.writes(), 0);
}

#[test]
fn test_interrupted_create_is_adopted() {
    let graph = ncr();
    let provider = FakeProvider::default();
    let existing = provider.seed(ResourceKind::Network, "n");

    let mut pending = RecordSet::new();
    let n = graph.get("n").unwrap();
    pending.insert("n".into(), ResourceRecord::pending(n, n.properties()));
    let mut store = MemoryStateStore::with_records(pending);

    let records = store.load().unwrap();
    let plan = plan(&graph, &records, &PlanOptions::default()).unwrap();
    assert_eq!(
        plan.get(&OpKey::new(PlanAction::Create, "n")).unwrap().reason,
        ChangeReason::Unknown
    );

    let report = apply(&graph, &provider, &mut store, &PlanOptions::default());
    assert!(report.is_success());
    assert!(provider.calls().contains(&"lookup:n".to_string()));
    assert!(!provider.calls().contains(&"create:n".to_string()));
    assert_eq!(store.load().unwrap()["n"].identity, Some(existing));
}

// ============================================================================
// Replacement
// ============================================================================

#[test]
fn test_immutable_change_refused_by_default() {
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    apply(&ncr(), &provider, &mut store, &PlanOptions::default());

    let moved = ResourceGraph::build(vec![network("10.1.0.0/16"), cluster(), compute()]).unwrap();
    let records = store.load().unwrap();
    match plan(&moved, &records, &PlanOptions::default()) {
        Err(Error::ImmutableChange { node, fields }) => {
            assert_eq!(node, "n");
            assert_eq!(fields, vec!["cidr"]);
        }
        other => panic!("expected ImmutableChange, got {other:?}"),
    }
}

#[test]
fn test_destroy_then_create_replaces_dependents() {
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    apply(&ncr(), &provider, &mut store, &PlanOptions::default());
    let old_network = store.load().unwrap()["n"].identity.clone();

    let moved = ResourceGraph::build(vec![network("10.1.0.0/16"), cluster(), compute()]).unwrap();
    let options = PlanOptions {
        replace_policy: ReplacePolicy::DestroyThenCreate,
        target: None,
    };
    let records = store.load().unwrap();
    let plan = plan(&moved, &records, &options).unwrap();
    let order: Vec<String> = plan.operations().iter().map(|op| op.key.to_string()).collect();
    assert_eq!(
        order,
        vec![
            "delete:r", "delete:c", "delete:n", "create:n", "create:c", "create:r"
        ]
    );
    assert_eq!(
        plan.get(&OpKey::new(PlanAction::Create, "c")).unwrap().reason,
        ChangeReason::DependencyReplaced {
            upstream: "n".into()
        }
    );

    let report = apply(&moved, &provider, &mut store, &options);
    assert!(report.is_success());
    assert_eq!(provider.live_ids(), vec!["c", "n", "r"]);
    assert_ne!(store.load().unwrap()["n"].identity, old_network);
}

#[test]
fn test_rollback_rewires_restored_dependents() {
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    apply(&ncr(), &provider, &mut store, &PlanOptions::default());

    let moved = ResourceGraph::build(vec![network("10.1.0.0/16"), cluster(), compute()]).unwrap();
    let options = PlanOptions {
        replace_policy: ReplacePolicy::DestroyThenCreate,
        target: None,
    };
    provider.fail_create("r", ProviderError::Invalid("quota exhausted".into()));
    let report = apply(&moved, &provider, &mut store, &options);

    assert_eq!(report.status, RunStatus::Failed);
    let undone: Vec<(String, bool)> = report
        .rollback
        .iter()
        .map(|e| (e.key.to_string(), e.outcome == RollbackOutcome::Undone))
        .collect();
    assert_eq!(
        undone,
        vec![
            ("create:c".to_string(), true),
            ("create:n".to_string(), true),
            ("delete:n".to_string(), true),
            ("delete:c".to_string(), true),
            ("delete:r".to_string(), false),
        ]
    );

    // The restored cluster points at the restored network, not the deleted one
    let records = store.load().unwrap();
    let network_id = records["n"].identity.clone().unwrap();
    assert_eq!(provider.live_ids(), vec!["c", "n"]);
    assert_eq!(
        provider.live_properties("c").unwrap()["network"],
        Value::String(network_id.clone())
    );
    assert_eq!(records["c"].applied_properties["network"], Value::String(network_id));
    assert_eq!(
        provider.live_properties("n").unwrap()["cidr"],
        Value::from("10.0.0.0/16")
    );
}

#[test]
fn test_upstream_kept_when_dependent_undo_fails() {
    let graph = ncr();
    let provider = FakeProvider::default();
    provider.fail_create("r", ProviderError::Invalid("quota exhausted".into()));
    provider.fail_delete("c", ProviderError::Invalid("deletion protection".into()));
    let mut store = MemoryStateStore::new();

    let report = apply(&graph, &provider, &mut store, &PlanOptions::default());

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.rollback.len(), 2);
    assert_eq!(report.rollback[0].key, OpKey::new(PlanAction::Create, "c"));
    assert!(matches!(report.rollback[0].outcome, RollbackOutcome::Failed { .. }));
    assert_eq!(report.rollback[1].key, OpKey::new(PlanAction::Create, "n"));
    assert_eq!(
        report.rollback[1].outcome,
        RollbackOutcome::Kept {
            dependent: "c".into()
        }
    );
    assert_eq!(report.summary.rollback_failed, 2);

    // Nothing was deleted out from under the surviving cluster
    assert!(!provider.calls().contains(&"delete:n".to_string()));
    assert_eq!(provider.live_ids(), vec!["c", "n"]);
    let records = store.load().unwrap();
    assert!(records["n"].identity.is_some());
    assert!(records["c"].identity.is_some());
}

// ============================================================================
// Outputs, destroy and persistence
// ============================================================================

#[test]
fn test_output_binding_exported() {
    let graph = ResourceGraph::build(vec![
        network("10.0.0.0/16"),
        cluster(),
        endpoint_binding(),
    ])
    .unwrap();
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();

    let report = apply(&graph, &provider, &mut store, &PlanOptions::default());
    let cluster_id = store.load().unwrap()["c"].identity.clone().unwrap();
    assert_eq!(report.outputs.get("cluster_id"), Some(&cluster_id));
    assert!(!provider.calls().iter().any(|c| c.contains("cluster-id")));
}

#[test]
fn test_destroy_removes_dependents_first() {
    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    apply(&ncr(), &provider, &mut store, &PlanOptions::default());

    let records = store.load().unwrap();
    let plan = plan_destroy(&records, None).unwrap();
    let report = execute(
        &plan,
        &ResourceGraph::default(),
        &records,
        &provider,
        &mut store,
        &fast_retry(),
        &mut NoProgress,
    )
    .unwrap();

    assert!(report.is_success());
    assert_eq!(report.summary.deleted, 3);
    let deletes: Vec<String> = provider
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("delete:"))
        .collect();
    assert_eq!(deletes, vec!["delete:r", "delete:c", "delete:n"]);
    assert!(provider.live_ids().is_empty());
    assert!(store.load().unwrap().is_empty());
}

#[test]
fn test_independent_branches_run_in_parallel_pool() {
    let mut nodes = Vec::new();
    for i in 0..4 {
        nodes.push(
            ResourceNode::builder(format!("reg-{i}"), ResourceKind::Registry)
                .prop("name", format!("images-{i}"))
                .build()
                .unwrap(),
        );
    }
    let graph = ResourceGraph::build(nodes).unwrap();
    let plan = plan(&graph, &RecordSet::new(), &PlanOptions::default()).unwrap();
    assert_eq!(plan.independent_groups(), 4);
    assert_eq!(ExecuteOptions::default().worker_count(&plan), 4);

    let provider = FakeProvider::default();
    let mut store = MemoryStateStore::new();
    let report = apply(&graph, &provider, &mut store, &PlanOptions::default());
    assert!(report.is_success());
    assert_eq!(provider.live_ids().len(), 4);
}

#[test]
fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let graph = ncr();
    let provider = FakeProvider::default();

    {
        let mut store = FileStateStore::open(dir.path()).unwrap();
        assert!(matches!(
            FileStateStore::open(dir.path()),
            Err(Error::StateLocked(_))
        ));
        let report = apply(&graph, &provider, &mut store, &PlanOptions::default());
        assert!(report.is_success());
    }

    let mut reopened = FileStateStore::open(dir.path()).unwrap();
    let records = reopened.load().unwrap();
    assert_eq!(records.len(), 3);
    let plan = plan(&graph, &records, &PlanOptions::default()).unwrap();
    assert!(!plan.has_changes());
}
