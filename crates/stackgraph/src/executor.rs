//! Execution engine - runs a plan against a provider with bounded parallelism
//!
//! The scheduler runs on the calling thread. Provider calls run as jobs on
//! a rayon pool and report back over a channel, so the scheduler is the
//! only writer of the state store and the output resolver. An operation is
//! dispatched once every prerequisite has succeeded; the first fatal
//! failure halts dispatch, in-flight jobs finish, and the operations that
//! succeeded in this run are undone in reverse order.

use crate::error::{Error, Result};
use crate::graph::ResourceGraph;
use crate::node::ResourceNode;
use crate::outputs::OutputResolver;
use crate::plan::{ChangeReason, ExecutionPlan, OpKey, PlanAction, PlanOperation};
use crate::provider::{
    CancelToken, ErrorCategory, ProgressCallback, Provider, ProviderError, Realized,
};
use crate::report::{
    ExecuteSummary, ExecutionReport, FailureCause, OpOutcome, OpReport, RollbackEntry,
    RollbackOutcome, RootCause, RunStatus,
};
use crate::retry::{Attempted, RetryCallback, RetryConfig, with_retry};
use crate::state::{RecordSet, RecordStatus, ResourceRecord, StateStore};
use crate::types::{Outputs, Properties, ResourceKind};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Sender};
use std::time::{Duration, Instant};

/// Default cap on worker threads when no explicit concurrency is set
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Worker threads; `None` uses one per independent group of operations
    pub concurrency: Option<usize>,
    /// Cap applied to the default concurrency
    pub max_concurrency: usize,
    /// Backoff for transient provider errors
    pub retry: RetryConfig,
    /// Undo this run's changes when it is cancelled
    pub rollback_on_cancel: bool,
    pub cancel: CancelToken,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryConfig::default(),
            rollback_on_cancel: false,
            cancel: CancelToken::new(),
        }
    }
}

impl ExecuteOptions {
    /// Number of worker threads to use for `plan`
    pub fn worker_count(&self, plan: &ExecutionPlan) -> usize {
        match self.concurrency {
            Some(n) => n.max(1),
            None => plan
                .independent_groups()
                .clamp(1, self.max_concurrency.max(1)),
        }
    }
}

enum Work {
    Create { reconcile: bool },
    Update { identity: String },
    Delete { identity: Option<String> },
}

/// A provider call handed to a worker; owns everything it needs
struct Job {
    key: OpKey,
    kind: ResourceKind,
    work: Work,
    properties: Properties,
}

enum Completion {
    Created { realized: Realized, adopted: bool },
    Updated { outputs: Outputs },
    Deleted { existed: bool },
}

enum Message {
    Retry {
        key: OpKey,
        attempt: u32,
        error: ProviderError,
        delay: Duration,
    },
    Finished {
        key: OpKey,
        outcome: Attempted<Completion>,
    },
}

/// Forwards worker-side retries to the scheduler
struct ChannelRetry<'a> {
    key: &'a OpKey,
    tx: &'a Sender<Message>,
}

impl RetryCallback for ChannelRetry<'_> {
    fn on_retry(&self, attempt: u32, _max_attempts: u32, error: &ProviderError, delay: Duration) {
        // The scheduler outlives every job; a closed channel only means it bailed out
        let _ = self.tx.send(Message::Retry {
            key: self.key.clone(),
            attempt,
            error: error.clone(),
            delay,
        });
    }
}

/// Adopt a resource left by an interrupted run, or create it
fn run_create(
    job: &Job,
    reconcile: bool,
    provider: &dyn Provider,
    retry: &RetryConfig,
    callback: &dyn RetryCallback,
) -> Attempted<Completion> {
    let mut attempts = 0;
    if reconcile {
        let found = with_retry(retry, Some(callback), || provider.lookup(job.kind, &job.key.id));
        attempts += found.attempts;
        match found.result {
            Ok(Some(realized)) => {
                return Attempted {
                    result: Ok(Completion::Created {
                        realized,
                        adopted: true,
                    }),
                    attempts,
                };
            }
            Ok(None) => {}
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts,
                };
            }
        }
    }

    let created = with_retry(retry, Some(callback), || {
        provider.create(job.kind, &job.key.id, &job.properties)
    });
    Attempted {
        result: created.result.map(|realized| Completion::Created {
            realized,
            adopted: false,
        }),
        attempts: attempts + created.attempts,
    }
}

/// Delete a resource; an identity-less record is looked up first
fn run_delete(
    job: &Job,
    identity: Option<&str>,
    provider: &dyn Provider,
    retry: &RetryConfig,
    callback: &dyn RetryCallback,
) -> Attempted<Completion> {
    let mut attempts = 0;
    let identity = match identity {
        Some(identity) => identity.to_string(),
        None => {
            let found = with_retry(retry, Some(callback), || provider.lookup(job.kind, &job.key.id));
            attempts += found.attempts;
            match found.result {
                Ok(Some(realized)) => realized.identity,
                Ok(None) => {
                    return Attempted {
                        result: Ok(Completion::Deleted { existed: false }),
                        attempts,
                    };
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts,
                    };
                }
            }
        }
    };

    let deleted = with_retry(retry, Some(callback), || provider.delete(job.kind, &identity));
    let result = match deleted.result {
        Ok(()) => Ok(Completion::Deleted { existed: true }),
        // Deletes are idempotent
        Err(ProviderError::NotFound(_)) => Ok(Completion::Deleted { existed: false }),
        Err(e) => Err(e),
    };
    Attempted {
        result,
        attempts: attempts + deleted.attempts,
    }
}

/// Perform one job on a worker thread
fn run_job(
    job: &Job,
    provider: &dyn Provider,
    retry: &RetryConfig,
    callback: &dyn RetryCallback,
) -> Attempted<Completion> {
    match &job.work {
        Work::Create { reconcile } => run_create(job, *reconcile, provider, retry, callback),
        Work::Update { identity } => {
            let updated = with_retry(retry, Some(callback), || {
                provider.update(job.kind, identity, &job.properties)
            });
            Attempted {
                result: updated.result.map(|outputs| Completion::Updated { outputs }),
                attempts: updated.attempts,
            }
        }
        Work::Delete { identity } => run_delete(job, identity.as_deref(), provider, retry, callback),
    }
}

enum Slot {
    Pending,
    InFlight {
        started: Instant,
        properties: Properties,
    },
    Done(OpReport),
}

enum Start {
    /// Completed on the scheduler thread without a provider call
    Inline,
    Dispatch(Job),
}

struct Scheduler<'a> {
    plan: &'a ExecutionPlan,
    graph: &'a ResourceGraph,
    records: &'a RecordSet,
    store: &'a mut dyn StateStore,
    progress: &'a mut dyn ProgressCallback,
    resolver: OutputResolver,
    slots: BTreeMap<OpKey, Slot>,
    /// Succeeded operations in completion order
    completed: Vec<OpKey>,
    first_failure: Option<OpKey>,
    cancelled: bool,
}

/// Resolver seeded with the outputs of every resource known to exist
fn recorded_outputs(records: &RecordSet) -> OutputResolver {
    let mut resolver = OutputResolver::new();
    for (id, record) in records.iter().filter(|(_, r)| !r.is_unknown()) {
        resolver.publish(id, record.outputs.clone());
    }
    resolver
}

impl<'a> Scheduler<'a> {
    fn new(
        plan: &'a ExecutionPlan,
        graph: &'a ResourceGraph,
        records: &'a RecordSet,
        store: &'a mut dyn StateStore,
        progress: &'a mut dyn ProgressCallback,
    ) -> Self {
        let resolver = recorded_outputs(records);
        Self {
            plan,
            graph,
            records,
            store,
            progress,
            resolver,
            slots: plan
                .operations()
                .iter()
                .map(|op| (op.key.clone(), Slot::Pending))
                .collect(),
            completed: Vec::new(),
            first_failure: None,
            cancelled: false,
        }
    }

    fn is_halted(&self) -> bool {
        self.first_failure.is_some() || self.cancelled
    }

    fn has_pending(&self) -> bool {
        self.slots.values().any(|s| matches!(s, Slot::Pending))
    }

    fn is_pending(&self, key: &OpKey) -> bool {
        matches!(self.slots.get(key), Some(Slot::Pending))
    }

    fn node(&self, id: &str) -> Result<&'a ResourceNode> {
        let graph: &'a ResourceGraph = self.graph;
        graph
            .get(id)
            .ok_or_else(|| Error::PlanMismatch(id.to_string()))
    }

    /// First pending operation whose prerequisites all succeeded
    fn next_ready(&self, has_capacity: bool) -> Option<&'a PlanOperation> {
        let plan: &'a ExecutionPlan = self.plan;
        plan.operations().iter().find(|op| {
            self.is_pending(&op.key)
                && (has_capacity || !op.touches_provider())
                && op.prerequisites.iter().all(|p| match self.slots.get(p) {
                    Some(Slot::Done(report)) => report.outcome.is_success(),
                    Some(_) => false,
                    None => true,
                })
        })
    }

    /// Mark pending operations whose prerequisites can no longer succeed
    fn propagate_blocked(&mut self) {
        // Operations are ordered by wave, so one pass reaches every descendant
        let plan = self.plan;
        for op in plan.operations() {
            if !self.is_pending(&op.key) {
                continue;
            }
            let root_cause = op.prerequisites.iter().find_map(|p| match self.slots.get(p) {
                Some(Slot::Done(report)) => report.root_cause(),
                _ => None,
            });
            if let Some(root_cause) = root_cause {
                log::warn!("{} blocked by {root_cause}", op.key);
                self.complete(OpReport::new(
                    op.key.clone(),
                    op.kind,
                    OpOutcome::Blocked { root_cause },
                ));
            }
        }
    }

    fn complete(&mut self, report: OpReport) {
        if report.key.action != PlanAction::NoOp {
            self.progress.on_operation_complete(&report);
        }
        if report.outcome == OpOutcome::Succeeded {
            self.completed.push(report.key.clone());
        }
        self.slots.insert(report.key.clone(), Slot::Done(report));
    }

    fn fail(&mut self, op: &PlanOperation, cause: FailureCause, error: String, attempts: u32) {
        log::error!("{} failed: {error}", op.key);
        self.first_failure.get_or_insert_with(|| op.key.clone());
        let mut report = OpReport::new(op.key.clone(), op.kind, OpOutcome::Failed { cause, error });
        report.attempts = attempts;
        self.complete(report);
    }

    /// Begin an operation: resolve its inputs and either finish it here or build a job
    fn start(&mut self, op: &'a PlanOperation) -> Result<Start> {
        let id = op.id();

        if op.action() == PlanAction::NoOp {
            if op.kind == ResourceKind::OutputBinding {
                let node = self.node(id)?;
                if let Err(e) = self.resolver.bind(node) {
                    self.fail(op, FailureCause::MissingOutput, e.to_string(), 0);
                    return Ok(Start::Inline);
                }
            }
            self.complete(OpReport::new(op.key.clone(), op.kind, OpOutcome::NoOp));
            return Ok(Start::Inline);
        }

        if op.action() == PlanAction::Delete {
            self.progress
                .on_operation_start(&op.key.to_string(), &format!("{} {id}", op.kind));
            let identity = self.records.get(id).and_then(|r| r.identity.clone());
            if !op.kind.is_provisioned() {
                self.store.remove(id)?;
                self.complete(OpReport::new(op.key.clone(), op.kind, OpOutcome::Succeeded));
                return Ok(Start::Inline);
            }
            self.slots.insert(
                op.key.clone(),
                Slot::InFlight {
                    started: Instant::now(),
                    properties: Properties::new(),
                },
            );
            return Ok(Start::Dispatch(Job {
                key: op.key.clone(),
                kind: op.kind,
                work: Work::Delete { identity },
                properties: Properties::new(),
            }));
        }

        let node = self.node(id)?;
        self.progress
            .on_operation_start(&op.key.to_string(), &node.description());

        let resolved = match self.resolver.resolve(node.properties()) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail(op, FailureCause::MissingOutput, e.to_string(), 0);
                return Ok(Start::Inline);
            }
        };

        if !op.kind.is_provisioned() {
            let outputs = match self.resolver.bind(node) {
                Ok(outputs) => outputs,
                Err(e) => {
                    self.fail(op, FailureCause::MissingOutput, e.to_string(), 0);
                    return Ok(Start::Inline);
                }
            };
            self.store
                .commit(&ResourceRecord::succeeded(node, None, outputs, &resolved))?;
            self.complete(OpReport::new(op.key.clone(), op.kind, OpOutcome::Succeeded));
            return Ok(Start::Inline);
        }

        let work = if op.action() == PlanAction::Create {
            // Write-ahead intent: a crash from here on leaves an unknown record
            self.store.commit(&ResourceRecord::pending(node, &resolved))?;
            Work::Create {
                reconcile: op.reason == ChangeReason::Unknown,
            }
        } else {
            match self.records.get(id).and_then(|r| r.identity.clone()) {
                Some(identity) => Work::Update { identity },
                None => {
                    self.fail(
                        op,
                        FailureCause::Provider(ErrorCategory::Invalid),
                        format!("no recorded identity for '{id}'"),
                        0,
                    );
                    return Ok(Start::Inline);
                }
            }
        };

        self.slots.insert(
            op.key.clone(),
            Slot::InFlight {
                started: Instant::now(),
                properties: resolved.clone(),
            },
        );
        Ok(Start::Dispatch(Job {
            key: op.key.clone(),
            kind: op.kind,
            work,
            properties: resolved,
        }))
    }

    /// Record the result of a finished job
    fn finish(&mut self, key: &OpKey, outcome: Attempted<Completion>) -> Result<()> {
        let (plan, records) = (self.plan, self.records);
        let Some(op) = plan.get(key) else {
            return Err(Error::PlanMismatch(key.to_string()));
        };
        let (started, properties) = match self.slots.remove(key) {
            Some(Slot::InFlight {
                started,
                properties,
            }) => (started, properties),
            _ => (Instant::now(), Properties::new()),
        };
        let id = op.id();
        let previous = records.get(id);

        let completion = match outcome.result {
            Ok(completion) => completion,
            Err(e) => {
                // Persist the failure so the next plan retries or reconciles it
                let failed = match op.action() {
                    PlanAction::Create => Some(ResourceRecord::pending(self.node(id)?, &properties)),
                    _ => previous.cloned(),
                };
                if let Some(mut record) = failed {
                    record.status = RecordStatus::Failed;
                    record.updated_at = Utc::now();
                    self.store.commit(&record)?;
                }
                self.fail(op, FailureCause::Provider(e.category()), e.to_string(), outcome.attempts);
                return Ok(());
            }
        };

        let identity = match completion {
            Completion::Created { realized, adopted } => {
                if adopted {
                    log::info!("Adopted existing {id} ({})", realized.identity);
                }
                let node = self.node(id)?;
                let record = ResourceRecord::succeeded(
                    node,
                    Some(realized.identity.clone()),
                    realized.outputs.clone(),
                    &properties,
                );
                self.store.commit(&record)?;
                self.resolver.publish(id, realized.outputs);
                Some(realized.identity)
            }
            Completion::Updated { outputs } => {
                let node = self.node(id)?;
                let identity = previous.and_then(|r| r.identity.clone());
                let record =
                    ResourceRecord::succeeded(node, identity.clone(), outputs.clone(), &properties);
                self.store.commit(&record)?;
                self.resolver.publish(id, outputs);
                identity
            }
            Completion::Deleted { existed } => {
                if !existed {
                    log::info!("{id} was already gone");
                }
                self.store.remove(id)?;
                previous.and_then(|r| r.identity.clone())
            }
        };

        log::debug!("{key} succeeded after {} attempt(s)", outcome.attempts);
        let mut report = OpReport::new(key.clone(), op.kind, OpOutcome::Succeeded);
        report.attempts = outcome.attempts;
        report.duration = started.elapsed();
        report.identity = identity;
        self.complete(report);
        Ok(())
    }

    /// Dispatch and collect operations until nothing is left to run
    fn schedule<'s>(
        &mut self,
        scope: &rayon::Scope<'s>,
        provider: &'s dyn Provider,
        options: &'s ExecuteOptions,
        workers: usize,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Message>();
        let mut in_flight = 0usize;

        loop {
            loop {
                self.propagate_blocked();
                if !self.is_halted() && self.has_pending() && options.cancel.is_cancelled() {
                    log::warn!("Run cancelled; waiting for {in_flight} in-flight operation(s)");
                    self.cancelled = true;
                }
                if self.is_halted() {
                    break;
                }
                let Some(op) = self.next_ready(in_flight < workers) else {
                    break;
                };
                if let Start::Dispatch(job) = self.start(op)? {
                    log::debug!("Dispatching {}", job.key);
                    in_flight += 1;
                    let tx = tx.clone();
                    let retry = &options.retry;
                    scope.spawn(move |_| {
                        let callback = ChannelRetry {
                            key: &job.key,
                            tx: &tx,
                        };
                        let outcome = run_job(&job, provider, retry, &callback);
                        let _ = tx.send(Message::Finished {
                            key: job.key.clone(),
                            outcome,
                        });
                    });
                }
            }

            if in_flight == 0 {
                break;
            }

            match rx.recv() {
                Ok(Message::Retry {
                    key,
                    attempt,
                    error,
                    delay,
                }) => {
                    log::warn!(
                        "{key}: attempt {attempt} failed ({error}), retrying in {}ms",
                        delay.as_millis()
                    );
                    self.progress
                        .on_retry(&key.to_string(), attempt, &error, delay);
                }
                Ok(Message::Finished { key, outcome }) => {
                    in_flight -= 1;
                    self.finish(&key, outcome)?;
                }
                Err(_) => break,
            }
        }

        // Whatever is still pending never started
        let root_cause = match &self.first_failure {
            Some(key) => RootCause::Op(key.clone()),
            None => RootCause::Cancelled,
        };
        let plan = self.plan;
        let skipped: Vec<&PlanOperation> = plan
            .operations()
            .iter()
            .filter(|op| self.is_pending(&op.key))
            .collect();
        for op in skipped {
            self.complete(OpReport::new(
                op.key.clone(),
                op.kind,
                OpOutcome::Skipped {
                    root_cause: root_cause.clone(),
                },
            ));
        }
        Ok(())
    }

    /// Undo every operation that succeeded in this run, newest first
    fn rollback(&mut self, provider: &dyn Provider, retry: &RetryConfig) -> Result<Vec<RollbackEntry>> {
        let plan = self.plan;
        let completed = std::mem::take(&mut self.completed);
        let mut entries = Vec::with_capacity(completed.len());
        // Restored resources resolve against the outputs recorded before the run
        self.resolver = recorded_outputs(self.records);
        // Resources still live in their new form after a failed undo
        let mut stuck: BTreeSet<String> = BTreeSet::new();

        for key in completed.into_iter().rev() {
            let Some(op) = plan.get(&key) else {
                continue;
            };
            if op.action() == PlanAction::NoOp {
                continue;
            }
            let removes_or_reverts = matches!(op.action(), PlanAction::Create | PlanAction::Update);
            let blocking = removes_or_reverts
                .then(|| stuck.iter().find(|d| self.depends_on(d, op.id())).cloned())
                .flatten();
            if let Some(dependent) = blocking {
                log::warn!("Keeping {key}: dependent '{dependent}' could not be undone");
                stuck.insert(op.id().to_string());
                entries.push(RollbackEntry {
                    key,
                    outcome: RollbackOutcome::Kept { dependent },
                });
                continue;
            }

            log::warn!("Rolling back {key}");
            self.progress.on_rollback(&key.to_string());

            let outcome = self.undo(op, provider, retry)?;
            if let RollbackOutcome::Failed { error } = &outcome {
                log::warn!("Rollback of {key} failed: {error}");
                if removes_or_reverts {
                    stuck.insert(op.id().to_string());
                }
            }
            entries.push(RollbackEntry { key, outcome });
        }
        Ok(entries)
    }

    /// Whether `id` is declared or recorded as depending on `upstream`
    fn depends_on(&self, id: &str, upstream: &str) -> bool {
        self.graph.get(id).is_some_and(|n| n.dependencies().contains(upstream))
            || self
                .records
                .get(id)
                .is_some_and(|r| r.dependencies.contains(upstream))
    }

    fn undo(
        &mut self,
        op: &PlanOperation,
        provider: &dyn Provider,
        retry: &RetryConfig,
    ) -> Result<RollbackOutcome> {
        let id = op.id();
        let kind = op.kind;
        let records = self.records;
        let previous = records.get(id);

        match op.action() {
            PlanAction::Create => {
                let identity = match self.slots.get(&op.key) {
                    Some(Slot::Done(report)) => report.identity.clone(),
                    _ => None,
                };
                if let (true, Some(identity)) = (kind.is_provisioned(), identity) {
                    match with_retry(retry, None, || provider.delete(kind, &identity)).result {
                        Ok(()) | Err(ProviderError::NotFound(_)) => {}
                        Err(e) => return Ok(RollbackOutcome::Failed { error: e.to_string() }),
                    }
                }
                self.store.remove(id)?;
            }
            PlanAction::Update | PlanAction::Delete => {
                let Some(previous) = previous else {
                    return Ok(RollbackOutcome::Failed {
                        error: format!("no prior record for '{id}'"),
                    });
                };
                let mut restored = previous.clone();
                // Nothing was known to exist before an identity-less delete
                let recreate =
                    kind.is_provisioned() && !(op.action() == PlanAction::Delete && previous.is_unknown());
                if recreate {
                    // Upstream identities may have changed since the record was written
                    let properties = match self.resolver.resolve(&previous.declared_properties) {
                        Ok(properties) => properties,
                        Err(e) => return Ok(RollbackOutcome::Failed { error: e.to_string() }),
                    };
                    let result = if op.action() == PlanAction::Update {
                        let identity = previous.identity.clone().unwrap_or_default();
                        with_retry(retry, None, || provider.update(kind, &identity, &properties))
                            .result
                            .map(|outputs| (None, outputs))
                    } else {
                        with_retry(retry, None, || provider.create(kind, id, &properties))
                            .result
                            .map(|realized| (Some(realized.identity), realized.outputs))
                    };
                    match result {
                        Ok((identity, outputs)) => {
                            if identity.is_some() {
                                restored.identity = identity;
                            }
                            restored.outputs = outputs;
                            restored.applied_properties = properties;
                        }
                        Err(e) => return Ok(RollbackOutcome::Failed { error: e.to_string() }),
                    }
                    restored.status = RecordStatus::Succeeded;
                }
                restored.updated_at = Utc::now();
                self.store.commit(&restored)?;
                if !restored.is_unknown() {
                    self.resolver.publish(id, restored.outputs.clone());
                }
            }
            PlanAction::NoOp => {}
        }
        Ok(RollbackOutcome::Undone)
    }

    fn into_report(self, status: RunStatus, rollback: Vec<RollbackEntry>) -> ExecutionReport {
        let mut slots = self.slots;
        let mut summary = ExecuteSummary::default();
        let operations: Vec<OpReport> = self
            .plan
            .operations()
            .iter()
            .map(|op| match slots.remove(&op.key) {
                Some(Slot::Done(report)) => report,
                _ => OpReport::new(
                    op.key.clone(),
                    op.kind,
                    OpOutcome::Skipped {
                        root_cause: RootCause::Cancelled,
                    },
                ),
            })
            .collect();
        for report in &operations {
            summary.add_result(report);
        }
        for entry in &rollback {
            summary.add_rollback(entry);
        }

        let outputs = if status == RunStatus::Succeeded {
            self.resolver.into_exports()
        } else {
            BTreeMap::new()
        };

        ExecutionReport {
            status,
            operations,
            rollback,
            outputs,
            summary,
        }
    }
}

/// Execute a plan against a provider
///
/// `records` must be the state the plan was computed from. For a destroy
/// plan `graph` may be empty: deletes only need the recorded identities.
///
/// Returns `Err` only when the state store fails or the plan does not
/// match the graph; provider failures are contained in the report.
pub fn execute(
    plan: &ExecutionPlan,
    graph: &ResourceGraph,
    records: &RecordSet,
    provider: &dyn Provider,
    store: &mut dyn StateStore,
    options: &ExecuteOptions,
    progress: &mut dyn ProgressCallback,
) -> Result<ExecutionReport> {
    let workers = options.worker_count(plan);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("stackgraph-worker-{i}"))
        .build()
        .map_err(|e| Error::WorkerPool(e.to_string()))?;

    log::info!(
        "Executing {} operation(s) with {workers} worker(s)",
        plan.changes().count()
    );
    progress.on_run_start(plan.changes().count());

    let mut scheduler = Scheduler::new(plan, graph, records, store, progress);
    pool.in_place_scope(|scope| scheduler.schedule(scope, provider, options, workers))?;

    let status = if scheduler.first_failure.is_some() {
        RunStatus::Failed
    } else if scheduler.cancelled {
        RunStatus::Cancelled
    } else {
        RunStatus::Succeeded
    };

    let rollback = match status {
        RunStatus::Failed => scheduler.rollback(provider, &options.retry.undo_budget())?,
        RunStatus::Cancelled if options.rollback_on_cancel => {
            scheduler.rollback(provider, &options.retry.undo_budget())?
        }
        _ => Vec::new(),
    };

    if status == RunStatus::Succeeded {
        scheduler.store.compact()?;
    }

    let report = scheduler.into_report(status, rollback);
    log::info!(
        "Run {:?}: {} created, {} updated, {} deleted, {} failed, {} blocked, {} skipped",
        report.status,
        report.summary.created,
        report.summary.updated,
        report.summary.deleted,
        report.summary.failed,
        report.summary.blocked,
        report.summary.skipped
    );
    Ok(report)
}
