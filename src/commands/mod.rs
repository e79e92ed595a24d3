//! Subcommand implementations
//!
//! Each command returns the process exit code: 0 on success, 1 when a run
//! failed, 2 when it was cancelled.

pub mod apply;
pub mod destroy;
pub mod graph;
pub mod outputs;
pub mod plan;
pub mod state;
pub mod validate;

use anyhow::{Context as AnyhowContext, Result};
use stackgraph::{
    CancelToken, Error, ExecuteOptions, ExecutionPlan, FileStateStore, PlanOptions, RecordSet,
    ReplacePolicy, ResourceGraph, StateLock, StateStore,
};
use std::time::Duration;

use crate::Context;
use crate::cli::ExecArgs;
use crate::declaration;
use crate::display::{self, ProgressReporter};
use crate::sandbox::SandboxProvider;
use crate::ui;

/// Load the stack declaration and build its graph
pub fn load_graph(ctx: &Context) -> Result<ResourceGraph> {
    let stack = &ctx.settings.stack;
    log::debug!("Loading stack {}", stack.display());
    declaration::load(stack)?
        .into_graph()
        .with_context(|| format!("Invalid stack {}", stack.display()))
}

/// Open the state directory for a run that writes, taking the lock
pub fn open_store(ctx: &Context, force_unlock: bool) -> Result<FileStateStore> {
    let dir = &ctx.settings.state_dir;
    if force_unlock && StateLock::force_release(dir)? {
        ui::warn("Removed existing state lock");
    }
    match FileStateStore::open(dir) {
        Ok(store) => Ok(store),
        Err(e @ Error::StateLocked(_)) => Err(anyhow::Error::new(e).context(
            "Another keel run is active. If it crashed, retry with --force-unlock",
        )),
        Err(e) => Err(e).with_context(|| format!("Could not open state in {}", dir.display())),
    }
}

/// Read recorded state without taking the lock
pub fn read_records(ctx: &Context) -> Result<RecordSet> {
    let dir = &ctx.settings.state_dir;
    let mut store = FileStateStore::open_unlocked(dir)
        .with_context(|| format!("Could not read state in {}", dir.display()))?;
    Ok(store.load()?)
}

/// Pick the replace policy from the flag, falling back to config
pub fn replace_policy(ctx: &Context, allow_replace: bool) -> ReplacePolicy {
    if allow_replace {
        ReplacePolicy::DestroyThenCreate
    } else {
        ctx.settings.execution.replace_policy
    }
}

/// Diff the graph against records
pub fn build_plan(
    graph: &ResourceGraph,
    records: &RecordSet,
    target: Option<&str>,
    replace_policy: ReplacePolicy,
) -> Result<ExecutionPlan> {
    let options = PlanOptions {
        replace_policy,
        target: target.map(str::to_string),
    };
    match stackgraph::plan(graph, records, &options) {
        Ok(plan) => Ok(plan),
        Err(e @ Error::ImmutableChange { .. }) => {
            Err(anyhow::Error::new(e).context("Planning refused; pass --allow-replace to recreate"))
        }
        Err(e) => Err(e.into()),
    }
}

/// Executor options from flags layered over config
pub fn execute_options(ctx: &Context, args: &ExecArgs) -> ExecuteOptions {
    let execution = &ctx.settings.execution;
    let cancel = args
        .timeout
        .or(execution.timeout_secs)
        .map(|secs| CancelToken::with_timeout(Duration::from_secs(secs)))
        .unwrap_or_default();

    ExecuteOptions {
        concurrency: args.jobs.or(execution.jobs),
        max_concurrency: execution.max_jobs,
        retry: ctx.settings.retry.clone(),
        rollback_on_cancel: args.rollback_on_cancel || execution.rollback_on_cancel,
        cancel,
    }
}

/// Confirm, execute against the sandbox provider and print the report
pub fn run_plan(
    ctx: &Context,
    plan: &ExecutionPlan,
    graph: &ResourceGraph,
    records: &RecordSet,
    store: &mut FileStateStore,
    args: &ExecArgs,
    prompt: &str,
) -> Result<u8> {
    if !args.yes && !display::confirm(prompt)? {
        println!();
        ui::info("Aborted, nothing changed");
        return Ok(0);
    }

    let provider = SandboxProvider::open(&ctx.settings.state_dir)?;
    let options = execute_options(ctx, args);
    log::info!(
        "Executing {} with {} worker(s)",
        ui::count(plan.len(), "operation"),
        options.worker_count(plan)
    );

    let mut progress = ProgressReporter::new(ctx.quiet);
    let report = stackgraph::execute(plan, graph, records, &provider, store, &options, &mut progress);
    progress.finish();
    let report = report?;

    display::print_report(&report, ctx.verbose > 0);
    if report.is_success() {
        // Built from every binding record so targeted runs keep the full map
        outputs::save(&ctx.settings.state_dir, &outputs::exports(&store.load()?))?;
    }
    if !report.outputs.is_empty() {
        ui::section("Outputs");
        display::print_outputs(&report.outputs);
    }

    Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}
