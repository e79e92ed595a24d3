//! Terminal rendering for plans, run reports and live progress

use anyhow::Result;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use similar::{ChangeTag, TextDiff};
use stackgraph::{
    ExecutionPlan, ExecutionReport, OpOutcome, OpReport, PlanAction, PlanOperation,
    ProgressCallback, Properties, ProviderError, RecordSet, ResourceGraph, RollbackOutcome,
};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::ui;

// ============================================================================
// Plan
// ============================================================================

/// Print a plan, with property diffs for updates and replacements
pub fn print_plan(plan: &ExecutionPlan, graph: &ResourceGraph, records: &RecordSet, verbose: bool) {
    let summary = plan.summary();
    if !summary.has_changes() {
        println!();
        println!("  {} No changes. Provider state matches the declaration.", "✓".green());
        return;
    }

    ui::section("Plan");
    for op in plan.operations() {
        if op.action() == PlanAction::NoOp && !verbose {
            continue;
        }
        println!(
            "  {} {:<32} {} {}",
            ui::action_symbol(op.action(), op.replacement),
            op.id(),
            format!("{:<22}", op.kind.as_str()).dimmed(),
            op.reason.to_string().dimmed()
        );

        if shows_diff(op)
            && let (Some(record), Some(node)) = (records.get(op.id()), graph.get(op.id()))
        {
            for line in property_diff(&record.declared_properties, node.properties()) {
                println!("        {line}");
            }
        }
    }

    println!();
    println!(
        "  {} {} to create, {} to update, {} to delete, {} replaced, {} unchanged",
        "Plan:".bold(),
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.delete.to_string().red(),
        summary.replace.to_string().magenta(),
        summary.unchanged
    );
}

fn shows_diff(op: &PlanOperation) -> bool {
    match op.action() {
        PlanAction::Update => true,
        PlanAction::Create => op.replacement,
        PlanAction::Delete | PlanAction::NoOp => false,
    }
}

fn property_lines(properties: &Properties) -> String {
    properties
        .iter()
        .map(|(name, value)| format!("{name} = {}\n", value.render()))
        .collect()
}

/// Changed `key = value` lines between two property bags, colored
pub fn property_diff(old: &Properties, new: &Properties) -> Vec<String> {
    let old = property_lines(old);
    let new = property_lines(new);
    TextDiff::from_lines(&old, &new)
        .iter_all_changes()
        .filter_map(|change| {
            let text = change.value().trim_end();
            match change.tag() {
                ChangeTag::Delete => Some(format!("- {text}").red().to_string()),
                ChangeTag::Insert => Some(format!("+ {text}").green().to_string()),
                ChangeTag::Equal => None,
            }
        })
        .collect()
}

// ============================================================================
// Report
// ============================================================================

/// One-line explanation of an outcome
pub fn outcome_detail(report: &OpReport) -> String {
    match &report.outcome {
        OpOutcome::Succeeded => report.identity.clone().unwrap_or_default(),
        OpOutcome::NoOp => String::new(),
        OpOutcome::Failed { cause, error } => format!("{}: {error}", cause.label()),
        OpOutcome::Blocked { root_cause } => format!("blocked by {root_cause}"),
        OpOutcome::Skipped { root_cause } => format!("skipped ({root_cause})"),
    }
}

/// Print the per-operation table, rollback results and totals
pub fn print_report(report: &ExecutionReport, verbose: bool) {
    let rows: Vec<&OpReport> = report
        .operations
        .iter()
        .filter(|r| verbose || r.outcome != OpOutcome::NoOp)
        .collect();

    if !rows.is_empty() {
        ui::section("Results");
        for row in rows {
            let attempts = if row.attempts > 1 {
                format!(" ({} attempts)", row.attempts)
            } else {
                String::new()
            };
            println!(
                "  {} {:<40} {}  {}{}",
                ui::outcome_symbol(&row.outcome),
                row.key.to_string(),
                format!("{:>8}", ui::format_duration(row.duration)).dimmed(),
                outcome_detail(row).dimmed(),
                attempts.dimmed()
            );
        }
    }

    if !report.rollback.is_empty() {
        ui::section("Rollback");
        for entry in &report.rollback {
            match &entry.outcome {
                RollbackOutcome::Undone => println!("  {} undid {}", "↺".cyan(), entry.key),
                RollbackOutcome::Failed { error } => println!(
                    "  {} could not undo {}: {}",
                    "✗".red(),
                    entry.key,
                    error.dimmed()
                ),
                RollbackOutcome::Kept { dependent } => println!(
                    "  {} kept {}: {}",
                    "!".yellow(),
                    entry.key,
                    format!("dependent '{dependent}' could not be undone").dimmed()
                ),
            }
        }
    }

    let summary = &report.summary;
    println!();
    if report.is_success() {
        println!("  {} Run completed", "✓".green().bold());
    } else {
        println!("  {} Run {}", "⚠".yellow().bold(), status_word(report));
    }
    let lines = [
        (summary.created, "created"),
        (summary.updated, "updated"),
        (summary.deleted, "deleted"),
        (summary.no_change, "unchanged"),
        (summary.failed, "failed"),
        (summary.blocked, "blocked"),
        (summary.skipped, "skipped"),
        (summary.rolled_back, "rolled back"),
        (summary.rollback_failed, "failed to roll back"),
    ];
    for (n, label) in lines.into_iter().filter(|(n, _)| *n > 0) {
        println!("    • {} {label}", ui::count(n, "resource"));
    }
}

fn status_word(report: &ExecutionReport) -> &'static str {
    match report.exit_code() {
        2 => "cancelled",
        _ => "failed",
    }
}

/// Print an export map as aligned `name = value` lines
pub fn print_outputs(outputs: &BTreeMap<String, String>) {
    let width = outputs.keys().map(String::len).max().unwrap_or(0);
    for (name, value) in outputs {
        println!("  {} = {}", format!("{name:<width$}").bold(), value);
    }
}

// ============================================================================
// Live progress
// ============================================================================

/// Progress bar fed by the executor's scheduler thread
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {elapsed} {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        };
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressCallback for ProgressReporter {
    fn on_run_start(&mut self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn on_operation_start(&mut self, key: &str, description: &str) {
        log::info!("Starting {key} ({description})");
        self.bar.set_message(key.to_string());
    }

    fn on_retry(&mut self, key: &str, attempt: u32, error: &ProviderError, delay: Duration) {
        self.bar.println(format!(
            "  {} {key} attempt {attempt} failed ({error}), retrying in {}",
            "↻".yellow(),
            ui::format_duration(delay)
        ));
    }

    fn on_operation_complete(&mut self, report: &OpReport) {
        self.bar.inc(1);
        if report.outcome != OpOutcome::NoOp {
            self.bar.println(format!(
                "  {} {} {}",
                ui::outcome_symbol(&report.outcome),
                report.key,
                outcome_detail(report).dimmed()
            ));
        }
    }

    fn on_rollback(&mut self, key: &str) {
        self.bar.println(format!("  {} rolling back {key}", "↺".cyan()));
    }
}

/// Ask before changing anything
pub fn confirm(prompt: &str) -> Result<bool> {
    let confirmed = dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmed)
}
