use colored::{ColoredString, Colorize};
use stackgraph::{OpOutcome, PlanAction};
use std::time::Duration;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Plan and outcome styling
// ============================================================================

/// Colored plan symbol (`+`, `~`, `-`, `-/+`, `=`)
pub fn action_symbol(action: PlanAction, replacement: bool) -> ColoredString {
    match (action, replacement) {
        (PlanAction::Create, true) | (PlanAction::Delete, true) => "-/+".magenta(),
        (PlanAction::Create, false) => "+".green(),
        (PlanAction::Update, _) => "~".yellow(),
        (PlanAction::Delete, false) => "-".red(),
        (PlanAction::NoOp, _) => "=".dimmed(),
    }
}

/// Colored status icon for an operation outcome
pub fn outcome_symbol(outcome: &OpOutcome) -> ColoredString {
    match outcome {
        OpOutcome::Succeeded => "✓".green(),
        OpOutcome::NoOp => "○".dimmed(),
        OpOutcome::Failed { .. } => "✗".red(),
        OpOutcome::Blocked { .. } => "⊘".yellow(),
        OpOutcome::Skipped { .. } => "⊘".dimmed(),
    }
}

/// Format an elapsed time for tables
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.1}s", duration.as_secs_f64())
    } else {
        let secs = duration.as_secs();
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

/// `1 resource`, `3 resources`
pub fn count(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("{n} {noun}")
    } else {
        format!("{n} {noun}s")
    }
}
