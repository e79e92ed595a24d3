use anyhow::{Result, bail};
use colored::Colorize;
use stackgraph::{RecordStatus, StateStore};

use super::{open_store, read_records};
use crate::Context;
use crate::cli::StateCommand;
use crate::display;
use crate::ui;

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<u8> {
    match cmd {
        StateCommand::List => list(ctx),
        StateCommand::Show { id } => show(ctx, &id),
        StateCommand::Rm { id, yes } => rm(ctx, &id, yes),
    }
}

fn list(ctx: &Context) -> Result<u8> {
    let records = read_records(ctx)?;
    ui::header("State");
    ui::kv("Directory", &ctx.settings.state_dir.display().to_string());

    if records.is_empty() {
        println!();
        ui::info("No resources recorded");
        return Ok(0);
    }

    println!();
    for record in records.values() {
        let status = match record.status {
            RecordStatus::Succeeded => "✓".green(),
            RecordStatus::Failed => "✗".red(),
            RecordStatus::Pending => "?".yellow(),
        };
        println!(
            "  {} {:<32} {} {}",
            status,
            record.id,
            format!("{:<22}", record.kind.as_str()).dimmed(),
            record.identity.as_deref().unwrap_or("(no identity)").dimmed()
        );
    }

    let unknown = records.values().filter(|r| r.is_unknown()).count();
    println!();
    ui::info(&ui::count(records.len(), "record"));
    if unknown > 0 {
        ui::warn(&format!(
            "{} may exist without a known identity; the next apply reconciles them",
            ui::count(unknown, "resource")
        ));
    }
    Ok(0)
}

fn show(ctx: &Context, id: &str) -> Result<u8> {
    let records = read_records(ctx)?;
    let Some(record) = records.get(id) else {
        bail!("No record for '{id}'");
    };
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(0)
}

fn rm(ctx: &Context, id: &str, yes: bool) -> Result<u8> {
    let mut store = open_store(ctx, false)?;
    let records = store.load()?;
    let Some(record) = records.get(id) else {
        bail!("No record for '{id}'");
    };

    let dependents: Vec<&str> = records
        .values()
        .filter(|r| r.dependencies.contains(id))
        .map(|r| r.id.as_str())
        .collect();
    if !dependents.is_empty() {
        ui::warn(&format!("Recorded dependents: {}", dependents.join(", ")));
    }

    let prompt = format!(
        "Forget {} {}? The resource itself is left in place",
        record.kind, record.id
    );
    if !yes && !display::confirm(&prompt)? {
        ui::info("Aborted");
        return Ok(0);
    }

    store.remove(id)?;
    store.compact()?;
    ui::success(&format!("Removed '{id}' from state"));
    Ok(0)
}
