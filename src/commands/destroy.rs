use anyhow::Result;
use colored::Colorize;
use stackgraph::{ResourceGraph, StateStore};

use super::{open_store, run_plan};
use crate::Context;
use crate::cli::DestroyArgs;
use crate::display;
use crate::ui;

pub fn run(ctx: &Context, args: DestroyArgs) -> Result<u8> {
    ui::header("Destroy");

    let mut store = open_store(ctx, args.exec.force_unlock)?;
    let records = store.load()?;
    if records.is_empty() {
        ui::info("No recorded resources, nothing to destroy");
        return Ok(0);
    }

    let plan = stackgraph::plan_destroy(&records, args.target.as_deref())?;
    // Deletes run from records alone; no declared graph is needed
    let graph = ResourceGraph::default();
    display::print_plan(&plan, &graph, &records, ctx.verbose > 0);

    println!();
    println!(
        "  {} This deletes {} from the provider.",
        "⚠".yellow().bold(),
        ui::count(plan.summary().delete, "resource").bold()
    );
    run_plan(
        ctx,
        &plan,
        &graph,
        &records,
        &mut store,
        &args.exec,
        "Really destroy?",
    )
}
