use anyhow::Result;
use stackgraph::StateStore;

use super::{build_plan, load_graph, open_store, replace_policy, run_plan};
use crate::Context;
use crate::cli::ApplyArgs;
use crate::display;
use crate::ui;

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<u8> {
    ui::header("Apply");

    let graph = load_graph(ctx)?;
    let mut store = open_store(ctx, args.exec.force_unlock)?;
    let records = store.load()?;

    let plan = build_plan(
        &graph,
        &records,
        args.target.as_deref(),
        replace_policy(ctx, args.allow_replace),
    )?;
    display::print_plan(&plan, &graph, &records, ctx.verbose > 0);

    if !plan.has_changes() {
        return Ok(0);
    }

    println!();
    run_plan(
        ctx,
        &plan,
        &graph,
        &records,
        &mut store,
        &args.exec,
        "Apply these changes?",
    )
}
