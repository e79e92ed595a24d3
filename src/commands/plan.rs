use anyhow::Result;

use super::{build_plan, load_graph, read_records, replace_policy};
use crate::Context;
use crate::cli::PlanArgs;
use crate::display;
use crate::ui;

pub fn run(ctx: &Context, args: PlanArgs) -> Result<u8> {
    let graph = load_graph(ctx)?;
    let records = read_records(ctx)?;
    let plan = build_plan(
        &graph,
        &records,
        args.target.as_deref(),
        replace_policy(ctx, args.allow_replace),
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }

    ui::header("Plan");
    ui::kv("Stack", &ctx.settings.stack.display().to_string());
    ui::kv("State", &ctx.settings.state_dir.display().to_string());
    if let Some(target) = &args.target {
        ui::kv("Target", target);
    }
    display::print_plan(&plan, &graph, &records, ctx.verbose > 0);

    if plan.has_changes() && !ctx.quiet {
        println!();
        ui::dim(&format!(
            "{} in {}, run `keel apply` to execute",
            ui::count(plan.changes().count(), "operation"),
            ui::count(plan.waves().len(), "wave")
        ));
    }
    Ok(0)
}
