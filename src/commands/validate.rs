use anyhow::{Context as AnyhowContext, Result};
use stackgraph::ResourceKind;
use std::collections::BTreeMap;

use crate::Context;
use crate::declaration;
use crate::ui;

pub fn run(ctx: &Context) -> Result<u8> {
    let stack = &ctx.settings.stack;
    ui::header("Validate");
    ui::kv("Stack", &stack.display().to_string());

    let decl = declaration::load(stack)?;
    let statements = decl.statement_count();
    let principals = decl.policies.len();
    let graph = decl
        .into_graph()
        .with_context(|| format!("Invalid stack {}", stack.display()))?;

    let mut kinds: BTreeMap<ResourceKind, usize> = BTreeMap::new();
    for node in graph.nodes() {
        *kinds.entry(node.kind()).or_default() += 1;
    }

    if !ctx.quiet {
        ui::section("Resources");
        for (kind, n) in &kinds {
            ui::kv(kind.as_str(), &n.to_string());
        }
        ui::section("Policies");
        ui::kv("principals", &principals.to_string());
        ui::kv("statements", &statements.to_string());
    }

    println!();
    ui::success(&format!(
        "{} valid, no cycles",
        ui::count(graph.len(), "resource")
    ));
    Ok(0)
}
