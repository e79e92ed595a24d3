use anyhow::Result;
use colored::Colorize;
use stackgraph::{RecordSet, ReplacePolicy};

use super::{build_plan, load_graph};
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context) -> Result<u8> {
    let graph = load_graph(ctx)?;
    ui::header("Dependency Graph");

    ui::section("Order");
    for (i, node) in graph.ordered_nodes().enumerate() {
        let deps: Vec<&str> = node.dependencies().into_iter().collect();
        let deps = if deps.is_empty() {
            String::new()
        } else {
            format!("← {}", deps.join(", "))
        };
        println!(
            "  {} {:<32} {} {}",
            format!("{:>3}.", i + 1).dimmed(),
            node.id(),
            format!("{:<22}", node.kind().as_str()).dimmed(),
            deps.dimmed()
        );
    }

    // Waves of a fresh create show how far the run can fan out
    let fresh = build_plan(&graph, &RecordSet::new(), None, ReplacePolicy::Refuse)?;
    ui::section("Creation waves");
    for (i, wave) in fresh.waves().iter().enumerate() {
        let ids: Vec<&str> = wave.iter().map(|op| op.id()).collect();
        println!("  {} {}", format!("{:>3}.", i + 1).dimmed(), ids.join(", "));
    }

    let components = graph.components();
    ui::section("Independent groups");
    for (i, group) in components.iter().enumerate() {
        println!(
            "  {} {}",
            format!("{:>3}.", i + 1).dimmed(),
            group.join(", ")
        );
    }

    println!();
    ui::info(&format!(
        "{} in {}, {}",
        ui::count(graph.len(), "resource"),
        ui::count(fresh.waves().len(), "wave"),
        ui::count(components.len(), "independent group")
    ));
    Ok(0)
}
