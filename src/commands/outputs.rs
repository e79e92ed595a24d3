use anyhow::{Context as AnyhowContext, Result};
use stackgraph::{RecordSet, RecordStatus, ResourceKind};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::read_records;
use crate::Context;
use crate::cli::OutputsArgs;
use crate::display;
use crate::ui;

const OUTPUTS_FILE: &str = "outputs.json";

pub fn run(ctx: &Context, args: OutputsArgs) -> Result<u8> {
    let exports = match load(&ctx.settings.state_dir)? {
        Some(exports) => exports,
        None => exports(&read_records(ctx)?),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&exports)?);
    } else if exports.is_empty() {
        ui::info("No outputs recorded. Run `keel apply` first.");
    } else {
        display::print_outputs(&exports);
    }
    Ok(0)
}

/// Write the export map of a successful run into the state directory
pub fn save(dir: &Path, exports: &BTreeMap<String, String>) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

    let path = dir.join(OUTPUTS_FILE);
    let content = serde_json::to_string_pretty(exports).context("Failed to serialize outputs")?;
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;

    log::debug!("Saved {} output(s) to {}", exports.len(), path.display());
    Ok(path)
}

/// Export map written by the last successful run, if any
fn load(dir: &Path) -> Result<Option<BTreeMap<String, String>>> {
    let path = dir.join(OUTPUTS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let exports =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(exports))
}

/// Export map rebuilt from output binding records
pub fn exports(records: &RecordSet) -> BTreeMap<String, String> {
    records
        .values()
        .filter(|r| r.kind == ResourceKind::OutputBinding && r.status == RecordStatus::Succeeded)
        .filter_map(|r| Some((r.outputs.get("name")?.clone(), r.outputs.get("value")?.clone())))
        .collect()
}
