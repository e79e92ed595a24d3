mod cli;
mod commands;
mod config;
mod declaration;
mod display;
mod sandbox;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::{KeelConfig, Settings};
use std::io;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub settings: Settings,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            ui::error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "keel", &mut io::stdout());
        return Ok(0);
    }

    let (config, source) = KeelConfig::discover(cli.config.as_deref())?;
    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        settings: Settings::resolve(config, source, cli.stack, cli.state_dir),
    };
    if let Some(source) = &ctx.settings.source {
        log::info!("Loaded config from {}", source.display());
    }

    match cli.command {
        Command::Plan(args) => commands::plan::run(&ctx, args),
        Command::Apply(args) => commands::apply::run(&ctx, args),
        Command::Destroy(args) => commands::destroy::run(&ctx, args),
        Command::Graph => commands::graph::run(&ctx),
        Command::Validate => commands::validate::run(&ctx),
        Command::State(cmd) => commands::state::run(&ctx, cmd),
        Command::Outputs(args) => commands::outputs::run(&ctx, args),
        Command::Completions { .. } => Ok(0),
    }
}
