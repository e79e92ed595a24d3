use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan, apply and destroy dependency-ordered cloud resource stacks", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Project config file (default: ./keel.toml, then the user config dir)
    #[arg(long, global = true, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Stack declaration file
    #[arg(short, long, global = true, env = "KEEL_STACK")]
    pub stack: Option<PathBuf>,

    /// Directory holding the state snapshot, journal and lock
    #[arg(long, global = true, env = "KEEL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change, without touching anything
    Plan(PlanArgs),

    /// Converge the provider to the declared stack
    Apply(ApplyArgs),

    /// Delete every recorded resource, dependents first
    Destroy(DestroyArgs),

    /// Print the dependency order and independent groups
    Graph,

    /// Check the declaration for schema errors and cycles
    Validate,

    /// Inspect or repair recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Print values exported by output bindings
    Outputs(OutputsArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Plan / Apply / Destroy
// ============================================================================

#[derive(Args)]
pub struct PlanArgs {
    /// Only plan this resource and what it depends on
    #[arg(short, long)]
    pub target: Option<String>,

    /// Replace resources whose immutable fields changed
    #[arg(long)]
    pub allow_replace: bool,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

/// Flags shared by commands that execute a plan
#[derive(Args)]
pub struct ExecArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Number of parallel provider calls
    #[arg(short, long, env = "KEEL_JOBS")]
    pub jobs: Option<usize>,

    /// Undo this run's changes if it is cancelled by the timeout
    #[arg(long)]
    pub rollback_on_cancel: bool,

    /// Stop dispatching new operations after this many seconds
    #[arg(long, env = "KEEL_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Remove a stale state lock left by a crashed run
    #[arg(long)]
    pub force_unlock: bool,
}

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub exec: ExecArgs,

    /// Only apply this resource and what it depends on
    #[arg(short, long)]
    pub target: Option<String>,

    /// Replace resources whose immutable fields changed
    #[arg(long)]
    pub allow_replace: bool,
}

#[derive(Args)]
pub struct DestroyArgs {
    #[command(flatten)]
    pub exec: ExecArgs,

    /// Only destroy this resource and everything built on it
    #[arg(short, long)]
    pub target: Option<String>,
}

// ============================================================================
// State / Outputs
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded resources
    List,

    /// Show one record in full
    Show {
        /// Logical id
        id: String,
    },

    /// Forget a record without deleting the resource
    Rm {
        /// Logical id
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Args)]
pub struct OutputsArgs {
    /// Print as a JSON object
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::parse_from([
            "keel",
            "-vv",
            "--stack",
            "stacks/app.toml",
            "apply",
            "--yes",
            "--jobs",
            "3",
            "--target",
            "cluster",
            "--timeout",
            "600",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.stack, Some(PathBuf::from("stacks/app.toml")));
        match cli.command {
            Command::Apply(args) => {
                assert!(args.exec.yes);
                assert_eq!(args.exec.jobs, Some(3));
                assert_eq!(args.exec.timeout, Some(600));
                assert_eq!(args.target.as_deref(), Some("cluster"));
                assert!(!args.allow_replace);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_state_rm() {
        let cli = Cli::parse_from(["keel", "state", "rm", "vpc", "-y"]);
        assert!(matches!(
            cli.command,
            Command::State(StateCommand::Rm { ref id, yes: true }) if id == "vpc"
        ));
    }
}
