//! stackrun CLI tool.

use clap::{Args, Parser, Subcommand};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "stackrun")]
#[command(about = "Provision interdependent infrastructure units in dependency order", long_about = None)]
struct Cli {
    /// Path to the stack file
    #[arg(short, long, global = true, env = "STACKRUN_FILE", default_value = "stack.kdl")]
    file: PathBuf,

    /// Path to the state file [default: .stackrun/<stack>.state.json next to the stack file]
    #[arg(long, global = true, env = "STACKRUN_STATE")]
    state: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the stack file and its dependency graph
    Validate,
    /// Show the execution waves
    Graph {
        /// Show destroy order instead of apply order
        #[arg(long)]
        destroy: bool,
    },
    /// Show what an apply would do, without calling any provisioner
    Plan,
    /// Provision every unit, dependencies first
    Apply(RunArgs),
    /// Destroy every unit, dependents first
    Destroy(RunArgs),
    /// Inspect recorded state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Show the recorded state of every unit
    Show,
}

/// Overrides for the stack file's `settings` block.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Maximum number of units in flight at once
    #[arg(long)]
    concurrency: Option<NonZeroUsize>,

    /// Keep running independent units after a failure
    #[arg(long)]
    best_effort: bool,

    /// Wall-clock budget for the run (e.g. 45m)
    #[arg(long)]
    timeout: Option<String>,

    /// On cancellation, also abort in-flight provisioning and polling
    #[arg(long)]
    abort_in_flight: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context {
        file: cli.file,
        state: cli.state,
        json: cli.json,
    };

    match cli.command {
        Commands::Validate => commands::validate(&ctx)?,
        Commands::Graph { destroy } => commands::graph(&ctx, destroy)?,
        Commands::Plan => commands::plan::plan(&ctx).await?,
        Commands::Apply(args) => commands::run::apply(&ctx, &args).await?,
        Commands::Destroy(args) => commands::run::destroy(&ctx, &args).await?,
        Commands::State { command } => match command {
            StateCommands::Show => commands::state::show(&ctx).await?,
        },
    }

    Ok(())
}
