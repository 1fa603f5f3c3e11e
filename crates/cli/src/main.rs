//! clnrm CLI - Main Entry Point
//!
//! Runs hermetic integration tests, validates definitions and exposes the
//! scheduler's history analysis and optimization.

use clap::{Parser, Subcommand};
use clnrm_cli::commands::{ai, health, run, services, validate};
use clnrm_cli::output::{self, OutputFormat};
use clnrm_cli::{Context, Outcome};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// clnrm - hermetic integration testing with trace assertions
#[derive(Parser)]
#[command(name = "clnrm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Engine configuration file
    #[arg(long, default_value = "clnrm.toml", env = "CLNRM_CONFIG", global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value = "human", global = true)]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test definitions
    Run(run::RunArgs),

    /// Check definitions without starting anything
    Validate(validate::ValidateArgs),

    /// Inspect services and forecast their load
    #[command(subcommand)]
    Services(services::ServicesCommands),

    /// Plan tests by predicted failure risk, then run them
    AiOrchestrate(ai::OrchestrateArgs),

    /// Analyze run history and predict failures
    AiPredict(ai::PredictArgs),

    /// Recommend execution order, resources and parallelism
    AiOptimize(ai::OptimizeArgs),

    /// Check the container runtime, trace sink, history store and oracle
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging; stdout is kept for command output
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let outcome = match dispatch(cli).await {
        Ok(outcome) => outcome,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            Outcome::from_error(&e)
        }
    };
    std::process::exit(outcome.code());
}

async fn dispatch(cli: Cli) -> anyhow::Result<Outcome> {
    let ctx = Context::load(cli.config, cli.format, cli.verbose)?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    match cli.command {
        Commands::Run(args) => run::execute(args, &ctx, cancel).await,
        Commands::Validate(args) => validate::execute(args, &ctx),
        Commands::Services(cmd) => services::execute(cmd, &ctx).await,
        Commands::AiOrchestrate(args) => ai::orchestrate(args, &ctx, cancel).await,
        Commands::AiPredict(args) => ai::predict(args, &ctx).await,
        Commands::AiOptimize(args) => ai::optimize(args, &ctx).await,
        Commands::Health => health::execute(&ctx).await,
    }
}

/// First Ctrl-C cancels in-flight runs; their services are still torn down
fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::print_warning("Interrupted; cancelling runs");
            cancel.cancel();
        }
    });
}
