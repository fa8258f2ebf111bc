mod baseline;
mod ci;
mod commands;
mod config;
mod deliverables;
mod error;
mod escalation;
mod finalizer;
mod governance;
mod lock;
mod orchestrator;
mod paths;
mod phase;
mod quality;
mod risk;
mod server;
mod store;
mod subprocess;
mod telemetry;
mod template;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::approvals::ApprovalsArgs;
use commands::assess::AssessArgs;
use commands::baseline::BaselineArgs;
use commands::init::InitArgs;
use commands::run::RunArgs;
use commands::score::{ClassifyArgs, ScoreArgs};
use commands::serve::ServeArgs;

#[derive(Debug, Parser)]
#[command(
    name = "phasegate",
    version,
    about = "Phase completion and safety gates for autonomous multi-phase build runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a run plan phase by phase, gating every attempt
    Run(RunArgs),
    /// Capture or show the regression baseline of a run
    Baseline(BaselineArgs),
    /// Judge one candidate change against a recorded baseline
    Assess(AssessArgs),
    /// Score the risk of a change
    Score(ScoreArgs),
    /// Classify a change into an approval tier
    Classify(ClassifyArgs),
    /// List and resolve human approval requests
    Approvals(ApprovalsArgs),
    /// Serve the approval API over persisted requests
    Serve(ServeArgs),
    /// Write a starter .phasegate.toml
    Init(InitArgs),
    /// Print the JSON Schema for .phasegate.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Baseline(_) => "baseline",
            Self::Assess(_) => "assess",
            Self::Score(_) => "score",
            Self::Classify(_) => "classify",
            Self::Approvals(_) => "approvals",
            Self::Serve(_) => "serve",
            Self::Init(_) => "init",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Run(args) => args.execute(),
        Commands::Baseline(args) => args.execute(),
        Commands::Assess(args) => args.execute(),
        Commands::Score(args) => args.execute(),
        Commands::Classify(args) => args.execute(),
        Commands::Approvals(args) => args.execute(),
        Commands::Serve(args) => args.execute(),
        Commands::Init(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
