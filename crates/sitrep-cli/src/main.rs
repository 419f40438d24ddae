#![forbid(unsafe_code)]

mod cmd;
mod desk;
mod output;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use output::OutputMode;
use sitrep_core::config::resolve_config;
use sitrep_core::error::ErrorCode;
use sitrep_core::query::ViewScope;
use std::env;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "sitrep: incident command desk",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Initialize a command desk",
        long_about = "Create .sitrep/ with a default config and a migrated SQLite store.",
        after_help = "EXAMPLES:\n    # Initialize in the current directory\n    sitrep init\n\n    # Emit machine-readable output\n    sitrep init --json"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Field",
        about = "File an incident report",
        after_help = "EXAMPLES:\n    # Report a flood with two victims\n    sitrep report --category flood --severity 4 --victims 2 --officer off-1\n\n    # Report with coordinates\n    sitrep report --category landslide --severity 5 --lat 7.29 --lon 80.63"
    )]
    Report(cmd::report::ReportArgs),

    #[command(next_help_heading = "Field", about = "Manage the officer roster")]
    Officer(cmd::officer::OfficerArgs),

    #[command(next_help_heading = "Field", about = "List the officer roster")]
    Officers,

    #[command(
        next_help_heading = "Desk",
        about = "List active incidents",
        long_about = "Show one page of incidents not yet archived, newest first.",
        after_help = "EXAMPLES:\n    # First page\n    sitrep list\n\n    # Critical floods, page 2\n    sitrep list --severity critical --search flood --page 2"
    )]
    List(cmd::list::ListArgs),

    #[command(
        next_help_heading = "Desk",
        about = "List archived incidents",
        long_about = "Show one page of completed incidents. Search also matches the reporter name."
    )]
    Completed(cmd::list::ListArgs),

    #[command(next_help_heading = "Desk", about = "Dashboard counters for the active page")]
    Stats(cmd::list::ListArgs),

    #[command(
        next_help_heading = "Desk",
        about = "Move an incident to a new status",
        after_help = "EXAMPLES:\n    # Dispatch a unit\n    sitrep status inc-1a2b3c4d dispatched\n\n    # Resolve and wait for auto-archival\n    sitrep status inc-1a2b3c4d resolved --wait"
    )]
    Status(cmd::status::StatusArgs),

    #[command(
        next_help_heading = "Desk",
        about = "Follow the desk live",
        long_about = "Poll the change log and print the page whenever it changes."
    )]
    Watch(cmd::watch::WatchArgs),

    #[command(next_help_heading = "Development", about = "Deterministic simulation campaigns")]
    Sim(cmd::sim::SimArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SITREP_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "sitrep=debug,info"
        } else {
            "sitrep=info,warn"
        })
    });

    let format = env::var("SITREP_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if cli.verbose {
        info!("Verbose mode enabled");
    }

    let project_root = env::current_dir()?;
    let config = resolve_config(&project_root, cli.json)
        .with_context(|| ErrorCode::ConfigParseError.message())?;
    let output = OutputMode::from_resolved(&config.resolved_output);
    let engine = config.engine;

    match cli.command {
        Commands::Init(args) => cmd::init::run_init(&args, output, &project_root),
        Commands::Report(args) => cmd::report::run_report(&args, engine, output, &project_root),
        Commands::Officer(args) => match args.command {
            cmd::officer::OfficerCommand::Add(add) => {
                cmd::officer::run_officer_add(&add, engine, output, &project_root)
            }
        },
        Commands::Officers => cmd::officer::run_officers(engine, output, &project_root),
        Commands::List(args) => {
            cmd::list::run_list(&args, ViewScope::Active, engine, output, &project_root)
        }
        Commands::Completed(args) => {
            cmd::list::run_list(&args, ViewScope::Completed, engine, output, &project_root)
        }
        Commands::Stats(args) => cmd::stats::run_stats(&args, engine, output, &project_root),
        Commands::Status(args) => cmd::status::run_status(&args, engine, output, &project_root),
        Commands::Watch(args) => cmd::watch::run_watch(&args, engine, output, &project_root),
        Commands::Sim(args) => match args.command {
            cmd::sim::SimCommand::Run(run) => cmd::sim::run_sim_run(&run, output),
            cmd::sim::SimCommand::Replay(replay) => cmd::sim::run_sim_replay(&replay, output),
        },
    }
}
