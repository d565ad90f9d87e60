//! # backup
//! Takes, verifies, lists and prunes backups of a service stack.
//!

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::{fs, path::PathBuf, process::ExitCode};

use backup_orchestrator::{
    AbortReason, Cancellation, Config, Context, Orchestrator, PointerPublisher, RunError, RunId,
    retention::summarize, verify::verify_run,
};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use shared::init_logger;
use tracing::{Level, error, info, warn};

const EXIT_FAILURE: u8 = 1;
const EXIT_ALREADY_RUNNING: u8 = 2;
const EXIT_QUIESCE_TIMEOUT: u8 = 3;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// The config file.
    #[arg(long, default_value = "./config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Take a backup, then prune if configured to.
    Run,

    /// Delete the runs the retention policy no longer keeps.
    Prune,

    /// Re-verify a run against its manifest, the latest run if none is given.
    Verify {
        /// The run to verify.
        run_id: Option<RunId>,
    },

    /// List every run with its status.
    List,

    /// Write a default config file.
    Init,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize config if the command is 'init'.
    if matches!(cli.command, Command::Init) {
        let contents = match toml::to_string_pretty(&Config::default()) {
            Ok(contents) => contents,
            Err(e) => {
                eprintln!("Could not serialize the default config: {e}");
                return ExitCode::from(EXIT_FAILURE);
            }
        };

        if let Err(e) = fs::write(&cli.config, contents) {
            eprintln!("Could not write {:?}: {e}", cli.config);
            return ExitCode::from(EXIT_FAILURE);
        }

        return ExitCode::SUCCESS;
    }

    // Load config
    let config = match Config::load_toml(cli.config.clone()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Could not load config {:?}: {e}", cli.config);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let level = config.log_level.parse().unwrap_or(Level::INFO);
    let _logger = match init_logger(&config.log_directory, level) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Could not initialize logging: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let cancellation = Cancellation::new();
    if let Err(e) = cancellation.install_signal_handlers() {
        warn!("Could not install signal handlers, interrupts will not be handled: {e}");
    }

    let orchestrator = Orchestrator::from_config(config, cancellation);

    match cli.command {
        Command::Run => run(&orchestrator),
        Command::Prune => prune(&orchestrator),
        Command::Verify { run_id } => verify(&orchestrator, run_id),
        Command::List => list(&orchestrator),
        Command::Init => ExitCode::SUCCESS,
    }
}

fn run(orchestrator: &Orchestrator) -> ExitCode {
    let outcome = match orchestrator.run_backup() {
        Ok(outcome) => outcome,
        Err(e) => return exit_for_error(&e),
    };

    let run = &outcome.manifest.run;
    info!("Run {} finished: {}", run.id, run.status);
    for artifact in &run.artifacts {
        match &artifact.error {
            Some(reason) => info!("  {:?}: {:?}, {reason}", artifact.path, artifact.status),
            None => info!("  {:?}: {:?}", artifact.path, artifact.status),
        }
    }
    if !outcome.resumed {
        error!("CRITICAL: services were not resumed, they must be started manually");
    }

    match outcome.abort() {
        Some(AbortReason::QuiesceTimeout) => ExitCode::from(EXIT_QUIESCE_TIMEOUT),
        _ if outcome.published && outcome.resumed => ExitCode::SUCCESS,
        _ => ExitCode::from(EXIT_FAILURE),
    }
}

fn prune(orchestrator: &Orchestrator) -> ExitCode {
    match orchestrator.prune() {
        Ok(deleted) => {
            info!("Deleted {} runs", deleted.len());
            ExitCode::SUCCESS
        }
        Err(e) => exit_for_error(&e),
    }
}

fn verify(orchestrator: &Orchestrator, run_id: Option<RunId>) -> ExitCode {
    let id = match run_id {
        Some(id) => id,
        None => match PointerPublisher::new(orchestrator.root().clone()).resolve() {
            Ok(Some(id)) => id,
            Ok(None) => {
                error!("There is no latest run to verify");
                return ExitCode::from(EXIT_FAILURE);
            }
            Err(e) => {
                error!("Could not resolve the latest run: {e}");
                return ExitCode::from(EXIT_FAILURE);
            }
        },
    };

    match verify_run(orchestrator.root(), id) {
        Ok(report) if report.is_intact() => {
            info!("Run {id} is intact");
            ExitCode::SUCCESS
        }
        Ok(_) => {
            error!("Run {id} is damaged");
            ExitCode::from(EXIT_FAILURE)
        }
        Err(e) => {
            error!("Could not verify run {id}: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn list(orchestrator: &Orchestrator) -> ExitCode {
    let context = Context::default();

    let runs = match summarize(orchestrator.root(), &context) {
        Ok(runs) => runs,
        Err(e) => {
            error!("Could not list runs: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let latest = PointerPublisher::new(orchestrator.root().clone())
        .resolve()
        .ok()
        .flatten();

    for run in runs {
        let status = run
            .status
            .map_or_else(|| "incomplete".to_string(), |status| status.to_string());
        let marker = if Some(run.id) == latest { " (latest)" } else { "" };

        println!("{}  {status}{marker}", run.id);
    }

    ExitCode::SUCCESS
}

fn exit_for_error(error: &RunError) -> ExitCode {
    error!("{error}");

    match error {
        RunError::AlreadyRunning(_) => ExitCode::from(EXIT_ALREADY_RUNNING),
        _ => ExitCode::from(EXIT_FAILURE),
    }
}
