mod config;
mod logging;
mod notifier;
mod process;
mod signals;
mod supervisor;

use clap::Parser;
use config::{ConfigError, EscalatorConfig};
use logging::RunContext;
use signals::SignalSource;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::Supervisor;
use tokio_util::sync::CancellationToken;

/// Exit code for configuration errors; nothing has been spawned.
const EXIT_CONFIG: u8 = 2;
/// Exit code when supervision could not start.
const EXIT_STARTUP: u8 = 1;

/// Run a worker process under supervision: forward the first Ctrl-C to it,
/// kill it if it doesn't exit within the grace period, restart it once with
/// a shorter delay, and kill that one too if it outlives the final grace.
#[derive(Parser, Debug)]
#[command(name = "escalator", version, about)]
pub struct Cli {
    /// Worker command to run (overrides config)
    #[arg(long)]
    command: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = "escalator.toml")]
    config: PathBuf,

    /// Grace period after the interrupt, in seconds (overrides config)
    #[arg(long)]
    grace: Option<u64>,

    /// Grace period for the restarted worker, in seconds (overrides config)
    #[arg(long)]
    final_grace: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (stale exit reports, ignored events)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Extra worker arguments, placed before `--delay N`
    #[arg(last = true)]
    worker_args: Vec<String>,
}

/// Load the config file, apply CLI overrides, and validate.
fn resolve_config(cli: &Cli) -> Result<EscalatorConfig, ConfigError> {
    let mut config = config::load_config(&cli.config)?;

    if let Some(command) = &cli.command {
        config.worker.command = command.clone();
    }
    if !cli.worker_args.is_empty() {
        config.worker.args = cli.worker_args.clone();
    }
    if let Some(grace) = cli.grace {
        config.escalation.grace_secs = grace;
    }
    if let Some(final_grace) = cli.final_grace {
        config.escalation.final_grace_secs = final_grace;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let ctx = RunContext::new();
    let cli = Cli::parse();
    logging::init(&ctx, cli.verbose, cli.quiet);

    tracing::info!(started_at = %ctx.started_at.to_rfc3339(), "escalator starting");
    tracing::debug!(?cli, "parsed CLI arguments");

    let settings = match resolve_config(&cli).and_then(|c| c.supervisor_settings()) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration, exiting");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if cli.dry_run {
        println!("worker command: {}", settings.worker.program());
        println!("worker args:    {:?}", settings.worker.args());
        println!("initial delay:  {}s", settings.initial_delay_secs);
        println!("restart delay:  {}s", settings.restart_delay_secs);
        println!("grace:          {}s", settings.grace.as_secs());
        println!("final grace:    {}s", settings.final_grace.as_secs());
        return ExitCode::SUCCESS;
    }

    let shutdown = CancellationToken::new();
    let interrupts = match SignalSource::listen()
        .and_then(|source| signals::cancel_on_terminate(shutdown.clone()).map(|()| source))
    {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let code = match Supervisor::new(settings).run(interrupts, shutdown).await {
        Ok(report) => {
            tracing::info!(
                ending = ?report.ending,
                spawned = report.spawned.len(),
                killed = ?report.killed.iter().map(|g| g.get()).collect::<Vec<_>>(),
                "supervision finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "couldn't start the worker");
            ExitCode::from(EXIT_STARTUP)
        }
    };

    tracing::info!(
        elapsed_secs = ctx.started.elapsed().as_secs(),
        "escalator says bye-bye"
    );
    code
}
