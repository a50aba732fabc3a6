use clap::Parser;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};

/// Used when `--delay` is zero or negative.
const FALLBACK_DELAY_SECS: u64 = 30;

/// Worker supervised by escalator. Waits `--delay` seconds and exits; after
/// an interrupt it exits once `--quick-delay` seconds have passed instead.
#[derive(Parser, Debug)]
#[command(name = "escalator-worker", version, about)]
struct Cli {
    /// Seconds to wait before exiting on its own
    #[arg(long, default_value_t = 30, allow_negative_numbers = true)]
    delay: i64,

    /// Seconds to wait after an interrupt before exiting
    #[arg(long, default_value_t = 15)]
    quick_delay: u64,
}

fn effective_delay(delay: i64) -> u64 {
    if delay <= 0 {
        FALLBACK_DELAY_SECS
    } else {
        delay as u64
    }
}

/// Why the worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Delay,
    QuickDelay,
}

/// Wait for the delay, or for the quick delay after the first interrupt.
///
/// Only the first interrupt arms the quick-delay timer; later ones are ignored.
async fn run(
    delay: Duration,
    quick_delay: Duration,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> Exit {
    let timer = sleep(delay);
    tokio::pin!(timer);
    let mut quick: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = &mut timer => return Exit::Delay,
            _ = wait_for(quick) => return Exit::QuickDelay,
            Some(()) = interrupts.recv() => {
                if quick.is_some() {
                    tracing::info!("already exiting, interrupt ignored");
                    continue;
                }
                tracing::info!(
                    quick_delay_secs = quick_delay.as_secs(),
                    "received an interrupt, exiting soon"
                );
                quick = Some(Instant::now() + quick_delay);
            }
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_timer(tracing_subscriber::fmt::time::Uptime::default())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let delay = effective_delay(cli.delay);
    tracing::info!(
        delay_secs = delay,
        quick_delay_secs = cli.quick_delay,
        "worker starting"
    );

    let mut sigint = signal(SignalKind::interrupt())?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while sigint.recv().await.is_some() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });

    match run(
        Duration::from_secs(delay),
        Duration::from_secs(cli.quick_delay),
        &mut rx,
    )
    .await
    {
        Exit::Delay => tracing::info!("delay elapsed, exiting"),
        Exit::QuickDelay => tracing::info!("done waiting after the interrupt, exiting"),
    }
    Ok(())
}
