use chrono::{DateTime, Local};
use std::time::Instant;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

/// Start-of-run context, created once in `main` and passed where needed.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub started: Instant,
    pub started_at: DateTime<Local>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Local::now(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Log timer printing whole seconds since the run started, e.g. `[12]`.
#[derive(Debug, Clone, Copy)]
pub struct SinceStart {
    started: Instant,
}

impl SinceStart {
    pub fn new(ctx: &RunContext) -> Self {
        Self {
            started: ctx.started,
        }
    }
}

impl FormatTime for SinceStart {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "[{}]", self.started.elapsed().as_secs())
    }
}

/// Default filter directive for the verbosity flags. `RUST_LOG` wins over it.
fn default_directive(verbose: bool, quiet: bool) -> &'static str {
    if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    }
}

pub fn init(ctx: &RunContext, verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));

    tracing_subscriber::fmt()
        .with_timer(SinceStart::new(ctx))
        .with_target(false)
        .with_thread_ids(false)
        .with_env_filter(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_since_start_formats_whole_seconds() {
        let ctx = RunContext::new();
        let mut out = String::new();
        SinceStart::new(&ctx)
            .format_time(&mut Writer::new(&mut out))
            .unwrap();
        assert_eq!(out, "[0]");
    }

    #[test]
    fn test_since_start_uses_given_start() {
        let Some(started) = Instant::now().checked_sub(std::time::Duration::from_secs(7)) else {
            return;
        };
        let ctx = RunContext {
            started,
            started_at: Local::now(),
        };
        let mut out = String::new();
        SinceStart::new(&ctx)
            .format_time(&mut Writer::new(&mut out))
            .unwrap();
        assert_eq!(out, "[7]");
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false, false), "info");
        assert_eq!(default_directive(true, false), "debug");
        assert_eq!(default_directive(false, true), "warn");
        assert_eq!(default_directive(true, true), "debug");
    }
}
