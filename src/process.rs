/// One worker generation: spawn the OS process, forward signals to it,
/// kill it, and wait for it to be reaped.
///
/// The `tokio::process::Child` is owned by a background task that waits for
/// the exit and applies signal/kill requests in between, so a request can
/// never reach a pid that has already been reaped.
use crate::config::ConfigError;
use crate::notifier::ExitReporter;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

/// Identifies one spawned worker instance, numbered in restart order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u32);

impl Generation {
    pub const INITIAL: Generation = Generation(1);

    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited on its own with this code.
    Code(i32),
    /// Terminated by this signal number.
    Signaled(i32),
    /// Waiting failed, the status is unknown.
    Unknown,
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Code(code),
            (None, Some(signal)) => ExitOutcome::Signaled(signal),
            (None, None) => ExitOutcome::Unknown,
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "exit code {code}"),
            ExitOutcome::Signaled(signal) => write!(f, "terminated by signal {signal}"),
            ExitOutcome::Unknown => write!(f, "unknown status"),
        }
    }
}

/// Validated worker executable plus the arguments placed before `--delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
}

impl WorkerCommand {
    /// Fails fast on an empty program so no process is ever created for it.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Result<Self, ConfigError> {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        Ok(Self { program, args })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Full argument list for a generation started with `delay_secs`.
    fn args_with_delay(&self, delay_secs: u64) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--delay".to_string());
        args.push(delay_secs.to_string());
        args
    }
}

/// Errors from driving a worker process.
///
/// Only `Spawn` is ever returned to a caller; the others are logged by the
/// background task and never block the supervisor.
#[derive(Debug)]
pub enum ProcessError {
    /// Failed to spawn the worker.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Failed to deliver a signal to a live worker.
    Signal {
        generation: Generation,
        signal: Signal,
        source: Errno,
    },
    /// Failed to force-kill the worker.
    Kill {
        generation: Generation,
        source: std::io::Error,
    },
    /// Failed while waiting for the worker to exit.
    Wait {
        generation: Generation,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn { program, source } => {
                write!(f, "failed to spawn worker {:?}: {}", program, source)
            }
            ProcessError::Signal {
                generation,
                signal,
                source,
            } => {
                write!(
                    f,
                    "can't send {} to worker generation {}: {}",
                    signal, generation, source
                )
            }
            ProcessError::Kill { generation, source } => {
                write!(f, "can't kill worker generation {}: {}", generation, source)
            }
            ProcessError::Wait { generation, source } => {
                write!(
                    f,
                    "failed waiting for worker generation {} to exit: {}",
                    generation, source
                )
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source, .. } => Some(source),
            ProcessError::Signal { source, .. } => Some(source),
            ProcessError::Kill { source, .. } => Some(source),
            ProcessError::Wait { source, .. } => Some(source),
        }
    }
}

/// Request applied to the child by its background task.
#[derive(Debug, Clone, Copy)]
enum Control {
    Signal(Signal),
    Kill,
}

/// Handle to one spawned generation, exclusively owned by the supervisor.
#[derive(Debug)]
pub struct ProcessHandle {
    generation: Generation,
    pid: u32,
    control: mpsc::UnboundedSender<Control>,
    reaped: Option<oneshot::Receiver<ExitOutcome>>,
}

impl ProcessHandle {
    /// Spawn `command --delay <delay_secs>` as generation `reporter.generation()`.
    ///
    /// stdout and stderr pass through to ours; stdin is closed. The worker
    /// gets its own process group so terminal Ctrl-C only reaches us.
    pub fn spawn(
        command: &WorkerCommand,
        delay_secs: u64,
        reporter: ExitReporter,
    ) -> Result<ProcessHandle, ProcessError> {
        let generation = reporter.generation();
        let args = command.args_with_delay(delay_secs);
        tracing::info!(
            generation = %generation,
            command = %command.program(),
            args = ?args,
            "spawning worker"
        );

        let child = Command::new(command.program())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                program: command.program().to_string(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(generation = %generation, pid, "worker started");

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (reaped_tx, reaped_rx) = oneshot::channel();
        tokio::spawn(watch_exit(child, generation, control_rx, reaped_tx, reporter));

        Ok(ProcessHandle {
            generation,
            pid,
            control: control_tx,
            reaped: Some(reaped_rx),
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Best-effort signal delivery. A worker that already exited is logged,
    /// not treated as an error.
    pub fn signal(&self, signal: Signal) {
        if self.control.send(Control::Signal(signal)).is_err() {
            tracing::info!(
                generation = %self.generation,
                %signal,
                "worker already exited, signal not sent"
            );
        }
    }

    /// Best-effort forced termination.
    ///
    /// Returns `false` if the worker had already been reaped, so nothing was
    /// killed.
    pub fn kill(&self) -> bool {
        if self.control.send(Control::Kill).is_err() {
            tracing::info!(generation = %self.generation, "worker already exited, nothing to kill");
            return false;
        }
        true
    }

    /// Wait until the generation is reaped.
    ///
    /// Returns `None` if the outcome was already taken or the background
    /// task vanished without reporting.
    pub async fn wait(&mut self) -> Option<ExitOutcome> {
        let reaped = self.reaped.take()?;
        match reaped.await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                tracing::warn!(generation = %self.generation, "exit watcher ended without an outcome");
                None
            }
        }
    }
}

/// Background wait for one generation; reports exactly once.
async fn watch_exit(
    mut child: Child,
    generation: Generation,
    mut control: mpsc::UnboundedReceiver<Control>,
    reaped: oneshot::Sender<ExitOutcome>,
    reporter: ExitReporter,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = control.recv() => apply(&mut child, generation, request),
        }
    };

    let outcome = match status {
        Ok(status) => {
            let outcome = ExitOutcome::from(status);
            tracing::info!(generation = %generation, %outcome, "worker exited");
            outcome
        }
        Err(e) => {
            let err = ProcessError::Wait {
                generation,
                source: e,
            };
            tracing::warn!(error = %err, "wait failed");
            ExitOutcome::Unknown
        }
    };

    // Nobody waiting on the handle is normal: only escalation reaps synchronously.
    let _ = reaped.send(outcome);
    reporter.report(outcome);
}

fn apply(child: &mut Child, generation: Generation, request: Control) {
    match request {
        Control::Signal(signal) => {
            let Some(pid) = child.id() else {
                tracing::info!(generation = %generation, %signal, "worker already reaped, signal not sent");
                return;
            };
            match nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) => tracing::info!(generation = %generation, pid, %signal, "signal sent to worker"),
                Err(Errno::ESRCH) => {
                    tracing::info!(generation = %generation, pid, %signal, "worker already gone")
                }
                Err(e) => {
                    let err = ProcessError::Signal {
                        generation,
                        signal,
                        source: e,
                    };
                    tracing::warn!(error = %err, "signal delivery failed");
                }
            }
        }
        Control::Kill => match child.start_kill() {
            Ok(()) => tracing::info!(generation = %generation, "kill sent to worker"),
            Err(e) => {
                let err = ProcessError::Kill {
                    generation,
                    source: e,
                };
                tracing::warn!(error = %err, "kill failed");
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::ExitNotifier;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_empty_program_rejected() {
        let err = WorkerCommand::new("", vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommand));
    }

    #[test]
    fn test_delay_argument_appended_after_args() {
        let command = WorkerCommand::new("worker", vec!["--verbose".to_string()]).unwrap();
        assert_eq!(command.args_with_delay(5), vec!["--verbose", "--delay", "5"]);
    }

    #[test]
    fn test_generation_numbering() {
        assert_eq!(Generation::INITIAL.get(), 1);
        assert_eq!(Generation::INITIAL.next().get(), 2);
        assert_eq!(Generation::INITIAL.next().to_string(), "2");
    }

    #[test]
    fn test_exit_outcome_display() {
        assert_eq!(ExitOutcome::Code(0).to_string(), "exit code 0");
        assert_eq!(ExitOutcome::Signaled(9).to_string(), "terminated by signal 9");
        assert_eq!(ExitOutcome::Unknown.to_string(), "unknown status");
    }

    #[tokio::test]
    async fn test_spawn_passes_delay_and_reports_exit_code() {
        let mut notifier = ExitNotifier::new();
        let reporter = notifier.bind(Generation::INITIAL);
        // $1 = --delay, $2 = 7
        let mut handle =
            ProcessHandle::spawn(&sh(r#"[ "$1" = --delay ] && exit "$2""#), 7, reporter).unwrap();

        assert!(handle.pid() > 0);
        assert_eq!(handle.wait().await, Some(ExitOutcome::Code(7)));
        assert_eq!(handle.wait().await, None);

        let report = notifier.recv().await;
        assert_eq!(report.generation, Generation::INITIAL);
        assert_eq!(report.outcome, ExitOutcome::Code(7));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut notifier = ExitNotifier::new();
        let command = WorkerCommand::new("nonexistent-binary-xyz", vec![]).unwrap();
        let err = ProcessHandle::spawn(&command, 30, notifier.bind(Generation::INITIAL)).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_kill_reaps_worker() {
        let mut notifier = ExitNotifier::new();
        let mut handle =
            ProcessHandle::spawn(&sh("exec sleep 30"), 30, notifier.bind(Generation::INITIAL))
                .unwrap();

        let start = Instant::now();
        assert!(handle.kill());
        assert_eq!(handle.wait().await, Some(ExitOutcome::Signaled(9)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_interrupt_is_forwarded() {
        let mut notifier = ExitNotifier::new();
        let mut handle = ProcessHandle::spawn(
            &sh("trap 'exit 42' INT; while :; do sleep 0.05; done"),
            30,
            notifier.bind(Generation::INITIAL),
        )
        .unwrap();

        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.signal(Signal::SIGINT);
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(outcome, Some(ExitOutcome::Code(42)));
    }

    #[tokio::test]
    async fn test_signal_and_kill_after_exit_are_harmless() {
        let mut notifier = ExitNotifier::new();
        let mut handle =
            ProcessHandle::spawn(&sh("exit 0"), 30, notifier.bind(Generation::INITIAL)).unwrap();
        assert_eq!(handle.wait().await, Some(ExitOutcome::Code(0)));

        // Give the watcher task time to finish and drop its receiver.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.signal(Signal::SIGINT);
        assert!(!handle.kill(), "an exited worker can't be killed");
        assert_eq!(notifier.recv().await.outcome, ExitOutcome::Code(0));
    }
}
