/// The escalation state machine.
///
/// A single decision loop owns the current generation, the phase and the
/// armed deadline. It waits on shutdown, exit reports, the operator
/// interrupt and the deadline, and reacts to whichever comes first:
///
/// ```text
/// Running --interrupt--> GraceRequested --grace elapsed--> Escalated --final grace elapsed--> Terminal
///    |                        |                               |
///    +------ bound generation exits, or shutdown: Terminal ---+
/// ```
///
/// Generation 1 is interrupted, then killed and replaced by generation 2
/// with a shorter `--delay`; generation 2 is killed if it outlives the final
/// grace period. There is never a third generation.
use crate::config::SupervisorSettings;
use crate::notifier::{ExitNotifier, ExitReport};
use crate::process::{ExitOutcome, Generation, ProcessError, ProcessHandle};
use crate::signals::SignalSource;
use nix::sys::signal::Signal;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    GraceRequested,
    Escalated,
    Terminal,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Running => "running",
            Phase::GraceRequested => "grace-requested",
            Phase::Escalated => "escalated",
            Phase::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    /// After the interrupt was forwarded to generation 1.
    Grace,
    /// After generation 2 was started.
    FinalGrace,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    kind: DeadlineKind,
    at: Instant,
}

#[derive(Debug)]
enum Event {
    Shutdown,
    Exited(ExitReport),
    Interrupt,
    DeadlineElapsed(DeadlineKind),
}

/// How the supervision run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// The bound generation exited before it had to be killed.
    WorkerExited {
        generation: Generation,
        outcome: ExitOutcome,
    },
    /// The restarted generation outlived the final grace period.
    ForcedKill { generation: Generation },
    /// Overall shutdown was requested.
    Shutdown,
    /// No process handle was left when an action needed one.
    ProcessMissing,
    /// The replacement generation could not be spawned.
    RestartFailed,
}

/// A generation the supervisor started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawned {
    pub generation: Generation,
    pub delay_secs: u64,
}

/// Everything the supervisor did during one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionReport {
    pub spawned: Vec<Spawned>,
    pub interrupted: Vec<Generation>,
    pub killed: Vec<Generation>,
    pub ending: Ending,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    phase: Phase,
    current: Option<ProcessHandle>,
    deadline: Option<Deadline>,
    notifier: ExitNotifier,
    spawned: Vec<Spawned>,
    interrupted: Vec<Generation>,
    killed: Vec<Generation>,
    ending: Option<Ending>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            phase: Phase::Running,
            current: None,
            deadline: None,
            notifier: ExitNotifier::new(),
            spawned: Vec::new(),
            interrupted: Vec::new(),
            killed: Vec::new(),
            ending: None,
        }
    }

    #[cfg(test)]
    fn phase(&self) -> Phase {
        self.phase
    }

    /// Spawn generation 1 and run the decision loop until `Terminal`.
    ///
    /// Fails only if generation 1 cannot be spawned.
    pub async fn run(
        mut self,
        mut interrupts: SignalSource,
        shutdown: CancellationToken,
    ) -> Result<SupervisionReport, ProcessError> {
        self.launch(Generation::INITIAL, self.settings.initial_delay_secs)?;
        info!(
            grace_secs = self.settings.grace.as_secs_f64(),
            final_grace_secs = self.settings.final_grace.as_secs_f64(),
            "waiting for the worker to exit; an interrupt is forwarded to it and escalated to a kill and one faster restart if it doesn't comply"
        );

        while self.phase != Phase::Terminal {
            let event = self.next_event(&mut interrupts, &shutdown).await;
            self.handle(event).await;
        }

        Ok(self.into_report())
    }

    async fn next_event(
        &mut self,
        interrupts: &mut SignalSource,
        shutdown: &CancellationToken,
    ) -> Event {
        let listening = self.phase == Phase::Running;
        let deadline = self.deadline;

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Event::Shutdown,
            report = self.notifier.recv() => Event::Exited(report),
            _ = interrupts.recv(), if listening => Event::Interrupt,
            kind = wait_for(deadline) => Event::DeadlineElapsed(kind),
        }
    }

    async fn handle(&mut self, event: Event) {
        match (self.phase, event) {
            (phase, Event::Shutdown) => {
                info!(%phase, "shutdown requested, abandoning supervision");
                self.finish(Ending::Shutdown);
            }
            (phase, Event::Exited(report)) => {
                self.current = None;
                info!(
                    %phase,
                    generation = %report.generation,
                    outcome = %report.outcome,
                    "worker exited on its own"
                );
                self.finish(Ending::WorkerExited {
                    generation: report.generation,
                    outcome: report.outcome,
                });
            }
            (Phase::Running, Event::Interrupt) => self.request_grace(),
            (Phase::GraceRequested, Event::DeadlineElapsed(DeadlineKind::Grace)) => {
                self.escalate().await
            }
            (Phase::Escalated, Event::DeadlineElapsed(DeadlineKind::FinalGrace)) => {
                self.give_up().await
            }
            (phase, event) => {
                debug!(%phase, ?event, "event ignored");
                // An elapsed deadline stays ready; drop it so it can't fire again.
                if matches!(event, Event::DeadlineElapsed(_)) {
                    self.deadline = None;
                }
            }
        }
    }

    /// Running -> GraceRequested: forward the interrupt and arm the grace deadline.
    fn request_grace(&mut self) {
        let Some(handle) = self.current.as_ref() else {
            warn!("no worker to interrupt, treating it as already terminated");
            return self.finish(Ending::ProcessMissing);
        };

        let generation = handle.generation();
        handle.signal(Signal::SIGINT);
        self.interrupted.push(generation);
        self.arm(DeadlineKind::Grace, self.settings.grace);
        self.phase = Phase::GraceRequested;
        info!(
            generation = %generation,
            grace_secs = self.settings.grace.as_secs_f64(),
            "interrupt forwarded, waiting for the worker to exit"
        );
    }

    /// GraceRequested -> Escalated: kill, reap, and start the faster generation.
    async fn escalate(&mut self) {
        let Some(mut handle) = self.current.take() else {
            warn!("no worker left to kill, maybe everything is fine; leaving");
            return self.finish(Ending::ProcessMissing);
        };

        let generation = handle.generation();
        warn!(
            generation = %generation,
            pid = handle.pid(),
            "worker didn't exit after the interrupt, killing it"
        );
        if handle.kill() {
            self.killed.push(generation);
        }
        match handle.wait().await {
            Some(outcome) => info!(generation = %generation, %outcome, "killed worker reaped"),
            None => warn!(generation = %generation, "couldn't confirm the killed worker was reaped"),
        }
        drop(handle);

        let next = generation.next();
        info!(generation = %next, "starting a faster worker");
        if let Err(e) = self.launch(next, self.settings.restart_delay_secs) {
            error!(error = %e, "restart failed");
            return self.finish(Ending::RestartFailed);
        }
        self.arm(DeadlineKind::FinalGrace, self.settings.final_grace);
        self.phase = Phase::Escalated;
    }

    /// Escalated -> Terminal: the restarted worker outlived its final grace.
    async fn give_up(&mut self) {
        let Some(mut handle) = self.current.take() else {
            warn!("no worker left to kill, treating it as already terminated");
            return self.finish(Ending::ProcessMissing);
        };

        let generation = handle.generation();
        warn!(
            generation = %generation,
            pid = handle.pid(),
            "worker didn't exit after the final warning, killing it"
        );
        if handle.kill() {
            self.killed.push(generation);
        }
        if let Some(outcome) = handle.wait().await {
            info!(generation = %generation, %outcome, "killed worker reaped");
        }
        self.finish(Ending::ForcedKill { generation });
    }

    /// Bind the notifier to `generation`, then spawn it.
    fn launch(&mut self, generation: Generation, delay_secs: u64) -> Result<(), ProcessError> {
        let reporter = self.notifier.bind(generation);
        let handle = ProcessHandle::spawn(&self.settings.worker, delay_secs, reporter)?;
        self.spawned.push(Spawned {
            generation,
            delay_secs,
        });
        self.current = Some(handle);
        Ok(())
    }

    /// Arm a deadline, superseding any previous one.
    fn arm(&mut self, kind: DeadlineKind, after: Duration) {
        self.deadline = Some(Deadline {
            kind,
            at: Instant::now() + after,
        });
    }

    fn finish(&mut self, ending: Ending) {
        self.phase = Phase::Terminal;
        self.deadline = None;
        self.notifier.unbind();
        self.ending = Some(ending);
    }

    fn into_report(self) -> SupervisionReport {
        SupervisionReport {
            spawned: self.spawned,
            interrupted: self.interrupted,
            killed: self.killed,
            // The loop only stops through `finish`.
            ending: self.ending.unwrap_or(Ending::Shutdown),
        }
    }
}

async fn wait_for(deadline: Option<Deadline>) -> DeadlineKind {
    match deadline {
        Some(d) => {
            tokio::time::sleep_until(d.at).await;
            d.kind
        }
        None => std::future::pending().await,
    }
}
