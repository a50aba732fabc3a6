/// Generation-tagged exit notifications.
///
/// Every spawned generation gets an [`ExitReporter`] that carries its own
/// generation id. The supervisor keeps the matching [`ExitNotifier`] bound to
/// the generation it currently watches; reports from any other generation
/// are stale and dropped on receipt.
use crate::process::{ExitOutcome, Generation};
use tokio::sync::mpsc;

/// One "this generation finished" report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub generation: Generation,
    pub outcome: ExitOutcome,
}

/// Sending half handed to a generation's background wait task.
#[derive(Debug)]
pub struct ExitReporter {
    generation: Generation,
    tx: mpsc::UnboundedSender<ExitReport>,
}

impl ExitReporter {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Report that this reporter's generation has been reaped.
    ///
    /// Consumes the reporter: a generation finishes once.
    pub fn report(self, outcome: ExitOutcome) {
        let report = ExitReport {
            generation: self.generation,
            outcome,
        };
        if self.tx.send(report).is_err() {
            tracing::debug!(generation = %self.generation, "supervisor gone, exit report dropped");
        }
    }
}

/// Receiving half, owned by the supervisor's decision loop.
pub struct ExitNotifier {
    tx: mpsc::UnboundedSender<ExitReport>,
    rx: mpsc::UnboundedReceiver<ExitReport>,
    bound: Option<Generation>,
}

impl ExitNotifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx, bound: None }
    }

    /// Bind to `generation` and return the only reporter for it.
    ///
    /// Must be called before the generation is spawned so that its report
    /// can never arrive ahead of the binding.
    pub fn bind(&mut self, generation: Generation) -> ExitReporter {
        self.bound = Some(generation);
        ExitReporter {
            generation,
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting reports from any generation.
    pub fn unbind(&mut self) {
        self.bound = None;
    }

    #[cfg(test)]
    fn bound(&self) -> Option<Generation> {
        self.bound
    }

    /// Wait for the next report belonging to the bound generation.
    ///
    /// Stale reports are discarded. Cancel safe: a report is only consumed
    /// when it is either returned or dropped as stale.
    pub async fn recv(&mut self) -> ExitReport {
        loop {
            let Some(report) = self.rx.recv().await else {
                // Unreachable while `self.tx` is alive.
                return std::future::pending().await;
            };
            if self.bound == Some(report.generation) {
                return report;
            }
            tracing::debug!(
                generation = %report.generation,
                bound = ?self.bound.map(|g| g.get()),
                "dropping stale exit report"
            );
        }
    }
}

impl Default for ExitNotifier {
    fn default() -> Self {
        Self::new()
    }
}
