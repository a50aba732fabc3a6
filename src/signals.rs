/// Signal handling for the supervisor.
///
/// SIGINT (Ctrl-C): the first one becomes a single interrupt event for the
/// decision loop. The listener is never re-armed; later interrupts are
/// absorbed by the installed handler and have no effect. The worker runs in
/// its own process group, so a repeated Ctrl-C doesn't reach it either.
/// SIGTERM / SIGQUIT: request overall shutdown of the supervisor. Send
/// SIGTERM to stop early once an escalation is under way.
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// One-shot source of the operator interrupt.
pub struct SignalSource {
    rx: Option<oneshot::Receiver<()>>,
}

impl SignalSource {
    /// Install the SIGINT handler and start listening for the first interrupt.
    pub fn listen() -> std::io::Result<SignalSource> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            if sigint.recv().await.is_some() {
                tracing::info!("got an interrupt, asking the worker to stop");
                let _ = tx.send(());
            }
        });
        Ok(SignalSource { rx: Some(rx) })
    }

    /// A source fired by hand instead of by the OS.
    #[cfg(test)]
    pub fn manual() -> (InterruptTrigger, SignalSource) {
        let (tx, rx) = oneshot::channel();
        (InterruptTrigger(tx), SignalSource { rx: Some(rx) })
    }

    /// Resolve on the first interrupt; pending forever afterwards.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            let fired = rx.await.is_ok();
            self.rx = None;
            if fired {
                return;
            }
        }
        std::future::pending().await
    }

    /// Whether an interrupt can still be delivered.
    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.rx.is_some()
    }
}

#[cfg(test)]
pub struct InterruptTrigger(oneshot::Sender<()>);

#[cfg(test)]
impl InterruptTrigger {
    pub fn fire(self) {
        let _ = self.0.send(());
    }
}

/// Cancel `shutdown` when SIGTERM or SIGQUIT arrives.
///
/// Handlers are installed before returning so registration errors surface
/// to the caller.
pub fn cancel_on_terminate(shutdown: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigquit.recv() => tracing::info!("received SIGQUIT, shutting down"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
    Ok(())
}
