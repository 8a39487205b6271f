use std::io;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

/// Cooperative cancellation signal observed by [`super::Instance::boot`]
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

/// Fires the paired [`Interrupt`]
#[derive(Debug)]
pub struct InterruptTrigger {
    tx: watch::Sender<bool>,
}

/// Create a connected trigger/interrupt pair
pub fn interrupt_pair() -> (InterruptTrigger, Interrupt) {
    let (tx, rx) = watch::channel(false);
    (InterruptTrigger { tx }, Interrupt { rx })
}

impl Interrupt {
    /// An interrupt that never fires
    pub fn never() -> Self {
        interrupt_pair().1
    }

    /// An interrupt fired by SIGINT or SIGTERM. Must be called from within a
    /// tokio runtime.
    pub fn from_signals() -> io::Result<Self> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let (trigger, interrupt) = interrupt_pair();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
            trigger.trigger();
        });
        Ok(interrupt)
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the interrupt fires; pending forever if it never can.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl InterruptTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiter() {
        let (trigger, mut interrupt) = interrupt_pair();
        assert!(!interrupt.is_triggered());

        let waiter = tokio::spawn(async move {
            interrupt.triggered().await;
        });
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_never_stays_pending() {
        let mut interrupt = Interrupt::never();
        assert!(!interrupt.is_triggered());
        let fired = tokio::time::timeout(Duration::from_millis(50), interrupt.triggered()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_triggered_after_sender_dropped() {
        let (trigger, mut interrupt) = interrupt_pair();
        trigger.trigger();
        drop(trigger);
        assert!(interrupt.is_triggered());
        interrupt.triggered().await;
    }
}
