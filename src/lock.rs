//! Session lock management for machine configuration.
//!
//! The hypervisor enforces mutual exclusion; this module only requests lock
//! transitions and polls the reported [`LockState`] until they arrive.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hypervisor::{
    DeviceAttachment, Hypervisor, LockState, MachineHandle, SerialPortConfig, SessionId,
    StorageBus, StorageSlot,
};
use crate::utils::{wait_until, BoxFuture, WAIT_INTERVAL, WAIT_TIMEOUT};

/// Acquires and releases write locks on machines
#[derive(Clone)]
pub struct LockManager {
    hypervisor: Arc<dyn Hypervisor>,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            hypervisor,
            wait_timeout: WAIT_TIMEOUT,
            poll_interval: WAIT_INTERVAL,
        }
    }

    /// Override the budget for reaching a lock state and the poll interval.
    pub fn with_timeouts(mut self, wait_timeout: Duration, poll_interval: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Take the write lock on `machine` through `session`.
    ///
    /// The returned guard is the only way to mutate the machine's settings.
    /// Release it with [`LockedMachine::release`]; dropping it while held
    /// schedules a background release instead.
    pub async fn acquire(
        &self,
        machine: &MachineHandle,
        session: &SessionId,
    ) -> Result<LockedMachine> {
        debug!(machine = %machine, session = %session, "locking machine");
        self.hypervisor
            .lock_machine(machine, session)
            .await
            .map_err(|source| Error::LockUnavailable {
                machine: machine.to_string(),
                source,
            })?;
        Ok(LockedMachine {
            locks: self.clone(),
            machine: machine.clone(),
            session: session.clone(),
            held: true,
        })
    }

    /// Drop the session's lock, whatever state the machine is in.
    ///
    /// Safe to call when nothing is held: an unlocked machine is a no-op, and
    /// a machine already unlocking is only waited for. A state that cannot be
    /// read is handled as `Locked`.
    pub async fn release(&self, machine: &MachineHandle, session: &SessionId) -> Result<()> {
        let state = match self.hypervisor.lock_state(machine).await {
            Ok(state) => state,
            Err(e) => {
                warn!(machine = %machine, error = %e, "lock state unknown, unlocking anyway");
                LockState::Locked
            }
        };
        debug!(machine = %machine, state = %state, "releasing machine lock");

        match state {
            LockState::Unlocked => return Ok(()),
            LockState::Unlocking => return self.wait_for(machine, LockState::Unlocked).await,
            // The launching process has to finish taking the lock before it can be dropped
            LockState::Spawning => self.wait_for(machine, LockState::Locked).await?,
            LockState::Locked => {}
        }

        self.hypervisor.unlock_machine(session).await?;
        self.wait_for(machine, LockState::Unlocked).await
    }

    /// Run `body` with the write lock held, releasing it on every exit path.
    ///
    /// If the body fails, its error is returned even when the release fails
    /// too; the release failure is logged.
    pub async fn with_lock<T, F>(
        &self,
        machine: &MachineHandle,
        session: &SessionId,
        body: F,
    ) -> Result<T>
    where
        F: for<'g> FnOnce(&'g LockedMachine) -> BoxFuture<'g, Result<T>>,
    {
        let guard = self.acquire(machine, session).await?;
        let outcome = body(&guard).await;
        let released = guard.release().await;

        match (outcome, released) {
            (Ok(value), released) => released.map(|()| value),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(machine = %machine, error = %release_err, "failed to release lock after error");
                Err(err)
            }
        }
    }

    async fn wait_for(&self, machine: &MachineHandle, expected: LockState) -> Result<()> {
        let hypervisor = self.hypervisor.clone();
        let target = machine.clone();
        let reached = wait_until(
            move || {
                let hypervisor = hypervisor.clone();
                let target = target.clone();
                async move { matches!(hypervisor.lock_state(&target).await, Ok(state) if state == expected) }
            },
            self.wait_timeout,
            self.poll_interval,
        )
        .await;

        if reached {
            return Ok(());
        }

        let observed = match self.hypervisor.lock_state(machine).await {
            Ok(state) => state.to_string(),
            Err(e) => format!("unknown ({})", e),
        };
        Err(Error::LockWaitTimeout {
            machine: machine.to_string(),
            expected,
            observed,
            waited: self.wait_timeout,
        })
    }
}

/// Mutable view of a machine while its write lock is held
pub struct LockedMachine {
    locks: LockManager,
    machine: MachineHandle,
    session: SessionId,
    held: bool,
}

impl LockedMachine {
    pub fn machine(&self) -> &MachineHandle {
        &self.machine
    }

    fn hypervisor(&self) -> &dyn Hypervisor {
        self.locks.hypervisor.as_ref()
    }

    pub async fn add_storage_controller(
        &self,
        name: &str,
        bus: StorageBus,
        port_count: u32,
    ) -> Result<()> {
        debug!(machine = %self.machine, controller = name, "adding storage controller");
        Ok(self
            .hypervisor()
            .add_storage_controller(&self.session, name, bus, port_count)
            .await?)
    }

    pub async fn attach_device(&self, attachment: &DeviceAttachment) -> Result<()> {
        debug!(
            machine = %self.machine,
            controller = %attachment.slot.controller,
            medium = %attachment.medium.display(),
            "attaching device"
        );
        Ok(self
            .hypervisor()
            .attach_device(&self.session, attachment)
            .await?)
    }

    pub async fn detach_device(&self, slot: &StorageSlot) -> Result<()> {
        debug!(machine = %self.machine, controller = %slot.controller, port = slot.port, "detaching device");
        Ok(self.hypervisor().detach_device(&self.session, slot).await?)
    }

    pub async fn configure_serial_port(&self, port: &SerialPortConfig) -> Result<()> {
        debug!(machine = %self.machine, path = %port.path.display(), "configuring serial port");
        Ok(self
            .hypervisor()
            .configure_serial_port(&self.session, port)
            .await?)
    }

    pub async fn save_settings(&self) -> Result<()> {
        debug!(machine = %self.machine, "saving settings");
        Ok(self.hypervisor().save_settings(&self.session).await?)
    }

    /// Release the lock and wait until the hypervisor reports it unlocked.
    pub async fn release(mut self) -> Result<()> {
        self.held = false;
        self.locks.release(&self.machine, &self.session).await
    }
}

impl Drop for LockedMachine {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        warn!(machine = %self.machine, "lock guard dropped while held, releasing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let locks = self.locks.clone();
                let machine = self.machine.clone();
                let session = self.session.clone();
                handle.spawn(async move {
                    if let Err(e) = locks.release(&machine, &session).await {
                        warn!(machine = %machine, error = %e, "background lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(machine = %self.machine, "no runtime available, lock left held");
            }
        }
    }
}
