//! Lifecycle of one disposable sandbox VM.
//!
//! An [`Instance`] walks `absent → created → booted → shutdown → destroyed`.
//! [`Instance::up`] keeps an explicit stack of compensating actions and
//! unwinds it when a stage fails, so no machine or lock outlives a failure.
//!
//! Every mutation of the machine's configuration goes through the
//! [`LockManager`]; no lock is held while the VM launches or while the
//! console is being watched.

pub mod interrupt;
pub mod rollback;

pub use interrupt::{interrupt_pair, Interrupt, InterruptTrigger};
pub use rollback::{Compensation, Rollback};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::hypervisor::{
    CleanupMode, DeviceAttachment, DeviceType, Hypervisor, LaunchMode, MachineHandle,
    MachineSpec, PortMode, SerialPortConfig, SessionId, StorageBus, StorageSlot,
    SATA_CONTROLLER,
};
use crate::image::ImageDescriptor;
use crate::lock::LockManager;
use crate::paths;
use crate::readiness::console::{read_into, Transcript};
use crate::state::{InstanceRecord, StateManager};
use crate::utils::{bounded, BoxFuture};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Absent,
    Created,
    Booted,
    Shutdown,
    Destroyed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Absent => "absent",
            Stage::Created => "created",
            Stage::Booted => "booted",
            Stage::Shutdown => "shutdown",
            Stage::Destroyed => "destroyed",
        })
    }
}

/// A lifecycle operation, recorded in [`Instance::history`] before it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Boot,
    Shutdown,
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Boot => "boot",
            Operation::Shutdown => "shutdown",
            Operation::Destroy => "destroy",
        })
    }
}

/// One sandbox VM and the session used to drive it
pub struct Instance {
    name: String,
    image: ImageDescriptor,
    hypervisor: Arc<dyn Hypervisor>,
    session: SessionId,
    locks: LockManager,
    settings: Settings,
    console_dir: PathBuf,
    interrupt: Interrupt,
    state: Option<StateManager>,

    machine: Option<MachineHandle>,
    registered: bool,
    console_path: Option<PathBuf>,
    console_output: Option<Transcript>,
    stage: Stage,
    history: Vec<Operation>,
    created_at: DateTime<Utc>,
}

impl Instance {
    /// Set up an instance. No hypervisor call is made until [`Instance::create`].
    pub fn new(name: impl Into<String>, image: ImageDescriptor, hypervisor: Arc<dyn Hypervisor>) -> Self {
        let settings = Settings::default();
        let locks = lock_manager(&hypervisor, &settings);
        Self {
            name: name.into(),
            image,
            hypervisor,
            session: SessionId::new(),
            locks,
            settings,
            console_dir: paths::console_dir(),
            interrupt: Interrupt::never(),
            state: None,
            machine: None,
            registered: false,
            console_path: None,
            console_output: None,
            stage: Stage::Absent,
            history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Rebuild an instance from a persisted record, e.g. to tear it down
    /// after the process that created it died.
    pub fn from_record(record: InstanceRecord, hypervisor: Arc<dyn Hypervisor>) -> Self {
        let mut instance = Self::new(record.name, record.image, hypervisor);
        instance.machine = record.machine;
        instance.registered = record.registered;
        instance.console_path = record.console_path;
        instance.stage = record.stage;
        instance.created_at = record.created_at;
        instance
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.locks = lock_manager(&self.hypervisor, &settings);
        self.settings = settings;
        self
    }

    /// Directory in which console sockets are created
    pub fn with_console_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.console_dir = dir.into();
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Persist an [`InstanceRecord`] on every stage transition
    pub fn with_state(mut self, state: StateManager) -> Self {
        self.state = Some(state);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &ImageDescriptor {
        &self.image
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn machine(&self) -> Option<&MachineHandle> {
        self.machine.as_ref()
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn console_path(&self) -> Option<&Path> {
        self.console_path.as_deref()
    }

    /// Console transcript of the last boot (partial if the boot failed)
    pub fn console_output(&self) -> Option<&Transcript> {
        self.console_output.as_ref()
    }

    /// Operations invoked so far, in order
    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    /// Create, register and configure the machine.
    ///
    /// The image is checked before any hypervisor call. Once the machine
    /// exists its handle is kept on the instance even if a later step fails,
    /// so [`Instance::destroy`] can clean it up.
    pub async fn create(&mut self) -> Result<()> {
        self.begin(Operation::Create);
        info!(instance = %self.name, "creating machine");

        let arch = self.image.arch()?;
        let codename = self.image.codename()?;
        debug!(instance = %self.name, %arch, os_type = arch.os_type(), release = %codename, "image accepted");

        let spec = MachineSpec {
            name: self.name.clone(),
            os_type: arch.os_type().to_string(),
            cpus: self.settings.machine.cpus,
            memory_mib: self.settings.machine.memory_mib,
        };
        let machine = self.hypervisor.create_machine(&spec).await?;
        self.machine = Some(machine.clone());
        self.persist().await;

        debug!(instance = %self.name, machine = %machine, "registering machine");
        self.hypervisor.register_machine(&machine).await?;
        self.registered = true;
        self.persist().await;

        debug!(instance = %self.name, "attaching SATA storage controller");
        let attachment = DeviceAttachment {
            slot: StorageSlot::boot_disk(),
            device_type: DeviceType::HardDisk,
            medium: self.image.medium.clone(),
        };
        self.locks
            .with_lock(&machine, &self.session, move |m| {
                Box::pin(async move {
                    m.add_storage_controller(SATA_CONTROLLER, StorageBus::Sata, 1)
                        .await?;
                    m.attach_device(&attachment).await?;
                    m.save_settings().await
                })
            })
            .await?;

        debug!(instance = %self.name, "enabling serial port");
        tokio::fs::create_dir_all(&self.console_dir)
            .await
            .map_err(|source| Error::Console {
                path: self.console_dir.clone(),
                source,
            })?;
        let console_path = paths::console_socket(&self.console_dir, &self.name);
        self.console_path = Some(console_path.clone());
        let port = SerialPortConfig {
            slot: 0,
            enabled: true,
            path: console_path,
            host_mode: PortMode::HostPipe,
            server: true,
        };
        self.locks
            .with_lock(&machine, &self.session, move |m| {
                Box::pin(async move {
                    m.configure_serial_port(&port).await?;
                    m.save_settings().await
                })
            })
            .await?;

        self.transition(Stage::Created).await;
        info!(instance = %self.name, machine = %machine, "machine created");
        Ok(())
    }

    /// Launch the VM headless and wait for the boot signature on its console.
    ///
    /// Both waits give way to the instance's [`Interrupt`]. The console output
    /// read so far is kept in [`Instance::console_output`] however the boot
    /// ends.
    pub async fn boot(&mut self) -> Result<()> {
        self.begin(Operation::Boot);
        info!(instance = %self.name, "booting machine");

        let machine = self
            .machine
            .clone()
            .ok_or_else(|| Error::NotCreated(self.name.clone()))?;
        let console_path = self
            .console_path
            .clone()
            .ok_or_else(|| Error::NotCreated(self.name.clone()))?;
        let signature = self.image.termination_signature()?;

        let mut interrupt = self.interrupt.clone();
        let interrupted = || Error::Interrupted {
            operation: Operation::Boot,
        };
        if interrupt.is_triggered() {
            return Err(interrupted());
        }

        debug!(instance = %self.name, "launching VM process");
        let limit = self.settings.boot.launch_timeout();
        let launch = bounded(
            limit,
            self.hypervisor
                .launch_vm_process(&machine, &self.session, LaunchMode::Headless),
        );
        let launched = tokio::select! {
            biased;
            _ = interrupt.triggered() => return Err(interrupted()),
            launched = launch => launched,
        };
        match launched {
            Some(launched) => launched?,
            None => {
                return Err(Error::OperationTimeout {
                    operation: "launch",
                    timeout: limit.unwrap_or_default(),
                })
            }
        }

        let mut output = Vec::new();
        let watched = tokio::select! {
            biased;
            _ = interrupt.triggered() => Err(interrupted()),
            watched = read_into(
                &console_path,
                signature,
                self.settings.boot.timeout(),
                self.settings.boot.poll_interval(),
                &mut output,
            ) => watched,
        };
        self.console_output = Some(output.into());
        watched?;

        self.transition(Stage::Booted).await;
        info!(instance = %self.name, "machine booted");
        Ok(())
    }

    /// Power the VM down and force-release the session lock.
    ///
    /// The lock is released even if the power-down fails; the power-down
    /// error is the one returned.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.begin(Operation::Shutdown);
        info!(instance = %self.name, "shutting down machine");

        let Some(machine) = self.machine.clone() else {
            debug!(instance = %self.name, "machine was not created, nothing to shut down");
            return Ok(());
        };

        let limit = self.settings.boot.power_down_timeout();
        let power_down = self.hypervisor.power_down(&machine, &self.session);
        let powered_down = match bounded(limit, power_down).await {
            Some(result) => result.map_err(Error::from),
            None => Err(Error::OperationTimeout {
                operation: "power down",
                timeout: limit.unwrap_or_default(),
            }),
        };
        if let Err(e) = &powered_down {
            warn!(instance = %self.name, error = %e, "power down failed, releasing lock anyway");
        }

        let released = self.locks.release(&machine, &self.session).await;
        powered_down?;
        released?;

        self.transition(Stage::Shutdown).await;
        Ok(())
    }

    /// Detach the boot disk, unregister the machine and delete it.
    ///
    /// A no-op when no machine was ever created. A boot disk that is already
    /// gone is not an error.
    pub async fn destroy(&mut self) -> Result<()> {
        self.begin(Operation::Destroy);
        info!(instance = %self.name, "destroying machine");

        let Some(machine) = self.machine.clone() else {
            debug!(instance = %self.name, "machine was not created, skipping destruction");
            return Ok(());
        };

        if self.registered {
            debug!(instance = %self.name, "detaching SATA storage controller");
            let slot = StorageSlot::boot_disk();
            let detached = self
                .locks
                .with_lock(&machine, &self.session, move |m| {
                    Box::pin(async move {
                        m.detach_device(&slot).await?;
                        m.save_settings().await
                    })
                })
                .await;
            match detached {
                Ok(()) => {}
                Err(e) if e.is_object_not_found() => {
                    debug!(instance = %self.name, error = %e, "boot disk already detached");
                }
                Err(e) => return Err(e),
            }

            debug!(instance = %self.name, machine = %machine, "unregistering machine");
            self.hypervisor
                .unregister_machine(&machine, CleanupMode::UnregisterOnly)
                .await?;
            self.registered = false;
        }

        debug!(instance = %self.name, machine = %machine, "removing machine");
        self.hypervisor.remove_machine(&machine, true).await?;
        self.machine = None;

        if let Some(path) = self.console_path.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(instance = %self.name, path = %path.display(), error = %e, "failed to remove console socket");
                }
            }
        }

        self.transition(Stage::Destroyed).await;
        info!(instance = %self.name, "machine destroyed");
        Ok(())
    }

    /// Create and boot, rolling back on any failure.
    ///
    /// A failed create is followed by destroy; a failed or interrupted boot by
    /// shutdown and then destroy. The original error is returned unchanged.
    pub async fn up(&mut self) -> Result<()> {
        let mut rollback = Rollback::new();

        // destroy() is a no-op until create() has a machine to clean up
        rollback.push(Compensation::Destroy);
        if let Err(err) = self.create().await {
            return Err(self.unwind(rollback, err).await);
        }

        rollback.push(Compensation::Shutdown);
        if let Err(err) = self.boot().await {
            return Err(self.unwind(rollback, err).await);
        }

        Ok(())
    }

    /// Shut down and destroy. Destroy runs even if shutdown fails; the first
    /// error is returned.
    pub async fn down(&mut self) -> Result<()> {
        let shut_down = self.shutdown().await;
        if let Err(e) = &shut_down {
            warn!(instance = %self.name, error = %e, "shutdown failed, destroying anyway");
        }
        let destroyed = self.destroy().await;
        shut_down?;
        destroyed
    }

    /// Run `body` against a booted instance: `up()`, the body, then always
    /// `down()`.
    ///
    /// The body's error takes precedence over a teardown error.
    pub async fn scoped<T, E, F>(&mut self, body: F) -> std::result::Result<T, E>
    where
        E: From<Error>,
        F: for<'a> FnOnce(&'a mut Instance) -> BoxFuture<'a, std::result::Result<T, E>>,
    {
        self.up().await?;
        let outcome = body(&mut *self).await;
        let torn_down = self.down().await;

        match (outcome, torn_down) {
            (Ok(value), torn_down) => torn_down.map(|()| value).map_err(E::from),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(down_err)) => {
                warn!(instance = %self.name, error = %down_err, "teardown failed after error");
                Err(err)
            }
        }
    }

    async fn unwind(&mut self, rollback: Rollback, err: Error) -> Error {
        error!(instance = %self.name, error = %err, "lifecycle failed, rolling back");
        for action in rollback.unwind() {
            info!(instance = %self.name, %action, "running compensating action");
            let compensated = match action {
                Compensation::Shutdown => self.shutdown().await,
                Compensation::Destroy => self.destroy().await,
            };
            if let Err(e) = compensated {
                warn!(instance = %self.name, %action, error = %e, "compensating action failed");
            }
        }
        err
    }

    fn begin(&mut self, operation: Operation) {
        self.history.push(operation);
    }

    async fn transition(&mut self, stage: Stage) {
        debug!(instance = %self.name, from = %self.stage, to = %stage, "stage transition");
        self.stage = stage;
        self.persist().await;
    }

    /// Snapshot of the instance for the state directory
    pub fn record(&self) -> InstanceRecord {
        let mut record =
            InstanceRecord::new(self.name.clone(), self.image.clone(), self.hypervisor.name());
        record.stage = self.stage;
        record.machine = self.machine.clone();
        record.registered = self.registered;
        record.console_path = self.console_path.clone();
        record.created_at = self.created_at;
        record
    }

    async fn persist(&self) {
        let Some(state) = &self.state else {
            return;
        };
        let saved = if self.stage == Stage::Destroyed {
            state.delete(&self.name).await
        } else {
            state.save(&self.record()).await
        };
        if let Err(e) = saved {
            warn!(instance = %self.name, error = %e, "failed to persist instance record");
        }
    }
}

fn lock_manager(hypervisor: &Arc<dyn Hypervisor>, settings: &Settings) -> LockManager {
    LockManager::new(hypervisor.clone())
        .with_timeouts(settings.lock.wait_timeout(), settings.lock.poll_interval())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serialization() {
        assert_eq!(serde_json::to_string(&Stage::Booted).unwrap(), "\"booted\"");
        let stage: Stage = serde_json::from_str("\"shutdown\"").unwrap();
        assert_eq!(stage, Stage::Shutdown);
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(Operation::Create.to_string(), "create");
        assert_eq!(
            Error::Interrupted {
                operation: Operation::Boot
            }
            .to_string(),
            "interrupted during boot"
        );
    }
}
