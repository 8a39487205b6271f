//! Hypervisor capability used by the lifecycle controller.
//!
//! Backends expose machine creation, storage and serial configuration, session
//! locking and VM process control. Every call may fail with a provider error;
//! only [`HypervisorError::ObjectNotFound`] is ever treated specially.

pub mod vboxmanage;

pub use vboxmanage::VBoxManage;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::HypervisorError;

pub type HvResult<T> = std::result::Result<T, HypervisorError>;

/// Name of the storage controller the boot disk hangs off
pub const SATA_CONTROLLER: &str = "SATA Controller";

/// Opaque reference to a VM object owned by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineHandle {
    pub id: String,
    pub name: String,
    /// Backend settings file, when the backend has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_file: Option<PathBuf>,
}

impl fmt::Display for MachineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// The calling process's right to mutate a machine.
///
/// Sessions are client-side objects; creating one does not talk to the
/// hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session lock state of a machine, as reported by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Unlocked,
    Locked,
    /// A VM process is being launched and is taking over the lock
    Spawning,
    Unlocking,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockState::Unlocked => "unlocked",
            LockState::Locked => "locked",
            LockState::Spawning => "spawning",
            LockState::Unlocking => "unlocking",
        })
    }
}

/// Everything needed to create (but not yet register) a machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub name: String,
    pub os_type: String,
    pub cpus: u32,
    pub memory_mib: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBus {
    Sata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    HardDisk,
}

/// Controller/port/device coordinates of an attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSlot {
    pub controller: String,
    pub port: u32,
    pub device: u32,
}

impl StorageSlot {
    /// Port 0, device 0 on the SATA controller
    pub fn boot_disk() -> Self {
        Self {
            controller: SATA_CONTROLLER.to_string(),
            port: 0,
            device: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttachment {
    pub slot: StorageSlot,
    pub device_type: DeviceType,
    pub medium: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// Host-side local stream socket
    HostPipe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortConfig {
    pub slot: u32,
    pub enabled: bool,
    pub path: PathBuf,
    pub host_mode: PortMode,
    /// Create the socket when the VM starts rather than connecting to one
    pub server: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Headless,
}

impl LaunchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchMode::Headless => "headless",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Unregister only; attached media are left alone
    UnregisterOnly,
}

#[async_trait::async_trait]
pub trait Hypervisor: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Create a machine sized per `spec` and persist its settings.
    async fn create_machine(&self, spec: &MachineSpec) -> HvResult<MachineHandle>;

    async fn register_machine(&self, machine: &MachineHandle) -> HvResult<()>;

    async fn lock_state(&self, machine: &MachineHandle) -> HvResult<LockState>;

    /// Request the write lock for `session`. Rejected if another session holds it.
    async fn lock_machine(&self, machine: &MachineHandle, session: &SessionId) -> HvResult<()>;

    /// Ask the hypervisor to drop the session's lock. Completion is observed
    /// through [`Hypervisor::lock_state`].
    async fn unlock_machine(&self, session: &SessionId) -> HvResult<()>;

    async fn add_storage_controller(
        &self,
        session: &SessionId,
        name: &str,
        bus: StorageBus,
        port_count: u32,
    ) -> HvResult<()>;

    async fn attach_device(
        &self,
        session: &SessionId,
        attachment: &DeviceAttachment,
    ) -> HvResult<()>;

    async fn detach_device(&self, session: &SessionId, slot: &StorageSlot) -> HvResult<()>;

    async fn configure_serial_port(
        &self,
        session: &SessionId,
        port: &SerialPortConfig,
    ) -> HvResult<()>;

    async fn save_settings(&self, session: &SessionId) -> HvResult<()>;

    /// Launch the VM process and resolve once the launch has completed.
    async fn launch_vm_process(
        &self,
        machine: &MachineHandle,
        session: &SessionId,
        mode: LaunchMode,
    ) -> HvResult<()>;

    /// Power the VM down and wait for it.
    ///
    /// Works by machine, so a VM launched by another session or process can
    /// be stopped too. A machine that is not running is already powered down.
    async fn power_down(&self, machine: &MachineHandle, session: &SessionId) -> HvResult<()>;

    async fn unregister_machine(&self, machine: &MachineHandle, mode: CleanupMode)
        -> HvResult<()>;

    /// Delete the machine, and its owned storage when `delete` is set.
    async fn remove_machine(&self, machine: &MachineHandle, delete: bool) -> HvResult<()>;
}
