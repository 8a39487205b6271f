//! VirtualBox backend driven through the `VBoxManage` CLI.
//!
//! The CLI has no notion of a client session, so session locks are tracked
//! in-process: a machine is locked by at most one [`SessionId`] at a time,
//! `Spawning` while `startvm` runs and held by the VM process afterwards.
//! Settings are written by every command, which makes `save_settings` a no-op.
//! Power-down goes by machine id, so a VM launched by another process (or by
//! a launch that was abandoned) can still be stopped.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    CleanupMode, DeviceAttachment, DeviceType, HvResult, Hypervisor, LaunchMode, LockState,
    MachineHandle, MachineSpec, PortMode, SerialPortConfig, SessionId, StorageBus, StorageSlot,
};
use crate::config::VBoxManageSettings;
use crate::error::HypervisorError;

/// I/O base and IRQ of the first legacy COM port
const COM1: [&str; 2] = ["0x3F8", "4"];

pub struct VBoxManage {
    binary: PathBuf,
    /// Never held across an await
    locks: Mutex<HashMap<String, LockState>>,
    sessions: tokio::sync::Mutex<HashMap<SessionId, MachineHandle>>,
    /// cpus/memory of created machines, applied once they are registered
    hardware: tokio::sync::Mutex<HashMap<String, (u32, u32)>>,
}

impl VBoxManage {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            locks: Mutex::new(HashMap::new()),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            hardware: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &VBoxManageSettings) -> Self {
        Self::new(settings.binary.clone())
    }

    /// Run one VBoxManage command and return its stdout.
    async fn run<I, S>(&self, operation: &'static str, args: I) -> HvResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.args(args).kill_on_drop(true);
        debug!(target: "vboxmanage", operation, command = ?command.as_std(), "running");

        let output = command
            .output()
            .await
            .map_err(|source| HypervisorError::Io { operation, source })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(operation, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn session_machine(&self, operation: &'static str, session: &SessionId) -> HvResult<MachineHandle> {
        self.sessions
            .lock()
            .await
            .get(session)
            .cloned()
            .ok_or_else(|| HypervisorError::provider(operation, format!("{} holds no lock", session)))
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<String, LockState>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_lock_state(&self, machine: &MachineHandle, state: LockState) {
        debug!(target: "vboxmanage", machine = %machine, %state, "lock state");
        self.lock_table().insert(machine.id.clone(), state);
    }

    async fn forget(&self, machine: &MachineHandle) {
        self.lock_table().remove(&machine.id);
        self.hardware.lock().await.remove(&machine.id);
        self.sessions.lock().await.retain(|_, m| m.id != machine.id);
    }
}

#[async_trait::async_trait]
impl Hypervisor for VBoxManage {
    fn name(&self) -> &'static str {
        "vboxmanage"
    }

    async fn create_machine(&self, spec: &MachineSpec) -> HvResult<MachineHandle> {
        let stdout = self
            .run(
                "create machine",
                ["createvm", "--name", spec.name.as_str(), "--ostype", spec.os_type.as_str()],
            )
            .await?;
        let (id, settings_file) = parse_created(&stdout)?;
        self.hardware
            .lock()
            .await
            .insert(id.clone(), (spec.cpus, spec.memory_mib));

        Ok(MachineHandle {
            id,
            name: spec.name.clone(),
            settings_file: Some(settings_file),
        })
    }

    async fn register_machine(&self, machine: &MachineHandle) -> HvResult<()> {
        let settings = machine.settings_file.as_ref().ok_or_else(|| {
            HypervisorError::provider("register machine", format!("{} has no settings file", machine))
        })?;
        self.run("register machine", [OsStr::new("registervm"), settings.as_os_str()])
            .await?;

        let sizing = self.hardware.lock().await.get(&machine.id).copied();
        if let Some((cpus, memory_mib)) = sizing {
            let (cpus, memory) = (cpus.to_string(), memory_mib.to_string());
            self.run(
                "size machine",
                ["modifyvm", machine.id.as_str(), "--cpus", cpus.as_str(), "--memory", memory.as_str()],
            )
            .await?;
        }
        Ok(())
    }

    async fn lock_state(&self, machine: &MachineHandle) -> HvResult<LockState> {
        Ok(self
            .lock_table()
            .get(&machine.id)
            .copied()
            .unwrap_or(LockState::Unlocked))
    }

    async fn lock_machine(&self, machine: &MachineHandle, session: &SessionId) -> HvResult<()> {
        {
            let mut locks = self.lock_table();
            let state = locks.get(&machine.id).copied().unwrap_or(LockState::Unlocked);
            if state != LockState::Unlocked {
                return Err(HypervisorError::provider(
                    "lock machine",
                    format!("{} is {}", machine, state),
                ));
            }
            locks.insert(machine.id.clone(), LockState::Locked);
        }

        self.sessions
            .lock()
            .await
            .insert(session.clone(), machine.clone());
        Ok(())
    }

    async fn unlock_machine(&self, session: &SessionId) -> HvResult<()> {
        if let Some(machine) = self.sessions.lock().await.remove(session) {
            self.set_lock_state(&machine, LockState::Unlocked);
        }
        Ok(())
    }

    async fn add_storage_controller(
        &self,
        session: &SessionId,
        name: &str,
        bus: StorageBus,
        port_count: u32,
    ) -> HvResult<()> {
        let machine = self.session_machine("add storage controller", session).await?;
        let bus = match bus {
            StorageBus::Sata => "sata",
        };
        let ports = port_count.to_string();
        self.run(
            "add storage controller",
            [
                "storagectl",
                machine.id.as_str(),
                "--name",
                name,
                "--add",
                bus,
                "--portcount",
                ports.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn attach_device(
        &self,
        session: &SessionId,
        attachment: &DeviceAttachment,
    ) -> HvResult<()> {
        let machine = self.session_machine("attach device", session).await?;
        let kind = match attachment.device_type {
            DeviceType::HardDisk => "hdd",
        };
        let mut args = storage_args(&machine, &attachment.slot);
        args.push(OsString::from("--type"));
        args.push(OsString::from(kind));
        args.push(OsString::from("--medium"));
        args.push(attachment.medium.clone().into_os_string());
        self.run("attach device", args).await?;
        Ok(())
    }

    async fn detach_device(&self, session: &SessionId, slot: &StorageSlot) -> HvResult<()> {
        let machine = self.session_machine("detach device", session).await?;
        let mut args = storage_args(&machine, slot);
        args.push(OsString::from("--medium"));
        args.push(OsString::from("none"));
        self.run("detach device", args).await?;
        Ok(())
    }

    async fn configure_serial_port(
        &self,
        session: &SessionId,
        port: &SerialPortConfig,
    ) -> HvResult<()> {
        let machine = self.session_machine("configure serial port", session).await?;
        let uart = format!("--uart{}", port.slot + 1);
        if !port.enabled {
            self.run("configure serial port", ["modifyvm", machine.id.as_str(), uart.as_str(), "off"])
                .await?;
            return Ok(());
        }

        let mode = match (port.host_mode, port.server) {
            (PortMode::HostPipe, true) => "server",
            (PortMode::HostPipe, false) => "client",
        };
        let uart_mode = format!("--uartmode{}", port.slot + 1);
        let args: Vec<&OsStr> = vec![
            OsStr::new("modifyvm"),
            OsStr::new(&machine.id),
            OsStr::new(&uart),
            OsStr::new(COM1[0]),
            OsStr::new(COM1[1]),
            OsStr::new(&uart_mode),
            OsStr::new(mode),
            port.path.as_os_str(),
        ];
        self.run("configure serial port", args).await?;
        Ok(())
    }

    async fn save_settings(&self, session: &SessionId) -> HvResult<()> {
        debug!(target: "vboxmanage", session = %session, "settings already saved by each command");
        Ok(())
    }

    async fn launch_vm_process(
        &self,
        machine: &MachineHandle,
        session: &SessionId,
        mode: LaunchMode,
    ) -> HvResult<()> {
        {
            let mut locks = self.lock_table();
            let state = locks.get(&machine.id).copied().unwrap_or(LockState::Unlocked);
            if state != LockState::Unlocked {
                return Err(HypervisorError::provider(
                    "launch",
                    format!("{} is {}", machine, state),
                ));
            }
            locks.insert(machine.id.clone(), LockState::Spawning);
        }
        let spawning = SpawnGuard::new(self, machine);

        self.run("launch", ["startvm", machine.id.as_str(), "--type", mode.as_str()])
            .await?;

        self.sessions
            .lock()
            .await
            .insert(session.clone(), machine.clone());
        spawning.complete();
        Ok(())
    }

    async fn power_down(&self, machine: &MachineHandle, session: &SessionId) -> HvResult<()> {
        match self
            .run("power down", ["controlvm", machine.id.as_str(), "poweroff"])
            .await
        {
            Ok(_) => {}
            Err(HypervisorError::Provider { message, .. }) if is_not_running(&message) => {
                debug!(target: "vboxmanage", machine = %machine, "machine was not running");
            }
            Err(e) => return Err(e),
        }
        // The VM process held the lock; it is gone with the process
        self.sessions
            .lock()
            .await
            .retain(|s, m| s != session && m.id != machine.id);
        self.set_lock_state(machine, LockState::Unlocked);
        Ok(())
    }

    async fn unregister_machine(
        &self,
        machine: &MachineHandle,
        mode: CleanupMode,
    ) -> HvResult<()> {
        match mode {
            CleanupMode::UnregisterOnly => {
                self.run("unregister machine", ["unregistervm", machine.id.as_str()])
                    .await?;
            }
        }
        Ok(())
    }

    async fn remove_machine(&self, machine: &MachineHandle, delete: bool) -> HvResult<()> {
        self.forget(machine).await;
        if !delete {
            return Ok(());
        }

        let Some(dir) = machine.settings_file.as_deref().and_then(Path::parent) else {
            return Ok(());
        };
        debug!(target: "vboxmanage", machine = %machine, dir = %dir.display(), "deleting machine directory");
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HypervisorError::Io {
                operation: "remove machine",
                source,
            }),
        }
    }
}

/// Resets a machine left `Spawning` when its launch fails or is abandoned.
///
/// Dropping the launch future kills `startvm` (`kill_on_drop`), so nothing
/// is left to move the machine on to `Locked`.
struct SpawnGuard<'a> {
    vbox: &'a VBoxManage,
    machine: &'a MachineHandle,
    armed: bool,
}

impl<'a> SpawnGuard<'a> {
    fn new(vbox: &'a VBoxManage, machine: &'a MachineHandle) -> Self {
        Self {
            vbox,
            machine,
            armed: true,
        }
    }

    /// The VM process took the lock.
    fn complete(mut self) {
        self.armed = false;
        self.vbox.set_lock_state(self.machine, LockState::Locked);
    }
}

impl Drop for SpawnGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(target: "vboxmanage", machine = %self.machine, "launch did not complete, machine unlocked");
            self.vbox.set_lock_state(self.machine, LockState::Unlocked);
        }
    }
}

fn is_not_running(message: &str) -> bool {
    message.contains("is not currently running")
}

fn storage_args(machine: &MachineHandle, slot: &StorageSlot) -> Vec<OsString> {
    vec![
        "storageattach".into(),
        machine.id.clone().into(),
        "--storagectl".into(),
        slot.controller.clone().into(),
        "--port".into(),
        slot.port.to_string().into(),
        "--device".into(),
        slot.device.to_string().into(),
    ]
}

/// Map a failed command's stderr onto a hypervisor error.
fn classify(operation: &'static str, stderr: &str) -> HypervisorError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if message.contains("VBOX_E_OBJECT_NOT_FOUND") || lower.contains("could not find") {
        return HypervisorError::ObjectNotFound(message);
    }
    HypervisorError::provider(operation, message)
}

/// Extract the UUID and settings file from `createvm` output.
fn parse_created(stdout: &str) -> HvResult<(String, PathBuf)> {
    let mut id = None;
    let mut settings = None;
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("UUID:") {
            id = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Settings file:") {
            settings = Some(PathBuf::from(rest.trim().trim_matches('\'')));
        }
    }

    match (id, settings) {
        (Some(id), Some(settings)) if !id.is_empty() => Ok((id, settings)),
        _ => Err(HypervisorError::provider(
            "create machine",
            format!("unexpected createvm output: {}", stdout.trim()),
        )),
    }
}
