// Common test utilities for sandvm integration tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sandvm::config::Settings;
use sandvm::error::HypervisorError;
use sandvm::hypervisor::{
    CleanupMode, DeviceAttachment, HvResult, Hypervisor, LaunchMode, LockState, MachineHandle,
    MachineSpec, SerialPortConfig, SessionId, StorageBus, StorageSlot,
};
use sandvm::image::ImageDescriptor;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;

/// Route library logs through the test harness (`RUST_LOG=debug cargo test`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn bullseye_image() -> ImageDescriptor {
    ImageDescriptor::new("amd64", "bullseye", "/images/bullseye-amd64.vdi")
}

pub fn wheezy_image() -> ImageDescriptor {
    ImageDescriptor::new("x86", "wheezy", "/images/wheezy-i386.vdi")
}

/// Settings with short waits so failure paths finish quickly.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.boot.timeout_secs = 5;
    settings.boot.poll_interval_ms = 50;
    settings.lock.wait_timeout_ms = 500;
    settings.lock.poll_interval_ms = 10;
    settings
}

/// Injected hypervisor failure, recreated on every matching call
#[derive(Debug, Clone)]
pub enum Failure {
    NotFound,
    Provider(String),
}

impl Failure {
    fn to_error(&self, operation: &'static str) -> HypervisorError {
        match self {
            Failure::NotFound => HypervisorError::ObjectNotFound(format!("{} target", operation)),
            Failure::Provider(message) => HypervisorError::provider(operation, message.clone()),
        }
    }
}

/// What the VM prints on its serial console once launched
#[derive(Debug, Clone, Default)]
pub struct ConsoleScript {
    /// (delay before the chunk, chunk)
    pub chunks: Vec<(Duration, Vec<u8>)>,
    /// Close the connection after the last chunk instead of idling
    pub close: bool,
}

impl ConsoleScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk(mut self, delay_ms: u64, text: &str) -> Self {
        self.chunks
            .push((Duration::from_millis(delay_ms), text.as_bytes().to_vec()));
        self
    }

    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    next_id: u32,
    lock_states: HashMap<String, LockState>,
    /// Answers for lock_state, consumed front to back; the last one sticks
    scripted: VecDeque<LockState>,
    unlock_outcome: Option<LockState>,
    /// lock_state calls left to fail
    lock_state_errors: u32,
    sessions: HashMap<SessionId, MachineHandle>,
    failures: HashMap<&'static str, Failure>,
    launch_delay: Option<Duration>,
    console: Option<ConsoleScript>,
    serial_path: Option<PathBuf>,

    specs: Vec<MachineSpec>,
    controllers: Vec<(String, StorageBus, u32)>,
    attachments: Vec<DeviceAttachment>,
    detached: Vec<StorageSlot>,
    serial_ports: Vec<SerialPortConfig>,
}

/// In-memory hypervisor that records every call
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A hypervisor whose VM prints `script` on its console when launched.
    pub fn with_console(script: ConsoleScript) -> Arc<Self> {
        let fake = Self::new();
        fake.set_console(script);
        fake
    }

    pub fn set_console(&self, script: ConsoleScript) {
        self.state.lock().unwrap().console = Some(script);
    }

    pub fn fail(&self, operation: &'static str, failure: Failure) {
        self.state.lock().unwrap().failures.insert(operation, failure);
    }

    pub fn script_lock_states(&self, states: &[LockState]) {
        self.state.lock().unwrap().scripted = states.iter().copied().collect();
    }

    /// Make the next `times` lock_state calls fail
    pub fn fail_lock_state(&self, times: u32) {
        self.state.lock().unwrap().lock_state_errors = times;
    }

    /// Lock state reported after unlock_machine (default: Unlocked)
    pub fn set_unlock_outcome(&self, state: LockState) {
        self.state.lock().unwrap().unlock_outcome = Some(state);
    }

    pub fn set_lock_state(&self, machine: &MachineHandle, state: LockState) {
        self.state
            .lock()
            .unwrap()
            .lock_states
            .insert(machine.id.clone(), state);
    }

    /// Current lock state as the lock manager would observe it
    pub async fn lock_state_of(&self, machine: &MachineHandle) -> LockState {
        self.lock_state(machine).await.unwrap()
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().launch_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == operation).count()
    }

    /// Position of the first call named `operation`
    pub fn position(&self, operation: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.as_str() == operation)
    }

    pub fn specs(&self) -> Vec<MachineSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn controllers(&self) -> Vec<(String, StorageBus, u32)> {
        self.state.lock().unwrap().controllers.clone()
    }

    pub fn attachments(&self) -> Vec<DeviceAttachment> {
        self.state.lock().unwrap().attachments.clone()
    }

    pub fn detached(&self) -> Vec<StorageSlot> {
        self.state.lock().unwrap().detached.clone()
    }

    pub fn serial_ports(&self) -> Vec<SerialPortConfig> {
        self.state.lock().unwrap().serial_ports.clone()
    }

    /// Record the call and return the injected failure for it, if any.
    fn enter(&self, operation: &'static str) -> HvResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(operation.to_string());
        match state.failures.get(operation) {
            Some(failure) => Err(failure.to_error(operation)),
            None => Ok(()),
        }
    }

    fn session_machine(&self, session: &SessionId) -> HvResult<MachineHandle> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(session)
            .cloned()
            .ok_or_else(|| HypervisorError::provider("session", "session holds no lock"))
    }
}

#[async_trait::async_trait]
impl Hypervisor for FakeHypervisor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create_machine(&self, spec: &MachineSpec) -> HvResult<MachineHandle> {
        self.enter("create_machine")?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        state.specs.push(spec.clone());
        Ok(MachineHandle {
            id: format!("fake-{}", state.next_id),
            name: spec.name.clone(),
            settings_file: None,
        })
    }

    async fn register_machine(&self, _machine: &MachineHandle) -> HvResult<()> {
        self.enter("register_machine")
    }

    async fn lock_state(&self, machine: &MachineHandle) -> HvResult<LockState> {
        let mut state = self.state.lock().unwrap();
        if state.lock_state_errors > 0 {
            state.lock_state_errors -= 1;
            return Err(HypervisorError::provider("lock_state", "session state unavailable"));
        }
        let scripted = if state.scripted.len() > 1 {
            state.scripted.pop_front()
        } else {
            state.scripted.front().copied()
        };
        Ok(scripted.unwrap_or_else(|| {
            state
                .lock_states
                .get(&machine.id)
                .copied()
                .unwrap_or(LockState::Unlocked)
        }))
    }

    async fn lock_machine(&self, machine: &MachineHandle, session: &SessionId) -> HvResult<()> {
        self.enter("lock_machine")?;
        let mut state = self.state.lock().unwrap();
        let current = state
            .lock_states
            .get(&machine.id)
            .copied()
            .unwrap_or(LockState::Unlocked);
        if current != LockState::Unlocked {
            return Err(HypervisorError::provider(
                "lock_machine",
                format!("machine is {}", current),
            ));
        }
        state.lock_states.insert(machine.id.clone(), LockState::Locked);
        state.sessions.insert(session.clone(), machine.clone());
        Ok(())
    }

    async fn unlock_machine(&self, session: &SessionId) -> HvResult<()> {
        self.enter("unlock_machine")?;
        let mut state = self.state.lock().unwrap();
        state.scripted.clear();
        let outcome = state.unlock_outcome.unwrap_or(LockState::Unlocked);
        if let Some(machine) = state.sessions.get(session).cloned() {
            state.lock_states.insert(machine.id, outcome);
        }
        if outcome == LockState::Unlocked {
            state.sessions.remove(session);
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
        self.enter("add_storage_controller")?;
        self.session_machine(session)?;
        self.state
            .lock()
            .unwrap()
            .controllers
            .push((name.to_string(), bus, port_count));
        Ok(())
    }

    async fn attach_device(
        &self,
        session: &SessionId,
        attachment: &DeviceAttachment,
    ) -> HvResult<()> {
        self.enter("attach_device")?;
        self.session_machine(session)?;
        self.state
            .lock()
            .unwrap()
            .attachments
            .push(attachment.clone());
        Ok(())
    }

    async fn detach_device(&self, session: &SessionId, slot: &StorageSlot) -> HvResult<()> {
        self.enter("detach_device")?;
        self.session_machine(session)?;
        self.state.lock().unwrap().detached.push(slot.clone());
        Ok(())
    }

    async fn configure_serial_port(
        &self,
        session: &SessionId,
        port: &SerialPortConfig,
    ) -> HvResult<()> {
        self.enter("configure_serial_port")?;
        self.session_machine(session)?;
        let mut state = self.state.lock().unwrap();
        state.serial_path = Some(port.path.clone());
        state.serial_ports.push(port.clone());
        Ok(())
    }

    async fn save_settings(&self, session: &SessionId) -> HvResult<()> {
        self.enter("save_settings")?;
        self.session_machine(session)?;
        Ok(())
    }

    async fn launch_vm_process(
        &self,
        machine: &MachineHandle,
        session: &SessionId,
        _mode: LaunchMode,
    ) -> HvResult<()> {
        self.enter("launch_vm_process")?;
        let delay = self.state.lock().unwrap().launch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (script, path) = {
            let mut state = self.state.lock().unwrap();
            state.lock_states.insert(machine.id.clone(), LockState::Locked);
            state.sessions.insert(session.clone(), machine.clone());
            (state.console.clone(), state.serial_path.clone())
        };
        if let (Some(script), Some(path)) = (script, path) {
            serve_console(&path, script)
                .map_err(|source| HypervisorError::Io {
                    operation: "launch_vm_process",
                    source,
                })?;
        }
        Ok(())
    }

    async fn power_down(&self, _machine: &MachineHandle, _session: &SessionId) -> HvResult<()> {
        self.enter("power_down")
    }

    async fn unregister_machine(
        &self,
        _machine: &MachineHandle,
        _mode: CleanupMode,
    ) -> HvResult<()> {
        self.enter("unregister_machine")
    }

    async fn remove_machine(&self, machine: &MachineHandle, _delete: bool) -> HvResult<()> {
        self.enter("remove_machine")?;
        self.state.lock().unwrap().lock_states.remove(&machine.id);
        Ok(())
    }
}

/// Bind a console server at `path` that plays `script` to its first client.
pub fn serve_console(path: &Path, script: ConsoleScript) -> std::io::Result<()> {
    let listener = UnixListener::bind(path)?;
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        for (delay, chunk) in script.chunks {
            tokio::time::sleep(delay).await;
            if stream.write_all(&chunk).await.is_err() {
                return;
            }
        }
        if script.close {
            let _ = stream.shutdown().await;
            return;
        }
        // Idle like a VM that has nothing more to say
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    Ok(())
}
