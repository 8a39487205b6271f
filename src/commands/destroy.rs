use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cli::NameArgs;
use crate::config::Settings;
use crate::hypervisor::VBoxManage;
use crate::instance::Instance;
use crate::paths;
use crate::state::StateManager;

/// Tear down a sandbox whose driving process is gone.
pub async fn cmd_destroy(args: NameArgs, config: Option<&Path>) -> Result<()> {
    info!(name = %args.name, "sandvm destroy");
    let settings = Settings::load(config)?;
    let state_manager = StateManager::new(paths::state_dir());

    let record = state_manager
        .load(&args.name)
        .await
        .with_context(|| format!("no recorded sandbox named {}", args.name))?;
    if record.pid != std::process::id() && process_alive(record.pid) {
        warn!(name = %args.name, pid = record.pid, "sandbox is still driven by a running process");
    }

    let hypervisor = Arc::new(VBoxManage::from_settings(&settings.vboxmanage));
    let mut instance = Instance::from_record(record, hypervisor)
        .with_settings(settings)
        .with_state(state_manager);

    // The VM may already be off
    if let Err(e) = instance.shutdown().await {
        warn!(name = %args.name, error = %e, "shutdown failed, destroying anyway");
    }
    instance
        .destroy()
        .await
        .with_context(|| format!("destroying sandbox {}", args.name))?;

    info!(name = %args.name, "sandbox destroyed");
    Ok(())
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}
