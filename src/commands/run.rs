use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::cli::RunArgs;
use crate::config::Settings;
use crate::error::Error;
use crate::hypervisor::VBoxManage;
use crate::image::ImageDescriptor;
use crate::instance::{Instance, Interrupt};
use crate::paths;
use crate::state::{generate_instance_name, validate_name, StateManager};

/// Create and boot a sandbox, optionally hold it, then tear it down.
pub async fn cmd_run(args: RunArgs, config: Option<&Path>) -> Result<()> {
    info!("Starting sandvm run");

    let mut settings = Settings::load(config)?;
    if let Some(secs) = args.boot_timeout {
        settings.boot.timeout_secs = secs;
    }

    let name = match args.name {
        Some(name) => {
            validate_name(&name)?;
            name
        }
        None => generate_instance_name(),
    };
    let image = ImageDescriptor::new(args.arch, args.release, args.image);
    tokio::fs::metadata(&image.medium)
        .await
        .with_context(|| format!("boot image {}", image.medium.display()))?;

    let state_manager = StateManager::new(paths::state_dir());
    state_manager.init().await?;

    let interrupt = Interrupt::from_signals().context("installing signal handlers")?;
    let hypervisor = Arc::new(VBoxManage::from_settings(&settings.vboxmanage));
    let mut instance = Instance::new(name.clone(), image, hypervisor)
        .with_settings(settings)
        .with_console_dir(paths::console_dir())
        .with_interrupt(interrupt.clone())
        .with_state(state_manager);

    let (hold, print_console) = (args.hold, args.print_console);
    let result = instance
        .scoped(move |instance| {
            Box::pin(async move {
                info!(name = %instance.name(), "sandbox is up");
                if print_console {
                    if let Some(transcript) = instance.console_output() {
                        let mut stdout = std::io::stdout().lock();
                        stdout.write_all(transcript.as_bytes())?;
                        stdout.flush()?;
                    }
                }
                if hold {
                    info!(
                        name = %instance.name(),
                        console = ?instance.console_path(),
                        "holding sandbox until interrupted"
                    );
                    let mut interrupt = interrupt;
                    interrupt.triggered().await;
                }
                Ok::<(), anyhow::Error>(())
            })
        })
        .await;

    if let Err(e) = &result {
        // The partial console is the only clue to why boot stalled
        if let Some(transcript) = e.downcast_ref::<Error>().and_then(Error::transcript) {
            if print_console && !transcript.is_empty() {
                eprintln!("{}", transcript);
            }
        }
    }
    result.with_context(|| format!("running sandbox {}", name))?;

    info!(name = %name, "sandbox torn down");
    Ok(())
}
