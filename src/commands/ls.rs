use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::cli::LsArgs;
use crate::paths;
use crate::state::{truncate_id, StateManager};

#[derive(Debug, Serialize)]
struct InstanceInfo {
    name: String,
    stage: String,
    arch: String,
    release: String,
    machine: Option<String>,
    pid: u32,
    running: bool,
    console: Option<String>,
    last_updated: String,
}

pub async fn cmd_ls(args: LsArgs) -> Result<()> {
    // Only log in non-JSON mode to avoid mixing logs with JSON output
    if !args.json {
        info!("sandvm ls");
    }
    let state_manager = StateManager::new(paths::state_dir());
    let records = state_manager.list().await?;

    let infos: Vec<InstanceInfo> = records
        .into_iter()
        .map(|record| InstanceInfo {
            running: std::path::Path::new(&format!("/proc/{}", record.pid)).exists(),
            stage: record.stage.to_string(),
            arch: record.image.architecture,
            release: record.image.release,
            machine: record.machine.map(|m| m.id),
            pid: record.pid,
            console: record.console_path.map(|p| p.display().to_string()),
            last_updated: record.last_updated.to_rfc3339(),
            name: record.name,
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:<8} {:<10} {:<14} {:<8} {:<8}",
        "NAME", "STAGE", "ARCH", "RELEASE", "MACHINE", "PID", "RUNNING"
    );
    println!("{}", "-".repeat(88));
    for info in infos {
        let machine = info
            .machine
            .as_deref()
            .map_or("-", |id| truncate_id(id, 12));
        println!(
            "{:<24} {:<10} {:<8} {:<10} {:<14} {:<8} {:<8}",
            info.name,
            info.stage,
            info.arch,
            info.release,
            machine,
            info.pid,
            if info.running { "yes" } else { "no" }
        );
    }

    Ok(())
}
