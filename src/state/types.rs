use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::hypervisor::MachineHandle;
use crate::image::ImageDescriptor;
use crate::instance::Stage;

/// Persisted snapshot of an instance, enough to tear it down after a crash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    pub stage: Stage,
    pub image: ImageDescriptor,
    pub machine: Option<MachineHandle>,
    /// Whether the machine was registered with the hypervisor
    #[serde(default)]
    pub registered: bool,
    pub console_path: Option<PathBuf>,
    /// Backend that owns the machine
    pub backend: String,
    /// sandvm process that drives the instance
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(name: String, image: ImageDescriptor, backend: &str) -> Self {
        let now = Utc::now();
        Self {
            name,
            stage: Stage::Absent,
            image,
            machine: None,
            registered: false,
            console_path: None,
            backend: backend.to_string(),
            pid: std::process::id(),
            created_at: now,
            last_updated: now,
        }
    }
}
