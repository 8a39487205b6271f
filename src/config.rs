//! Configuration file loading.
//!
//! Every field has a default, so a partial file (or none at all) is fine.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Config file name
pub const CONFIG_FILE: &str = "sandvm.toml";

/// Embedded default config (written by `sandvm config`)
pub const EMBEDDED_CONFIG: &str = include_str!("../sandvm.toml");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub machine: MachineSettings,
    pub boot: BootSettings,
    pub lock: LockSettings,
    pub vboxmanage: VBoxManageSettings,
}

/// Hardware profile of every sandbox VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSettings {
    pub cpus: u32,
    pub memory_mib: u32,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mib: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootSettings {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub launch_timeout_secs: Option<u64>,
    pub power_down_timeout_secs: Option<u64>,
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            poll_interval_ms: 500,
            launch_timeout_secs: None,
            power_down_timeout_secs: None,
        }
    }
}

impl BootSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn launch_timeout(&self) -> Option<Duration> {
        self.launch_timeout_secs.map(Duration::from_secs)
    }

    pub fn power_down_timeout(&self) -> Option<Duration> {
        self.power_down_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 5000,
            poll_interval_ms: 50,
        }
    }
}

impl LockSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VBoxManageSettings {
    pub binary: PathBuf,
}

impl Default for VBoxManageSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("VBoxManage"),
        }
    }
}

impl Settings {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("parsing sandvm config")
    }

    /// Load settings using the lookup chain, falling back to the embedded defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match find_config_file(explicit_path)? {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file: {}", path.display()))?;
                let settings = toml::from_str(&content)
                    .with_context(|| format!("parsing config file: {}", path.display()))?;
                info!(config_file = %path.display(), "loaded config");
                Ok(settings)
            }
            None => {
                debug!("no config file found, using embedded defaults");
                Self::parse(EMBEDDED_CONFIG)
            }
        }
    }
}

/// Write the embedded default config to the XDG config directory.
///
/// Writes to ~/.config/sandvm/sandvm.toml
pub fn generate_config(force: bool) -> Result<PathBuf> {
    let proj_dirs =
        ProjectDirs::from("", "", "sandvm").context("Could not determine config directory")?;
    let config_dir = proj_dirs.config_dir();
    let config_path = config_dir.join(CONFIG_FILE);

    if config_path.exists() && !force {
        bail!(
            "Config file already exists at {}\n\n\
             Use --force to overwrite, or edit the existing file.",
            config_path.display()
        );
    }

    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory: {}", config_dir.display()))?;
    std::fs::write(&config_path, EMBEDDED_CONFIG)
        .with_context(|| format!("writing config file: {}", config_path.display()))?;

    info!("Generated config at {}", config_path.display());
    Ok(config_path)
}

/// Find the config file using the lookup chain.
///
/// Lookup order:
/// 1. Explicit path (--config flag), which must exist
/// 2. SUDO_USER's config (when running with sudo, use invoking user's config)
/// 3. XDG user config (~/.config/sandvm/sandvm.toml)
/// 4. System config (/etc/sandvm/sandvm.toml)
///
/// Returns `None` when nothing is found; callers use the embedded defaults.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit_path {
        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        match nix::unistd::User::from_name(&sudo_user) {
            Ok(Some(user)) => {
                let p = user.dir.join(".config/sandvm").join(CONFIG_FILE);
                if p.exists() {
                    return Ok(Some(p));
                }
            }
            Ok(None) => {
                debug!("SUDO_USER '{}' not found in passwd database", sudo_user);
            }
            Err(e) => {
                debug!("Failed to lookup SUDO_USER '{}': {}", sudo_user, e);
            }
        }
    }

    if let Some(proj_dirs) = ProjectDirs::from("", "", "sandvm") {
        let p = proj_dirs.config_dir().join(CONFIG_FILE);
        if p.exists() {
            return Ok(Some(p));
        }
    }

    let system = Path::new("/etc/sandvm").join(CONFIG_FILE);
    if system.exists() {
        return Ok(Some(system));
    }

    Ok(None)
}
