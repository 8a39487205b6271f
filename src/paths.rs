use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::state::truncate_id;

static BASE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Set the base directory (from --base-dir). Only the first call has an effect.
pub fn init_base_dir(path: Option<&str>) {
    let dir = path.map(PathBuf::from).unwrap_or_else(default_base_dir);
    let _ = BASE_DIR.set(dir);
}

fn default_base_dir() -> PathBuf {
    ProjectDirs::from("", "", "sandvm")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/tmp/sandvm"))
}

/// Base directory for all sandvm data
pub fn base_dir() -> PathBuf {
    BASE_DIR.get_or_init(default_base_dir).clone()
}

/// Directory for instance records
pub fn state_dir() -> PathBuf {
    base_dir().join("state")
}

/// Directory holding serial console sockets
pub fn console_dir() -> PathBuf {
    base_dir().join("consoles")
}

/// A fresh console socket path for `name` inside `dir`.
///
/// Unix socket paths are limited to 108 bytes, so the name is shortened.
pub fn console_socket(dir: &Path, name: &str) -> PathBuf {
    let suffix = Uuid::new_v4().simple().to_string();
    dir.join(format!(
        "{}-{}.sock",
        truncate_id(name, 24),
        truncate_id(&suffix, 8)
    ))
}
