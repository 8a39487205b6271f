use anyhow::{bail, Result};
use uuid::Uuid;

/// Generate a new instance name
pub fn generate_instance_name() -> String {
    format!("sandvm-{}", truncate_id(&Uuid::new_v4().simple().to_string(), 12))
}

/// First `len` characters of an id (or the whole id if shorter)
pub fn truncate_id(id: &str, len: usize) -> &str {
    match id.char_indices().nth(len) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Validate an instance name for safe use in paths and hypervisor commands
///
/// Constraints:
/// - Must be 1-63 characters
/// - Must contain only alphanumeric chars, dashes, or underscores
/// - Must not start with a dash
///
/// These rules prevent:
/// - Path traversal (no slashes, dots)
/// - Names being read as VBoxManage options (no leading dash)
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("instance name cannot be empty");
    }

    if name.len() > 63 {
        bail!("instance name must be 63 characters or less, got {}", name.len());
    }

    if name.starts_with('-') {
        bail!("instance name cannot start with a dash");
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!(
            "instance name must contain only alphanumeric characters, dashes, or underscores: {:?}",
            name
        );
    }

    Ok(())
}
