use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::InstanceRecord;

/// Manages instance record persistence
#[derive(Debug, Clone)]
pub struct StateManager {
    state_dir: PathBuf,
}

impl StateManager {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    /// Initialize state directory
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .await
            .context("creating state directory")?;
        Ok(())
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", name))
    }

    /// Save an instance record (owner read/write only)
    ///
    /// Written to a temp file and renamed so readers never see a partial record.
    pub async fn save(&self, record: &InstanceRecord) -> Result<()> {
        let path = self.record_path(&record.name);
        let tmp = self.state_dir.join(format!(".{}.json.tmp", record.name));
        let json = serde_json::to_string_pretty(record)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)
            .await
            .context("opening instance record")?;
        file.write_all(json.as_bytes())
            .await
            .context("writing instance record")?;
        file.sync_all().await.context("syncing instance record")?;
        drop(file);

        fs::rename(&tmp, &path)
            .await
            .context("publishing instance record")?;
        Ok(())
    }

    /// Load an instance record by name
    pub async fn load(&self, name: &str) -> Result<InstanceRecord> {
        let json = fs::read_to_string(self.record_path(name))
            .await
            .with_context(|| format!("reading instance record for {}", name))?;
        let record: InstanceRecord =
            serde_json::from_str(&json).context("parsing instance record")?;
        Ok(record)
    }

    /// Delete an instance record (no error if it does not exist)
    pub async fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.record_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("deleting instance record"),
        }
    }

    /// List all instance records, skipping unreadable ones
    pub async fn list(&self) -> Result<Vec<InstanceRecord>> {
        let mut records = Vec::new();

        if !self.state_dir.exists() {
            return Ok(records);
        }

        let mut entries = fs::read_dir(&self.state_dir)
            .await
            .context("reading state directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Ok(json) = fs::read_to_string(&path).await {
                    if let Ok(record) = serde_json::from_str::<InstanceRecord>(&json) {
                        records.push(record);
                    }
                }
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

// StateManager tests live in tests/test_state_manager.rs
