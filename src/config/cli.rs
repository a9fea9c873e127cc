use crate::adapters::memory_store::StoreSnapshot;
use crate::utils::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// JSON file persisting the in-memory store between CLI runs.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty store.
    pub fn load(&self) -> Result<StoreSnapshot> {
        if !self.path.exists() {
            tracing::debug!("No snapshot at {}, starting empty", self.path.display());
            return Ok(StoreSnapshot::default());
        }
        let data = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // 先寫入暫存檔再改名，避免中斷時留下半份檔案
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
