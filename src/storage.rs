use crate::helper::Dataset;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Durable copy of a meter's working dataset
#[derive(Debug, Clone)]
pub struct DatasetStorage {
    root: PathBuf,
    cups: String,
    scups: String,
}

impl DatasetStorage {
    pub fn new(storage_dir: impl AsRef<Path>, cups: &str, scups: &str) -> Self {
        Self {
            root: storage_dir.as_ref().to_path_buf(),
            cups: cups.to_ascii_lowercase(),
            scups: scups.to_ascii_uppercase(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.root
            .join("edata")
            .join(format!("edata_{}.json", self.cups))
    }

    fn legacy_path(&self) -> PathBuf {
        self.root.join(format!("edata.storage_{}", self.scups))
    }

    /// Moves a pre-2024 storage file into the current layout, once
    pub async fn migrate_legacy(&self) -> io::Result<bool> {
        let new_path = self.path();
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::try_exists(&new_path).await? {
            return Ok(false);
        }
        let legacy_path = self.legacy_path();
        let Ok(content) = fs::read_to_string(&legacy_path).await else {
            return Ok(false);
        };
        let mut contents: Value = match serde_json::from_str(&content) {
            Ok(contents) => contents,
            Err(e) => {
                debug!("Ignoring unreadable legacy storage {:?}: {}", legacy_path, e);
                return Ok(false);
            }
        };
        let Some(data) = contents.get_mut("data").map(Value::take) else {
            return Ok(false);
        };
        if data.is_null() {
            return Ok(false);
        }

        info!("Migrating storage to 2024.xx.xx strategy");
        fs::write(&new_path, serde_json::to_vec(&data)?).await?;
        info!("Storage migrated successfully, removing old storage");
        contents["data"] = Value::Array(Vec::new());
        fs::write(&legacy_path, serde_json::to_vec(&contents)?).await?;
        Ok(true)
    }

    /// Stored dataset; unreadable or undecodable files count as absent
    pub async fn load(&self) -> Option<Dataset> {
        let path = self.path();
        let content = fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Discarding undecodable storage {:?}: {}", path, e);
                None
            }
        }
    }

    pub async fn save(&self, data: &Dataset) -> io::Result<()> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec(data)?;
        fs::write(path, content).await
    }
}
