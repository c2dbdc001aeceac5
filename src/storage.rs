//! Pod persistence collaborator.
//!
//! `JsonFileStore` serializes the `PodRecord` with `serde_json` and writes it atomically
//! (temp file + rename) so a crash mid-save never leaves a corrupt record on disk.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::pod::PodRecord;

#[async_trait]
pub trait PodStorage: Send {
    async fn save(&self, record: &PodRecord) -> std::io::Result<()>;
    async fn load(&self) -> std::io::Result<PodRecord>;
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PodStorage for JsonFileStore {
    async fn save(&self, record: &PodRecord) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp_path = tmp_path_for(&self.path);
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(path = %self.path.display(), "pod record saved");
        Ok(())
    }

    async fn load(&self) -> std::io::Result<PodRecord> {
        let bytes = tokio::fs::read(&self.path).await?;
        serde_json::from_slice(&bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::PodRecord;

    #[tokio::test]
    async fn round_trips_pod_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pod.json");
        let store = JsonFileStore::new(&path);

        let mut record = PodRecord::new(111, 222);
        record.address = Some(0xDEAD_BEEF);
        record.last_nonce = 42;
        record.nonce_seed = 7;
        record.msg_sequence = 3;
        record.packet_sequence = 5;
        record.basal_schedule[0] = 100;

        store.save(&record).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded.lot, 111);
        assert_eq!(loaded.tid, 222);
        assert_eq!(loaded.address, Some(0xDEAD_BEEF));
        assert_eq!(loaded.last_nonce, 42);
        assert_eq!(loaded.nonce_seed, 7);
        assert_eq!(loaded.msg_sequence, 3);
        assert_eq!(loaded.packet_sequence, 5);
        assert_eq!(loaded.basal_schedule[0], 100);
    }

    #[tokio::test]
    async fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("missing.json"));
        assert!(store.load().await.is_err());
    }
}
