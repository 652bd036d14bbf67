//! Known-good image references recorded before every destructive step.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{JsonFile, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub container_id: String,
    pub container_name: String,
    pub image_name: String,
    pub image_tag: String,
    pub image_digest: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub trigger_name: String,
}

impl BackupRecord {
    /// The reference to pull when rolling back to this record.
    pub fn image_reference(&self) -> String {
        match &self.image_digest {
            Some(digest) => format!("{}:{}@{}", self.image_name, self.image_tag, digest),
            None => format!("{}:{}", self.image_name, self.image_tag),
        }
    }
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn insert(&self, record: BackupRecord) -> Result<(), StoreError>;

    /// Records for `container_name`, oldest first.
    async fn list_by_name(&self, container_name: &str) -> Result<Vec<BackupRecord>, StoreError>;

    /// Drop the oldest records for `container_name` so that at most `keep`
    /// remain. Returns the removed records.
    async fn prune_oldest(
        &self,
        container_name: &str,
        keep: usize,
    ) -> Result<Vec<BackupRecord>, StoreError>;
}

pub struct JsonBackupStore {
    file: JsonFile<Vec<BackupRecord>>,
}

impl JsonBackupStore {
    pub fn in_memory() -> Self {
        Self {
            file: JsonFile::in_memory(),
        }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            file: JsonFile::open(path).await?,
        })
    }
}

#[async_trait]
impl BackupStore for JsonBackupStore {
    async fn insert(&self, record: BackupRecord) -> Result<(), StoreError> {
        self.file.write(move |records| records.push(record)).await
    }

    async fn list_by_name(&self, container_name: &str) -> Result<Vec<BackupRecord>, StoreError> {
        let mut records: Vec<_> = self
            .file
            .read(|records| {
                records
                    .iter()
                    .filter(|r| r.container_name == container_name)
                    .cloned()
                    .collect()
            })
            .await;
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    async fn prune_oldest(
        &self,
        container_name: &str,
        keep: usize,
    ) -> Result<Vec<BackupRecord>, StoreError> {
        self.file
            .write(|records| {
                let mut mine: Vec<(usize, DateTime<Utc>)> = records
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.container_name == container_name)
                    .map(|(i, r)| (i, r.timestamp))
                    .collect();
                if mine.len() <= keep {
                    return Vec::new();
                }
                mine.sort_by_key(|(_, ts)| *ts);
                let excess = mine.len() - keep;
                let mut doomed: Vec<usize> = mine[..excess].iter().map(|(i, _)| *i).collect();
                doomed.sort_unstable();
                let mut removed = Vec::with_capacity(doomed.len());
                for index in doomed.into_iter().rev() {
                    removed.push(records.remove(index));
                }
                removed.sort_by_key(|r| r.timestamp);
                removed
            })
            .await
    }
}
