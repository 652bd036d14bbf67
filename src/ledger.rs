//! Durable record of every update attempt.
//!
//! A row is inserted when an update reaches the point where it may start
//! mutating the host and is rewritten at every phase transition. Rows are
//! never deleted; at startup the `in-progress` ones tell us which swaps were
//! interrupted.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{JsonFile, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    RolledBack,
    Failed,
}

impl AsRef<str> for OperationStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::RolledBack => "rolled-back",
            Self::Failed => "failed",
        }
    }
}

/// Checkpoint reached by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Prepare,
    Renamed,
    NewCreated,
    OldStopped,
    NewStarted,
    HealthGate,
    HealthGatePassed,
    ComposeFileUpdated,
    HelperStarted,
    Succeeded,
    RollbackStarted,
    RolledBack,
    RollbackFailed,
}

impl AsRef<str> for Phase {
    fn as_ref(&self) -> &str {
        match self {
            Self::Prepare => "prepare",
            Self::Renamed => "renamed",
            Self::NewCreated => "new-created",
            Self::OldStopped => "old-stopped",
            Self::NewStarted => "new-started",
            Self::HealthGate => "health-gate",
            Self::HealthGatePassed => "health-gate-passed",
            Self::ComposeFileUpdated => "compose-file-updated",
            Self::HelperStarted => "helper-started",
            Self::Succeeded => "succeeded",
            Self::RollbackStarted => "rollback-started",
            Self::RolledBack => "rolled-back",
            Self::RollbackFailed => "rollback-failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOperation {
    pub id: Uuid,
    pub container_id: String,
    pub container_name: String,
    pub trigger_name: String,
    pub old_container_id: Option<String>,
    pub old_name: String,
    pub temp_name: String,
    pub old_container_was_running: bool,
    pub old_container_stopped: bool,
    pub new_container_id: Option<String>,
    pub from_version: String,
    pub to_version: String,
    pub target_image: String,
    pub status: OperationStatus,
    pub phase: Phase,
    pub last_error: Option<String>,
    pub rollback_reason: Option<String>,
    pub recovered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields known when an operation starts.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub container_id: String,
    pub container_name: String,
    pub trigger_name: String,
    pub temp_name: String,
    pub old_container_was_running: bool,
    pub from_version: String,
    pub to_version: String,
    pub target_image: String,
}

impl UpdateOperation {
    pub fn new(fields: NewOperation) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            old_container_id: Some(fields.container_id.clone()),
            old_name: fields.container_name.clone(),
            container_id: fields.container_id,
            container_name: fields.container_name,
            trigger_name: fields.trigger_name,
            temp_name: fields.temp_name,
            old_container_was_running: fields.old_container_was_running,
            old_container_stopped: false,
            new_container_id: None,
            from_version: fields.from_version,
            to_version: fields.to_version,
            target_image: fields.target_image,
            status: OperationStatus::InProgress,
            phase: Phase::Prepare,
            last_error: None,
            rollback_reason: None,
            recovered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == OperationStatus::InProgress
    }
}

pub struct OperationLedger {
    file: JsonFile<Vec<UpdateOperation>>,
}

impl OperationLedger {
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

    pub async fn insert(&self, fields: NewOperation) -> Result<UpdateOperation, StoreError> {
        let op = UpdateOperation::new(fields);
        let stored = op.clone();
        self.file.write(move |ops| ops.push(stored)).await?;
        Ok(op)
    }

    /// Apply `mutate` to the operation `id` and persist it.
    pub async fn update(
        &self,
        id: Uuid,
        mutate: impl FnOnce(&mut UpdateOperation),
    ) -> Result<UpdateOperation, StoreError> {
        self.file
            .write(move |ops| {
                let op = ops.iter_mut().find(|op| op.id == id)?;
                mutate(op);
                op.updated_at = Utc::now();
                Some(op.clone())
            })
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub async fn get(&self, id: Uuid) -> Option<UpdateOperation> {
        self.file
            .read(|ops| ops.iter().find(|op| op.id == id).cloned())
            .await
    }

    /// The most recent in-progress operation for `name`.
    pub async fn in_progress_for(&self, name: &str) -> Option<UpdateOperation> {
        self.file
            .read(|ops| {
                ops.iter()
                    .rev()
                    .find(|op| op.is_in_progress() && op.container_name == name)
                    .cloned()
            })
            .await
    }

    pub async fn list_in_progress(&self) -> Vec<UpdateOperation> {
        self.file
            .read(|ops| ops.iter().filter(|op| op.is_in_progress()).cloned().collect())
            .await
    }

    pub async fn history(&self, name: &str) -> Vec<UpdateOperation> {
        self.file
            .read(|ops| {
                ops.iter()
                    .filter(|op| op.container_name == name)
                    .cloned()
                    .collect()
            })
            .await
    }
}
