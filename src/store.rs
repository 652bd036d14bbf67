//! Small JSON document store used by the ledger, the backup store and the
//! runtime-origin store.
//!
//! Each store owns one document. Every mutation rewrites the whole file
//! through [`write_atomic`], so a crash mid-write leaves either the previous
//! or the next version on disk, never a torn one.

use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("JSON error on {0:?}: {1}")]
    Json(PathBuf, #[source] serde_json::Error),
    #[error("Record {0} not found")]
    NotFound(String),
}

pub struct JsonFile<T> {
    path: Option<PathBuf>,
    state: Mutex<T>,
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(T::default()),
        }
    }

    /// Open the document at `path`, starting empty when it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => T::default(),
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Json(path.clone(), e))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No state at {path:?}, starting empty");
                T::default()
            }
            Err(e) => return Err(StoreError::Io(path, e)),
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    /// Mutate the document and persist it before releasing the lock.
    ///
    /// When persisting fails the in-memory document is rolled back so memory
    /// and disk never disagree.
    pub async fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError>
    where
        T: Clone,
    {
        let mut state = self.state.lock().await;
        let previous = state.clone();
        let out = f(&mut state);
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(&*state)
                .map_err(|e| StoreError::Json(path.clone(), e))?;
            if let Err(e) = write_atomic(path, &bytes).await {
                *state = previous;
                return Err(StoreError::Io(path.clone(), e));
            }
        }
        Ok(out)
    }
}

/// Write `contents` to a sibling temp file and rename it over `path`.
///
/// On any failure the temp file is removed and `path` is untouched.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::now_v7()));

    let written = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, path).await
    }
    .await;
    discard_on_error(&temp_path, written).await
}

async fn discard_on_error<T>(temp_path: &Path, result: std::io::Result<T>) -> std::io::Result<T> {
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {temp_path:?}: {e}");
            }
        }
    }
    result
}
