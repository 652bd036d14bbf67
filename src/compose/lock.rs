//! Serializing edits of a compose file.
//!
//! Two layers: an async mutex per file for tasks of this process, and a
//! `<file>.lock` sidecar created with `O_EXCL` for other processes.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::config::ComposeConfig;

use super::ComposeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up after this long.
    pub wait: Duration,
    pub poll: Duration,
    /// A sidecar older than this is left over from a crashed writer.
    pub stale: Duration,
}

impl From<&ComposeConfig> for LockOptions {
    fn from(config: &ComposeConfig) -> Self {
        Self {
            wait: Duration::from_secs(config.lock_wait_secs),
            poll: Duration::from_millis(config.lock_poll_millis.max(1)),
            stale: Duration::from_secs(config.lock_stale_secs),
        }
    }
}

pub fn lock_path(file: &Path) -> PathBuf {
    let mut name = file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    file.with_file_name(name)
}

/// The sidecar lock file. Removed on drop.
#[derive(Debug)]
pub struct ComposeFileLock {
    path: PathBuf,
}

impl ComposeFileLock {
    pub async fn acquire(file: &Path, options: &LockOptions) -> Result<Self, ComposeError> {
        let path = lock_path(file);
        let deadline = Instant::now() + options.wait;
        loop {
            let created = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match created {
                Ok(mut handle) => {
                    let owner = format!(
                        "{} {}\n",
                        std::process::id(),
                        chrono::Utc::now().to_rfc3339()
                    );
                    let lock = Self { path };
                    if let Err(e) = handle.write_all(owner.as_bytes()).await {
                        log::debug!("Cannot record owner in {:?}: {e}", lock.path);
                    }
                    log::debug!("Acquired {:?}", lock.path);
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, options.stale).await {
                        log::warn!("Reclaiming stale lock {path:?}");
                        match tokio::fs::remove_file(&path).await {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(ComposeError::Io(path, e)),
                        }
                    }
                }
                Err(e) => return Err(ComposeError::Io(path, e)),
            }

            if Instant::now() >= deadline {
                return Err(ComposeError::LockTimeout(path, options.wait));
            }
            tokio::time::sleep(options.poll).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ComposeFileLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Released {:?}", self.path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to release {:?}: {e}", self.path),
        }
    }
}

async fn is_stale(path: &Path, stale: Duration) -> bool {
    let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    modified.elapsed().is_ok_and(|age| age >= stale)
}

/// Held while a compose file is being edited and applied.
#[derive(Debug)]
pub struct ComposeLockGuard {
    // Field order matters: the sidecar goes before the local mutex opens.
    file: ComposeFileLock,
    _local: OwnedMutexGuard<()>,
}

impl ComposeLockGuard {
    pub fn lock_file(&self) -> &Path {
        self.file.path()
    }
}

/// Per-file mutexes, shared by every driver of one orchestrator.
#[derive(Default)]
pub struct ComposeLockRegistry {
    files: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ComposeLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, file: &Path) -> Arc<Mutex<()>> {
        let key = std::path::absolute(file).unwrap_or_else(|_| file.to_path_buf());
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.entry(key).or_default().clone()
    }

    pub async fn acquire(
        &self,
        file: &Path,
        options: &LockOptions,
    ) -> Result<ComposeLockGuard, ComposeError> {
        let started = Instant::now();
        let local = tokio::time::timeout(options.wait, self.mutex_for(file).lock_owned())
            .await
            .map_err(|_| ComposeError::LockTimeout(lock_path(file), options.wait))?;
        let remaining = options.wait.saturating_sub(started.elapsed());
        let file = ComposeFileLock::acquire(
            file,
            &LockOptions {
                wait: remaining,
                ..*options
            },
        )
        .await?;
        Ok(ComposeLockGuard {
            file,
            _local: local,
        })
    }
}
