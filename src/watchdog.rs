//! Post-update auto-rollback.
//!
//! After an update passes its health gate, a watchdog keeps polling the new
//! container for a while and rolls back to the last backed-up image as soon
//! as it reports `unhealthy`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::engine::{ContainerEngine, HealthState};
use crate::update::UpdateError;

pub const ROLLBACK_REASON: &str = "health_check_failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthMonitorTask {
    /// Id of the container the update created. Only used for logs, the
    /// container is resolved by name on every poll.
    pub container_id: String,
    pub container_name: String,
    /// Image to go back to.
    pub backup_image: String,
    pub window: Duration,
    pub interval: Duration,
    pub trigger_name: String,
}

#[async_trait]
pub trait RollbackExecutor: Send + Sync {
    /// Put `image` back on `container_name`, recording telemetry under
    /// `reason`.
    async fn rollback_to(
        &self,
        container_name: &str,
        image: &str,
        reason: &str,
    ) -> Result<(), UpdateError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The window elapsed without an unhealthy report.
    Stable,
    RolledBack,
    RollbackFailed(String),
    /// The container disappeared.
    Lost,
    Aborted,
}

pub async fn watch(
    task: &HealthMonitorTask,
    engine: &dyn ContainerEngine,
    executor: &dyn RollbackExecutor,
) -> WatchOutcome {
    log::info!(
        "Watching {} ({}) for {:?}, rollback target {}",
        task.container_name,
        task.container_id,
        task.window,
        task.backup_image
    );
    let deadline = Instant::now() + task.window;
    loop {
        let now = Instant::now();
        if now >= deadline {
            log::info!("{} stayed healthy, watchdog done", task.container_name);
            return WatchOutcome::Stable;
        }
        tokio::time::sleep(task.interval.min(deadline - now)).await;

        match engine.inspect_container(&task.container_name).await {
            Ok(Some(snapshot)) if snapshot.health == HealthState::Unhealthy => {
                log::warn!(
                    "{} became unhealthy, rolling back to {}",
                    task.container_name,
                    task.backup_image
                );
                return match executor
                    .rollback_to(&task.container_name, &task.backup_image, ROLLBACK_REASON)
                    .await
                {
                    Ok(()) => WatchOutcome::RolledBack,
                    Err(e) => {
                        log::error!("Auto-rollback of {} failed: {e}", task.container_name);
                        WatchOutcome::RollbackFailed(e.to_string())
                    }
                };
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                log::warn!("{} disappeared, watchdog done", task.container_name);
                return WatchOutcome::Lost;
            }
            Err(e) => log::warn!("Watchdog cannot inspect {}: {e}", task.container_name),
        }
    }
}

/// The armed watchdogs, at most one per container name.
#[derive(Default)]
pub struct WatchdogRegistry {
    tasks: Mutex<HashMap<String, JoinHandle<WatchOutcome>>>,
}

impl WatchdogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<WatchOutcome>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start watching, replacing any watchdog already armed for the same
    /// container.
    pub fn arm(
        &self,
        task: HealthMonitorTask,
        engine: Arc<dyn ContainerEngine>,
        executor: Arc<dyn RollbackExecutor>,
    ) {
        let name = task.container_name.clone();
        let handle =
            tokio::spawn(async move { watch(&task, engine.as_ref(), executor.as_ref()).await });
        if let Some(previous) = self.tasks().insert(name.clone(), handle) {
            log::debug!("Replacing watchdog of {name}");
            previous.abort();
        }
    }

    pub fn disarm(&self, container_name: &str) -> bool {
        match self.tasks().remove(container_name) {
            Some(handle) => {
                let active = !handle.is_finished();
                handle.abort();
                if active {
                    log::info!("Disarmed watchdog of {container_name}");
                }
                active
            }
            None => false,
        }
    }

    pub fn is_armed(&self, container_name: &str) -> bool {
        self.tasks()
            .get(container_name)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for every armed watchdog to finish.
    pub async fn wait_all(&self) -> Vec<(String, WatchOutcome)> {
        let drained: Vec<_> = self.tasks().drain().collect();
        let mut outcomes = Vec::with_capacity(drained.len());
        for (name, handle) in drained {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => WatchOutcome::Aborted,
                Err(e) => WatchOutcome::RollbackFailed(format!("watchdog task failed: {e}")),
            };
            outcomes.push((name, outcome));
        }
        outcomes
    }
}
