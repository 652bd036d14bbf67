//! Reconciliation of operations a previous process left `in-progress`.

use chrono::Utc;

use crate::engine::{ContainerEngine, ContainerSnapshot, EngineError};
use crate::events::{EventSink, RollbackOutcome, RollbackTelemetry};
use crate::ledger::{OperationLedger, OperationStatus, Phase, UpdateOperation};

use super::UpdateError;

/// How an interrupted operation was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// New container in place, the renamed old one was left behind and has
    /// now been removed.
    CleanedUp,
    /// Only the renamed old container existed; it got its name back.
    RolledBack,
    /// Only the renamed old container existed and renaming it back failed.
    RenameBackFailed,
    /// The new container is in place under the original name.
    Completed,
    /// The original container is still in place; the swap never started.
    Untouched,
    /// Neither container exists.
    Missing,
}

impl Recovery {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CleanedUp => "startup_reconcile_cleanup",
            Self::RolledBack => "startup_reconcile_rolled_back",
            Self::RenameBackFailed => "startup_reconcile_rename_failed",
            Self::Completed => "startup_reconcile_completed",
            Self::Untouched => "startup_reconcile_untouched",
            Self::Missing => "startup_reconcile_missing",
        }
    }

    pub fn outcome(&self) -> RollbackOutcome {
        match self {
            Self::RolledBack => RollbackOutcome::Success,
            Self::CleanedUp | Self::Completed | Self::Untouched => RollbackOutcome::Info,
            Self::RenameBackFailed | Self::Missing => RollbackOutcome::Error,
        }
    }

    fn status(&self) -> OperationStatus {
        match self {
            Self::CleanedUp | Self::Completed => OperationStatus::Succeeded,
            Self::RolledBack | Self::Untouched => OperationStatus::RolledBack,
            Self::RenameBackFailed | Self::Missing => OperationStatus::Failed,
        }
    }

    fn phase(&self, current: Phase) -> Phase {
        match self {
            Self::CleanedUp | Self::Completed => Phase::Succeeded,
            Self::RolledBack | Self::Untouched => Phase::RolledBack,
            Self::RenameBackFailed => Phase::RollbackFailed,
            Self::Missing => current,
        }
    }
}

async fn inspect(
    engine: &dyn ContainerEngine,
    name: &str,
) -> Result<Option<ContainerSnapshot>, UpdateError> {
    engine
        .inspect_container(name)
        .await
        .map_err(|e| UpdateError::Context(format!("inspecting {name}: {e}")))
}

/// Look at what is on the host and settle `op`.
///
/// Errors leave the operation `in-progress` so the next start tries again.
pub async fn reconcile_operation(
    engine: &dyn ContainerEngine,
    ledger: &OperationLedger,
    telemetry: &RollbackTelemetry,
    sink: &dyn EventSink,
    op: &UpdateOperation,
) -> Result<Recovery, UpdateError> {
    log::info!(
        "Reconciling interrupted operation {} for {} (phase {})",
        op.id,
        op.old_name,
        op.phase
    );
    let original = inspect(engine, &op.old_name).await?;
    let renamed = if op.temp_name == op.old_name {
        None
    } else {
        inspect(engine, &op.temp_name).await?
    };

    let mut error = None;
    let recovery = match (original, renamed) {
        (Some(original), Some(renamed)) => {
            log::info!("Removing leftover container {}", op.temp_name);
            if let Err(e) = engine.remove_container(&renamed.id, true).await {
                if !e.is_not_found() {
                    record_error(ledger, op, &e).await;
                    return Err(UpdateError::Context(format!(
                        "removing leftover container {}: {e}",
                        op.temp_name
                    )));
                }
            }
            if op.old_container_was_running && !original.running {
                if let Err(e) = engine.start_container(&original.id).await {
                    log::warn!("Failed to start {} after cleanup: {e}", op.old_name);
                }
            }
            Recovery::CleanedUp
        }
        (None, Some(renamed)) => match engine.rename_container(&renamed.id, &op.old_name).await {
            Ok(()) => {
                if op.old_container_was_running && !renamed.running {
                    if let Err(e) = engine.start_container(&renamed.id).await {
                        log::warn!("Failed to restart {} after renaming it back: {e}", op.old_name);
                    }
                }
                Recovery::RolledBack
            }
            Err(e) => {
                log::error!(
                    "Failed to rename {} back to {}: {e}",
                    op.temp_name,
                    op.old_name
                );
                error = Some(e.to_string());
                Recovery::RenameBackFailed
            }
        },
        // Still the original under its own name: the swap never began, so
        // there is nothing to call succeeded.
        (Some(original), None) if op.old_container_id.as_deref() == Some(original.id.as_str()) => {
            Recovery::Untouched
        }
        (Some(_), None) => Recovery::Completed,
        (None, None) => {
            error = Some("no containers found".to_string());
            Recovery::Missing
        }
    };

    ledger
        .update(op.id, |row| {
            row.status = recovery.status();
            row.phase = recovery.phase(row.phase);
            row.recovered_at = Some(Utc::now());
            row.rollback_reason = Some(recovery.reason().to_string());
            if error.is_some() {
                row.last_error = error;
            }
        })
        .await?;
    telemetry
        .record(sink, &op.old_name, recovery.outcome(), recovery.reason())
        .await;
    log::info!("Operation {} for {}: {:?}", op.id, op.old_name, recovery);
    Ok(recovery)
}

async fn record_error(ledger: &OperationLedger, op: &UpdateOperation, e: &EngineError) {
    let message = e.to_string();
    if let Err(store) = ledger
        .update(op.id, |row| row.last_error = Some(message))
        .await
    {
        log::warn!("Failed to record error on operation {}: {store}", op.id);
    }
}
