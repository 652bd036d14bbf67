//! `decant helper`: the far side of a self-update.
//!
//! Runs in the disposable container spawned by
//! [`hand_off`](crate::update::self_update::hand_off). By the time it starts
//! the old container has been renamed and the new one created under the
//! original name, so all that is left is stop, start, check and clean up.

use std::time::Duration;

use tokio::time::Instant;

use crate::engine::{ContainerEngine, EngineError};
use crate::update::health;
use crate::update::self_update::CONTRACT_ENV;
use crate::update::HelperContract;

const POLL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("{CONTRACT_ENV} is not set")]
    MissingContract,
    #[error("Invalid helper contract: {0}")]
    Contract(#[from] serde_json::Error),
    #[error("Container {0} did not show up within {1:?}")]
    NotPresent(String, Duration),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("New container failed ({0}), old container restored")]
    RolledBack(String),
    #[error("New container failed ({reason}) and the old one could not be restored: {restore}")]
    RestoreFailed { reason: String, restore: String },
}

pub fn contract_from_env() -> Result<HelperContract, HelperError> {
    contract_from(std::env::var(CONTRACT_ENV).ok())
}

fn contract_from(value: Option<String>) -> Result<HelperContract, HelperError> {
    let value = value.ok_or(HelperError::MissingContract)?;
    Ok(HelperContract::from_json(&value)?)
}

async fn wait_present(
    engine: &dyn ContainerEngine,
    name_or_id: &str,
    deadline: Instant,
    timeout: Duration,
) -> Result<(), HelperError> {
    loop {
        if engine.inspect_container(name_or_id).await?.is_some() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(HelperError::NotPresent(name_or_id.to_string(), timeout));
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Wait for `healthy` when the container has a health check, for `running`
/// otherwise.
async fn wait_ready(
    engine: &dyn ContainerEngine,
    container_id: &str,
    timeout: Duration,
) -> Result<(), String> {
    let snapshot = engine
        .inspect_container(container_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("{container_id} disappeared"))?;
    if snapshot.spec.has_healthcheck() {
        return health::wait_healthy(engine, container_id, POLL, timeout)
            .await
            .map_err(|e| e.to_string());
    }

    let deadline = Instant::now() + timeout;
    loop {
        match engine.inspect_container(container_id).await {
            Ok(Some(snapshot)) if snapshot.running => return Ok(()),
            Ok(Some(_)) => {}
            Ok(None) => return Err(format!("{container_id} disappeared")),
            Err(e) => log::warn!("Inspecting {container_id}: {e}"),
        }
        if Instant::now() >= deadline {
            return Err(format!("{container_id} not running after {timeout:?}"));
        }
        tokio::time::sleep(POLL).await;
    }
}

async fn swap(engine: &dyn ContainerEngine, contract: &HelperContract) -> Result<(), String> {
    log::info!("Stopping old container {}", contract.old_temp_name);
    match engine.stop_container(&contract.old_container_id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(format!("stopping old container: {e}")),
    }
    log::info!("Starting new container {}", contract.new_container_id);
    engine
        .start_container(&contract.new_container_id)
        .await
        .map_err(|e| format!("starting new container: {e}"))?;
    wait_ready(
        engine,
        &contract.new_container_id,
        Duration::from_secs(contract.health_timeout_secs),
    )
    .await
}

async fn restore(engine: &dyn ContainerEngine, contract: &HelperContract) -> Result<(), String> {
    match engine
        .remove_container(&contract.new_container_id, true)
        .await
    {
        Ok(()) => log::info!("Removed new container {}", contract.new_container_id),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(format!("removing new container: {e}")),
    }
    engine
        .rename_container(&contract.old_container_id, &contract.container_name)
        .await
        .map_err(|e| format!("renaming old container back: {e}"))?;
    engine
        .start_container(&contract.old_container_id)
        .await
        .map_err(|e| format!("restarting old container: {e}"))?;
    log::info!("Restored {}", contract.container_name);
    Ok(())
}

/// Finish the swap described by `contract`.
pub async fn run_helper(
    engine: &dyn ContainerEngine,
    contract: &HelperContract,
) -> Result<(), HelperError> {
    log::info!(
        "Helper finishing operation {} for {}",
        contract.operation_id,
        contract.container_name
    );
    let start_timeout = Duration::from_secs(contract.start_timeout_secs);
    let deadline = Instant::now() + start_timeout;
    wait_present(engine, &contract.old_container_id, deadline, start_timeout).await?;
    wait_present(engine, &contract.new_container_id, deadline, start_timeout).await?;

    if let Err(reason) = swap(engine, contract).await {
        log::error!("Self-update of {} failed: {reason}", contract.container_name);
        return match restore(engine, contract).await {
            Ok(()) => Err(HelperError::RolledBack(reason)),
            Err(restore) => Err(HelperError::RestoreFailed { reason, restore }),
        };
    }

    match engine
        .remove_container(&contract.old_container_id, true)
        .await
    {
        Ok(()) => log::info!("Removed old container {}", contract.old_temp_name),
        Err(e) if e.is_not_found() => {}
        Err(e) => log::warn!("Failed to remove old container {}: {e}", contract.old_temp_name),
    }
    log::info!("Self-update of {} complete", contract.container_name);
    Ok(())
}
