//! Swap-time health gate.

use std::time::Duration;

use tokio::time::Instant;

use crate::engine::{ContainerEngine, EngineError, HealthState};

#[derive(Debug, thiserror::Error)]
pub enum HealthGateError {
    #[error("container reported unhealthy")]
    Unhealthy,
    #[error("container exited before reporting healthy")]
    Exited,
    #[error("container {0} disappeared")]
    Vanished(String),
    #[error("no healthy status within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl HealthGateError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "health_gate_timeout",
            _ => "health_gate_failed",
        }
    }
}

/// Poll `name_or_id` until it reports `healthy`.
///
/// Only an explicit `healthy` passes. `unhealthy` fails at once; anything
/// else keeps polling every `interval` until `timeout` has elapsed.
pub async fn wait_healthy(
    engine: &dyn ContainerEngine,
    name_or_id: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<(), HealthGateError> {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = engine
            .inspect_container(name_or_id)
            .await?
            .ok_or_else(|| HealthGateError::Vanished(name_or_id.to_string()))?;

        match snapshot.health {
            HealthState::Healthy => {
                log::info!("Container {name_or_id} is healthy");
                return Ok(());
            }
            HealthState::Unhealthy => return Err(HealthGateError::Unhealthy),
            HealthState::Starting | HealthState::None if !snapshot.running => {
                return Err(HealthGateError::Exited);
            }
            state => log::debug!("Container {name_or_id} health: {}", state.as_ref()),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(HealthGateError::Timeout(timeout));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
