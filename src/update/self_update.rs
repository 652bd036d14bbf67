//! Updating the container we run in.
//!
//! We cannot stop ourselves and then start the replacement, so the swap is
//! prepared here (rename, create without starting) and finished by a
//! disposable helper container. The helper gets everything it needs through
//! [`HelperContract`], serialized into its environment.

use std::collections::HashMap;

use bollard::models::HostConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SelfUpdateConfig;
use crate::engine::{ContainerEngine, ContainerSnapshot, ContainerSpec};
use crate::ledger::Phase;

use super::context::TriggerContext;
use super::driver::OperationRun;
use super::swap::DockerDriver;
use super::UpdateError;

pub const CONTRACT_ENV: &str = "DECANT_HELPER_CONTRACT";
pub const LABEL_HELPER: &str = "decant.helper";

/// What the helper is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperContract {
    pub operation_id: Uuid,
    pub container_name: String,
    pub old_container_id: String,
    /// Name the old container was renamed to.
    pub old_temp_name: String,
    pub new_container_id: String,
    /// How long to wait for both containers to show up.
    pub start_timeout_secs: u64,
    /// How long the new container gets to become running/healthy.
    pub health_timeout_secs: u64,
}

impl HelperContract {
    /// `NAME=value` entry for the helper's environment.
    pub fn to_env(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{CONTRACT_ENV}={}", serde_json::to_string(self)?))
    }

    pub fn from_json(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }
}

/// How we recognise our own container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfIdentity {
    /// Configured name or id.
    Container(String),
    /// `$HOSTNAME`, which the daemon sets to the short container id.
    Hostname(String),
}

impl SelfIdentity {
    pub fn detect(config: &SelfUpdateConfig) -> Option<Self> {
        if let Some(container) = config.container.as_ref().filter(|c| !c.is_empty()) {
            return Some(Self::Container(container.clone()));
        }
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .map(Self::Hostname)
    }

    pub fn matches(&self, snapshot: &ContainerSnapshot) -> bool {
        match self {
            Self::Container(name) => {
                let name = name.trim_start_matches('/');
                snapshot.name == name
                    || snapshot.id == name
                    || (name.len() >= 12 && snapshot.id.starts_with(name))
            }
            Self::Hostname(hostname) => {
                hostname.len() >= 12
                    && hostname.chars().all(|c| c.is_ascii_hexdigit())
                    && snapshot.id.starts_with(hostname.as_str())
            }
        }
    }
}

/// Spec of the helper container.
pub fn helper_spec(
    config: &SelfUpdateConfig,
    ctx: &TriggerContext,
    contract: &HelperContract,
) -> Result<ContainerSpec, UpdateError> {
    let contract_env = contract
        .to_env()
        .map_err(|e| UpdateError::SelfUpdate(format!("serializing helper contract: {e}")))?;
    let socket = config.socket.display().to_string();
    let mut labels = HashMap::new();
    labels.insert(LABEL_HELPER.to_string(), contract.operation_id.to_string());

    Ok(ContainerSpec {
        image: config
            .helper_image
            .clone()
            .unwrap_or_else(|| ctx.target_image.clone()),
        entrypoint: Some(vec!["decant".to_string()]),
        cmd: Some(vec!["helper".to_string()]),
        env: vec![contract_env, "RUST_LOG=info".to_string()],
        labels,
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{socket}:{socket}")]),
            auto_remove: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn helper_name(operation_id: Uuid) -> String {
    let simple = operation_id.simple().to_string();
    format!("decant-helper-{}", &simple[simple.len() - 12..])
}

/// Prepare the swap and start the helper. After this returns `Ok` the
/// helper owns the rest of the update and this process will be replaced.
pub async fn hand_off(
    driver: &DockerDriver,
    engine: &dyn ContainerEngine,
    config: &SelfUpdateConfig,
    ctx: &TriggerContext,
    run: &mut OperationRun,
) -> Result<String, UpdateError> {
    driver.rename_current(ctx, run).await?;
    let new_container_id = driver.create_new(ctx, run).await?;

    let contract = HelperContract {
        operation_id: run.op().id,
        container_name: ctx.name().to_string(),
        old_container_id: ctx.current.id.clone(),
        old_temp_name: run.op().temp_name.clone(),
        new_container_id,
        start_timeout_secs: config.start_timeout_secs,
        health_timeout_secs: config.health_timeout_secs,
    };
    let spec = helper_spec(config, ctx, &contract)?;
    let name = helper_name(contract.operation_id);

    log::info!("Creating self-update helper {name} from {}", spec.image);
    let helper_id = engine
        .create_container(&name, &spec)
        .await
        .map_err(|e| UpdateError::SelfUpdate(format!("creating helper {name}: {e}")))?;
    if let Err(e) = engine.start_container(&helper_id).await {
        if let Err(remove) = engine.remove_container(&helper_id, true).await {
            log::warn!("Failed to remove helper {name} that did not start: {remove}");
        }
        return Err(UpdateError::SelfUpdate(format!(
            "starting helper {name}: {e}"
        )));
    }
    run.phase(Phase::HelperStarted).await;
    log::info!(
        "Self-update of {} handed off to helper {name}, this process will be replaced",
        ctx.name()
    );
    Ok(helper_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HealthState;

    fn snapshot(name: &str, id: &str) -> ContainerSnapshot {
        ContainerSnapshot {
            id: id.to_string(),
            name: name.to_string(),
            image_id: None,
            running: true,
            health: HealthState::None,
            spec: ContainerSpec::default(),
        }
    }

    #[test]
    fn test_identity_matching() {
        let me = snapshot("decant", "0123456789abcdef0123");
        assert!(SelfIdentity::Container("decant".into()).matches(&me));
        assert!(SelfIdentity::Container("/decant".into()).matches(&me));
        assert!(SelfIdentity::Container("0123456789ab".into()).matches(&me));
        assert!(!SelfIdentity::Container("nginx".into()).matches(&me));
        assert!(SelfIdentity::Hostname("0123456789ab".into()).matches(&me));
        // A host name that happens to equal a container name is not us.
        assert!(!SelfIdentity::Hostname("decant".into()).matches(&me));
    }

    #[test]
    fn test_contract_round_trips_through_env() {
        let contract = HelperContract {
            operation_id: Uuid::now_v7(),
            container_name: "decant".to_string(),
            old_container_id: "old".to_string(),
            old_temp_name: "decant-old-1".to_string(),
            new_container_id: "new".to_string(),
            start_timeout_secs: 30,
            health_timeout_secs: 60,
        };
        let env = contract.to_env().unwrap();
        let (key, value) = env.split_once('=').unwrap();
        assert_eq!(key, CONTRACT_ENV);
        assert_eq!(HelperContract::from_json(value).unwrap(), contract);
    }

    #[test]
    fn test_helper_name_is_short() {
        let name = helper_name(Uuid::now_v7());
        assert!(name.starts_with("decant-helper-"));
        assert_eq!(name.len(), "decant-helper-".len() + 12);
    }
}
