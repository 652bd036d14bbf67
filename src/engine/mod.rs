//! The daemon seam.
//!
//! Everything the update core does to containers and images goes through
//! [`ContainerEngine`]. The production implementation talks to the Docker
//! API through bollard; tests use an in-memory fake.

mod daemon;
#[cfg(test)]
pub mod fake;

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::models::{EndpointSettings, HealthConfig, HealthStatusEnum, HostConfig};
use serde::{Deserialize, Serialize};

pub use self::daemon::BollardEngine;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("No such container or image: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::DockerApi(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Starting,
    None,
}

impl AsRef<str> for HealthState {
    fn as_ref(&self) -> &str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Starting => "starting",
            Self::None => "none",
        }
    }
}

impl From<HealthStatusEnum> for HealthState {
    fn from(status: HealthStatusEnum) -> Self {
        match status {
            HealthStatusEnum::HEALTHY => Self::Healthy,
            HealthStatusEnum::UNHEALTHY => Self::Unhealthy,
            HealthStatusEnum::STARTING => Self::Starting,
            HealthStatusEnum::EMPTY | HealthStatusEnum::NONE => Self::None,
        }
    }
}

/// Everything needed to create a container like an existing one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub stop_signal: Option<String>,
    pub exposed_ports: Option<HashMap<String, HashMap<(), ()>>>,
    pub healthcheck: Option<HealthConfig>,
    pub host_config: Option<HostConfig>,
    /// Network name to endpoint settings. Runtime-assigned fields (addresses,
    /// endpoint ids) are stripped when the spec is taken from an inspection.
    pub networks: HashMap<String, EndpointSettings>,
}

impl ContainerSpec {
    pub fn has_healthcheck(&self) -> bool {
        self.healthcheck
            .as_ref()
            .and_then(|h| h.test.as_ref())
            .is_some_and(|test| !test.is_empty() && test[0] != "NONE")
    }

    pub fn auto_remove(&self) -> bool {
        self.host_config
            .as_ref()
            .and_then(|h| h.auto_remove)
            .unwrap_or(false)
    }
}

/// Point-in-time view of a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    /// Id of the image the container was created from.
    pub image_id: Option<String>,
    pub running: bool,
    pub health: HealthState,
    pub spec: ContainerSpec,
}

/// The runtime defaults baked into an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageDefaults {
    pub id: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub repo_digests: Vec<String>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Inspect by name or id; `None` when it does not exist.
    async fn inspect_container(
        &self,
        name_or_id: &str,
    ) -> Result<Option<ContainerSnapshot>, EngineError>;

    /// Inspect a local image; `None` when it is not present.
    async fn inspect_image(&self, image: &str) -> Result<Option<ImageDefaults>, EngineError>;

    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), EngineError>;

    async fn rename_container(&self, name_or_id: &str, new_name: &str)
    -> Result<(), EngineError>;

    /// Create a container and return its id.
    async fn create_container(&self, name: &str, spec: &ContainerSpec)
    -> Result<String, EngineError>;

    async fn start_container(&self, name_or_id: &str) -> Result<(), EngineError>;

    /// Stop a container. Already stopped is not an error.
    async fn stop_container(&self, name_or_id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<(), EngineError>;

    async fn remove_image(&self, image: &str) -> Result<(), EngineError>;

    /// Point `reference` at the local image `image` (name or id).
    async fn tag_image(&self, image: &str, reference: &str) -> Result<(), EngineError>;
}

/// Strip the parts of an endpoint the daemon assigns at runtime.
pub(crate) fn reusable_endpoint(endpoint: &EndpointSettings) -> EndpointSettings {
    EndpointSettings {
        ipam_config: endpoint.ipam_config.clone(),
        links: endpoint.links.clone(),
        aliases: endpoint.aliases.clone(),
        driver_opts: endpoint.driver_opts.clone(),
        ..Default::default()
    }
}
