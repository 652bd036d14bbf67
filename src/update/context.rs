use std::path::PathBuf;

use bollard::auth::DockerCredentials;

use crate::credentials::CredentialProvider;
use crate::engine::{ContainerEngine, ContainerSnapshot};
use crate::model::Container;

use super::UpdateError;

/// Compose file and service a container was deployed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeTarget {
    pub file: PathBuf,
    pub service: String,
}

/// Everything one update attempt needs, resolved up front. Never persisted.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub container: Container,
    pub credentials: Option<DockerCredentials>,
    /// Fully qualified reference of the image to run.
    pub target_image: String,
    /// Inspection of the current container taken when the attempt started.
    pub current: ContainerSnapshot,
    pub compose: Option<ComposeTarget>,
}

impl TriggerContext {
    /// Inspect the current container and resolve pull credentials.
    pub async fn build(
        engine: &dyn ContainerEngine,
        credentials: &dyn CredentialProvider,
        container: &Container,
    ) -> Result<Self, UpdateError> {
        let lookup = if container.id.is_empty() {
            container.name.as_str()
        } else {
            container.id.as_str()
        };
        let current = engine
            .inspect_container(lookup)
            .await
            .map_err(|e| UpdateError::Context(format!("inspecting {}: {e}", container.name)))?
            .ok_or_else(|| {
                UpdateError::Context(format!("container {} does not exist", container.name))
            })?;

        let target = container.target_image();
        let credentials = credentials.credentials(target.registry_host()).await;

        Ok(Self {
            container: container.clone(),
            credentials,
            target_image: target.reference(),
            current,
            compose: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.container.name
    }

    pub fn was_running(&self) -> bool {
        self.current.running
    }

    /// Pull the target image with the resolved credentials.
    pub async fn pull(&self, engine: &dyn ContainerEngine) -> Result<(), UpdateError> {
        log::info!("Pulling {} for {}", self.target_image, self.name());
        engine
            .pull_image(&self.target_image, self.credentials.clone())
            .await
            .map_err(|source| UpdateError::Pull {
                image: self.target_image.clone(),
                source,
            })
    }

    /// The image reference the current container was created from.
    pub fn current_image(&self) -> &str {
        &self.current.spec.image
    }
}
