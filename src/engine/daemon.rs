//! [`ContainerEngine`] over the Docker API.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::models::{ContainerCreateBody, NetworkConnectRequest, NetworkingConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateContainerOptionsBuilder, CreateImageOptions,
    CreateImageOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    RemoveContainerOptions, RemoveContainerOptionsBuilder, RemoveImageOptions,
    RemoveImageOptionsBuilder, RenameContainerOptions, RenameContainerOptionsBuilder,
    StartContainerOptions, StartContainerOptionsBuilder, StopContainerOptions,
    StopContainerOptionsBuilder, TagImageOptions, TagImageOptionsBuilder,
};
use futures_util::StreamExt;

use crate::model::ImageRef;

use super::{
    ContainerEngine, ContainerSnapshot, ContainerSpec, EngineError, HealthState, ImageDefaults,
    reusable_endpoint,
};

/// Seconds the daemon waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: i32 = 10;

#[derive(Clone)]
pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn is_status(e: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

/// Networks that cannot be combined with any other.
fn is_exclusive_network_mode(mode: &str) -> bool {
    mode == "host" || mode == "none" || mode.starts_with("container:")
}

#[async_trait]
impl ContainerEngine for BollardEngine {
    async fn inspect_container(
        &self,
        name_or_id: &str,
    ) -> Result<Option<ContainerSnapshot>, EngineError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        let info = match self
            .docker
            .inspect_container(name_or_id, Some(options))
            .await
        {
            Ok(info) => info,
            Err(e) if is_status(&e, 404) => return Ok(None),
            Err(e) => return Err(EngineError::DockerApi(e)),
        };

        let id = info.id.unwrap_or_default();
        let name = info
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let (running, health) = match info.state {
            Some(state) => (
                state.running.unwrap_or(false),
                state
                    .health
                    .and_then(|h| h.status)
                    .map(HealthState::from)
                    .unwrap_or(HealthState::None),
            ),
            None => (false, HealthState::None),
        };

        let config = info.config.unwrap_or_default();
        // The daemon defaults the hostname to the short id; carrying that
        // over would give the new container the old container's id.
        let hostname = config
            .hostname
            .filter(|h| !h.is_empty() && !id.starts_with(h.as_str()));
        let networks = info
            .network_settings
            .and_then(|n| n.networks)
            .unwrap_or_default()
            .iter()
            .map(|(name, endpoint)| (name.clone(), reusable_endpoint(endpoint)))
            .collect();

        let spec = ContainerSpec {
            image: config.image.unwrap_or_default(),
            entrypoint: config.entrypoint,
            cmd: config.cmd,
            env: config.env.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            hostname,
            user: config.user.filter(|u| !u.is_empty()),
            working_dir: config.working_dir.filter(|w| !w.is_empty()),
            stop_signal: config.stop_signal,
            exposed_ports: config.exposed_ports,
            healthcheck: config.healthcheck,
            host_config: info.host_config,
            networks,
        };

        Ok(Some(ContainerSnapshot {
            id,
            name,
            image_id: info.image,
            running,
            health,
            spec,
        }))
    }

    async fn inspect_image(&self, image: &str) -> Result<Option<ImageDefaults>, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(inspect) => {
                let (entrypoint, cmd) = match inspect.config {
                    Some(config) => (config.entrypoint, config.cmd),
                    None => (None, None),
                };
                Ok(Some(ImageDefaults {
                    id: inspect.id,
                    entrypoint,
                    cmd,
                    repo_digests: inspect.repo_digests.unwrap_or_default(),
                }))
            }
            Err(e) if is_status(&e, 404) => Ok(None),
            Err(e) => Err(EngineError::DockerApi(e)),
        }
    }

    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), EngineError> {
        log::info!("Pulling image: {image}");
        let reference = crate::model::ImageRef::parse(image);
        // Digest pulls go through `from_image` alone.
        let options: CreateImageOptions = match &reference.digest {
            Some(_) => CreateImageOptionsBuilder::new().from_image(image).build(),
            None => CreateImageOptionsBuilder::new()
                .from_image(&reference.name())
                .tag(reference.tag_or_latest())
                .build(),
        };

        let mut stream = self.docker.create_image(Some(options), None, credentials);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log::debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    log::error!("Failed to pull image {image}: {e}");
                    return Err(EngineError::DockerApi(e));
                }
            }
        }

        log::info!("Image {image} pulled successfully");
        Ok(())
    }

    async fn rename_container(
        &self,
        name_or_id: &str,
        new_name: &str,
    ) -> Result<(), EngineError> {
        let options: RenameContainerOptions =
            RenameContainerOptionsBuilder::new().name(new_name).build();
        self.docker
            .rename_container(name_or_id, options)
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    EngineError::NotFound(name_or_id.to_string())
                } else {
                    EngineError::DockerApi(e)
                }
            })?;
        log::info!("Container {name_or_id} renamed to {new_name}");
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        log::info!("Creating container: {name}");

        let network_mode = spec
            .host_config
            .as_ref()
            .and_then(|h| h.network_mode.clone());
        let exclusive = network_mode
            .as_deref()
            .is_some_and(is_exclusive_network_mode);

        // Only one network can be attached at creation time; the rest are
        // connected afterwards.
        let mut network_names: Vec<&String> = spec.networks.keys().collect();
        network_names.sort();
        let primary = network_mode
            .as_ref()
            .filter(|mode| spec.networks.contains_key(*mode))
            .or_else(|| network_names.first().copied())
            .cloned();

        let networking_config = match (&primary, exclusive) {
            (Some(primary), false) => {
                let mut endpoints = HashMap::new();
                endpoints.insert(primary.clone(), spec.networks[primary].clone());
                Some(NetworkingConfig {
                    endpoints_config: Some(endpoints),
                })
            }
            _ => None,
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            entrypoint: spec.entrypoint.clone(),
            cmd: spec.cmd.clone(),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone())
            },
            hostname: spec.hostname.clone(),
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            stop_signal: spec.stop_signal.clone(),
            exposed_ports: spec.exposed_ports.clone(),
            healthcheck: spec.healthcheck.clone(),
            host_config: spec.host_config.clone(),
            networking_config,
            ..Default::default()
        };

        let options: CreateContainerOptions = CreateContainerOptionsBuilder::new().name(name).build();

        let response = self.docker.create_container(Some(options), config).await?;

        if !exclusive {
            for network in network_names
                .into_iter()
                .filter(|n| Some(*n) != primary.as_ref())
            {
                let connect_request = NetworkConnectRequest {
                    container: Some(response.id.clone()),
                    endpoint_config: Some(spec.networks[network].clone()),
                };

                if let Err(e) = self.docker.connect_network(network, connect_request).await {
                    log::warn!("Failed to connect container {name} to network {network}: {e}");
                    // The caller never learns the id, so the container must not outlive the error.
                    if let Err(remove) = self.remove_container(&response.id, true).await {
                        log::error!("Failed to remove half-created container {name}: {remove}");
                    }
                    return Err(e.into());
                }
            }
        }

        log::info!("Container {name} created successfully ({})", response.id);
        Ok(response.id)
    }

    async fn start_container(&self, name_or_id: &str) -> Result<(), EngineError> {
        let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();

        match self.docker.start_container(name_or_id, Some(options)).await {
            Ok(_) => {
                log::info!("Container {name_or_id} started successfully");
                Ok(())
            }
            Err(e) if is_status(&e, 304) => {
                log::info!("Container {name_or_id} already running");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound(name_or_id.to_string())),
            Err(e) => {
                log::error!("Failed to start container {name_or_id}: {e}");
                Err(EngineError::DockerApi(e))
            }
        }
    }

    async fn stop_container(&self, name_or_id: &str) -> Result<(), EngineError> {
        log::info!("Stopping container: {name_or_id}");

        let options: StopContainerOptions = StopContainerOptionsBuilder::new()
            .t(STOP_TIMEOUT_SECS)
            .build();

        match self
            .docker
            .stop_container(name_or_id, Some(options))
            .await
        {
            Ok(_) => {
                log::info!("Container {name_or_id} stopped successfully");
                Ok(())
            }
            Err(e) if is_status(&e, 304) => {
                log::info!("Container {name_or_id} already stopped");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound(name_or_id.to_string())),
            Err(e) => {
                log::warn!("Failed to stop container {name_or_id}: {e}");
                Err(EngineError::DockerApi(e))
            }
        }
    }

    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<(), EngineError> {
        log::info!("Removing container: {name_or_id}");

        let options: RemoveContainerOptions =
            RemoveContainerOptionsBuilder::new().force(force).build();

        match self
            .docker
            .remove_container(name_or_id, Some(options))
            .await
        {
            Ok(_) => {
                log::info!("Container {name_or_id} removed successfully");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound(name_or_id.to_string())),
            Err(e) => {
                log::error!("Failed to remove container {name_or_id}: {e}");
                Err(EngineError::DockerApi(e))
            }
        }
    }

    async fn remove_image(&self, image: &str) -> Result<(), EngineError> {
        let options: RemoveImageOptions = RemoveImageOptionsBuilder::new().build();
        match self.docker.remove_image(image, Some(options), None).await {
            Ok(_) => {
                log::info!("Image {image} removed");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound(image.to_string())),
            Err(e) => Err(EngineError::DockerApi(e)),
        }
    }

    async fn tag_image(&self, image: &str, reference: &str) -> Result<(), EngineError> {
        let target = ImageRef::parse(reference);
        let options: TagImageOptions = TagImageOptionsBuilder::new()
            .repo(&target.name())
            .tag(target.tag_or_latest())
            .build();
        match self.docker.tag_image(image, Some(options)).await {
            Ok(()) => {
                log::info!("Tagged {image} as {reference}");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound(image.to_string())),
            Err(e) => Err(EngineError::DockerApi(e)),
        }
    }
}
