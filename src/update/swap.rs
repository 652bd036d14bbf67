//! The rename-swap state machine, run directly against the daemon.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::HealthGateConfig;
use crate::credentials::CredentialProvider;
use crate::engine::{ContainerEngine, ContainerSpec, ImageDefaults};
use crate::events::RollbackOutcome;
use crate::ledger::Phase;
use crate::model::Container;
use crate::origin::{self, OriginStore, RuntimeOrigin, RuntimeOrigins};

use super::context::TriggerContext;
use super::driver::{DriverKind, OperationRun, RuntimeDriver};
use super::error::Step;
use super::health;
use super::UpdateError;

/// Bound on waiting for an auto-remove container to disappear.
const AUTO_REMOVE_WAIT: Duration = Duration::from_secs(10);
const AUTO_REMOVE_POLL: Duration = Duration::from_millis(250);

pub struct DockerDriver {
    engine: Arc<dyn ContainerEngine>,
    credentials: Arc<dyn CredentialProvider>,
    origins: Arc<OriginStore>,
    health_gate: HealthGateConfig,
}

impl DockerDriver {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        credentials: Arc<dyn CredentialProvider>,
        origins: Arc<OriginStore>,
        health_gate: HealthGateConfig,
    ) -> Self {
        Self {
            engine,
            credentials,
            origins,
            health_gate,
        }
    }

    /// Runtime defaults of `image`, or `None` when it cannot be inspected.
    async fn image_defaults(&self, image: &str, container: &str) -> Option<ImageDefaults> {
        match self.engine.inspect_image(image).await {
            Ok(defaults) => defaults,
            Err(e) => {
                log::warn!("Cannot inspect image {image} of {container}: {e}");
                None
            }
        }
    }

    /// The current spec moved onto `target_image`, with inherited runtime
    /// fields dropped so the new image's defaults apply. Also returns the
    /// origins to remember for the new container.
    pub async fn clone_spec(
        &self,
        ctx: &TriggerContext,
        target_image: &str,
    ) -> (ContainerSpec, RuntimeOrigins) {
        let mut spec = ctx.current.spec.clone();
        spec.image = target_image.to_string();

        let old_image = ctx.current.image_id.as_deref().unwrap_or(ctx.current_image());
        let Some(old_defaults) = self.image_defaults(old_image, ctx.name()).await else {
            log::warn!(
                "Image of {} is gone, keeping its Entrypoint/Cmd as they are",
                ctx.name()
            );
            return (spec, RuntimeOrigins::default());
        };

        let recorded = self.origins.get(ctx.name()).await;
        let entrypoint =
            origin::reconcile_field(&spec.entrypoint, recorded.entrypoint, &old_defaults.entrypoint);
        let cmd = origin::reconcile_field(&spec.cmd, recorded.cmd, &old_defaults.cmd);
        if entrypoint.origin == RuntimeOrigin::Inherited && spec.entrypoint.is_some() {
            log::info!("Dropping inherited Entrypoint of {}", ctx.name());
        }
        if cmd.origin == RuntimeOrigin::Inherited && spec.cmd.is_some() {
            log::info!("Dropping inherited Cmd of {}", ctx.name());
        }

        let origins = match self.image_defaults(target_image, ctx.name()).await {
            Some(new_defaults) => RuntimeOrigins {
                entrypoint: origin::settle(&entrypoint, &new_defaults.entrypoint),
                cmd: origin::settle(&cmd, &new_defaults.cmd),
            },
            None => RuntimeOrigins {
                entrypoint: entrypoint.origin,
                cmd: cmd.origin,
            },
        };
        spec.entrypoint = entrypoint.value;
        spec.cmd = cmd.value;
        (spec, origins)
    }

    /// Create the new container under the original name. Shared with the
    /// self-update path, which must not start it.
    pub async fn create_new(
        &self,
        ctx: &TriggerContext,
        run: &mut OperationRun,
    ) -> Result<String, UpdateError> {
        let (spec, origins) = self.clone_spec(ctx, &ctx.target_image).await;
        log::info!("Creating {} from {}", ctx.name(), ctx.target_image);
        let new_id = self
            .engine
            .create_container(ctx.name(), &spec)
            .await
            .map_err(UpdateError::step(Step::Create))?;
        run.record(|op| {
            op.phase = Phase::NewCreated;
            op.new_container_id = Some(new_id.clone());
        })
        .await;
        if let Err(e) = self.origins.set(ctx.name(), origins).await {
            log::warn!("Failed to record runtime origins for {}: {e}", ctx.name());
        }
        Ok(new_id)
    }

    pub async fn rename_current(
        &self,
        ctx: &TriggerContext,
        run: &mut OperationRun,
    ) -> Result<(), UpdateError> {
        let temp_name = run.op().temp_name.clone();
        log::info!("Renaming {} to {temp_name}", ctx.name());
        self.engine
            .rename_container(&ctx.current.id, &temp_name)
            .await
            .map_err(UpdateError::step(Step::Rename))?;
        run.phase(Phase::Renamed).await;
        Ok(())
    }

    /// A container other than the original holding the original name. The
    /// rename freed the name, so it can only be one we created but never
    /// recorded.
    async fn unrecorded_new(&self, ctx: &TriggerContext) -> Option<String> {
        match self.engine.inspect_container(ctx.name()).await {
            Ok(Some(snapshot)) if snapshot.id != ctx.current.id => {
                log::warn!(
                    "Rollback of {}: found unrecorded container {}",
                    ctx.name(),
                    snapshot.id
                );
                Some(snapshot.id)
            }
            Ok(_) => None,
            Err(e) => {
                log::warn!("Rollback of {}: cannot inspect {}: {e}", ctx.name(), ctx.name());
                None
            }
        }
    }

    async fn wait_removed(&self, name_or_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + AUTO_REMOVE_WAIT;
        while tokio::time::Instant::now() < deadline {
            match self.engine.inspect_container(name_or_id).await {
                Ok(None) => return true,
                Ok(Some(_)) => {}
                Err(e) => log::debug!("Inspecting {name_or_id} while waiting for removal: {e}"),
            }
            tokio::time::sleep(AUTO_REMOVE_POLL).await;
        }
        false
    }
}

#[async_trait]
impl RuntimeDriver for DockerDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Docker
    }

    async fn create_context(&self, container: &Container) -> Result<TriggerContext, UpdateError> {
        TriggerContext::build(self.engine.as_ref(), self.credentials.as_ref(), container).await
    }

    async fn pull(&self, ctx: &TriggerContext) -> Result<(), UpdateError> {
        ctx.pull(self.engine.as_ref()).await
    }

    async fn recreate(
        &self,
        ctx: &TriggerContext,
        run: &mut OperationRun,
    ) -> Result<(), UpdateError> {
        self.rename_current(ctx, run).await?;
        let new_id = self.create_new(ctx, run).await?;

        if !ctx.was_running() {
            log::info!("{} was not running, leaving the new container stopped", ctx.name());
            return Ok(());
        }

        let temp_name = run.op().temp_name.clone();
        log::info!("Stopping old container {temp_name}");
        // Stopping may have half-happened when it fails, so rollback must
        // always try to restart.
        run.record(|op| op.old_container_stopped = true).await;
        self.engine
            .stop_container(&temp_name)
            .await
            .map_err(UpdateError::step(Step::StopOld))?;
        run.phase(Phase::OldStopped).await;

        log::info!("Starting new container {} ({new_id})", ctx.name());
        self.engine
            .start_container(&new_id)
            .await
            .map_err(UpdateError::step(Step::StartNew))?;
        run.phase(Phase::NewStarted).await;

        if ctx.current.spec.has_healthcheck() {
            run.phase(Phase::HealthGate).await;
            health::wait_healthy(
                self.engine.as_ref(),
                &new_id,
                self.health_gate.interval(),
                self.health_gate.timeout(),
            )
            .await
            .map_err(|source| UpdateError::HealthGate {
                container: ctx.name().to_string(),
                source,
            })?;
            run.phase(Phase::HealthGatePassed).await;
        }
        Ok(())
    }

    async fn stop_and_remove(
        &self,
        ctx: &TriggerContext,
        run: &mut OperationRun,
    ) -> Result<(), UpdateError> {
        let temp_name = run.op().temp_name.clone();
        if ctx.current.spec.auto_remove() && run.op().old_container_stopped {
            if self.wait_removed(&temp_name).await {
                log::info!("Old container {temp_name} removed itself");
                return Ok(());
            }
            log::warn!("Old container {temp_name} did not remove itself, removing it");
        }

        log::info!("Removing old container {temp_name}");
        match self.engine.remove_container(&temp_name, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                log::info!("Old container {temp_name} already gone");
                Ok(())
            }
            Err(e) => Err(UpdateError::Step {
                step: Step::CleanupOld,
                source: e,
            }),
        }
    }

    async fn rollback(&self, ctx: &TriggerContext, run: &mut OperationRun) -> RollbackOutcome {
        let name = ctx.name();
        let temp_name = run.op().temp_name.clone();
        let mut outcome = RollbackOutcome::Success;

        let new_id = match run.op().new_container_id.clone() {
            Some(id) => Some(id),
            None => self.unrecorded_new(ctx).await,
        };
        if let Some(new_id) = new_id {
            if let Err(e) = self.engine.stop_container(&new_id).await {
                if !e.is_not_found() {
                    log::warn!("Rollback of {name}: failed to stop new container {new_id}: {e}");
                }
            }
            match self.engine.remove_container(&new_id, true).await {
                Ok(()) => log::info!("Rollback of {name}: removed new container {new_id}"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    log::warn!("Rollback of {name}: failed to remove new container {new_id}: {e}");
                    outcome = RollbackOutcome::Error;
                }
            }
        }

        match self.engine.rename_container(&temp_name, name).await {
            Ok(()) => log::info!("Rollback of {name}: renamed {temp_name} back"),
            Err(e) => {
                log::warn!("Rollback of {name}: failed to rename {temp_name} back: {e}");
                return RollbackOutcome::Error;
            }
        }

        if ctx.was_running() && run.op().old_container_stopped {
            match self.engine.start_container(name).await {
                Ok(()) => log::info!("Rollback of {name}: restarted old container"),
                Err(e) => {
                    log::warn!("Rollback of {name}: failed to restart old container: {e}");
                    outcome = RollbackOutcome::Error;
                }
            }
        }
        outcome
    }
}
