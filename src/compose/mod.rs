//! Containers deployed from a compose file.
//!
//! The compose file stays the source of truth: the service's `image:` is
//! edited in place and the compose CLI recreates the container. Everything
//! around the runtime mutation (security gate, hooks, bookkeeping) is the
//! orchestrator's and shared with the plain Docker driver.

mod cli;
mod lock;
mod patch;
mod resolve;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{ComposeConfig, HealthGateConfig};
use crate::credentials::CredentialProvider;
use crate::engine::{ContainerEngine, EngineError};
use crate::events::RollbackOutcome;
use crate::ledger::Phase;
use crate::model::Container;
use crate::store::write_atomic;
use crate::update::{
    ComposeTarget, DriverKind, OperationRun, RuntimeDriver, Step, TriggerContext, UpdateError,
};

pub use self::cli::{CommandOutput, CommandRunner, ComposeCli, ProcessRunner, UpOptions};
#[cfg(test)]
pub use self::cli::testing;
pub use self::lock::{ComposeFileLock, ComposeLockGuard, ComposeLockRegistry, LockOptions};
pub use self::patch::{
    restore_service_image, service_image, set_service_image, ImagePatch, PreviousImage,
};
pub use self::resolve::resolve_service;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("IO error on {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("YAML error in {0:?}: {1}")]
    Yaml(PathBuf, #[source] serde_yaml::Error),
    #[error("No service in {file:?} runs {image}")]
    ServiceNotFound { file: PathBuf, image: String },
    #[error("Cannot edit compose file: {0}")]
    Patch(String),
    #[error("Timed out after {1:?} waiting for {0:?}")]
    LockTimeout(PathBuf, Duration),
    #[error("No compose CLI available ({0})")]
    CliUnavailable(String),
    #[error("`{command}` failed with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
}

pub struct ComposeDriver {
    engine: Arc<dyn ContainerEngine>,
    credentials: Arc<dyn CredentialProvider>,
    cli: ComposeCli,
    locks: Arc<ComposeLockRegistry>,
    lock_options: LockOptions,
    health_gate: HealthGateConfig,
    /// `image:` slots edited by operations still in flight, for rollback.
    replaced: Mutex<HashMap<Uuid, PreviousImage>>,
}

impl ComposeDriver {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        credentials: Arc<dyn CredentialProvider>,
        runner: Arc<dyn CommandRunner>,
        locks: Arc<ComposeLockRegistry>,
        config: &ComposeConfig,
        health_gate: HealthGateConfig,
    ) -> Self {
        Self {
            engine,
            credentials,
            cli: ComposeCli::new(runner),
            locks,
            lock_options: LockOptions::from(config),
            health_gate,
            replaced: Mutex::new(HashMap::new()),
        }
    }

    fn replaced(&self) -> MutexGuard<'_, HashMap<Uuid, PreviousImage>> {
        self.replaced.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn target<'a>(ctx: &'a TriggerContext) -> Result<&'a ComposeTarget, UpdateError> {
        ctx.compose
            .as_ref()
            .ok_or_else(|| UpdateError::Context(format!("{} has no compose target", ctx.name())))
    }

    async fn read(file: &Path) -> Result<String, ComposeError> {
        tokio::fs::read_to_string(file)
            .await
            .map_err(|e| ComposeError::Io(file.to_path_buf(), e))
    }

    /// Point the service at `image` and write the file if that changed it.
    async fn patch_file(target: &ComposeTarget, image: &str) -> Result<ImagePatch, ComposeError> {
        let text = Self::read(&target.file).await?;
        let patch = set_service_image(&text, &target.service, image)?;
        Self::write_patch(target, &patch).await?;
        if patch.changed {
            log::info!(
                "Set image of service {} in {:?} to {image}",
                target.service,
                target.file
            );
        }
        Ok(patch)
    }

    async fn write_patch(target: &ComposeTarget, patch: &ImagePatch) -> Result<(), ComposeError> {
        if patch.changed {
            write_atomic(&target.file, patch.text.as_bytes())
                .await
                .map_err(|e| ComposeError::Io(target.file.clone(), e))?;
        }
        Ok(())
    }

    /// `compose pull` of the service as it will be after the update. When
    /// the file names another reference the pull runs against a hidden
    /// sibling copy, so the real file stays untouched until `recreate`.
    async fn pull_service(&self, target: &ComposeTarget, image: &str) -> Result<(), ComposeError> {
        let text = Self::read(&target.file).await?;
        let patch = set_service_image(&text, &target.service, image)?;
        if !patch.changed {
            self.cli.pull(&target.file, &target.service).await?;
            return Ok(());
        }

        let file_name = target
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staged = target
            .file
            .with_file_name(format!(".{file_name}.{}.pull", Uuid::now_v7()));
        write_atomic(&staged, patch.text.as_bytes())
            .await
            .map_err(|e| ComposeError::Io(staged.clone(), e))?;
        let pulled = self.cli.pull(&staged, &target.service).await;
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            log::warn!("Failed to remove {staged:?}: {e}");
        }
        pulled.map(|_| ())
    }

    /// Point the unchanged reference back at the image the container ran,
    /// so re-applying the file brings that image back.
    async fn pin_previous_image(&self, ctx: &TriggerContext) -> bool {
        let name = ctx.name();
        let Some(image_id) = ctx.current.image_id.as_deref() else {
            log::warn!("Rollback of {name}: previous image id unknown");
            return false;
        };
        match self.engine.tag_image(image_id, ctx.current_image()).await {
            Ok(()) => {
                log::info!("Rollback of {name}: pinned {} to {image_id}", ctx.current_image());
                true
            }
            Err(e) => {
                log::warn!("Rollback of {name}: cannot pin {} to {image_id}: {e}", ctx.current_image());
                false
            }
        }
    }
}

#[async_trait]
impl RuntimeDriver for ComposeDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Compose
    }

    async fn create_context(&self, container: &Container) -> Result<TriggerContext, UpdateError> {
        let mut ctx =
            TriggerContext::build(self.engine.as_ref(), self.credentials.as_ref(), container)
                .await?;
        let file = container
            .compose_file()
            .map(PathBuf::from)
            .ok_or_else(|| UpdateError::Context(format!("{} has no compose file", container.name)))?;
        let text = Self::read(&file).await?;
        let service =
            resolve_service(&text, &file, container.compose_service(), &container.image)?;
        log::debug!("{} is service {service} of {file:?}", container.name);
        ctx.compose = Some(ComposeTarget { file, service });
        Ok(ctx)
    }

    async fn pull(&self, ctx: &TriggerContext) -> Result<(), UpdateError> {
        let target = Self::target(ctx)?;
        log::info!("Pulling {} for service {}", ctx.target_image, target.service);
        self.pull_service(target, &ctx.target_image)
            .await
            .map_err(|e| UpdateError::Pull {
                image: ctx.target_image.clone(),
                source: EngineError::Other(e.to_string()),
            })
    }

    async fn recreate(
        &self,
        ctx: &TriggerContext,
        run: &mut OperationRun,
    ) -> Result<(), UpdateError> {
        let target = Self::target(ctx)?;
        {
            let _guard = self.locks.acquire(&target.file, &self.lock_options).await?;
            let patch = Self::patch_file(target, &ctx.target_image).await?;
            if patch.changed {
                self.replaced().insert(run.op().id, patch.previous);
                run.phase(Phase::ComposeFileUpdated).await;
            }
            // From here on compose may already have replaced the container.
            run.record(|op| op.old_container_stopped = ctx.was_running())
                .await;
            self.cli
                .up(
                    &target.file,
                    &target.service,
                    UpOptions {
                        start: ctx.was_running(),
                        // Same reference, new digest: compose would see no change.
                        force_recreate: !patch.changed,
                    },
                )
                .await?;
        }

        let recreated = self
            .engine
            .inspect_container(ctx.name())
            .await
            .map_err(UpdateError::step(Step::Create))?
            .ok_or_else(|| UpdateError::Step {
                step: Step::Create,
                source: EngineError::NotFound(ctx.name().to_string()),
            })?;
        let phase = if ctx.was_running() {
            Phase::NewStarted
        } else {
            Phase::NewCreated
        };
        run.record(|op| {
            op.new_container_id = Some(recreated.id.clone());
            op.phase = phase;
        })
        .await;

        if ctx.was_running() && ctx.current.spec.has_healthcheck() {
            run.phase(Phase::HealthGate).await;
            crate::update::health::wait_healthy(
                self.engine.as_ref(),
                &recreated.id,
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
        // `up` already replaced the container.
        self.replaced().remove(&run.op().id);
        log::debug!("Nothing left to remove for {}", ctx.name());
        Ok(())
    }

    async fn rollback(&self, ctx: &TriggerContext, run: &mut OperationRun) -> RollbackOutcome {
        let name = ctx.name();
        let previous = self.replaced().remove(&run.op().id);
        if previous.is_none() && !run.op().old_container_stopped && run.op().new_container_id.is_none()
        {
            log::info!("Rollback of {name}: nothing was changed");
            return RollbackOutcome::Success;
        }
        let Some(target) = ctx.compose.as_ref() else {
            return RollbackOutcome::Error;
        };

        let guard = match self.locks.acquire(&target.file, &self.lock_options).await {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("Rollback of {name}: {e}");
                return RollbackOutcome::Error;
            }
        };
        let restored = match &previous {
            Some(previous) => {
                let restored = async {
                    let text = Self::read(&target.file).await?;
                    let patch = restore_service_image(&text, &target.service, previous)?;
                    Self::write_patch(target, &patch).await
                }
                .await;
                if let Err(e) = restored {
                    log::warn!("Rollback of {name}: failed to restore {:?}: {e}", target.file);
                    return RollbackOutcome::Error;
                }
                log::info!("Rollback of {name}: restored service {} in {:?}", target.service, target.file);
                true
            }
            // Same reference as before: it now resolves to the new image.
            None => self.pin_previous_image(ctx).await,
        };

        if restored {
            match self.engine.inspect_image(ctx.current_image()).await {
                Ok(Some(_)) => {}
                _ => {
                    if let Err(e) = self.cli.pull(&target.file, &target.service).await {
                        log::warn!("Rollback of {name}: failed to pull previous image: {e}");
                    }
                }
            }
        }

        let outcome = match self
            .cli
            .up(
                &target.file,
                &target.service,
                UpOptions {
                    start: ctx.was_running(),
                    force_recreate: true,
                },
            )
            .await
        {
            Ok(_) if restored => {
                log::info!("Rollback of {name}: service {} re-applied", target.service);
                RollbackOutcome::Success
            }
            Ok(_) => {
                log::warn!("Rollback of {name}: service {} re-applied on the new image", target.service);
                RollbackOutcome::Error
            }
            Err(e) => {
                log::warn!("Rollback of {name}: failed to re-apply service {}: {e}", target.service);
                RollbackOutcome::Error
            }
        };
        drop(guard);
        outcome
    }
}
