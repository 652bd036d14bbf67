//! The update lifecycle.
//!
//! [`Updater`] owns everything around the runtime mutation: reconciling a
//! previous crash, the security gate, hooks, backups, the operation ledger,
//! rollback telemetry, pruning and the post-update watchdog. The mutation
//! itself is delegated to a [`RuntimeDriver`], the plain Docker rename-swap
//! or the compose variant.

mod context;
mod driver;
mod error;
pub mod health;
mod prune;
pub mod recovery;
pub mod self_update;
mod swap;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::backup::{BackupRecord, BackupStore};
use crate::compose::{CommandRunner, ComposeDriver, ComposeLockRegistry};
use crate::config::DecantConfig;
use crate::credentials::CredentialProvider;
use crate::engine::ContainerEngine;
use crate::events::{self, EventSink, RollbackOutcome, RollbackTelemetry};
use crate::hooks::{HookOptions, HookRunner};
use crate::ledger::{NewOperation, OperationLedger, OperationStatus, Phase, UpdateOperation};
use crate::model::{Container, HookConfig, ImageRef, UpdateKind};
use crate::origin::OriginStore;
use crate::security::{self, SecurityGate};
use crate::watchdog::{HealthMonitorTask, RollbackExecutor, WatchdogRegistry};

pub use self::context::{ComposeTarget, TriggerContext};
pub use self::driver::{DriverKind, OperationRun, RuntimeDriver};
pub use self::error::{Step, UpdateError};
pub use self::recovery::Recovery;
pub use self::self_update::{HelperContract, SelfIdentity};
pub use self::swap::DockerDriver;

/// Collaborators of the orchestrator.
pub struct Dependencies {
    pub engine: Arc<dyn ContainerEngine>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub ledger: Arc<OperationLedger>,
    pub backups: Arc<dyn BackupStore>,
    pub origins: Arc<OriginStore>,
    pub security: Arc<dyn SecurityGate>,
    pub hooks: Arc<dyn HookRunner>,
    pub events: Arc<dyn EventSink>,
    pub compose_runner: Arc<dyn CommandRunner>,
    pub compose_locks: Arc<ComposeLockRegistry>,
}

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Applied(UpdateOperation),
    /// Self-update: the helper finishes the swap after this process is gone.
    HandedOff(UpdateOperation),
}

impl UpdateOutcome {
    pub fn operation(&self) -> &UpdateOperation {
        match self {
            Self::Applied(op) | Self::HandedOff(op) => op,
        }
    }
}

struct Failure {
    error: UpdateError,
    operation_id: Option<Uuid>,
    rollback: Option<RollbackOutcome>,
}

impl From<UpdateError> for Failure {
    fn from(error: UpdateError) -> Self {
        Self {
            error,
            operation_id: None,
            rollback: None,
        }
    }
}

/// What `prepare` set up before the first destructive step.
struct Prepared {
    run: OperationRun,
    backup: Option<BackupRecord>,
    /// Backup records that fell out of retention.
    aged_out: Vec<BackupRecord>,
}

struct Inner {
    engine: Arc<dyn ContainerEngine>,
    ledger: Arc<OperationLedger>,
    backups: Arc<dyn BackupStore>,
    security: Arc<dyn SecurityGate>,
    hooks: Arc<dyn HookRunner>,
    events: Arc<dyn EventSink>,
    telemetry: RollbackTelemetry,
    watchdogs: WatchdogRegistry,
    docker: DockerDriver,
    compose: Option<ComposeDriver>,
    config: DecantConfig,
    identity: Option<SelfIdentity>,
}

#[derive(Clone)]
pub struct Updater {
    inner: Arc<Inner>,
}

impl Updater {
    pub fn new(deps: Dependencies, config: DecantConfig, identity: Option<SelfIdentity>) -> Self {
        let docker = DockerDriver::new(
            deps.engine.clone(),
            deps.credentials.clone(),
            deps.origins,
            config.health_gate.clone(),
        );
        let compose = config.compose.enabled.then(|| {
            ComposeDriver::new(
                deps.engine.clone(),
                deps.credentials,
                deps.compose_runner,
                deps.compose_locks,
                &config.compose,
                config.health_gate.clone(),
            )
        });
        Self {
            inner: Arc::new(Inner {
                engine: deps.engine,
                ledger: deps.ledger,
                backups: deps.backups,
                security: deps.security,
                hooks: deps.hooks,
                events: deps.events,
                telemetry: RollbackTelemetry::new(),
                watchdogs: WatchdogRegistry::new(),
                docker,
                compose,
                config,
                identity,
            }),
        }
    }

    pub fn telemetry(&self) -> &RollbackTelemetry {
        &self.inner.telemetry
    }

    pub fn watchdogs(&self) -> &WatchdogRegistry {
        &self.inner.watchdogs
    }

    pub fn ledger(&self) -> &OperationLedger {
        &self.inner.ledger
    }

    fn driver_for(&self, container: &Container) -> &dyn RuntimeDriver {
        match &self.inner.compose {
            Some(compose) if container.compose_file().is_some() => compose,
            _ => &self.inner.docker,
        }
    }

    /// A self-update helper started recently, still exists and may still be
    /// swapping.
    async fn helper_owns(&self, op: &UpdateOperation) -> bool {
        if op.phase != Phase::HelperStarted {
            return false;
        }
        let config = &self.inner.config.self_update;
        let budget = chrono::Duration::seconds(
            (config.start_timeout_secs + config.health_timeout_secs + 30) as i64,
        );
        if Utc::now() - op.updated_at >= budget {
            return false;
        }
        let helper = self_update::helper_name(op.id);
        match self.inner.engine.inspect_container(&helper).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                log::warn!("Cannot inspect helper {helper}, assuming it is still running: {e}");
                true
            }
        }
    }

    /// Settle every operation a previous process left `in-progress`.
    /// Failures are logged and reported, never raised.
    pub async fn reconcile_all(&self) -> Vec<(UpdateOperation, Result<Recovery, UpdateError>)> {
        let mut results = Vec::new();
        for op in self.inner.ledger.list_in_progress().await {
            if self.helper_owns(&op).await {
                log::info!(
                    "Operation {} for {} belongs to a running self-update helper",
                    op.id,
                    op.container_name
                );
                continue;
            }
            let result = recovery::reconcile_operation(
                self.inner.engine.as_ref(),
                &self.inner.ledger,
                &self.inner.telemetry,
                self.inner.events.as_ref(),
                &op,
            )
            .await;
            if let Err(e) = &result {
                log::error!(
                    "Cannot reconcile operation {} for {}: {e}",
                    op.id,
                    op.container_name
                );
            }
            results.push((op, result));
        }
        results
    }

    /// Run the full update lifecycle for `container`.
    pub async fn update(&self, container: &Container) -> Result<UpdateOutcome, UpdateError> {
        self.inner.watchdogs.disarm(&container.name);
        match self.run_lifecycle(container).await {
            Ok(outcome) => Ok(outcome),
            Err(Failure {
                error,
                operation_id,
                rollback,
            }) => {
                log::error!("Update of {} failed: {error}", container.name);
                self.inner
                    .telemetry
                    .record(
                        self.inner.events.as_ref(),
                        &container.name,
                        rollback.unwrap_or(RollbackOutcome::Info),
                        error.reason(),
                    )
                    .await;
                self.inner
                    .events
                    .emit(events::failed(
                        operation_id,
                        &container.name,
                        &container.target_image().reference(),
                        &error.to_string(),
                        rollback,
                        &self.inner.config.trigger_name,
                    ))
                    .await;
                Err(error)
            }
        }
    }

    async fn run_lifecycle(&self, container: &Container) -> Result<UpdateOutcome, Failure> {
        if let Some(op) = self.inner.ledger.in_progress_for(&container.name).await {
            if self.helper_owns(&op).await {
                return Err(UpdateError::Context(format!(
                    "a self-update helper is still finishing operation {}",
                    op.id
                ))
                .into());
            }
            let recovery = recovery::reconcile_operation(
                self.inner.engine.as_ref(),
                &self.inner.ledger,
                &self.inner.telemetry,
                self.inner.events.as_ref(),
                &op,
            )
            .await
            .map_err(|e| {
                UpdateError::Context(format!(
                    "interrupted operation {} cannot be reconciled: {e}",
                    op.id
                ))
            })?;
            log::info!(
                "Interrupted operation {} for {} reconciled: {recovery:?}",
                op.id,
                container.name
            );
        }

        let driver = self.driver_for(container);
        log::debug!("Updating {} with the {} driver", container.name, driver.kind().as_ref());
        let ctx = driver.create_context(container).await?;

        security::evaluate(
            self.inner.security.as_ref(),
            &self.inner.config.security,
            self.inner.events.as_ref(),
            ctx.name(),
            &ctx.target_image,
            ctx.credentials.as_ref(),
        )
        .await
        .map_err(|refusal| UpdateError::SecurityBlocked {
            image: ctx.target_image.clone(),
            reason: refusal.0,
        })?;

        let hooks = container.hook_config();
        if let Some(pre) = &hooks.pre {
            if let Err(e) = self.run_hook("pre", pre, &hooks, &ctx).await {
                if hooks.pre_abort {
                    return Err(UpdateError::PreHook(e).into());
                }
                log::warn!("Pre-update hook of {} failed, continuing: {e}", ctx.name());
            }
        }

        let is_self = self
            .inner
            .identity
            .as_ref()
            .is_some_and(|identity| identity.matches(&ctx.current));
        if is_self {
            return self.self_update(&ctx).await;
        }

        driver.pull(&ctx).await?;
        let Prepared {
            mut run,
            backup,
            aged_out,
        } = self
            .prepare(&ctx, container.from_version(), container.to_version(), true)
            .await?;

        if let Err(error) = self.swap(driver, &ctx, &mut run).await {
            return Err(self.fail_swap(driver, &ctx, &mut run, error).await);
        }
        run.finish(OperationStatus::Succeeded, Phase::Succeeded, None)
            .await;
        log::info!(
            "Updated {} from {} to {}",
            ctx.name(),
            ctx.current_image(),
            ctx.target_image
        );

        if let Some(post) = &hooks.post {
            if let Err(e) = self.run_hook("post", post, &hooks, &ctx).await {
                log::warn!("Post-update hook of {} failed: {e}", ctx.name());
            }
        }

        if self.inner.config.prune.images {
            prune::prune_images(
                self.inner.engine.as_ref(),
                self.inner.backups.as_ref(),
                ctx.name(),
                ctx.current_image(),
                &ctx.target_image,
                &aged_out,
            )
            .await;
        }

        let rollback = container.rollback_config();
        if rollback.auto {
            match (&backup, ctx.current.spec.has_healthcheck()) {
                (Some(backup), true) => {
                    let executor: Arc<dyn RollbackExecutor> = Arc::new(self.clone());
                    self.inner.watchdogs.arm(
                        HealthMonitorTask {
                            container_id: run.op().new_container_id.clone().unwrap_or_default(),
                            container_name: ctx.name().to_string(),
                            backup_image: backup.image_reference(),
                            window: rollback.window,
                            interval: rollback.interval,
                            trigger_name: self.inner.config.trigger_name.clone(),
                        },
                        self.inner.engine.clone(),
                        executor,
                    );
                }
                (_, false) => log::warn!(
                    "Auto-rollback requested for {} but it has no health check",
                    ctx.name()
                ),
                (None, true) => {}
            }
        }

        self.inner
            .events
            .emit(events::applied(
                Some(run.op().id),
                ctx.name(),
                ctx.current_image(),
                &ctx.target_image,
                &run.op().from_version,
                &run.op().to_version,
                &self.inner.config.trigger_name,
            ))
            .await;
        Ok(UpdateOutcome::Applied(run.op().clone()))
    }

    async fn self_update(&self, ctx: &TriggerContext) -> Result<UpdateOutcome, Failure> {
        let config = &self.inner.config.self_update;
        log::warn!("{} is this process, updating through a helper", ctx.name());
        events::announce_self_update(
            self.inner.events.as_ref(),
            ctx.name(),
            &ctx.target_image,
            config.ack_timeout(),
        )
        .await;

        let docker = &self.inner.docker;
        docker.pull(ctx).await?;
        let Prepared { mut run, .. } = self
            .prepare(
                ctx,
                ctx.container.from_version(),
                ctx.container.to_version(),
                true,
            )
            .await?;
        match self_update::hand_off(docker, self.inner.engine.as_ref(), config, ctx, &mut run).await
        {
            Ok(helper_id) => {
                log::info!("Helper {helper_id} owns operation {}", run.op().id);
                Ok(UpdateOutcome::HandedOff(run.op().clone()))
            }
            Err(error) => Err(self.fail_swap(docker, ctx, &mut run, error).await),
        }
    }

    /// Record a backup of the current image and open the operation.
    async fn prepare(
        &self,
        ctx: &TriggerContext,
        from_version: String,
        to_version: String,
        backup: bool,
    ) -> Result<Prepared, UpdateError> {
        let trigger_name = &self.inner.config.trigger_name;
        let mut aged_out = Vec::new();
        let backup = if backup {
            let current = ImageRef::parse(ctx.current_image());
            let digest = current.digest.clone().or_else(|| match &ctx.container.update_kind {
                UpdateKind::Digest { local, .. } => local.clone(),
                _ => None,
            });
            let record = BackupRecord {
                container_id: ctx.current.id.clone(),
                container_name: ctx.name().to_string(),
                image_name: current.name(),
                image_tag: current.tag_or_latest().to_string(),
                image_digest: digest,
                timestamp: Utc::now(),
                trigger_name: trigger_name.clone(),
            };
            self.inner.backups.insert(record.clone()).await?;
            match self
                .inner
                .backups
                .prune_oldest(ctx.name(), self.inner.config.backups.keep)
                .await
            {
                Ok(removed) => aged_out = removed,
                Err(e) => log::warn!("Failed to prune backups of {}: {e}", ctx.name()),
            }
            Some(record)
        } else {
            None
        };

        let suffix = Uuid::now_v7().simple().to_string();
        let op = self
            .inner
            .ledger
            .insert(NewOperation {
                container_id: ctx.current.id.clone(),
                container_name: ctx.name().to_string(),
                trigger_name: trigger_name.clone(),
                temp_name: format!("{}-old-{}", ctx.name(), &suffix[suffix.len() - 12..]),
                old_container_was_running: ctx.was_running(),
                from_version,
                to_version,
                target_image: ctx.target_image.clone(),
            })
            .await?;
        log::info!("Operation {} started for {}", op.id, ctx.name());
        Ok(Prepared {
            run: OperationRun::new(self.inner.ledger.clone(), op),
            backup,
            aged_out,
        })
    }

    async fn swap(
        &self,
        driver: &dyn RuntimeDriver,
        ctx: &TriggerContext,
        run: &mut OperationRun,
    ) -> Result<(), UpdateError> {
        driver.recreate(ctx, run).await?;
        driver.stop_and_remove(ctx, run).await
    }

    /// Roll back a failed swap and close the operation.
    async fn fail_swap(
        &self,
        driver: &dyn RuntimeDriver,
        ctx: &TriggerContext,
        run: &mut OperationRun,
        error: UpdateError,
    ) -> Failure {
        let operation_id = Some(run.op().id);
        if error.is_rename_failure() {
            let phase = run.op().phase;
            run.finish(OperationStatus::Failed, phase, Some(error.to_string()))
                .await;
            return Failure {
                error,
                operation_id,
                rollback: None,
            };
        }

        log::warn!("Update of {} failed, rolling back: {error}", ctx.name());
        let reason = error.reason();
        let message = error.to_string();
        run.record(|op| {
            op.phase = Phase::RollbackStarted;
            op.rollback_reason = Some(reason.to_string());
            op.last_error = Some(message);
        })
        .await;

        let outcome = driver.rollback(ctx, run).await;
        match outcome {
            RollbackOutcome::Success => {
                log::info!("Rolled back {}", ctx.name());
                run.finish(OperationStatus::RolledBack, Phase::RolledBack, None)
                    .await;
            }
            _ => {
                log::error!("Rollback of {} failed, check the host by hand", ctx.name());
                run.finish(OperationStatus::Failed, Phase::RollbackFailed, None)
                    .await;
            }
        }

        let error = if error.looks_runtime_incompatible() {
            UpdateError::RuntimeIncompatible {
                from_image: ctx.current_image().to_string(),
                to_image: ctx.target_image.clone(),
                rollback: outcome,
                source: Box::new(error),
            }
        } else {
            error
        };
        Failure {
            error,
            operation_id,
            rollback: Some(outcome),
        }
    }

    async fn run_hook(
        &self,
        label: &str,
        command: &str,
        hooks: &HookConfig,
        ctx: &TriggerContext,
    ) -> Result<(), String> {
        let options = HookOptions {
            timeout: hooks.timeout,
            env: hook_env(ctx),
            label: label.to_string(),
        };
        match self.inner.hooks.run(command, &options).await {
            Ok(result) if result.succeeded() => Ok(()),
            Ok(result) => Err(result.describe()),
            Err(e) => Err(format!("cannot run hook: {e}")),
        }
    }

    /// Put `image` back on `container_name` through the regular swap.
    async fn restore_image(
        &self,
        container_name: &str,
        image: &str,
        reason: &str,
    ) -> Result<(), UpdateError> {
        let snapshot = self
            .inner
            .engine
            .inspect_container(container_name)
            .await
            .map_err(|e| UpdateError::Context(format!("inspecting {container_name}: {e}")))?
            .ok_or_else(|| {
                UpdateError::Context(format!("container {container_name} does not exist"))
            })?;
        let current = ImageRef::parse(&snapshot.spec.image);
        let target = ImageRef::parse(image);
        let container = Container {
            id: snapshot.id.clone(),
            name: container_name.to_string(),
            image: current.clone(),
            update_kind: UpdateKind::Unknown,
            labels: snapshot.spec.labels.clone(),
            watcher: self.inner.config.trigger_name.clone(),
        };

        let driver = self.driver_for(&container);
        let mut ctx = driver.create_context(&container).await?;
        ctx.target_image = image.to_string();
        let local = matches!(self.inner.engine.inspect_image(image).await, Ok(Some(_)));
        if !local {
            driver.pull(&ctx).await?;
        }

        let Prepared { mut run, .. } = self
            .prepare(
                &ctx,
                current.tag_or_latest().to_string(),
                target.tag_or_latest().to_string(),
                false,
            )
            .await?;
        run.record(|op| op.rollback_reason = Some(reason.to_string()))
            .await;
        if let Err(error) = self.swap(driver, &ctx, &mut run).await {
            return Err(self.fail_swap(driver, &ctx, &mut run, error).await.error);
        }
        run.finish(OperationStatus::Succeeded, Phase::Succeeded, None)
            .await;
        log::info!("Restored {container_name} to {image}");
        self.inner
            .events
            .emit(events::applied(
                Some(run.op().id),
                container_name,
                &snapshot.spec.image,
                image,
                &run.op().from_version,
                &run.op().to_version,
                &self.inner.config.trigger_name,
            ))
            .await;
        Ok(())
    }
}

#[async_trait]
impl RollbackExecutor for Updater {
    async fn rollback_to(
        &self,
        container_name: &str,
        image: &str,
        reason: &str,
    ) -> Result<(), UpdateError> {
        let result = self.restore_image(container_name, image, reason).await;
        let outcome = match &result {
            Ok(()) => RollbackOutcome::Success,
            Err(_) => RollbackOutcome::Error,
        };
        self.inner
            .telemetry
            .record(self.inner.events.as_ref(), container_name, outcome, reason)
            .await;
        result
    }
}

fn hook_env(ctx: &TriggerContext) -> HashMap<String, String> {
    [
        ("DECANT_CONTAINER_NAME", ctx.name()),
        ("DECANT_CONTAINER_ID", ctx.current.id.as_str()),
        ("DECANT_IMAGE_FROM", ctx.current_image()),
        ("DECANT_IMAGE_TO", ctx.target_image.as_str()),
        ("DECANT_UPDATE_KIND", ctx.container.update_kind.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
