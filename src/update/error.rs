use std::fmt;

use crate::compose::ComposeError;
use crate::engine::EngineError;
use crate::events::RollbackOutcome;
use crate::store::StoreError;

use super::health::HealthGateError;

/// The destructive steps of a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Rename,
    Create,
    StopOld,
    StartNew,
    CleanupOld,
}

impl Step {
    /// Telemetry reason when this step fails.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Rename => "rename_failed",
            Self::Create => "create_failed",
            Self::StopOld => "stop_failed",
            Self::StartNew => "start_failed",
            Self::CleanupOld => "cleanup_failed",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Rename => "renaming the current container",
            Self::Create => "creating the new container",
            Self::StopOld => "stopping the old container",
            Self::StartNew => "starting the new container",
            Self::CleanupOld => "removing the old container",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("Security gate refused {image}: {reason}")]
    SecurityBlocked { image: String, reason: String },
    #[error("Failed to pull {image}: {source}")]
    Pull {
        image: String,
        #[source]
        source: EngineError,
    },
    #[error("Pre-update hook failed: {0}")]
    PreHook(String),
    #[error("Failed {step}: {source}")]
    Step {
        step: Step,
        #[source]
        source: EngineError,
    },
    #[error("Health gate failed for {container}: {source}")]
    HealthGate {
        container: String,
        #[source]
        source: HealthGateError,
    },
    #[error(
        "The new image {to_image} could not run with the configuration carried over from \
         {from_image} (rollback: {rollback}). Check that the container's Entrypoint/Cmd still \
         exist in the new image: {source}"
    )]
    RuntimeIncompatible {
        from_image: String,
        to_image: String,
        rollback: RollbackOutcome,
        #[source]
        source: Box<UpdateError>,
    },
    #[error("Self-update failed: {0}")]
    SelfUpdate(String),
    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),
    #[error("State store error: {0}")]
    Store(#[from] StoreError),
    #[error("Cannot prepare update: {0}")]
    Context(String),
}

impl UpdateError {
    pub fn step(step: Step) -> impl FnOnce(EngineError) -> Self {
        move |source| Self::Step { step, source }
    }

    /// Telemetry reason for this failure.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SecurityBlocked { .. } => "security_blocked",
            Self::Pull { .. } => "pull_failed",
            Self::PreHook(_) => "pre_hook_failed",
            Self::Step { step, .. } => step.reason(),
            Self::HealthGate { source, .. } => source.reason(),
            Self::RuntimeIncompatible { source, .. } => source.reason(),
            Self::SelfUpdate(_) => "self_update_failed",
            Self::Compose(_) => "compose_failed",
            Self::Store(_) => "store_failed",
            Self::Context(_) => "context_failed",
        }
    }

    /// Nothing destructive happened before this failure.
    pub fn is_rename_failure(&self) -> bool {
        matches!(
            self,
            Self::Step {
                step: Step::Rename,
                ..
            }
        )
    }

    /// The daemon's "exec: ... not found / permission denied" family, which
    /// almost always means the Entrypoint or Cmd does not exist in the new
    /// image.
    pub fn looks_runtime_incompatible(&self) -> bool {
        let message = match self {
            Self::Step { source, .. } => source.to_string(),
            Self::HealthGate { source, .. } => source.to_string(),
            _ => return false,
        }
        .to_lowercase();
        message.contains("exec")
            && (message.contains("no such file")
                || message.contains("permission denied")
                || message.contains("executable file not found")
                || message.contains("not found in $path"))
    }
}
