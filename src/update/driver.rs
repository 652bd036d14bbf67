use std::sync::Arc;

use async_trait::async_trait;

use crate::events::RollbackOutcome;
use crate::ledger::{OperationLedger, OperationStatus, Phase, UpdateOperation};
use crate::model::Container;

use super::context::TriggerContext;
use super::UpdateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Docker,
    Compose,
}

impl AsRef<str> for DriverKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::Docker => "docker",
            Self::Compose => "compose",
        }
    }
}

/// The runtime-mutation steps of an update. The orchestrator owns
/// everything else (security gate, hooks, bookkeeping, telemetry).
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    async fn create_context(&self, container: &Container) -> Result<TriggerContext, UpdateError>;

    async fn pull(&self, ctx: &TriggerContext) -> Result<(), UpdateError>;

    /// Bring up a container running the target image under the original name.
    async fn recreate(&self, ctx: &TriggerContext, run: &mut OperationRun)
    -> Result<(), UpdateError>;

    /// Get rid of the superseded container.
    async fn stop_and_remove(
        &self,
        ctx: &TriggerContext,
        run: &mut OperationRun,
    ) -> Result<(), UpdateError>;

    /// Undo whatever `run` records as done. Best-effort.
    async fn rollback(&self, ctx: &TriggerContext, run: &mut OperationRun) -> RollbackOutcome;
}

/// The in-flight operation and its ledger row.
///
/// The swap must keep going (or roll back) even if the ledger cannot be
/// written, so persistence failures are logged and the in-memory copy stays
/// authoritative for this run.
pub struct OperationRun {
    ledger: Arc<OperationLedger>,
    op: UpdateOperation,
}

impl OperationRun {
    pub fn new(ledger: Arc<OperationLedger>, op: UpdateOperation) -> Self {
        Self { ledger, op }
    }

    pub fn op(&self) -> &UpdateOperation {
        &self.op
    }

    pub async fn record(&mut self, mutate: impl FnOnce(&mut UpdateOperation)) {
        let mut next = self.op.clone();
        mutate(&mut next);
        let stored = next.clone();
        match self.ledger.update(next.id, move |op| *op = stored).await {
            Ok(op) => self.op = op,
            Err(e) => {
                log::warn!(
                    "Failed to persist operation {} for {}: {e}",
                    next.id,
                    next.container_name
                );
                self.op = next;
            }
        }
    }

    pub async fn phase(&mut self, phase: Phase) {
        log::debug!("Operation {} for {}: {phase}", self.op.id, self.op.container_name);
        self.record(|op| op.phase = phase).await;
    }

    pub async fn finish(&mut self, status: OperationStatus, phase: Phase, error: Option<String>) {
        self.record(|op| {
            op.status = status;
            op.phase = phase;
            if error.is_some() {
                op.last_error = error;
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::NewOperation;

    #[tokio::test]
    async fn test_run_records_phases() {
        let ledger = Arc::new(OperationLedger::in_memory());
        let op = ledger
            .insert(NewOperation {
                container_id: "abc".to_string(),
                container_name: "nginx".to_string(),
                trigger_name: "test".to_string(),
                temp_name: "nginx-old".to_string(),
                old_container_was_running: true,
                from_version: "1.24".to_string(),
                to_version: "1.25".to_string(),
                target_image: "nginx:1.25".to_string(),
            })
            .await
            .unwrap();
        let id = op.id;
        let mut run = OperationRun::new(ledger.clone(), op);
        run.phase(Phase::Renamed).await;
        run.record(|op| op.new_container_id = Some("new".to_string()))
            .await;
        run.finish(OperationStatus::Succeeded, Phase::Succeeded, None)
            .await;

        let stored = ledger.get(id).await.unwrap();
        assert_eq!(stored.phase, Phase::Succeeded);
        assert_eq!(stored.status, OperationStatus::Succeeded);
        assert_eq!(stored.new_container_id.as_deref(), Some("new"));
        assert_eq!(&stored, run.op());
    }
}
