//! Events emitted by the update core and the rollback telemetry counters.
//!
//! The core only emits. Delivery is an ordered channel; whoever owns the
//! receiving end (the default is [`log_events`]) decides what to do with
//! each event.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAppliedEvent {
    pub event_id: Uuid,
    /// Timestamp in microseconds (UTC)
    pub timestamp: i64,
    pub operation_id: Option<Uuid>,
    pub container_name: String,
    pub from_image: String,
    pub to_image: String,
    pub from_version: String,
    pub to_version: String,
    pub trigger_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFailedEvent {
    pub event_id: Uuid,
    /// Timestamp in microseconds (UTC)
    pub timestamp: i64,
    pub operation_id: Option<Uuid>,
    pub container_name: String,
    pub target_image: String,
    pub error: String,
    pub rollback: Option<RollbackOutcome>,
    pub trigger_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlertEvent {
    pub event_id: Uuid,
    /// Timestamp in microseconds (UTC)
    pub timestamp: i64,
    pub container_name: String,
    pub image: String,
    pub critical: u32,
    pub high: u32,
    pub blocked: bool,
}

/// Observers may answer a self-update notice before the process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReply {
    Acknowledged,
    Rejected,
}

#[derive(Debug)]
pub struct SelfUpdateNotice {
    pub event_id: Uuid,
    /// Timestamp in microseconds (UTC)
    pub timestamp: i64,
    pub container_name: String,
    pub target_image: String,
    pub ack_timeout: Duration,
    /// Present when an acknowledgement is requested.
    pub ack: Option<oneshot::Sender<AckReply>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    Success,
    Error,
    Info,
}

impl AsRef<str> for RollbackOutcome {
    fn as_ref(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSignal {
    /// Timestamp in microseconds (UTC)
    pub timestamp: i64,
    pub container_name: String,
    pub outcome: RollbackOutcome,
    pub reason: String,
}

#[derive(Debug)]
pub enum UpdateEvent {
    Applied(Box<UpdateAppliedEvent>),
    Failed(Box<UpdateFailedEvent>),
    SelfUpdateStarting(SelfUpdateNotice),
    SecurityAlert(Box<SecurityAlertEvent>),
    Rollback(RollbackSignal),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: UpdateEvent);
}

pub struct ChannelEventSink {
    tx: mpsc::Sender<UpdateEvent>,
}

impl ChannelEventSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<UpdateEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: UpdateEvent) {
        if let Err(e) = self.tx.send(event).await {
            log::warn!("Event channel closed, dropping event: {:?}", e.0);
        }
    }
}

/// Counters keyed by `(outcome, reason)`, mirrored as events.
pub struct RollbackTelemetry {
    counts: Mutex<BTreeMap<(RollbackOutcome, String), u64>>,
}

impl Default for RollbackTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl RollbackTelemetry {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn record(
        &self,
        sink: &dyn EventSink,
        container_name: &str,
        outcome: RollbackOutcome,
        reason: &str,
    ) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry((outcome, reason.to_string())).or_default() += 1;
        }
        log::info!(
            "Rollback telemetry for {container_name}: outcome={} reason={reason}",
            outcome.as_ref()
        );
        sink.emit(UpdateEvent::Rollback(RollbackSignal {
            timestamp: now_micros(),
            container_name: container_name.to_string(),
            outcome,
            reason: reason.to_string(),
        }))
        .await;
    }

    pub fn count(&self, outcome: RollbackOutcome, reason: &str) -> u64 {
        self.counts
            .lock()
            .ok()
            .and_then(|counts| counts.get(&(outcome, reason.to_string())).copied())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(RollbackOutcome, String, u64)> {
        self.counts
            .lock()
            .map(|counts| {
                counts
                    .iter()
                    .map(|((o, r), n)| (*o, r.clone(), *n))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Result of asking observers about a self-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    Rejected,
    TimedOut,
    NotRequested,
}

/// Announce a self-update and wait, bounded, for an acknowledgement.
///
/// Every outcome lets the update proceed; a timeout counts as an implicit
/// acknowledgement and so does a rejection.
// TODO: a rejection proceeds exactly like an acknowledgement; decide
// whether observers should be able to veto a self-update.
pub async fn announce_self_update(
    sink: &dyn EventSink,
    container_name: &str,
    target_image: &str,
    ack_timeout: Option<Duration>,
) -> AckOutcome {
    let (ack, rx) = match ack_timeout {
        Some(_) => {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        }
        None => (None, None),
    };
    sink.emit(UpdateEvent::SelfUpdateStarting(SelfUpdateNotice {
        event_id: Uuid::now_v7(),
        timestamp: now_micros(),
        container_name: container_name.to_string(),
        target_image: target_image.to_string(),
        ack_timeout: ack_timeout.unwrap_or_default(),
        ack,
    }))
    .await;

    let (Some(rx), Some(timeout)) = (rx, ack_timeout) else {
        return AckOutcome::NotRequested;
    };
    let outcome = match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(AckReply::Acknowledged)) => AckOutcome::Acknowledged,
        Ok(Ok(AckReply::Rejected)) => AckOutcome::Rejected,
        // A dropped sender means nobody is going to answer.
        Ok(Err(_)) | Err(_) => AckOutcome::TimedOut,
    };
    log::info!("Self-update acknowledgement for {container_name}: {outcome:?}, proceeding");
    outcome
}

pub fn applied(
    operation_id: Option<Uuid>,
    container_name: &str,
    from_image: &str,
    to_image: &str,
    from_version: &str,
    to_version: &str,
    trigger_name: &str,
) -> UpdateEvent {
    UpdateEvent::Applied(Box::new(UpdateAppliedEvent {
        event_id: Uuid::now_v7(),
        timestamp: now_micros(),
        operation_id,
        container_name: container_name.to_string(),
        from_image: from_image.to_string(),
        to_image: to_image.to_string(),
        from_version: from_version.to_string(),
        to_version: to_version.to_string(),
        trigger_name: trigger_name.to_string(),
    }))
}

pub fn failed(
    operation_id: Option<Uuid>,
    container_name: &str,
    target_image: &str,
    error: &str,
    rollback: Option<RollbackOutcome>,
    trigger_name: &str,
) -> UpdateEvent {
    UpdateEvent::Failed(Box::new(UpdateFailedEvent {
        event_id: Uuid::now_v7(),
        timestamp: now_micros(),
        operation_id,
        container_name: container_name.to_string(),
        target_image: target_image.to_string(),
        error: error.to_string(),
        rollback,
        trigger_name: trigger_name.to_string(),
    }))
}

pub fn security_alert(
    container_name: &str,
    image: &str,
    critical: u32,
    high: u32,
    blocked: bool,
) -> UpdateEvent {
    UpdateEvent::SecurityAlert(Box::new(SecurityAlertEvent {
        event_id: Uuid::now_v7(),
        timestamp: now_micros(),
        container_name: container_name.to_string(),
        image: image.to_string(),
        critical,
        high,
        blocked,
    }))
}

/// Default consumer: log every event and acknowledge self-update notices,
/// since there is nobody else to ask.
pub async fn log_events(mut rx: mpsc::Receiver<UpdateEvent>) {
    log::debug!("Event logger started");
    while let Some(event) = rx.recv().await {
        match event {
            UpdateEvent::Applied(e) => log::info!(
                "Update applied to {}: {} -> {}",
                e.container_name,
                e.from_image,
                e.to_image
            ),
            UpdateEvent::Failed(e) => log::error!(
                "Update of {} to {} failed (rollback: {:?}): {}",
                e.container_name,
                e.target_image,
                e.rollback,
                e.error
            ),
            UpdateEvent::SelfUpdateStarting(notice) => {
                log::warn!(
                    "Self-update of {} to {} starting, this process will be replaced",
                    notice.container_name,
                    notice.target_image
                );
                if let Some(ack) = notice.ack {
                    let _ = ack.send(AckReply::Acknowledged);
                }
            }
            UpdateEvent::SecurityAlert(e) => log::warn!(
                "Security alert for {} ({}): critical={} high={} blocked={}",
                e.container_name,
                e.image,
                e.critical,
                e.high,
                e.blocked
            ),
            UpdateEvent::Rollback(signal) => log::debug!(
                "Rollback signal for {}: {} ({})",
                signal.container_name,
                signal.outcome.as_ref(),
                signal.reason
            ),
        }
    }
    log::debug!("Event channel closed, event logger stopped");
}
