use std::collections::HashMap;
use std::sync::Arc;

use super::*;
use crate::backup::JsonBackupStore;
use crate::compose::testing::FakeCompose;
use crate::credentials::Anonymous;
use crate::engine::fake::{self, FakeEngine, Op};
use crate::engine::HealthState;
use crate::events::testing::RecordingSink;
use crate::hooks::testing::ScriptedHooks;
use crate::model::{
    LABEL_HOOK_POST, LABEL_HOOK_PRE, LABEL_HOOK_PRE_ABORT, LABEL_ROLLBACK_AUTO,
    LABEL_ROLLBACK_INTERVAL, LABEL_ROLLBACK_WINDOW,
};
use crate::origin::{RuntimeOrigin, RuntimeOrigins};
use crate::security::testing::StaticGate;
use crate::security::{DisabledSecurityGate, ScanStatus, SeveritySummary};
use crate::watchdog::{WatchOutcome, ROLLBACK_REASON};

struct Harness {
    engine: Arc<FakeEngine>,
    ledger: Arc<OperationLedger>,
    backups: Arc<JsonBackupStore>,
    origins: Arc<OriginStore>,
    hooks: Arc<ScriptedHooks>,
    events: Arc<RecordingSink>,
    updater: Updater,
}

fn harness_with(
    config: DecantConfig,
    gate: Arc<dyn SecurityGate>,
    identity: Option<SelfIdentity>,
) -> Harness {
    let engine = Arc::new(FakeEngine::new());
    let ledger = Arc::new(OperationLedger::in_memory());
    let backups = Arc::new(JsonBackupStore::in_memory());
    let origins = Arc::new(OriginStore::in_memory());
    let hooks = Arc::new(ScriptedHooks::default());
    let events = Arc::new(RecordingSink::default());
    let updater = Updater::new(
        Dependencies {
            engine: engine.clone(),
            credentials: Arc::new(Anonymous),
            ledger: ledger.clone(),
            backups: backups.clone(),
            origins: origins.clone(),
            security: gate,
            hooks: hooks.clone(),
            events: events.clone(),
            compose_runner: Arc::new(FakeCompose::new(engine.clone())),
            compose_locks: Arc::new(ComposeLockRegistry::new()),
        },
        config,
        identity,
    );
    Harness {
        engine,
        ledger,
        backups,
        origins,
        hooks,
        events,
        updater,
    }
}

fn harness() -> Harness {
    harness_with(
        DecantConfig::default(),
        Arc::new(DisabledSecurityGate),
        None,
    )
}

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A running (or stopped) container on `repo:from`.
fn deploy(h: &Harness, name: &str, repo: &str, from: &str, healthcheck: bool, running: bool) {
    let image = format!("{repo}:{from}");
    h.engine.add_image(&image, &[], &[]);
    h.engine
        .add_container(name, fake::spec(&image, healthcheck), running);
}

fn tag_update(name: &str, repo: &str, from: &str, to: &str) -> Container {
    Container {
        id: String::new(),
        name: name.to_string(),
        image: ImageRef::parse(&format!("{repo}:{from}")),
        update_kind: UpdateKind::Tag {
            local: from.to_string(),
            remote: to.to_string(),
        },
        labels: HashMap::new(),
        watcher: "test".to_string(),
    }
}

fn with_labels(mut container: Container, pairs: &[(&str, &str)]) -> Container {
    container.labels = labels(pairs);
    container
}

#[tokio::test]
async fn test_tag_update_succeeds() {
    let h = harness();
    deploy(&h, "nginx", "nginx", "1.24", false, true);

    let outcome = h
        .updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap();

    let UpdateOutcome::Applied(op) = outcome else {
        panic!("expected an applied update");
    };
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert_eq!(op.phase, Phase::Succeeded);
    assert_eq!(op.from_version, "1.24");
    assert_eq!(op.to_version, "1.25");
    assert_eq!(h.engine.names(), vec!["nginx"]);
    let (_, image, running) = h.engine.get("nginx").unwrap();
    assert_eq!(image, "nginx:1.25");
    assert!(running);

    let backups = h.backups.list_by_name("nginx").await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].image_tag, "1.24");
    assert_eq!(h.events.labels(), vec!["applied nginx"]);
    assert!(h.ledger.in_progress_for("nginx").await.is_none());
}

#[tokio::test]
async fn test_create_failure_rolls_back() {
    let h = harness();
    deploy(&h, "nginx", "nginx", "1.24", false, true);
    h.engine.fail(Op::Create, None, "no space left on device");

    let err = h
        .updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "create_failed");

    assert_eq!(h.engine.names(), vec!["nginx"]);
    let (_, image, running) = h.engine.get("nginx").unwrap();
    assert_eq!(image, "nginx:1.24");
    assert!(running);
    assert_eq!(h.engine.count_calls("stop"), 0);

    let op = &h.ledger.history("nginx").await[0];
    assert_eq!(op.status, OperationStatus::RolledBack);
    assert_eq!(op.phase, Phase::RolledBack);
    assert_eq!(op.rollback_reason.as_deref(), Some("create_failed"));
    assert_eq!(
        h.updater
            .telemetry()
            .count(RollbackOutcome::Success, "create_failed"),
        1
    );
    assert!(h.events.labels().contains(&"failed nginx".to_string()));
}

#[tokio::test]
async fn test_half_created_container_is_removed_on_rollback() {
    let h = harness();
    deploy(&h, "nginx", "nginx", "1.24", false, true);
    let original = h.engine.get("nginx").unwrap().0;
    h.engine.fail(Op::Connect, None, "network frontend not found");

    let err = h
        .updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "create_failed");

    assert_eq!(h.engine.names(), vec!["nginx"]);
    let (id, image, running) = h.engine.get("nginx").unwrap();
    assert_eq!(id, original);
    assert_eq!(image, "nginx:1.24");
    assert!(running);
    assert_eq!(
        h.ledger.history("nginx").await[0].status,
        OperationStatus::RolledBack
    );
    assert_eq!(
        h.updater
            .telemetry()
            .count(RollbackOutcome::Success, "create_failed"),
        1
    );
}

#[tokio::test]
async fn test_stop_failure_keeps_original_running() {
    let h = harness();
    deploy(&h, "nginx", "nginx", "1.24", false, true);
    let original = h.engine.get("nginx").unwrap().0;
    h.engine.fail(Op::Stop, None, "tried to kill container, but did not receive an exit event");

    let err = h
        .updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "stop_failed");

    assert_eq!(h.engine.names(), vec!["nginx"]);
    let (id, image, running) = h.engine.get("nginx").unwrap();
    assert_eq!(id, original);
    assert_eq!(image, "nginx:1.24");
    assert!(running);
    assert_eq!(
        h.updater
            .telemetry()
            .count(RollbackOutcome::Success, "stop_failed"),
        1
    );
}

#[tokio::test]
async fn test_start_failure_restarts_original() {
    let h = harness();
    deploy(&h, "nginx", "nginx", "1.24", false, true);
    let original = h.engine.get("nginx").unwrap().0;
    h.engine.fail(Op::Start, None, "port is already allocated");

    let err = h
        .updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "start_failed");

    assert_eq!(h.engine.names(), vec!["nginx"]);
    let (id, image, running) = h.engine.get("nginx").unwrap();
    assert_eq!(id, original);
    assert_eq!(image, "nginx:1.24");
    assert!(running);
    assert_eq!(
        h.updater
            .telemetry()
            .count(RollbackOutcome::Success, "start_failed"),
        1
    );
}

#[tokio::test]
async fn test_unhealthy_new_container_rolls_back() {
    let h = harness();
    deploy(&h, "nginx", "nginx", "1.24", true, true);
    h.engine.plan_health("nginx:1.25", &[HealthState::Unhealthy]);

    let err = h
        .updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::HealthGate { .. }), "{err}");

    assert_eq!(h.engine.names(), vec!["nginx"]);
    let (_, image, running) = h.engine.get("nginx").unwrap();
    assert_eq!(image, "nginx:1.24");
    assert!(running);
    assert_eq!(
        h.updater
            .telemetry()
            .count(RollbackOutcome::Success, "health_gate_failed"),
        1
    );
    let failed = h.events.position("failed nginx").unwrap();
    let rollback = h
        .events
        .position("rollback nginx success health_gate_failed")
        .unwrap();
    assert!(rollback < failed);
}

#[tokio::test(start_paused = true)]
async fn test_health_gate_timeout_rolls_back() {
    let h = harness();
    deploy(&h, "nginx", "nginx", "1.24", true, true);

    let started = tokio::time::Instant::now();
    let err = h
        .updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "health_gate_timeout");
    assert!(started.elapsed() >= DecantConfig::default().health_gate.timeout());
    assert_eq!(h.engine.get("nginx").unwrap().1, "nginx:1.24");
}

#[tokio::test]
async fn test_rename_failure_touches_nothing() {
    let h = harness();
    deploy(&h, "nginx", "nginx", "1.24", false, true);
    h.engine.fail(Op::Rename, None, "conflict");

    let err = h
        .updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap_err();
    assert!(err.is_rename_failure());

    let calls = h.engine.calls();
    assert_eq!(calls.len(), 2, "{calls:?}");
    assert_eq!(calls[0], "pull nginx:1.25");
    assert!(calls[1].starts_with("rename nginx-1 nginx-old-"));

    let op = &h.ledger.history("nginx").await[0];
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.phase, Phase::Prepare);
    assert_eq!(
        h.updater
            .telemetry()
            .count(RollbackOutcome::Info, "rename_failed"),
        1
    );
}

#[tokio::test]
async fn test_exec_error_is_reported_as_runtime_incompatibility() {
    let h = harness();
    deploy(&h, "app", "app", "1", false, true);
    h.engine.fail(
        Op::Start,
        None,
        "OCI runtime create failed: exec: \"/entry.sh\": stat /entry.sh: no such file or directory",
    );

    let err = h
        .updater
        .update(&tag_update("app", "app", "1", "2"))
        .await
        .unwrap_err();
    let UpdateError::RuntimeIncompatible {
        from_image,
        to_image,
        rollback,
        ..
    } = &err
    else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(from_image, "app:1");
    assert_eq!(to_image, "app:2");
    assert_eq!(*rollback, RollbackOutcome::Success);
    assert_eq!(err.reason(), "start_failed");
    assert!(err.to_string().contains("Entrypoint/Cmd"));

    let (_, image, running) = h.engine.get("app").unwrap();
    assert_eq!(image, "app:1");
    assert!(running);
}

#[tokio::test]
async fn test_stopped_container_stays_stopped() {
    let h = harness();
    deploy(&h, "worker", "worker", "1", true, false);

    h.updater
        .update(&tag_update("worker", "worker", "1", "2"))
        .await
        .unwrap();
    let (_, image, running) = h.engine.get("worker").unwrap();
    assert_eq!(image, "worker:2");
    assert!(!running);
    assert_eq!(h.engine.count_calls("start"), 0);
    assert_eq!(h.engine.count_calls("stop"), 0);
    assert_eq!(h.engine.names(), vec!["worker"]);
}

#[tokio::test]
async fn test_security_block_stops_before_anything() {
    let gate = StaticGate::scan_status(
        ScanStatus::Blocked,
        SeveritySummary {
            critical: 2,
            ..Default::default()
        },
    );
    let h = harness_with(DecantConfig::default(), Arc::new(gate), None);
    deploy(&h, "nginx", "nginx", "1.24", false, true);

    let err = h
        .updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::SecurityBlocked { .. }), "{err}");
    assert!(h.engine.calls().is_empty());
    assert!(h.ledger.history("nginx").await.is_empty());
    assert!(h.backups.list_by_name("nginx").await.unwrap().is_empty());
    assert_eq!(
        h.events.labels(),
        vec![
            "security-alert nginx",
            "rollback nginx info security_blocked",
            "failed nginx"
        ]
    );
}

#[tokio::test]
async fn test_pre_hook_failure_aborts_by_default() {
    let h = harness();
    deploy(&h, "db", "postgres", "15", false, true);
    h.hooks.exit_with("pg_dumpall > /backup.sql", 1);

    let container = with_labels(
        tag_update("db", "postgres", "15", "16"),
        &[(LABEL_HOOK_PRE, "pg_dumpall > /backup.sql")],
    );
    let err = h.updater.update(&container).await.unwrap_err();
    assert!(matches!(err, UpdateError::PreHook(_)), "{err}");
    assert!(h.engine.calls().is_empty());

    let runs = h.hooks.runs.lock().unwrap();
    let env = &runs[0].1.env;
    assert_eq!(env["DECANT_CONTAINER_NAME"], "db");
    assert_eq!(env["DECANT_IMAGE_FROM"], "postgres:15");
    assert_eq!(env["DECANT_IMAGE_TO"], "postgres:16");
    assert_eq!(env["DECANT_UPDATE_KIND"], "tag");
}

#[tokio::test]
async fn test_pre_hook_failure_can_be_ignored() {
    let h = harness();
    deploy(&h, "db", "postgres", "15", false, true);
    h.hooks.exit_with("backup", 1);

    let container = with_labels(
        tag_update("db", "postgres", "15", "16"),
        &[(LABEL_HOOK_PRE, "backup"), (LABEL_HOOK_PRE_ABORT, "false")],
    );
    h.updater.update(&container).await.unwrap();
    assert_eq!(h.engine.get("db").unwrap().1, "postgres:16");
}

#[tokio::test]
async fn test_post_hook_failure_keeps_update() {
    let h = harness();
    deploy(&h, "db", "postgres", "15", false, true);
    h.hooks.exit_with("notify", 2);

    let container = with_labels(
        tag_update("db", "postgres", "15", "16"),
        &[(LABEL_HOOK_PRE, "prepare"), (LABEL_HOOK_POST, "notify")],
    );
    let outcome = h.updater.update(&container).await.unwrap();
    assert_eq!(outcome.operation().status, OperationStatus::Succeeded);
    assert_eq!(h.hooks.commands(), vec!["prepare", "notify"]);
    assert_eq!(h.engine.get("db").unwrap().1, "postgres:16");
}

#[tokio::test]
async fn test_self_update_hands_off_to_helper() {
    let h = harness_with(
        DecantConfig::default(),
        Arc::new(DisabledSecurityGate),
        Some(SelfIdentity::Container("decant".to_string())),
    );
    deploy(&h, "decant", "decant", "1", false, true);

    let outcome = h
        .updater
        .update(&tag_update("decant", "decant", "1", "2"))
        .await
        .unwrap();
    let UpdateOutcome::HandedOff(op) = outcome else {
        panic!("expected a hand-off");
    };
    assert_eq!(op.status, OperationStatus::InProgress);
    assert_eq!(op.phase, Phase::HelperStarted);

    // New container created but not started; old one still running.
    let (_, image, running) = h.engine.get("decant").unwrap();
    assert_eq!(image, "decant:2");
    assert!(!running);
    assert!(h.engine.get(&op.temp_name).unwrap().2);
    let contract = helper_contract(&h, &op);
    assert_eq!(contract.operation_id, op.id);
    assert_eq!(contract.old_temp_name, op.temp_name);

    assert_eq!(h.events.position("self-update decant"), Some(0));
    // The helper owns the operation now; startup reconciliation leaves it.
    assert!(h.updater.reconcile_all().await.is_empty());
}

fn helper_contract(h: &Harness, op: &UpdateOperation) -> HelperContract {
    let spec = h.engine.spec_of(&self_update::helper_name(op.id)).unwrap();
    assert!(spec.auto_remove());
    spec.env
        .iter()
        .find_map(|e| e.strip_prefix(&format!("{}=", self_update::CONTRACT_ENV)))
        .map(|json| HelperContract::from_json(json).unwrap())
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_self_update_settles_once_helper_is_gone() {
    let h = harness_with(
        DecantConfig::default(),
        Arc::new(DisabledSecurityGate),
        Some(SelfIdentity::Container("decant".to_string())),
    );
    deploy(&h, "decant", "decant", "1", false, true);
    let outcome = h
        .updater
        .update(&tag_update("decant", "decant", "1", "2"))
        .await
        .unwrap();
    let op = outcome.operation().clone();

    let contract = helper_contract(&h, &op);
    crate::helper::run_helper(h.engine.as_ref(), &contract)
        .await
        .unwrap();
    // The helper exits and the daemon removes it.
    h.engine
        .remove_container(&self_update::helper_name(op.id), true)
        .await
        .unwrap();

    let results = h.updater.reconcile_all().await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0].1, Ok(Recovery::Completed)));
    assert_eq!(
        h.ledger.get(op.id).await.unwrap().status,
        OperationStatus::Succeeded
    );
    assert_eq!(h.engine.names(), vec!["decant"]);
    assert_eq!(h.engine.get("decant").unwrap().1, "decant:2");
}

#[tokio::test]
async fn test_self_update_helper_failure_rolls_back() {
    let h = harness_with(
        DecantConfig::default(),
        Arc::new(DisabledSecurityGate),
        Some(SelfIdentity::Container("decant".to_string())),
    );
    deploy(&h, "decant", "decant", "1", false, true);
    h.engine.fail(Op::Start, None, "helper image has no decant binary");

    let err = h
        .updater
        .update(&tag_update("decant", "decant", "1", "2"))
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::SelfUpdate(_)), "{err}");
    assert_eq!(h.engine.names(), vec!["decant"]);
    let (_, image, running) = h.engine.get("decant").unwrap();
    assert_eq!(image, "decant:1");
    assert!(running);
    assert_eq!(
        h.ledger.history("decant").await[0].status,
        OperationStatus::RolledBack
    );
}

#[tokio::test]
async fn test_inherited_cmd_follows_new_image() {
    let h = harness();
    h.engine.add_image("app:1", &[], &["serve"]);
    h.engine.add_image("app:2", &[], &["run", "--new"]);
    let mut spec = fake::spec("app:1", false);
    spec.entrypoint = Some(vec!["/custom".to_string()]);
    spec.cmd = Some(vec!["serve".to_string()]);
    h.engine.add_container("app", spec.clone(), true);
    h.engine.add_container("legacy", spec, true);
    h.origins
        .set(
            "app",
            RuntimeOrigins {
                entrypoint: RuntimeOrigin::Explicit,
                cmd: RuntimeOrigin::Inherited,
            },
        )
        .await
        .unwrap();

    h.updater
        .update(&tag_update("app", "app", "1", "2"))
        .await
        .unwrap();
    let spec = h.engine.spec_of("app").unwrap();
    assert_eq!(spec.entrypoint, Some(vec!["/custom".to_string()]));
    assert_eq!(spec.cmd, None);

    // No provenance recorded: keep everything.
    h.updater
        .update(&tag_update("legacy", "app", "1", "2"))
        .await
        .unwrap();
    let spec = h.engine.spec_of("legacy").unwrap();
    assert_eq!(spec.cmd, Some(vec!["serve".to_string()]));
    assert_eq!(h.origins.get("legacy").await.cmd, RuntimeOrigin::Unknown);
}

#[tokio::test]
async fn test_default_copied_by_daemon_is_learned_as_inherited() {
    let h = harness();
    h.engine.add_image("app:1", &[], &["serve"]);
    h.engine.add_image("app:2", &[], &["serve"]);
    h.engine.add_image("app:3", &[], &["run", "--new"]);
    let mut spec = fake::spec("app:1", false);
    spec.cmd = Some(vec!["serve".to_string()]);
    h.engine.add_container("app", spec, true);

    h.updater
        .update(&tag_update("app", "app", "1", "2"))
        .await
        .unwrap();
    assert_eq!(
        h.engine.spec_of("app").unwrap().cmd,
        Some(vec!["serve".to_string()])
    );
    assert_eq!(h.origins.get("app").await.cmd, RuntimeOrigin::Inherited);

    h.updater
        .update(&tag_update("app", "app", "2", "3"))
        .await
        .unwrap();
    let spec = h.engine.spec_of("app").unwrap();
    assert_eq!(spec.image, "app:3");
    assert_eq!(spec.cmd, None);
    assert_eq!(h.origins.get("app").await.cmd, RuntimeOrigin::Inherited);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_rolls_back_unhealthy_update() {
    let h = harness();
    let rollback_labels = [
        (LABEL_ROLLBACK_AUTO, "true"),
        (LABEL_ROLLBACK_WINDOW, "1m"),
        (LABEL_ROLLBACK_INTERVAL, "5s"),
    ];
    h.engine.add_image("app:1", &[], &[]);
    let mut spec = fake::spec("app:1", true);
    spec.labels = labels(&rollback_labels);
    h.engine.add_container("app", spec, true);
    h.engine.plan_health(
        "app:2",
        &[
            HealthState::Healthy,
            HealthState::Healthy,
            HealthState::Unhealthy,
        ],
    );
    h.engine.plan_health("app:1", &[HealthState::Healthy]);

    let container = with_labels(tag_update("app", "app", "1", "2"), &rollback_labels);
    h.updater.update(&container).await.unwrap();
    assert!(h.updater.watchdogs().is_armed("app"));

    let outcomes = h.updater.watchdogs().wait_all().await;
    assert_eq!(outcomes, vec![("app".to_string(), WatchOutcome::RolledBack)]);
    assert_eq!(h.engine.get("app").unwrap().1, "app:1");
    assert_eq!(h.engine.names(), vec!["app"]);
    assert_eq!(
        h.updater
            .telemetry()
            .count(RollbackOutcome::Success, ROLLBACK_REASON),
        1
    );
    let history = h.ledger.history("app").await;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|op| op.status == OperationStatus::Succeeded));
    // Rolling back does not record another backup.
    assert_eq!(h.backups.list_by_name("app").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_new_update_disarms_watchdog() {
    let h = harness();
    let rollback_labels = [(LABEL_ROLLBACK_AUTO, "true")];
    deploy(&h, "app", "app", "1", true, true);
    h.engine.plan_health("app:2", &[HealthState::Healthy]);
    h.engine.plan_health("app:3", &[HealthState::Healthy]);

    let first = with_labels(tag_update("app", "app", "1", "2"), &rollback_labels);
    h.updater.update(&first).await.unwrap();
    assert!(h.updater.watchdogs().is_armed("app"));

    // Without the label the next update leaves nothing armed.
    h.updater
        .update(&tag_update("app", "app", "2", "3"))
        .await
        .unwrap();
    assert!(!h.updater.watchdogs().is_armed("app"));
}

#[tokio::test]
async fn test_reconcile_all_is_idempotent() {
    let h = harness();
    // A crash right after the rename: only the temp-named container exists.
    let op = h
        .ledger
        .insert(NewOperation {
            container_id: "nginx-1".to_string(),
            container_name: "nginx".to_string(),
            trigger_name: "test".to_string(),
            temp_name: "nginx-old-abc".to_string(),
            old_container_was_running: true,
            from_version: "1.24".to_string(),
            to_version: "1.25".to_string(),
            target_image: "nginx:1.25".to_string(),
        })
        .await
        .unwrap();
    h.engine
        .add_container("nginx-old-abc", fake::spec("nginx:1.24", false), true);

    let results = h.updater.reconcile_all().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0.id, op.id);
    assert!(matches!(results[0].1, Ok(Recovery::RolledBack)));
    assert_eq!(h.engine.names(), vec!["nginx"]);

    assert!(h.updater.reconcile_all().await.is_empty());
    assert_eq!(
        h.ledger.get(op.id).await.unwrap().status,
        OperationStatus::RolledBack
    );
}

#[tokio::test]
async fn test_interrupted_operation_is_settled_before_update() {
    let h = harness();
    deploy(&h, "nginx", "nginx", "1.24", false, true);
    let stale = h
        .ledger
        .insert(NewOperation {
            container_id: "nginx-1".to_string(),
            container_name: "nginx".to_string(),
            trigger_name: "test".to_string(),
            temp_name: "nginx-old-gone".to_string(),
            old_container_was_running: true,
            from_version: "1.23".to_string(),
            to_version: "1.24".to_string(),
            target_image: "nginx:1.24".to_string(),
        })
        .await
        .unwrap();

    h.updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap();
    assert!(!h.ledger.get(stale.id).await.unwrap().is_in_progress());
    assert_eq!(h.engine.get("nginx").unwrap().1, "nginx:1.25");
}

#[tokio::test]
async fn test_prune_removes_images_aged_out_of_backups() {
    let mut config = DecantConfig::default();
    config.prune.images = true;
    config.backups.keep = 1;
    let h = harness_with(config, Arc::new(DisabledSecurityGate), None);
    deploy(&h, "nginx", "nginx", "1.24", false, true);

    h.updater
        .update(&tag_update("nginx", "nginx", "1.24", "1.25"))
        .await
        .unwrap();
    // Still the rollback target.
    assert!(h.engine.has_image("nginx:1.24"));

    h.updater
        .update(&tag_update("nginx", "nginx", "1.25", "1.26"))
        .await
        .unwrap();
    assert!(!h.engine.has_image("nginx:1.24"));
    assert!(h.engine.has_image("nginx:1.25"));
    assert!(h.engine.has_image("nginx:1.26"));
    let backups = h.backups.list_by_name("nginx").await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].image_tag, "1.25");
}
