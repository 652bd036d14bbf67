use std::process::ExitCode;
use std::sync::Arc;

use cli::Command;
use config::DecantConfig;
use engine::{BollardEngine, ContainerEngine};
use model::{Container, ImageRef, UpdateKind};
use update::{Dependencies, SelfIdentity, UpdateOutcome, Updater};

mod backup;
mod cli;
mod compose;
mod config;
mod credentials;
mod docker;
mod engine;
mod events;
mod helper;
mod hooks;
mod ledger;
mod model;
mod origin;
mod security;
mod store;
mod update;
mod watchdog;

const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = cli::get_cli_args();
    let engine: Arc<dyn ContainerEngine> = match docker::connect() {
        Ok(docker) => Arc::new(BollardEngine::new(docker)),
        Err(e) => {
            log::error!("Unable to connect to the Docker daemon: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The helper runs in a throwaway container without our config or state.
    if let Command::Helper = args.command {
        return run_helper(engine.as_ref()).await;
    }

    let config = match DecantConfig::try_init(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Unable to load config {:?}: {e}", args.config);
            return ExitCode::FAILURE;
        }
    };

    let updater = match build_updater(engine.clone(), config.clone()).await {
        Ok(updater) => updater,
        Err(e) => {
            log::error!("Unable to open state in {:?}: {e}", config.state_dir);
            return ExitCode::FAILURE;
        }
    };

    let code = match &args.command {
        Command::Reconcile => {
            let results = updater.reconcile_all().await;
            log::info!("Reconciled {} interrupted operations", results.len());
            if results.iter().all(|(_, result)| result.is_ok()) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::History { container } => {
            let history = updater.ledger().history(container).await;
            match serde_json::to_string_pretty(&history) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    log::error!("Unable to serialize history: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Update {
            container,
            tag,
            digest,
        } => {
            updater.reconcile_all().await;
            let request = match describe(
                engine.as_ref(),
                container,
                tag.as_deref(),
                digest.as_deref(),
                &config.trigger_name,
            )
            .await
            {
                Ok(request) => request,
                Err(e) => {
                    log::error!("{e}");
                    return ExitCode::FAILURE;
                }
            };
            match updater.update(&request).await {
                Ok(UpdateOutcome::Applied(op)) => {
                    log::info!("Operation {} finished: {:?}", op.id, op.status);
                    ExitCode::SUCCESS
                }
                Ok(UpdateOutcome::HandedOff(op)) => {
                    log::info!("Operation {} handed to the self-update helper", op.id);
                    ExitCode::SUCCESS
                }
                Err(_) => ExitCode::FAILURE,
            }
        }
        Command::Helper => run_helper(engine.as_ref()).await,
    };

    // Armed watchdogs keep the process alive until their window closes.
    for (name, outcome) in updater.watchdogs().wait_all().await {
        log::info!("Watchdog for {name} finished: {outcome:?}");
    }
    code
}

async fn build_updater(
    engine: Arc<dyn ContainerEngine>,
    config: DecantConfig,
) -> Result<Updater, store::StoreError> {
    let ledger = Arc::new(ledger::OperationLedger::open(&config.ledger_path()).await?);
    let backups = Arc::new(backup::JsonBackupStore::open(&config.backups_path()).await?);
    let origins = Arc::new(origin::OriginStore::open(&config.origins_path()).await?);

    let (events, rx) = events::ChannelEventSink::new(EVENT_BUFFER);
    tokio::spawn(events::log_events(rx));

    let identity = SelfIdentity::detect(&config.self_update);
    let deps = Dependencies {
        engine,
        credentials: Arc::new(credentials::DockerConfigCredentials),
        ledger,
        backups,
        origins,
        security: Arc::new(security::DisabledSecurityGate),
        hooks: Arc::new(hooks::ShellHookRunner),
        events: Arc::new(events),
        compose_runner: Arc::new(compose::ProcessRunner),
        compose_locks: Arc::new(compose::ComposeLockRegistry::new()),
    };
    Ok(Updater::new(deps, config, identity))
}

/// Turn "move `name` to this tag/digest" into an update request.
async fn describe(
    engine: &dyn ContainerEngine,
    name: &str,
    tag: Option<&str>,
    digest: Option<&str>,
    trigger_name: &str,
) -> Result<Container, String> {
    let snapshot = engine
        .inspect_container(name)
        .await
        .map_err(|e| format!("Unable to inspect {name}: {e}"))?
        .ok_or_else(|| format!("Container {name} does not exist"))?;
    let image = ImageRef::parse(&snapshot.spec.image);

    let update_kind = match (tag, digest) {
        (Some(tag), _) => UpdateKind::Tag {
            local: image.tag_or_latest().to_string(),
            remote: tag.to_string(),
        },
        (None, Some(digest)) => {
            let local = match engine.inspect_image(&snapshot.spec.image).await {
                Ok(Some(defaults)) => defaults
                    .repo_digests
                    .iter()
                    .find_map(|d| d.split_once('@').map(|(_, digest)| digest.to_string())),
                _ => None,
            };
            UpdateKind::Digest {
                local: local.or_else(|| image.digest.clone()),
                remote: digest.to_string(),
            }
        }
        (None, None) => UpdateKind::Unknown,
    };

    Ok(Container {
        id: snapshot.id,
        name: snapshot.name,
        image,
        update_kind,
        labels: snapshot.spec.labels,
        watcher: trigger_name.to_string(),
    })
}

async fn run_helper(engine: &dyn ContainerEngine) -> ExitCode {
    let contract = match helper::contract_from_env() {
        Ok(contract) => contract,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    match helper::run_helper(engine, &contract).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Self-update helper failed: {e}");
            ExitCode::FAILURE
        }
    }
}
