use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use minijinja::Environment;
use serde::Deserialize;

use crate::security::SecurityPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error in {0:?}: {1}")]
    Template(PathBuf, minijinja::Error),
}

fn default_trigger_name() -> String {
    "decant".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/decant")
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecantConfig {
    /// Recorded on every backup record and operation.
    #[serde(default = "default_trigger_name")]
    pub trigger_name: String,
    /// Directory holding the ledger, backup and origin documents.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub health_gate: HealthGateConfig,
    #[serde(default)]
    pub backups: BackupConfig,
    #[serde(default)]
    pub prune: PruneConfig,
    #[serde(default)]
    pub self_update: SelfUpdateConfig,
    #[serde(default)]
    pub compose: ComposeConfig,
    #[serde(default)]
    pub security: SecurityPolicy,
}

impl Default for DecantConfig {
    fn default() -> Self {
        Self {
            trigger_name: default_trigger_name(),
            state_dir: default_state_dir(),
            health_gate: HealthGateConfig::default(),
            backups: BackupConfig::default(),
            prune: PruneConfig::default(),
            self_update: SelfUpdateConfig::default(),
            compose: ComposeConfig::default(),
            security: SecurityPolicy::default(),
        }
    }
}

/// Swap-time wait for a health check verdict.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthGateConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthGateConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            timeout_secs: 60,
        }
    }
}

impl HealthGateConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Backup records retained per container.
    pub keep: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { keep: 3 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    /// Remove the superseded image after a successful update.
    pub images: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelfUpdateConfig {
    /// Name or id of our own container. Falls back to `$HOSTNAME`, which the
    /// daemon sets to the short container id.
    pub container: Option<String>,
    /// Image for the helper container; defaults to the update target.
    pub helper_image: Option<String>,
    pub socket: PathBuf,
    pub start_timeout_secs: u64,
    pub health_timeout_secs: u64,
    /// Zero disables the acknowledgement request.
    pub ack_timeout_secs: u64,
}

impl Default for SelfUpdateConfig {
    fn default() -> Self {
        Self {
            container: None,
            helper_image: None,
            socket: PathBuf::from("/var/run/docker.sock"),
            start_timeout_secs: 30,
            health_timeout_secs: 60,
            ack_timeout_secs: 5,
        }
    }
}

impl SelfUpdateConfig {
    pub fn ack_timeout(&self) -> Option<Duration> {
        (self.ack_timeout_secs > 0).then(|| Duration::from_secs(self.ack_timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    pub enabled: bool,
    pub lock_wait_secs: u64,
    pub lock_poll_millis: u64,
    pub lock_stale_secs: u64,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_wait_secs: 30,
            lock_poll_millis: 200,
            lock_stale_secs: 120,
        }
    }
}

impl DecantConfig {
    fn try_init_from_string(
        config: &str,
        path: &Path,
        vars: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let rendered =
            render_template(config, vars).map_err(|e| ConfigError::Template(path.into(), e))?;
        Ok(toml::from_str(&rendered)?)
    }

    /// Load the config at `path`, rendering `${ VAR }` placeholders from the
    /// environment. A missing file yields the defaults.
    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(config) => config,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {path:?}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::try_init_from_string(&config, path, &vars)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.json")
    }

    pub fn backups_path(&self) -> PathBuf {
        self.state_dir.join("backups.json")
    }

    pub fn origins_path(&self) -> PathBuf {
        self.state_dir.join("origins.json")
    }
}

pub fn render_template(
    template_str: &str,
    vars: &HashMap<String, String>,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()
        .expect("This really should not fail. If this fail something has gone horribly wrong.");

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    template.render(vars)
}
