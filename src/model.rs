//! The update request handed over by the detection side, and the
//! per-container settings derived from its labels.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const LABEL_HOOK_PRE: &str = "decant.hook.pre";
pub const LABEL_HOOK_POST: &str = "decant.hook.post";
pub const LABEL_HOOK_PRE_ABORT: &str = "decant.hook.pre.abort";
pub const LABEL_HOOK_TIMEOUT: &str = "decant.hook.timeout";
pub const LABEL_ROLLBACK_AUTO: &str = "decant.rollback.auto";
pub const LABEL_ROLLBACK_WINDOW: &str = "decant.rollback.window";
pub const LABEL_ROLLBACK_INTERVAL: &str = "decant.rollback.interval";
pub const LABEL_COMPOSE_FILE: &str = "decant.compose.file";
pub const LABEL_COMPOSE_SERVICE: &str = "decant.compose.service";
pub const LABEL_COMPOSE_CONFIG_FILES: &str = "com.docker.compose.project.config_files";
pub const LABEL_COMPOSE_SERVICE_NATIVE: &str = "com.docker.compose.service";

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_ROLLBACK_WINDOW: Duration = Duration::from_secs(300);
const DEFAULT_ROLLBACK_INTERVAL: Duration = Duration::from_secs(10);

/// A parsed image reference: `[registry/]repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(image: &str) -> Self {
        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (image, None),
        };

        // A colon followed by a slash belongs to a registry port
        // (localhost:5000/app), not to a tag.
        let (name, tag) = match rest.rfind(':') {
            Some(pos) if !rest[pos + 1..].contains('/') => {
                (&rest[..pos], Some(rest[pos + 1..].to_string()))
            }
            _ => (rest, None),
        };

        // The first path component is a registry host only when it looks
        // like one.
        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), remainder.to_string())
            }
            _ => (None, name.to_string()),
        };

        Self {
            registry,
            repository,
            tag,
            digest,
        }
    }

    /// Repository including its registry, without tag or digest.
    pub fn name(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{registry}/{}", self.repository),
            None => self.repository.clone(),
        }
    }

    /// The registry host used for credential lookup.
    pub fn registry_host(&self) -> &str {
        self.registry.as_deref().unwrap_or("docker.io")
    }

    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        }
    }

    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            digest: Some(digest.to_string()),
            ..self.clone()
        }
    }

    /// Full reference as accepted by the daemon.
    pub fn reference(&self) -> String {
        let mut out = self.name();
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// Reference with an implicit `:latest` made explicit.
    pub fn normalized(&self) -> String {
        if self.tag.is_none() && self.digest.is_none() {
            return format!("{}:latest", self.name());
        }
        self.reference()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference())
    }
}

/// What the detection side decided about the container's image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateKind {
    Tag { local: String, remote: String },
    Digest { local: Option<String>, remote: String },
    Unknown,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tag { .. } => "tag",
            Self::Digest { .. } => "digest",
            Self::Unknown => "unknown",
        }
    }
}

/// An update request for one container. Read-only for the whole update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: ImageRef,
    pub update_kind: UpdateKind,
    pub labels: HashMap<String, String>,
    /// Name of the watcher that reported the update.
    pub watcher: String,
}

impl Container {
    /// The image the container should run after the update.
    pub fn target_image(&self) -> ImageRef {
        match &self.update_kind {
            UpdateKind::Tag { remote, .. } => self.image.with_tag(remote),
            // Pinning by digest keeps the tag for readability.
            UpdateKind::Digest { remote, .. } if self.image.digest.is_some() => {
                self.image.with_digest(remote)
            }
            UpdateKind::Digest { .. } | UpdateKind::Unknown => self.image.clone(),
        }
    }

    pub fn from_version(&self) -> String {
        match &self.update_kind {
            UpdateKind::Tag { local, .. } => local.clone(),
            UpdateKind::Digest { local, .. } => local
                .clone()
                .unwrap_or_else(|| self.image.tag_or_latest().to_string()),
            UpdateKind::Unknown => self.image.tag_or_latest().to_string(),
        }
    }

    pub fn to_version(&self) -> String {
        match &self.update_kind {
            UpdateKind::Tag { remote, .. } | UpdateKind::Digest { remote, .. } => remote.clone(),
            UpdateKind::Unknown => self.image.tag_or_latest().to_string(),
        }
    }

    pub fn hook_config(&self) -> HookConfig {
        HookConfig::from_labels(&self.labels)
    }

    pub fn rollback_config(&self) -> RollbackConfig {
        RollbackConfig::from_labels(&self.labels)
    }

    /// Compose file this container was deployed from, if any.
    pub fn compose_file(&self) -> Option<&str> {
        if let Some(file) = self.labels.get(LABEL_COMPOSE_FILE) {
            return Some(file.as_str());
        }
        self.labels
            .get(LABEL_COMPOSE_CONFIG_FILES)
            .and_then(|files| files.split(',').map(str::trim).find(|f| !f.is_empty()))
    }

    pub fn compose_service(&self) -> Option<&str> {
        self.labels
            .get(LABEL_COMPOSE_SERVICE)
            .or_else(|| self.labels.get(LABEL_COMPOSE_SERVICE_NATIVE))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookConfig {
    pub pre: Option<String>,
    pub post: Option<String>,
    pub pre_abort: bool,
    pub timeout: Duration,
}

impl HookConfig {
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        Self {
            pre: non_empty(labels.get(LABEL_HOOK_PRE)),
            post: non_empty(labels.get(LABEL_HOOK_POST)),
            pre_abort: labels
                .get(LABEL_HOOK_PRE_ABORT)
                .map(|v| parse_bool(v).unwrap_or(true))
                .unwrap_or(true),
            timeout: labels
                .get(LABEL_HOOK_TIMEOUT)
                .and_then(|v| parse_duration(v))
                .unwrap_or(DEFAULT_HOOK_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackConfig {
    pub auto: bool,
    pub window: Duration,
    pub interval: Duration,
}

impl RollbackConfig {
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        Self {
            auto: labels
                .get(LABEL_ROLLBACK_AUTO)
                .and_then(|v| parse_bool(v))
                .unwrap_or(false),
            window: labels
                .get(LABEL_ROLLBACK_WINDOW)
                .and_then(|v| parse_duration(v))
                .unwrap_or(DEFAULT_ROLLBACK_WINDOW),
            interval: labels
                .get(LABEL_ROLLBACK_INTERVAL)
                .and_then(|v| parse_duration(v))
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_ROLLBACK_INTERVAL),
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `500ms`, `30s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim().to_lowercase();
    let (num, unit_ms) = if let Some(n) = value.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = value.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (value.as_str(), 1_000)
    };
    let num: u64 = num.trim().parse().ok()?;
    Some(Duration::from_millis(num.checked_mul(unit_ms)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_reference_variants() {
        let plain = ImageRef::parse("nginx");
        assert_eq!(plain.repository, "nginx");
        assert_eq!(plain.tag, None);
        assert_eq!(plain.normalized(), "nginx:latest");

        let tagged = ImageRef::parse("library/nginx:1.24");
        assert_eq!(tagged.registry, None);
        assert_eq!(tagged.repository, "library/nginx");
        assert_eq!(tagged.tag.as_deref(), Some("1.24"));

        let with_port = ImageRef::parse("localhost:5000/team/app");
        assert_eq!(with_port.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(with_port.repository, "team/app");
        assert_eq!(with_port.tag, None);

        let pinned = ImageRef::parse("ghcr.io/acme/api:2.0@sha256:abc");
        assert_eq!(pinned.registry.as_deref(), Some("ghcr.io"));
        assert_eq!(pinned.tag.as_deref(), Some("2.0"));
        assert_eq!(pinned.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(pinned.reference(), "ghcr.io/acme/api:2.0@sha256:abc");
        assert_eq!(pinned.registry_host(), "ghcr.io");
    }

    #[test]
    fn test_target_image_for_tag_update() {
        let container = Container {
            id: "abc".into(),
            name: "nginx".into(),
            image: ImageRef::parse("nginx:1.24"),
            update_kind: UpdateKind::Tag {
                local: "1.24".into(),
                remote: "1.25".into(),
            },
            labels: HashMap::new(),
            watcher: "local".into(),
        };
        assert_eq!(container.target_image().reference(), "nginx:1.25");
        assert_eq!(container.from_version(), "1.24");
        assert_eq!(container.to_version(), "1.25");
    }

    #[test]
    fn test_digest_update_keeps_reference_unless_pinned() {
        let mut container = Container {
            id: "abc".into(),
            name: "app".into(),
            image: ImageRef::parse("app:stable"),
            update_kind: UpdateKind::Digest {
                local: Some("sha256:old".into()),
                remote: "sha256:new".into(),
            },
            labels: HashMap::new(),
            watcher: "local".into(),
        };
        assert_eq!(container.target_image().reference(), "app:stable");

        container.image = ImageRef::parse("app:stable@sha256:old");
        assert_eq!(
            container.target_image().reference(),
            "app:stable@sha256:new"
        );
    }

    #[test]
    fn test_label_configs() {
        let labels: HashMap<String, String> = [
            (LABEL_HOOK_PRE, "echo pre"),
            (LABEL_HOOK_PRE_ABORT, "false"),
            (LABEL_HOOK_TIMEOUT, "1500ms"),
            (LABEL_ROLLBACK_AUTO, "true"),
            (LABEL_ROLLBACK_WINDOW, "2m"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let hooks = HookConfig::from_labels(&labels);
        assert_eq!(hooks.pre.as_deref(), Some("echo pre"));
        assert_eq!(hooks.post, None);
        assert!(!hooks.pre_abort);
        assert_eq!(hooks.timeout, Duration::from_millis(1500));

        let rollback = RollbackConfig::from_labels(&labels);
        assert!(rollback.auto);
        assert_eq!(rollback.window, Duration::from_secs(120));
        assert_eq!(rollback.interval, DEFAULT_ROLLBACK_INTERVAL);

        let defaults = HookConfig::from_labels(&HashMap::new());
        assert!(defaults.pre_abort);
        assert_eq!(defaults.timeout, DEFAULT_HOOK_TIMEOUT);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_compose_labels() {
        let mut labels = HashMap::new();
        labels.insert(
            LABEL_COMPOSE_CONFIG_FILES.to_string(),
            "/srv/app/compose.yaml,/srv/app/override.yaml".to_string(),
        );
        labels.insert(LABEL_COMPOSE_SERVICE_NATIVE.to_string(), "web".to_string());
        let container = Container {
            id: "1".into(),
            name: "app-web-1".into(),
            image: ImageRef::parse("web:1"),
            update_kind: UpdateKind::Unknown,
            labels,
            watcher: "local".into(),
        };
        assert_eq!(container.compose_file(), Some("/srv/app/compose.yaml"));
        assert_eq!(container.compose_service(), Some("web"));
    }
}
