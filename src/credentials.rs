//! Registry credentials for pulls, read from the Docker client config.

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use base64::Engine;
use bollard::auth::DockerCredentials;
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credentials for `registry`, or `None` for an anonymous pull.
    async fn credentials(&self, registry: &str) -> Option<DockerCredentials>;
}

/// Reads `$DOCKER_CONFIG/config.json` or `~/.docker/config.json` on every
/// lookup, so logins done while we run are picked up.
pub struct DockerConfigCredentials;

#[async_trait]
impl CredentialProvider for DockerConfigCredentials {
    async fn credentials(&self, registry: &str) -> Option<DockerCredentials> {
        resolve(registry).await
    }
}

/// Always anonymous.
pub struct Anonymous;

#[async_trait]
impl CredentialProvider for Anonymous {
    async fn credentials(&self, _registry: &str) -> Option<DockerCredentials> {
        None
    }
}

#[derive(serde::Deserialize, Debug)]
struct AuthEntry {
    auth: Option<String>,
}

#[derive(serde::Deserialize, Debug, Default)]
struct DockerConfig {
    auths: Option<HashMap<String, AuthEntry>>,
    #[serde(rename = "credHelpers")]
    cred_helpers: Option<HashMap<String, String>>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(serde::Deserialize)]
struct CredStoreOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

fn get_docker_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    let home_dir = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home_dir).join(".docker").join("config.json"))
}

async fn read_docker_config() -> Result<DockerConfig, Box<dyn Error + Send + Sync>> {
    let Some(path) = get_docker_config_path() else {
        return Ok(DockerConfig::default());
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DockerConfig::default()),
        Err(e) => Err(e.into()),
    }
}

async fn call_credential_helper(
    helper: &str,
    registry: &str,
) -> Result<(String, String), Box<dyn Error + Send + Sync>> {
    let command = format!("docker-credential-{}", helper);
    let mut process = tokio::process::Command::new(command)
        .arg("get")
        .stderr(Stdio::piped())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = process.stdin.take() {
        stdin.write_all(registry.as_bytes()).await?;
    }

    let output = process.wait_with_output().await?;
    if !output.status.success() {
        return Err(format!(
            "credential helper {helper} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )
        .into());
    }
    let creds: CredStoreOutput = serde_json::from_slice(&output.stdout)?;
    Ok((creds.username, creds.secret))
}

fn decode_auth(auth: &str) -> Result<(String, String), Box<dyn Error + Send + Sync>> {
    let decoded = base64::prelude::BASE64_STANDARD.decode(auth)?;
    let decoded_str = String::from_utf8(decoded)?;
    match decoded_str.split_once(':') {
        Some((user, secret)) => Ok((user.to_string(), secret.to_string())),
        None => Err("Invalid auth format".into()),
    }
}

/// Keys a registry may be stored under in `auths`.
fn registry_keys(registry: &str) -> Vec<String> {
    if registry == "docker.io" || registry == "index.docker.io" {
        return vec![
            "https://index.docker.io/v1/".to_string(),
            "index.docker.io".to_string(),
            "docker.io".to_string(),
        ];
    }
    vec![registry.to_string(), format!("https://{registry}")]
}

async fn lookup(
    config: DockerConfig,
    registry: &str,
) -> Result<Option<(String, String)>, Box<dyn Error + Send + Sync>> {
    let keys = registry_keys(registry);

    if let Some(cred_helpers) = &config.cred_helpers {
        if let Some(helper) = keys.iter().find_map(|k| cred_helpers.get(k)) {
            return call_credential_helper(helper, &keys[0]).await.map(Some);
        }
    }

    // Plain `auths` entries win over a global store so explicit logins work
    // on hosts that also have a desktop credential store configured.
    if let Some(auths) = &config.auths {
        if let Some(auth) = keys
            .iter()
            .find_map(|k| auths.get(k))
            .and_then(|entry| entry.auth.as_deref())
        {
            return decode_auth(auth).map(Some);
        }
    }

    if let Some(helper) = &config.creds_store {
        return call_credential_helper(helper, &keys[0]).await.map(Some);
    }

    Ok(None)
}

async fn resolve(registry: &str) -> Option<DockerCredentials> {
    let config = match read_docker_config().await {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Unable to read docker config, pulling anonymously: {e}");
            return None;
        }
    };
    match lookup(config, registry).await {
        Ok(Some((username, password))) => Some(DockerCredentials {
            username: Some(username),
            password: Some(password),
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        }),
        Ok(None) => None,
        Err(e) => {
            log::warn!("Error retrieving credentials for {registry}, pulling anonymously: {e}");
            None
        }
    }
}
