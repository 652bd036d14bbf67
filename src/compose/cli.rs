//! Delegation to the compose CLI.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;

use super::ComposeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], cwd: &Path) -> io::Result<CommandOutput>;
}

pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String], cwd: &Path) -> io::Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpOptions {
    /// `-d` when set, `--no-start` otherwise.
    pub start: bool,
    pub force_recreate: bool,
}

/// `docker compose` with a fallback to the standalone `docker-compose`.
pub struct ComposeCli {
    runner: Arc<dyn CommandRunner>,
}

/// The integrated plugin is missing, as opposed to the command failing.
fn plugin_missing(output: &CommandOutput) -> bool {
    !output.success()
        && ["is not a docker command", "unknown command", "unknown shorthand flag: 'f'"]
            .iter()
            .any(|needle| output.stderr.contains(needle))
}

impl ComposeCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn pull(&self, file: &Path, service: &str) -> Result<CommandOutput, ComposeError> {
        self.invoke(file, &["pull".to_string(), service.to_string()])
            .await
    }

    pub async fn up(
        &self,
        file: &Path,
        service: &str,
        options: UpOptions,
    ) -> Result<CommandOutput, ComposeError> {
        let mut args = vec!["up".to_string()];
        args.push(if options.start { "-d" } else { "--no-start" }.to_string());
        if options.force_recreate {
            args.push("--force-recreate".to_string());
        }
        args.push("--no-deps".to_string());
        args.push(service.to_string());
        self.invoke(file, &args).await
    }

    async fn invoke(&self, file: &Path, args: &[String]) -> Result<CommandOutput, ComposeError> {
        let cwd = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        // Relative paths are resolved against `cwd`, which already is the
        // file's directory.
        let file_arg = if file.is_absolute() {
            file.display().to_string()
        } else {
            file.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string())
        };

        let mut integrated = vec!["compose".to_string(), "-f".to_string(), file_arg.clone()];
        integrated.extend_from_slice(args);
        let first_failure = match self.runner.run("docker", &integrated, cwd).await {
            Ok(output) if !plugin_missing(&output) => {
                return check(output, "docker", &integrated);
            }
            Ok(output) => output.stderr.trim().to_string(),
            Err(e) => e.to_string(),
        };
        log::debug!("`docker compose` unavailable ({first_failure}), trying docker-compose");

        let mut legacy = vec!["-f".to_string(), file_arg];
        legacy.extend_from_slice(args);
        match self.runner.run("docker-compose", &legacy, cwd).await {
            Ok(output) => check(output, "docker-compose", &legacy),
            Err(e) => Err(ComposeError::CliUnavailable(format!(
                "docker compose: {first_failure}; docker-compose: {e}"
            ))),
        }
    }
}

fn check(output: CommandOutput, program: &str, args: &[String]) -> Result<CommandOutput, ComposeError> {
    let command = format!("{program} {}", args.join(" "));
    if !output.stdout.trim().is_empty() {
        log::debug!("{command}: {}", output.stdout.trim());
    }
    if output.success() {
        log::info!("Ran {command}");
        return Ok(output);
    }
    Err(ComposeError::Command {
        command,
        status: output
            .status
            .map(|code| format!("exit code {code}"))
            .unwrap_or_else(|| "killed by signal".to_string()),
        stderr: output.stderr.trim().to_string(),
    })
}
