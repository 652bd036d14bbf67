//! Lifecycle hooks run around an update.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct HookOptions {
    pub timeout: Duration,
    pub env: HashMap<String, String>,
    /// `pre` or `post`, for logs.
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResult {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl HookResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// One-line description of a failure.
    pub fn describe(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let stderr = self.stderr.trim();
        match self.exit_code {
            Some(code) if stderr.is_empty() => format!("exited with code {code}"),
            Some(code) => format!("exited with code {code}: {stderr}"),
            None => "terminated by signal".to_string(),
        }
    }
}

#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn run(&self, command: &str, options: &HookOptions) -> std::io::Result<HookResult>;
}

/// Runs hooks with `sh -c`.
pub struct ShellHookRunner;

#[async_trait]
impl HookRunner for ShellHookRunner {
    async fn run(&self, command: &str, options: &HookOptions) -> std::io::Result<HookResult> {
        log::info!("Running {} hook: {command}", options.label);
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(options.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(options.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(HookResult {
                    exit_code: output.status.code(),
                    timed_out: false,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            // Dropping the future kills the child.
            Err(_) => Ok(HookResult {
                exit_code: None,
                timed_out: true,
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }
}
