//! External command execution.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// What the command is for (used in logs and errors).
    pub label: String,

    pub program: String,

    pub args: Vec<String>,

    /// Variables added on top of the inherited environment.
    pub env: BTreeMap<String, String>,

    pub cwd: PathBuf,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,
}

impl Invocation {
    /// Build an invocation from an argv whose first element is the program.
    pub fn from_argv(label: impl Into<String>, argv: Vec<String>, cwd: PathBuf) -> Result<Self> {
        let label = label.into();
        let mut parts = argv.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| PipelineError::EmptyCommand(label.clone()))?;

        Ok(Self {
            label,
            program,
            args: parts.collect(),
            env: BTreeMap::new(),
            cwd,
            timeout_secs: 0,
        })
    }

    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Program and arguments joined by spaces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal).
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes invocations. Non-zero exits are data; only spawn failures and
/// timeouts are errors.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs invocations as child processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let start = Instant::now();

        debug!(
            label = %invocation.label,
            command = %invocation.command_line(),
            cwd = %invocation.cwd.display(),
            "Spawning command"
        );

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Spawn {
                program: invocation.program.clone(),
                message: e.to_string(),
            })?;

        let output = if invocation.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(invocation.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| PipelineError::Timeout {
                program: invocation.program.clone(),
                timeout_secs: invocation.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
