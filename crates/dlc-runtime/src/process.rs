//! Local process runner
//!
//! Executes commands as child processes of the harness.

use async_trait::async_trait;
use dlc_core::{DlcError, DlcResult};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::traits::{BackgroundProcess, CommandOutput, CommandRunner, CommandSpec};

/// Runs commands on the local host
#[derive(Debug, Clone, Default)]
pub struct LocalRunner {
    /// Environment applied to every command
    base_env: Vec<(String, String)>,
}

impl LocalRunner {
    /// Create a new local runner
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an environment variable applied to every command
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_env.push((key.into(), value.into()));
        self
    }

    /// Build the tokio command for a spec
    fn build_command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);

        for (key, value) in self.base_env.iter().chain(spec.env.iter()) {
            cmd.env(key, value);
        }

        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd
    }

    fn spawn_error(spec: &CommandSpec, e: std::io::Error) -> DlcError {
        error!(command = %spec, error = %e, "Failed to spawn command");
        DlcError::Spawn {
            command: spec.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, spec: &CommandSpec) -> DlcResult<CommandOutput> {
        debug!(command = %spec, "Running command");

        let mut cmd = self.build_command(spec);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| Self::spawn_error(spec, e))?;

        let result = CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(command = %spec, code = result.code, "Command finished");
        spec.check(result)
    }

    async fn spawn(&self, spec: &CommandSpec) -> DlcResult<BackgroundProcess> {
        let mut cmd = self.build_command(spec);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| Self::spawn_error(spec, e))?;
        info!(
            command = %spec,
            pid = child.id().unwrap_or(0),
            "Started background process"
        );

        Ok(BackgroundProcess::new(spec.to_string(), Some(child)))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
