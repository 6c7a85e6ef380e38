//! Command runner trait definitions

use async_trait::async_trait;
use dlc_core::{DlcError, DlcResult};
use std::fmt;
use std::path::PathBuf;

/// An external command to execute
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Tolerate a non-zero exit code
    pub warn: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Run a script through `/bin/sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Do not fail on a non-zero exit code
    pub fn warn(mut self) -> Self {
        self.warn = true;
        self
    }

    /// Validate an output against this spec's exit code policy
    pub fn check(&self, output: CommandOutput) -> DlcResult<CommandOutput> {
        if output.success() || self.warn {
            Ok(output)
        } else {
            Err(DlcError::Command {
                command: self.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal)
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// A long-running command such as `kubectl port-forward`
///
/// The process is killed when this handle is dropped.
#[derive(Debug)]
pub struct BackgroundProcess {
    description: String,
    child: Option<tokio::process::Child>,
}

impl BackgroundProcess {
    pub fn new(description: String, child: Option<tokio::process::Child>) -> Self {
        Self { description, child }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Terminate the process and wait for it
    pub async fn kill(mut self) -> DlcResult<()> {
        if let Some(child) = self.child.as_mut() {
            child.kill().await?;
        }
        Ok(())
    }
}

/// Runner trait for executing external tools
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output
    async fn run(&self, spec: &CommandSpec) -> DlcResult<CommandOutput>;

    /// Start a command in the background
    async fn spawn(&self, spec: &CommandSpec) -> DlcResult<BackgroundProcess>;

    /// Get the runner name
    fn name(&self) -> &'static str;
}
