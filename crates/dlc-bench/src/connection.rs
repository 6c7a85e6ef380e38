//! Remote command execution on EC2 instances

use dlc_core::DlcResult;
use dlc_runtime::{CommandOutput, CommandRunner, CommandSpec};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// SSH connection to a benchmark instance
///
/// Scripts are passed to the remote login shell, so `$HOME` and pipes
/// resolve on the instance.
pub struct Ec2Connection {
    runner: Arc<dyn CommandRunner>,
    host: String,
    user: String,
    key_file: Option<PathBuf>,
}

impl Ec2Connection {
    pub fn new(runner: Arc<dyn CommandRunner>, host: impl Into<String>) -> Self {
        Self {
            runner,
            host: host.into(),
            user: "ubuntu".to_string(),
            key_file: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_key_file(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn ssh(&self, script: &str) -> CommandSpec {
        let mut spec = CommandSpec::new("ssh").args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "BatchMode=yes",
        ]);
        if let Some(key) = &self.key_file {
            spec = spec.arg("-i").arg(key.display().to_string());
        }
        spec.arg(format!("{}@{}", self.user, self.host)).arg(script)
    }

    /// Run `script`, failing on a non-zero exit
    pub async fn run(&self, script: &str) -> DlcResult<CommandOutput> {
        debug!(host = %self.host, script = script, "Remote command");
        self.runner.run(&self.ssh(script)).await
    }

    /// Run `script`, tolerating a non-zero exit
    pub async fn run_warn(&self, script: &str) -> DlcResult<CommandOutput> {
        debug!(host = %self.host, script = script, "Remote command (warn)");
        self.runner.run(&self.ssh(script).warn()).await
    }

    pub async fn file_exists(&self, path: &str) -> DlcResult<bool> {
        Ok(self.run_warn(&format!("test -e {}", path)).await?.success())
    }

    pub async fn read_file(&self, path: &str) -> DlcResult<String> {
        Ok(self.run(&format!("cat {}", path)).await?.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlc_runtime::DryRunRunner;

    #[tokio::test]
    async fn test_ssh_command_line() {
        let runner = Arc::new(DryRunRunner::new());
        let connection = Ec2Connection::new(runner.clone(), "10.0.0.5")
            .with_user("ec2-user")
            .with_key_file("/keys/bench.pem");

        connection.run("nvidia-smi").await.unwrap();
        assert_eq!(
            runner.history(),
            vec![
                "ssh -o StrictHostKeyChecking=no -o BatchMode=yes -i /keys/bench.pem \
                 ec2-user@10.0.0.5 nvidia-smi"
            ]
        );
    }

    #[tokio::test]
    async fn test_file_exists() {
        let runner = Arc::new(DryRunRunner::new());
        runner
            .respond("test -e /logs/a.txt", CommandOutput::ok(""))
            .respond("test -e /logs/b.txt", CommandOutput::failed(1, ""));
        let connection = Ec2Connection::new(runner, "host");

        assert!(connection.file_exists("/logs/a.txt").await.unwrap());
        assert!(!connection.file_exists("/logs/b.txt").await.unwrap());
    }
}
