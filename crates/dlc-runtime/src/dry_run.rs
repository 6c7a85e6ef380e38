//! Dry-run runner
//!
//! Records commands instead of executing them. Canned outputs can be
//! registered per command substring, which makes the runner double as a
//! scripted fake for tests.

use async_trait::async_trait;
use dlc_core::DlcResult;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::info;

use crate::traits::{BackgroundProcess, CommandOutput, CommandRunner, CommandSpec};

struct Rule {
    pattern: String,
    /// Consumed front to back; the last output repeats
    outputs: VecDeque<CommandOutput>,
}

/// Runner that logs commands and returns scripted outputs
#[derive(Default)]
pub struct DryRunRunner {
    rules: Mutex<Vec<Rule>>,
    history: Mutex<Vec<String>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `output`
    ///
    /// Registering the same pattern again queues another output.
    pub fn respond(&self, pattern: &str, output: CommandOutput) -> &Self {
        let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.outputs.push_back(output),
            None => rules.push(Rule {
                pattern: pattern.to_string(),
                outputs: VecDeque::from([output]),
            }),
        }
        self
    }

    /// Every command seen so far, rendered as a command line
    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Commands containing `needle`
    pub fn commands_matching(&self, needle: &str) -> Vec<String> {
        self.history()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }

    fn record(&self, line: &str) {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(line.to_string());
    }

    fn scripted_output(&self, line: &str) -> CommandOutput {
        let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        rules
            .iter_mut()
            .find(|r| line.contains(&r.pattern))
            .and_then(|rule| {
                if rule.outputs.len() > 1 {
                    rule.outputs.pop_front()
                } else {
                    rule.outputs.front().cloned()
                }
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, spec: &CommandSpec) -> DlcResult<CommandOutput> {
        let line = spec.to_string();
        info!(command = %line, "[dry-run] run");
        self.record(&line);
        spec.check(self.scripted_output(&line))
    }

    async fn spawn(&self, spec: &CommandSpec) -> DlcResult<BackgroundProcess> {
        let line = spec.to_string();
        info!(command = %line, "[dry-run] spawn");
        self.record(&line);
        Ok(BackgroundProcess::new(line, None))
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_history() {
        let runner = DryRunRunner::new();
        runner.run(&CommandSpec::new("docker").arg("pull")).await.unwrap();
        runner.spawn(&CommandSpec::new("kubectl").arg("port-forward")).await.unwrap();
        assert_eq!(runner.history(), vec!["docker pull", "kubectl port-forward"]);
        assert_eq!(runner.commands_matching("kubectl").len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_outputs_in_order() {
        let runner = DryRunRunner::new();
        runner
            .respond("get pods", CommandOutput::ok("Pending"))
            .respond("get pods", CommandOutput::ok("Running"));

        let spec = CommandSpec::new("kubectl").args(["get", "pods"]);
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "Pending");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "Running");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "Running");
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let runner = DryRunRunner::new();
        runner.respond("push", CommandOutput::failed(1, "denied"));
        let result = runner.run(&CommandSpec::new("docker").arg("push")).await;
        assert!(result.is_err());
    }
}
