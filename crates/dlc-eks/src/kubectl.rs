//! kubectl wrapper

use dlc_core::{DlcError, DlcResult, EksConfig};
use dlc_runtime::{retry_until, BackgroundProcess, CommandRunner, CommandSpec, RetryConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A running `kubectl port-forward`
///
/// Dropping the guard stops the forward.
#[derive(Debug)]
pub struct PortForward {
    process: BackgroundProcess,
    host_port: u16,
}

impl PortForward {
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Stop forwarding
    pub async fn stop(self) -> DlcResult<()> {
        self.process.kill().await
    }
}

/// Issues kubectl commands against one namespace
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    namespace: String,
    readiness: RetryConfig,
}

impl Kubectl {
    pub fn new(runner: Arc<dyn CommandRunner>, namespace: impl Into<String>) -> Self {
        Self {
            runner,
            namespace: namespace.into(),
            readiness: RetryConfig::fixed(15, Duration::from_secs(30)),
        }
    }

    /// Create from the `[eks]` configuration table
    pub fn from_config(runner: Arc<dyn CommandRunner>, config: &EksConfig) -> Self {
        Self::new(runner, config.namespace.clone()).with_readiness(RetryConfig::fixed(
            config.readiness_attempts,
            Duration::from_secs(config.readiness_interval_secs),
        ))
    }

    /// Override the pod readiness polling policy
    pub fn with_readiness(mut self, readiness: RetryConfig) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new("kubectl")
    }

    /// `kubectl apply -f <path>`
    pub async fn apply(&self, manifest: &Path) -> DlcResult<()> {
        let spec = self
            .command()
            .arg("apply")
            .arg("-f")
            .arg(manifest.display().to_string())
            .args(["-n", self.namespace.as_str()]);
        self.runner.run(&spec).await?;
        info!(manifest = %manifest.display(), namespace = %self.namespace, "Applied manifest");
        Ok(())
    }

    pub async fn delete_deployment(&self, name: &str) -> DlcResult<()> {
        self.delete("deployment", name).await
    }

    pub async fn delete_service(&self, name: &str) -> DlcResult<()> {
        self.delete("service", name).await
    }

    async fn delete(&self, kind: &str, name: &str) -> DlcResult<()> {
        let spec = self
            .command()
            .args(["delete", kind, name, "-n", self.namespace.as_str()]);
        self.runner.run(&spec).await?;
        info!(kind = kind, name = name, "Deleted resource");
        Ok(())
    }

    /// Delete the deployment and the service named `name`
    ///
    /// Both deletions are attempted; the first failure is returned.
    pub async fn delete_deployment_and_service(&self, name: &str) -> DlcResult<()> {
        let deployment = self.delete_deployment(name).await;
        if let Err(e) = &deployment {
            warn!(name = name, error = %e, "Failed to delete deployment");
        }
        let service = self.delete_service(name).await;
        if let Err(e) = &service {
            warn!(name = name, error = %e, "Failed to delete service");
        }
        deployment.and(service)
    }

    async fn first_pod_field(&self, selector: &str, jsonpath: &str) -> DlcResult<String> {
        let spec = self
            .command()
            .args(["get", "pods", "-n", self.namespace.as_str()])
            .arg(format!("--selector=app={}", selector))
            .arg("-o")
            .arg(format!("jsonpath={{.items[0].{}}}", jsonpath))
            .warn();
        let output = self.runner.run(&spec).await?;
        // No pod is scheduled yet right after an apply
        if !output.success() {
            return Err(DlcError::NotReady(format!(
                "no pod for selector {}: {}",
                selector,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Phase of the first pod matching `app=<selector>`
    pub async fn pod_phase(&self, selector: &str) -> DlcResult<String> {
        self.first_pod_field(selector, "status.phase").await
    }

    /// Name of the first pod matching `app=<selector>`
    pub async fn pod_name(&self, selector: &str) -> DlcResult<String> {
        let name = self.first_pod_field(selector, "metadata.name").await?;
        if name.is_empty() {
            return Err(DlcError::NotReady(format!("no pod for selector {}", selector)));
        }
        Ok(name)
    }

    /// Poll until the first matching pod reports `Running`
    ///
    /// Errors once the readiness policy is exhausted.
    pub async fn is_service_running(&self, selector: &str) -> DlcResult<bool> {
        let what = format!("pod {} running", selector);
        let this = self;
        retry_until(&self.readiness, &what, move || async move {
            let phase = this.pod_phase(selector).await?;
            debug!(selector = selector, phase = %phase, "Pod phase");
            Ok(phase == "Running")
        })
        .await?;
        Ok(true)
    }

    /// Forward `host_port` on this host to `container_port` of the selected pod
    pub async fn forward_port(
        &self,
        selector: &str,
        host_port: u16,
        container_port: &str,
    ) -> DlcResult<PortForward> {
        let pod = self.pod_name(selector).await?;
        let spec = self
            .command()
            .args(["port-forward", "-n", self.namespace.as_str()])
            .arg(format!("pod/{}", pod))
            .arg(format!("{}:{}", host_port, container_port));
        let process = self.runner.spawn(&spec).await?;
        info!(pod = %pod, host_port = host_port, container_port = container_port, "Forwarding port");
        Ok(PortForward { process, host_port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlc_runtime::{CommandOutput, DryRunRunner};

    fn kubectl(runner: Arc<DryRunRunner>) -> Kubectl {
        Kubectl::new(runner, "default").with_readiness(RetryConfig::fixed(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_apply_and_delete() {
        let runner = Arc::new(DryRunRunner::new());
        let kubectl = kubectl(runner.clone());

        kubectl.apply(Path::new("/tmp/m.yaml")).await.unwrap();
        kubectl.delete_deployment_and_service("albert-cpu-4100").await.unwrap();

        assert_eq!(
            runner.history(),
            vec![
                "kubectl apply -f /tmp/m.yaml -n default",
                "kubectl delete deployment albert-cpu-4100 -n default",
                "kubectl delete service albert-cpu-4100 -n default",
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_attempts_service_after_deployment_failure() {
        let runner = Arc::new(DryRunRunner::new());
        runner.respond("delete deployment", CommandOutput::failed(1, "not found"));
        let kubectl = kubectl(runner.clone());

        let result = kubectl.delete_deployment_and_service("x").await;
        assert!(matches!(result, Err(DlcError::Command { .. })));
        assert_eq!(runner.commands_matching("delete service").len(), 1);
    }

    #[tokio::test]
    async fn test_waits_for_running() {
        let runner = Arc::new(DryRunRunner::new());
        runner
            .respond("status.phase", CommandOutput::ok("Pending"))
            .respond("status.phase", CommandOutput::ok("Running"));
        let kubectl = kubectl(runner.clone());

        assert!(kubectl.is_service_running("simple-neuron-4001").await.unwrap());
        assert_eq!(runner.commands_matching("status.phase").len(), 2);
        assert!(runner.history()[0].contains("--selector=app=simple-neuron-4001"));
    }

    #[tokio::test]
    async fn test_waits_for_pod_to_be_scheduled() {
        let runner = Arc::new(DryRunRunner::new());
        runner
            .respond(
                "status.phase",
                CommandOutput::failed(1, "array index out of bounds: index 0, length 0"),
            )
            .respond("status.phase", CommandOutput::ok("Running"));
        let kubectl = kubectl(runner.clone());

        assert!(kubectl
            .is_service_running("half-plus-two-service-cpu-4242")
            .await
            .unwrap());
        assert_eq!(runner.commands_matching("status.phase").len(), 2);
    }

    #[tokio::test]
    async fn test_unscheduled_pod_is_not_ready() {
        let runner = Arc::new(DryRunRunner::new());
        runner.respond("status.phase", CommandOutput::failed(1, "array index out of bounds"));
        let kubectl = kubectl(runner);

        let err = kubectl.pod_phase("albert-cpu-4100").await.unwrap_err();
        assert!(matches!(err, DlcError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_readiness_exhausted() {
        let runner = Arc::new(DryRunRunner::new());
        runner.respond("status.phase", CommandOutput::ok("Pending"));
        let kubectl = kubectl(runner.clone());

        let result = kubectl.is_service_running("stuck").await;
        assert!(matches!(result, Err(DlcError::RetryExhausted { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_forward_port() {
        let runner = Arc::new(DryRunRunner::new());
        runner.respond("metadata.name", CommandOutput::ok("albert-cpu-5000-abc12\n"));
        let kubectl = kubectl(runner.clone());

        let forward = kubectl.forward_port("albert-cpu-5000", 50000, "8500").await.unwrap();
        assert_eq!(forward.host_port(), 50000);
        assert_eq!(
            runner.commands_matching("port-forward"),
            vec!["kubectl port-forward -n default pod/albert-cpu-5000-abc12 50000:8500"]
        );
        forward.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_pod() {
        let runner = Arc::new(DryRunRunner::new());
        let kubectl = kubectl(runner);
        let err = kubectl.pod_name("nothing").await.unwrap_err();
        assert!(matches!(err, DlcError::NotReady(_)));
    }
}
