//! Single-node TensorFlow inference scenarios on EKS
//!
//! Each run renders a manifest, deploys it, waits for the pod, forwards a
//! local port, sends one inference request and always removes the
//! deployment and service afterwards.

use dlc_core::{DlcError, DlcResult, EksConfig, Environment, ImageUri, Processor};
use rand::Rng;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

use crate::kubectl::Kubectl;
use crate::serving::{self, TfServingClient};
use crate::template::{self, Replacements};
use crate::tensorflow;

/// Model served by a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Neuron,
    NeuronX,
    HalfPlusTwo,
    Albert,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::Neuron,
        Scenario::NeuronX,
        Scenario::HalfPlusTwo,
        Scenario::Albert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Neuron => "neuron",
            Scenario::NeuronX => "neuronx",
            Scenario::HalfPlusTwo => "half-plus-two",
            Scenario::Albert => "albert",
        }
    }

    /// Processor label used in names and the template path
    pub fn processor(&self, image: &ImageUri) -> Processor {
        match self {
            Scenario::Neuron => Processor::Neuron,
            Scenario::NeuronX => Processor::Neuronx,
            _ if image.is_gpu() => Processor::Gpu,
            _ => Processor::Cpu,
        }
    }

    pub fn model_name(&self, processor: Processor) -> String {
        match self {
            Scenario::Neuron => "mnist_neuron".to_string(),
            Scenario::NeuronX => "simple_neuronx".to_string(),
            Scenario::HalfPlusTwo => format!("saved_model_half_plus_two_{}", processor),
            Scenario::Albert => "albert".to_string(),
        }
    }

    /// Deployment, service and pod label name
    pub fn selector_name(&self, processor: Processor, suffix: u32) -> String {
        match self {
            Scenario::Neuron | Scenario::NeuronX => format!("simple-{}-{}", processor, suffix),
            Scenario::HalfPlusTwo => format!("half-plus-two-service-{}-{}", processor, suffix),
            Scenario::Albert => format!("albert-{}-{}", processor, suffix),
        }
    }

    /// Container port exposing the REST API
    pub fn container_port(&self) -> &'static str {
        match self {
            Scenario::Neuron | Scenario::NeuronX => "8501",
            Scenario::HalfPlusTwo | Scenario::Albert => "8500",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Scenario::Neuron => serving::mnist_payload(),
            Scenario::NeuronX => serving::neuronx_payload(),
            Scenario::HalfPlusTwo => serving::half_plus_two_payload(),
            Scenario::Albert => serving::nlp_payload(),
        }
    }

    /// Reason to skip this scenario for `image`, if any
    pub fn skip_reason(&self, image: &ImageUri, env: &Environment) -> Option<String> {
        match self {
            Scenario::NeuronX => {
                Some("Will be enabled once infrastructure changes are made".to_string())
            }
            Scenario::Neuron if !image.is_neuron() => {
                Some(format!("{} is not a neuron image", image))
            }
            Scenario::HalfPlusTwo | Scenario::Albert if image.is_neuron() => {
                Some(format!("{} is a neuron image", image))
            }
            Scenario::Albert if !image.is_graviton() && !env.is_nightly_context() => {
                Some("Running additional model in nightly context only".to_string())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = DlcError;

    fn from_str(s: &str) -> DlcResult<Self> {
        Scenario::ALL
            .iter()
            .copied()
            .find(|scenario| scenario.as_str() == s)
            .ok_or_else(|| DlcError::Config(format!("unknown EKS scenario '{}'", s)))
    }
}

/// Randomized names for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub processor: Processor,
    pub model_name: String,
    pub selector_name: String,
    pub manifest: PathBuf,
    pub host_port: u16,
}

/// Outcome of a scenario run
#[derive(Debug)]
pub enum Outcome {
    Passed(Value),
    Skipped(String),
}

/// Runs scenarios against a cluster
pub struct EksTensorflowTest {
    kubectl: Kubectl,
    client: TfServingClient,
    templates_root: PathBuf,
    manifests_dir: PathBuf,
    models_bucket: String,
}

impl EksTensorflowTest {
    pub fn new(
        kubectl: Kubectl,
        client: TfServingClient,
        templates_root: impl Into<PathBuf>,
        manifests_dir: impl Into<PathBuf>,
        config: &EksConfig,
    ) -> Self {
        Self {
            kubectl,
            client,
            templates_root: templates_root.into(),
            manifests_dir: manifests_dir.into(),
            models_bucket: config.tensorflow_models_bucket.clone(),
        }
    }

    /// Pick the random suffix, port and manifest path for a run
    pub fn plan(&self, scenario: Scenario, image: &ImageUri) -> Deployment {
        let (suffix, host_port) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(4001..=6000u32), rng.gen_range(49152..=65535u16))
        };
        let processor = scenario.processor(image);
        Deployment {
            processor,
            model_name: scenario.model_name(processor),
            selector_name: scenario.selector_name(processor, suffix),
            manifest: self.manifests_dir.join(format!(
                "tensorflow_single_node_{}_inference_{}.yaml",
                processor, suffix
            )),
            host_port,
        }
    }

    /// Manifest placeholder values for a run
    pub fn replacements(
        &self,
        scenario: Scenario,
        image: &ImageUri,
        deployment: &Deployment,
    ) -> DlcResult<Replacements> {
        let base_path = tensorflow::eks_tensorflow_model_base_path(
            image,
            &deployment.model_name,
            &self.models_bucket,
        )?;
        let (command, args) = tensorflow::tensorflow_command_args(
            image,
            &deployment.model_name,
            &base_path,
            &self.models_bucket,
        )?;

        let mut values = template::replacements([
            ("NUM_REPLICAS", "1".to_string()),
            ("SELECTOR_NAME", deployment.selector_name.clone()),
            ("INFERENCE_SERVICE_NAME", deployment.selector_name.clone()),
            ("DOCKER_IMAGE_BUILD_ID", image.to_string()),
            ("COMMAND", command),
            ("ARGS", args),
        ]);
        match scenario {
            Scenario::Neuron | Scenario::NeuronX => {
                values.insert("<NUM_INF1S>".to_string(), "1".to_string());
            }
            Scenario::HalfPlusTwo | Scenario::Albert => {
                values.insert(
                    "<TEST_TYPE>".to_string(),
                    image.eks_test_type_label().to_string(),
                );
                if deployment.processor == Processor::Gpu {
                    values.insert("<NUM_GPUS>".to_string(), "1".to_string());
                }
            }
        }
        Ok(values)
    }

    /// Run `scenario` unless it is skipped for this image and environment
    pub async fn run(
        &self,
        scenario: Scenario,
        image: &ImageUri,
        env: &Environment,
    ) -> DlcResult<Outcome> {
        if let Some(reason) = scenario.skip_reason(image, env) {
            info!(scenario = %scenario, reason = %reason, "Skipping scenario");
            return Ok(Outcome::Skipped(reason));
        }

        let deployment = self.plan(scenario, image);
        let values = self.replacements(scenario, image, &deployment)?;
        let template_path = template::single_node_inference_template_path(
            &self.templates_root,
            "tensorflow",
            deployment.processor,
        );
        template::write_eks_yaml_file_from_template(&template_path, &deployment.manifest, &values)?;

        info!(
            scenario = %scenario,
            selector = %deployment.selector_name,
            manifest = %deployment.manifest.display(),
            "Deploying"
        );

        let result = self.deploy_and_infer(scenario, &deployment).await;
        let cleanup = self
            .kubectl
            .delete_deployment_and_service(&deployment.selector_name)
            .await;

        match (result, cleanup) {
            (Ok(output), Ok(())) => Ok(Outcome::Passed(output)),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), cleanup) => {
                if let Err(cleanup_error) = cleanup {
                    warn!(error = %cleanup_error, "Cleanup failed after test failure");
                }
                Err(e)
            }
        }
    }

    async fn deploy_and_infer(&self, scenario: Scenario, deployment: &Deployment) -> DlcResult<Value> {
        self.kubectl.apply(&deployment.manifest).await?;
        self.kubectl
            .is_service_running(&deployment.selector_name)
            .await?;

        let forward = self
            .kubectl
            .forward_port(
                &deployment.selector_name,
                deployment.host_port,
                scenario.container_port(),
            )
            .await?;

        let output = self
            .client
            .request_tensorflow_inference(
                &deployment.model_name,
                forward.host_port(),
                &scenario.payload(),
            )
            .await;

        if let Err(e) = forward.stop().await {
            warn!(error = %e, "Failed to stop port forward");
        }
        output
    }
}
