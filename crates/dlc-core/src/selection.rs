//! Build matrix selection
//!
//! Decides whether a builder runs at all (general vs. EI/Neuron dedicated
//! builders) and which buildspec images it builds.

use crate::buildspec::{Buildspec, ImageSpec};
use crate::config::BuildConfig;
use crate::environment::Environment;
use crate::{DlcError, DlcResult};
use tracing::{debug, info};

/// Value meaning "no filtering" for the CLI filters
pub const ALL: &str = "all";

/// A comma separated CLI filter, or `all`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Only(Vec<String>),
}

impl Filter {
    pub fn parse(value: &str) -> Self {
        if value == ALL {
            Filter::All
        } else {
            Filter::Only(
                value
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect(),
            )
        }
    }

    pub fn allows(&self, value: &str) -> bool {
        match self {
            Filter::All => true,
            Filter::Only(values) => values.iter().any(|v| v == value),
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::All
    }
}

/// Which builders are enabled for a framework in the current environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuilderGates {
    /// Regular (non-dedicated) builder
    pub general: bool,
    /// Elastic Inference dedicated builder
    pub ei: bool,
    /// Neuron dedicated builder
    pub neuron: bool,
    /// Outside PR context every builder builds
    pub non_pr_context: bool,
}

impl BuilderGates {
    pub fn evaluate(framework: &str, config: &BuildConfig, env: &Environment) -> Self {
        let framework_enabled = !config.is_framework_disabled(framework);

        let general = !env.ei_dedicated
            && !env.neuron_dedicated
            && !config.enable_ei_mode
            && !config.enable_neuron_mode
            && framework_enabled;
        let ei = env.ei_dedicated && config.enable_ei_mode && framework_enabled;
        let neuron = env.neuron_dedicated && config.enable_neuron_mode && framework_enabled;

        let gates = Self {
            general,
            ei,
            neuron,
            non_pr_context: !env.build_context.is_pr(),
        };
        debug!(framework = framework, ?gates, "Evaluated builder gates");
        gates
    }

    pub fn should_build(&self) -> bool {
        self.general || self.ei || self.neuron || self.non_pr_context
    }
}

/// Filters applied to the images of a buildspec
#[derive(Debug, Clone, Default)]
pub struct BuildSelection {
    pub framework: String,
    pub device_types: Filter,
    pub image_types: Filter,
    pub py_versions: Filter,
    /// Restrict to EI images (EI dedicated builder)
    pub ei_only: bool,
    /// Restrict to Neuron images (Neuron dedicated builder)
    pub neuron_only: bool,
    /// Restrict to Graviton images (`enable_graviton_mode`)
    pub graviton_only: bool,
}

impl BuildSelection {
    pub fn new(framework: &str, device_types: &str, image_types: &str, py_versions: &str) -> Self {
        Self {
            framework: framework.to_string(),
            device_types: Filter::parse(device_types),
            image_types: Filter::parse(image_types),
            py_versions: Filter::parse(py_versions),
            ei_only: false,
            neuron_only: false,
            graviton_only: false,
        }
    }

    /// Apply the developer build flags
    pub fn with_build_config(mut self, config: &BuildConfig) -> Self {
        self.graviton_only = config.enable_graviton_mode;
        self
    }

    /// Narrow to the device family of a dedicated builder
    pub fn with_gates(mut self, gates: &BuilderGates) -> Self {
        self.ei_only = gates.ei && !gates.general;
        self.neuron_only = gates.neuron && !gates.general;
        self
    }

    fn is_graviton(spec: &Buildspec, image: &ImageSpec) -> bool {
        image.device_type == "graviton"
            || image.tag.contains("graviton")
            || spec.repository_for(image).contains("graviton")
    }

    fn matches(&self, spec: &Buildspec, image: &ImageSpec) -> bool {
        if !image.build {
            return false;
        }
        if self.graviton_only && !Self::is_graviton(spec, image) {
            return false;
        }
        if self.ei_only && image.device_type != "eia" {
            return false;
        }
        if self.neuron_only && !image.device_type.starts_with("neuron") {
            return false;
        }
        self.device_types.allows(&image.device_type)
            && self.image_types.allows(&image.image_type)
            && self.py_versions.allows(&image.python_version)
    }

    /// Images of `spec` to build, in buildspec order
    pub fn select<'a>(&self, spec: &'a Buildspec) -> DlcResult<Vec<(&'a str, &'a ImageSpec)>> {
        if spec.framework != self.framework {
            return Err(DlcError::Buildspec(format!(
                "buildspec is for '{}' but '{}' was requested",
                spec.framework, self.framework
            )));
        }

        let selected: Vec<_> = spec
            .images
            .iter()
            .filter(|(_, image)| self.matches(spec, image))
            .map(|(name, image)| (name.as_str(), image))
            .collect();

        info!(
            framework = %self.framework,
            selected = selected.len(),
            total = spec.images.len(),
            "Selected images"
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::BuildContext;

    fn env(context: BuildContext, ei: bool, neuron: bool) -> Environment {
        Environment {
            build_context: context,
            ei_dedicated: ei,
            neuron_dedicated: neuron,
            ..Environment::default()
        }
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(Filter::parse("all"), Filter::All);
        assert_eq!(
            Filter::parse("cpu,gpu"),
            Filter::Only(vec!["cpu".to_string(), "gpu".to_string()])
        );
        assert!(Filter::parse("cpu,gpu").allows("gpu"));
        assert!(!Filter::parse("cpu").allows("gpu"));
        assert!(Filter::All.allows("anything"));
    }

    #[test]
    fn test_general_builder_in_pr() {
        let gates = BuilderGates::evaluate(
            "tensorflow",
            &BuildConfig::default(),
            &env(BuildContext::Pr, false, false),
        );
        assert!(gates.general);
        assert!(!gates.ei);
        assert!(!gates.neuron);
        assert!(gates.should_build());
    }

    #[test]
    fn test_disabled_framework_in_pr() {
        let config = BuildConfig {
            disable_framework_tests: vec!["mxnet".to_string()],
            ..BuildConfig::default()
        };
        let gates = BuilderGates::evaluate("mxnet", &config, &env(BuildContext::Pr, false, false));
        assert!(!gates.should_build());
    }

    #[test]
    fn test_ei_mode_disables_general_builder() {
        let config = BuildConfig {
            enable_ei_mode: true,
            ..BuildConfig::default()
        };
        let general = BuilderGates::evaluate("mxnet", &config, &env(BuildContext::Pr, false, false));
        assert!(!general.should_build());

        let dedicated = BuilderGates::evaluate("mxnet", &config, &env(BuildContext::Pr, true, false));
        assert!(dedicated.ei);
        assert!(dedicated.should_build());
    }

    #[test]
    fn test_dedicated_builder_without_mode_is_idle_in_pr() {
        let gates = BuilderGates::evaluate(
            "tensorflow",
            &BuildConfig::default(),
            &env(BuildContext::Pr, false, true),
        );
        assert!(!gates.general);
        assert!(!gates.neuron);
        assert!(!gates.should_build());
    }

    #[test]
    fn test_non_pr_context_always_builds() {
        let config = BuildConfig {
            disable_framework_tests: vec!["pytorch".to_string()],
            ..BuildConfig::default()
        };
        let gates = BuilderGates::evaluate("pytorch", &config, &env(BuildContext::Mainline, true, false));
        assert!(!gates.general && !gates.ei && !gates.neuron);
        assert!(gates.should_build());

        let unset = BuilderGates::evaluate("pytorch", &config, &env(BuildContext::Unset, false, false));
        assert!(unset.should_build());
    }

    const SPEC: &str = r#"
account_id: "1"
region: us-west-2
framework: tensorflow
version: 2.13.0
images:
  cpu:
    build: true
    image_type: inference
    device_type: cpu
    python_version: py3
    tag: 2.13.0-cpu-py310
    docker_file: Dockerfile.cpu
  gpu:
    build: true
    image_type: training
    device_type: gpu
    python_version: py3
    tag: 2.13.0-gpu-py310
    docker_file: Dockerfile.gpu
  neuron:
    build: true
    image_type: inference
    device_type: neuron
    python_version: py3
    tag: 2.10.1-neuron-py310
    docker_file: Dockerfile.neuron
  graviton:
    build: true
    image_type: inference
    device_type: cpu
    python_version: py3
    repository: tensorflow-inference-graviton
    tag: 2.13.0-cpu-py310-ubuntu20.04-ec2
    docker_file: Dockerfile.graviton
  skipped:
    build: false
    image_type: inference
    device_type: cpu
    python_version: py3
    tag: 2.13.0-cpu-py39
    docker_file: Dockerfile.cpu
"#;

    fn names(selected: &[(&str, &ImageSpec)]) -> Vec<String> {
        selected.iter().map(|(n, _)| n.to_string()).collect()
    }

    #[test]
    fn test_select_filters() {
        let spec = Buildspec::parse(SPEC, |_| None).unwrap();

        let all = BuildSelection::new("tensorflow", "all", "all", "all");
        assert_eq!(names(&all.select(&spec).unwrap()), vec!["cpu", "gpu", "graviton", "neuron"]);

        let inference_cpu = BuildSelection::new("tensorflow", "cpu", "inference", "all");
        assert_eq!(names(&inference_cpu.select(&spec).unwrap()), vec!["cpu", "graviton"]);

        let py2 = BuildSelection::new("tensorflow", "all", "all", "py2");
        assert!(py2.select(&spec).unwrap().is_empty());
    }

    #[test]
    fn test_select_neuron_dedicated() {
        let spec = Buildspec::parse(SPEC, |_| None).unwrap();
        let config = BuildConfig {
            enable_neuron_mode: true,
            ..BuildConfig::default()
        };
        let gates = BuilderGates::evaluate("tensorflow", &config, &env(BuildContext::Pr, false, true));
        let selection = BuildSelection::new("tensorflow", "all", "all", "all").with_gates(&gates);
        assert_eq!(names(&selection.select(&spec).unwrap()), vec!["neuron"]);
    }

    #[test]
    fn test_select_graviton_mode() {
        let spec = Buildspec::parse(SPEC, |_| None).unwrap();
        let config = BuildConfig {
            enable_graviton_mode: true,
            ..BuildConfig::default()
        };
        let selection = BuildSelection::new("tensorflow", "all", "all", "all").with_build_config(&config);
        assert_eq!(names(&selection.select(&spec).unwrap()), vec!["graviton"]);

        let off = BuildSelection::new("tensorflow", "all", "all", "all")
            .with_build_config(&BuildConfig::default());
        assert_eq!(off.select(&spec).unwrap().len(), 4);
    }

    #[test]
    fn test_select_framework_mismatch() {
        let spec = Buildspec::parse(SPEC, |_| None).unwrap();
        let selection = BuildSelection::new("pytorch", "all", "all", "all");
        assert!(matches!(selection.select(&spec), Err(DlcError::Buildspec(_))));
    }
}
