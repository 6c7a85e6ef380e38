//! Configuration types for the harness

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "dlc.toml";

/// Top-level harness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Developer build flags
    pub build: BuildConfig,
    /// File system locations
    pub paths: PathsConfig,
    /// EKS test settings
    pub eks: EksConfig,
    /// Benchmark settings
    pub benchmark: BenchmarkConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl HarnessConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, crate::DlcError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::DlcError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::DlcError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load the explicit file if given, else `dlc.toml` when present, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self, crate::DlcError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::from_file(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

/// Developer-controlled build flags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Build Elastic Inference images only (with EIA_DEDICATED builders)
    pub enable_ei_mode: bool,
    /// Build Neuron images only (with NEURON_DEDICATED builders)
    pub enable_neuron_mode: bool,
    /// Build Graviton images only
    pub enable_graviton_mode: bool,
    /// Frameworks whose builds and tests are switched off
    pub disable_framework_tests: Vec<String>,
    /// Skip SageMaker test scheduling
    pub disable_sagemaker_tests: bool,
    /// Fraction an image may grow over its size baseline
    pub image_size_tolerance: f64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enable_ei_mode: false,
            enable_neuron_mode: false,
            enable_graviton_mode: false,
            disable_framework_tests: Vec::new(),
            disable_sagemaker_tests: false,
            image_size_tolerance: 0.2,
        }
    }
}

impl BuildConfig {
    /// Whether builds and tests for a framework are switched off
    pub fn is_framework_disabled(&self, framework: &str) -> bool {
        self.disable_framework_tests.iter().any(|f| f == framework)
    }
}

/// File system locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Output file mapping test types to built images
    pub test_type_images: PathBuf,
    /// Root directory of EKS manifest templates
    pub eks_templates: PathBuf,
    /// Scratch directory for Docker build contexts
    pub build_root: PathBuf,
    /// Directory for rendered manifests
    pub manifests: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            test_type_images: PathBuf::from("test_type_images.json"),
            eks_templates: PathBuf::from("test/dlc_tests/eks/eks_manifest_templates"),
            build_root: std::env::temp_dir().join("dlc-build"),
            manifests: PathBuf::from("/tmp"),
        }
    }
}

/// EKS test settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EksConfig {
    /// Kubernetes namespace for test deployments
    pub namespace: String,
    /// Attempts when waiting for a pod to reach Running
    pub readiness_attempts: u32,
    /// Seconds between readiness polls
    pub readiness_interval_secs: u64,
    /// Attempts for inference requests
    pub inference_attempts: u32,
    /// Seconds between inference attempts
    pub inference_interval_secs: u64,
    /// Bucket hosting TensorFlow test models
    pub tensorflow_models_bucket: String,
}

impl Default for EksConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            readiness_attempts: 15,
            readiness_interval_secs: 30,
            inference_attempts: 10,
            inference_interval_secs: 10,
            tensorflow_models_bucket: "s3://tensoflow-trained-models".to_string(),
        }
    }
}

/// Benchmark settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// Bucket receiving benchmark logs
    pub results_bucket: String,
    /// AWS region for ECR login
    pub region: String,
    /// Directory on the instance holding container test scripts
    pub container_tests_dir: String,
    /// Mount point of the test scripts inside the container
    pub container_tests_prefix: String,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            results_bucket: "s3://dlinfra-dlc-cicd-performance".to_string(),
            region: "us-west-2".to_string(),
            container_tests_dir: "$HOME/container_tests".to_string(),
            container_tests_prefix: "/test/bin".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert!(!config.build.enable_ei_mode);
        assert_eq!(config.eks.readiness_attempts, 15);
        assert_eq!(config.eks.namespace, "default");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_config_parse() {
        let toml_str = r#"
[build]
enable_neuron_mode = true
disable_framework_tests = ["mxnet"]

[eks]
readiness_attempts = 3
"#;
        let config: HarnessConfig = toml::from_str(toml_str).unwrap();
        assert!(config.build.enable_neuron_mode);
        assert!(config.build.is_framework_disabled("mxnet"));
        assert!(!config.build.is_framework_disabled("pytorch"));
        assert_eq!(config.eks.readiness_attempts, 3);
        assert_eq!(config.eks.readiness_interval_secs, 30);
        assert_eq!(config.build.image_size_tolerance, 0.2);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();

        let config = HarnessConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_load_missing_file() {
        let result = HarnessConfig::from_file(Path::new("/nonexistent/dlc.toml"));
        assert!(matches!(result, Err(crate::DlcError::Config(_))));
    }
}
