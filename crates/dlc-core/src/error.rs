//! Error types for the harness

use thiserror::Error;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum DlcError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Buildspec could not be parsed or resolved
    #[error("Buildspec error: {0}")]
    Buildspec(String),

    /// Image URI or tag could not be interpreted
    #[error("Invalid image URI: {0}")]
    InvalidImage(String),

    /// External command failed
    #[error("Command `{command}` failed with exit code {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    /// External command could not be started
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// Docker build or push failure
    #[error("Docker error: {0}")]
    Docker(String),

    /// Kubernetes resource is not ready yet
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Template rendering error
    #[error("Template error: {0}")]
    Template(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Inference request returned an unexpected result
    #[error("Inference error: {0}")]
    Inference(String),

    /// Benchmark result did not meet its threshold
    #[error("Threshold not met: {0}")]
    Threshold(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Retries exhausted
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DlcError {
    /// Whether a retry has a chance of succeeding
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DlcError::Network(_) | DlcError::NotReady(_) | DlcError::Timeout(_) | DlcError::Inference(_)
        )
    }
}

/// Result type for harness operations
pub type DlcResult<T> = Result<T, DlcError>;

impl From<serde_json::Error> for DlcError {
    fn from(err: serde_json::Error) -> Self {
        DlcError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for DlcError {
    fn from(err: serde_yaml::Error) -> Self {
        DlcError::Buildspec(err.to_string())
    }
}

impl From<toml::de::Error> for DlcError {
    fn from(err: toml::de::Error) -> Self {
        DlcError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for DlcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DlcError::Timeout(err.to_string())
        } else {
            DlcError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DlcError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");

        let err = DlcError::Command {
            command: "kubectl apply -f x.yaml".to_string(),
            code: 1,
            stderr: "no such file".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command `kubectl apply -f x.yaml` failed with exit code 1: no such file"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DlcError = io_err.into();
        assert!(matches!(err, DlcError::Io(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(DlcError::NotReady("pod".to_string()).is_retryable());
        assert!(DlcError::Network("refused".to_string()).is_retryable());
        assert!(!DlcError::Config("bad".to_string()).is_retryable());
        assert!(!DlcError::Threshold("slow".to_string()).is_retryable());
    }
}
