//! Environment variable gates

use serde::{Deserialize, Serialize};

/// CI context the harness runs in, from `BUILD_CONTEXT`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildContext {
    /// Pull request build
    Pr,
    /// Mainline (release) build
    Mainline,
    /// Nightly build
    Nightly,
    /// Developer build
    Dev,
    /// Any other value
    Other(String),
    /// Not set
    Unset,
}

impl BuildContext {
    /// Parse the value of `BUILD_CONTEXT`
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            None => BuildContext::Unset,
            Some("PR") => BuildContext::Pr,
            Some("MAINLINE") => BuildContext::Mainline,
            Some("NIGHTLY") => BuildContext::Nightly,
            Some("DEV") => BuildContext::Dev,
            Some(other) => BuildContext::Other(other.to_string()),
        }
    }

    pub fn is_pr(&self) -> bool {
        matches!(self, BuildContext::Pr)
    }
}

impl std::fmt::Display for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildContext::Pr => write!(f, "PR"),
            BuildContext::Mainline => write!(f, "MAINLINE"),
            BuildContext::Nightly => write!(f, "NIGHTLY"),
            BuildContext::Dev => write!(f, "DEV"),
            BuildContext::Other(v) => write!(f, "{}", v),
            BuildContext::Unset => write!(f, "<unset>"),
        }
    }
}

/// Snapshot of the environment variables the harness reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub build_context: BuildContext,
    /// `EIA_DEDICATED == "True"`
    pub ei_dedicated: bool,
    /// `NEURON_DEDICATED == "True"`
    pub neuron_dedicated: bool,
    /// `NIGHTLY_PR_TEST_MODE == "true"`
    pub nightly_pr_test_mode: bool,
    /// Commit being built, used to name benchmark logs
    pub source_version: String,
}

impl Environment {
    /// Read from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            build_context: BuildContext::parse(lookup("BUILD_CONTEXT").as_deref()),
            ei_dedicated: lookup("EIA_DEDICATED").as_deref() == Some("True"),
            neuron_dedicated: lookup("NEURON_DEDICATED").as_deref() == Some("True"),
            nightly_pr_test_mode: lookup("NIGHTLY_PR_TEST_MODE")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            source_version: lookup("CODEBUILD_RESOLVED_SOURCE_VERSION")
                .unwrap_or_else(|| "local".to_string()),
        }
    }

    /// Nightly runs enable additional models
    pub fn is_nightly_context(&self) -> bool {
        self.build_context == BuildContext::Nightly || self.nightly_pr_test_mode
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
