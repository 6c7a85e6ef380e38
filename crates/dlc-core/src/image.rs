//! Image URI parsing
//!
//! Framework, version and processor are inferred from naming conventions of
//! ECR image URIs such as
//! `123456789012.dkr.ecr.us-west-2.amazonaws.com/tensorflow-inference:2.13.0-gpu-py310-cu118-ubuntu20.04-ec2`.

use crate::version::FrameworkVersion;
use crate::{DlcError, DlcResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Frameworks in match order; longer names shadow their prefixes
pub const KNOWN_FRAMEWORKS: &[&str] = &[
    "huggingface-tensorflow-trcomp",
    "huggingface-pytorch-trcomp",
    "huggingface-tensorflow",
    "huggingface-pytorch",
    "stabilityai-pytorch",
    "pytorch-trcomp",
    "autogluon",
    "mxnet",
    "pytorch",
    "tensorflow",
];

/// Hardware family an image is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Processor {
    Neuronx,
    Neuron,
    Eia,
    Gpu,
    Cpu,
    Hpu,
}

impl Processor {
    /// Precedence when several markers appear; graviton is not a processor
    const SEARCH_ORDER: [Processor; 6] = [
        Processor::Neuronx,
        Processor::Neuron,
        Processor::Eia,
        Processor::Gpu,
        Processor::Cpu,
        Processor::Hpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Processor::Eia => "eia",
            Processor::Neuronx => "neuronx",
            Processor::Neuron => "neuron",
            Processor::Cpu => "cpu",
            Processor::Gpu => "gpu",
            Processor::Hpu => "hpu",
        }
    }

    /// Neuron and NeuronX both run on Inferentia/Trainium hosts
    pub fn is_neuron(&self) -> bool {
        matches!(self, Processor::Neuron | Processor::Neuronx)
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Processor {
    type Err = DlcError;

    fn from_str(s: &str) -> DlcResult<Self> {
        Self::SEARCH_ORDER
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| DlcError::InvalidImage(format!("unknown processor '{}'", s)))
    }
}

/// Training or inference image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkType {
    Training,
    Inference,
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkType::Training => write!(f, "training"),
            WorkType::Inference => write!(f, "inference"),
        }
    }
}

/// A parsed `registry/repository:tag` reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUri {
    /// Registry host (e.g. `123.dkr.ecr.us-west-2.amazonaws.com`), if any
    pub registry: Option<String>,
    /// Repository name
    pub repository: String,
    /// Image tag
    pub tag: String,
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(\.\d+){1,2}").expect("static regex"))
}

fn python_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"py\d+").expect("static regex"))
}

impl ImageUri {
    /// Build an ECR URI
    pub fn ecr(account_id: &str, region: &str, repository: &str, tag: &str) -> Self {
        Self {
            registry: Some(format!("{}.dkr.ecr.{}.amazonaws.com", account_id, region)),
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Framework name from the repository
    pub fn framework(&self) -> DlcResult<&'static str> {
        KNOWN_FRAMEWORKS
            .iter()
            .copied()
            .find(|f| self.repository.contains(f))
            .ok_or_else(|| {
                DlcError::InvalidImage(format!("cannot find framework in {}", self))
            })
    }

    /// First dotted version found in the tag
    pub fn framework_version(&self) -> DlcResult<FrameworkVersion> {
        version_regex()
            .find(&self.tag)
            .ok_or_else(|| DlcError::InvalidImage(format!("cannot find version in tag '{}'", self.tag)))?
            .as_str()
            .parse()
    }

    /// Framework and version as found in the URI
    pub fn framework_and_version(&self) -> DlcResult<(&'static str, FrameworkVersion)> {
        Ok((self.framework()?, self.framework_version()?))
    }

    /// Processor from the first `-<processor>` marker
    pub fn processor(&self) -> DlcResult<Processor> {
        let full = self.to_string();
        Processor::SEARCH_ORDER
            .iter()
            .copied()
            .find(|p| full.contains(&format!("-{}", p.as_str())))
            .ok_or_else(|| DlcError::InvalidImage(format!("cannot find processor in {}", full)))
    }

    pub fn is_graviton(&self) -> bool {
        self.to_string().contains("graviton")
    }

    pub fn is_gpu(&self) -> bool {
        self.to_string().contains("gpu")
    }

    pub fn is_neuron(&self) -> bool {
        self.to_string().contains("neuron")
    }

    pub fn work_type(&self) -> WorkType {
        if self.to_string().contains("training") {
            WorkType::Training
        } else {
            WorkType::Inference
        }
    }

    /// Python tag such as `py310`, defaulting to `py3`
    pub fn python_version(&self) -> String {
        python_regex()
            .find(&self.tag)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "py3".to_string())
    }

    /// Whether the image's framework version is strictly below `bound`
    ///
    /// Returns false when the image is not of `framework`.
    pub fn is_below_framework_version(&self, bound: &str, framework: &str) -> DlcResult<bool> {
        let (image_framework, version) = self.framework_and_version()?;
        if image_framework != framework {
            return Ok(false);
        }
        let bound: FrameworkVersion = bound.parse()?;
        Ok(version < bound)
    }

    /// Node-selector label used by EKS manifests
    pub fn eks_test_type_label(&self) -> &'static str {
        if self.is_graviton() {
            "graviton"
        } else {
            "default"
        }
    }
}

impl FromStr for ImageUri {
    type Err = DlcError;

    fn from_str(s: &str) -> DlcResult<Self> {
        let s = s.trim();
        let (path, tag) = match s.rfind(':') {
            Some(idx) if !s[idx + 1..].contains('/') => (&s[..idx], &s[idx + 1..]),
            _ => return Err(DlcError::InvalidImage(format!("missing tag in '{}'", s))),
        };
        if tag.is_empty() || path.is_empty() {
            return Err(DlcError::InvalidImage(format!("malformed image '{}'", s)));
        }
        let (registry, repository) = match path.split_once('/') {
            Some((host, repo)) if host.contains('.') || host.contains(':') => {
                (Some(host.to_string()), repo.to_string())
            }
            _ => (None, path.to_string()),
        };
        Ok(Self {
            registry,
            repository,
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.registry {
            Some(registry) => write!(f, "{}/{}:{}", registry, self.repository, self.tag),
            None => write!(f, "{}:{}", self.repository, self.tag),
        }
    }
}
