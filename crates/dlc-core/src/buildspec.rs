//! Buildspec model
//!
//! A buildspec is a YAML document enumerating the image variants of one
//! framework version. Anchors, aliases and `<<` merge keys are honoured, the
//! `!join [a, b]` tag concatenates scalars, and values such as
//! `<set-$ACCOUNT_ID-in-environment>` are filled from the environment.

use crate::image::ImageUri;
use crate::{DlcError, DlcResult};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Parsed buildspec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buildspec {
    /// AWS account owning the ECR repositories
    pub account_id: String,
    /// ECR region
    pub region: String,
    /// Framework name (e.g. "tensorflow")
    pub framework: String,
    /// Full framework version (e.g. "2.13.0")
    pub version: String,
    /// Short version (e.g. "2.13")
    #[serde(default)]
    pub short_version: Option<String>,
    /// Default repository for every image
    #[serde(default)]
    pub repository: Option<String>,
    /// Images keyed by name
    pub images: BTreeMap<String, ImageSpec>,
    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub root: PathBuf,
}

/// One image variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Whether this image is built at all
    #[serde(default)]
    pub build: bool,
    /// "training" or "inference"
    pub image_type: String,
    /// Device family (cpu, gpu, neuron, neuronx, eia, graviton, ...)
    pub device_type: String,
    /// Docker python version (e.g. "py3")
    pub python_version: String,
    /// Python version used in the tag (e.g. "py310")
    #[serde(default)]
    pub tag_python_version: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    /// Image tag
    pub tag: String,
    /// Dockerfile path
    pub docker_file: PathBuf,
    /// Multi-stage build target
    #[serde(default)]
    pub target: Option<String>,
    /// Repository override for this image
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default, deserialize_with = "scalar_map")]
    pub build_args: BTreeMap<String, String>,
    /// Files copied into the build context
    #[serde(default)]
    pub context: BTreeMap<String, ContextArtifact>,
    /// Expected image size in MB
    #[serde(default)]
    pub image_size_baseline: Option<u64>,
    /// Explicit test types for this image
    #[serde(default)]
    pub test_platforms: Vec<String>,
}

/// A file placed into the Docker build context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextArtifact {
    /// Source path, relative to the buildspec directory
    pub source: PathBuf,
    /// File name inside the build context
    pub target: String,
}

impl Buildspec {
    /// Load a buildspec file, resolving placeholders from the process environment
    pub fn from_file(path: &Path) -> DlcResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DlcError::Buildspec(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut spec = Self::parse(&content, |key| std::env::var(key).ok())?;
        spec.root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(spec)
    }

    /// Parse buildspec YAML with an explicit environment lookup
    pub fn parse<F>(content: &str, lookup: F) -> DlcResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut value: Value = serde_yaml::from_str(content)?;
        resolve_env_placeholders(&mut value, &lookup)?;
        resolve_tags(&mut value)?;
        apply_merge_keys(&mut value);

        let spec: Buildspec = serde_yaml::from_value(value)?;
        spec.validate()?;
        debug!(
            framework = %spec.framework,
            version = %spec.version,
            images = spec.images.len(),
            "Parsed buildspec"
        );
        Ok(spec)
    }

    fn validate(&self) -> DlcResult<()> {
        if self.framework.is_empty() {
            return Err(DlcError::Buildspec("framework must not be empty".to_string()));
        }
        for (name, image) in &self.images {
            if image.tag.is_empty() {
                return Err(DlcError::Buildspec(format!("image '{}' has an empty tag", name)));
            }
        }
        Ok(())
    }

    /// Repository an image is pushed to
    pub fn repository_for(&self, image: &ImageSpec) -> String {
        image
            .repository
            .clone()
            .or_else(|| self.repository.clone())
            .unwrap_or_else(|| format!("{}-{}", self.framework, image.image_type))
    }

    /// Full ECR URI of an image
    pub fn image_uri(&self, image: &ImageSpec) -> ImageUri {
        ImageUri::ecr(
            &self.account_id,
            &self.region,
            &self.repository_for(image),
            &image.tag,
        )
    }

    /// Resolve a path from the buildspec against its directory
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<set-\$([A-Za-z0-9_]+)-in-environment>").expect("static regex"))
}

fn resolve_env_placeholders<F>(value: &mut Value, lookup: &F) -> DlcResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            if !placeholder_regex().is_match(s.as_str()) {
                return Ok(());
            }
            let mut missing = None;
            let replaced = placeholder_regex().replace_all(s.as_str(), |caps: &regex::Captures| {
                let key = &caps[1];
                lookup(key).unwrap_or_else(|| {
                    missing = Some(key.to_string());
                    String::new()
                })
            });
            if let Some(key) = missing {
                return Err(DlcError::Buildspec(format!(
                    "environment variable {} is required by the buildspec",
                    key
                )));
            }
            *s = replaced.into_owned();
            Ok(())
        }
        Value::Sequence(items) => items
            .iter_mut()
            .try_for_each(|item| resolve_env_placeholders(item, lookup)),
        Value::Mapping(map) => map
            .iter_mut()
            .try_for_each(|(_, v)| resolve_env_placeholders(v, lookup)),
        Value::Tagged(tagged) => resolve_env_placeholders(&mut tagged.value, lookup),
        _ => Ok(()),
    }
}

fn scalar_to_string(value: &Value) -> DlcResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(DlcError::Buildspec(format!(
            "expected a scalar, found {:?}",
            other
        ))),
    }
}

fn resolve_tags(value: &mut Value) -> DlcResult<()> {
    match value {
        Value::Sequence(items) => items.iter_mut().try_for_each(resolve_tags),
        Value::Mapping(map) => map.iter_mut().try_for_each(|(_, v)| resolve_tags(v)),
        Value::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            let tag = tag.trim_start_matches('!');
            resolve_tags(&mut tagged.value)?;
            match (tag, &tagged.value) {
                ("join", Value::Sequence(items)) => {
                    let joined = items
                        .iter()
                        .map(scalar_to_string)
                        .collect::<DlcResult<Vec<_>>>()?
                        .concat();
                    *value = Value::String(joined);
                    Ok(())
                }
                ("join", _) => Err(DlcError::Buildspec("!join expects a list".to_string())),
                (other, _) => Err(DlcError::Buildspec(format!("unsupported tag !{}", other))),
            }
        }
        _ => Ok(()),
    }
}

/// Fold `<<` entries into their mapping; explicit keys win
fn apply_merge_keys(value: &mut Value) {
    match value {
        Value::Sequence(items) => items.iter_mut().for_each(apply_merge_keys),
        Value::Mapping(map) => {
            let merge_key = Value::String("<<".to_string());
            if let Some(merged) = map.remove(&merge_key) {
                let sources: Vec<Mapping> = match merged {
                    Value::Mapping(m) => vec![m],
                    Value::Sequence(items) => items
                        .into_iter()
                        .filter_map(|i| match i {
                            Value::Mapping(m) => Some(m),
                            _ => None,
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                for source in sources {
                    for (k, v) in source {
                        if !map.contains_key(&k) {
                            map.insert(k, v);
                        }
                    }
                }
            }
            map.iter_mut().for_each(|(_, v)| apply_merge_keys(v));
        }
        _ => {}
    }
}

fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Value> = BTreeMap::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| {
            scalar_to_string(&v)
                .map(|s| (k, s))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}
