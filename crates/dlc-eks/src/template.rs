//! Kubernetes manifest templates
//!
//! Templates carry `<UPPER_SNAKE>` placeholders that are replaced verbatim.

use dlc_core::{DlcError, DlcResult, Processor};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Placeholder to value, keyed by the full token including angle brackets
pub type Replacements = BTreeMap<String, String>;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[A-Z][A-Z0-9_]*>").expect("static regex"))
}

/// Build a replacement map from `(NAME, value)` pairs
///
/// Names may be given with or without the surrounding angle brackets.
pub fn replacements<I, K, V>(pairs: I) -> Replacements
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| {
            let key = k.as_ref();
            let token = if key.starts_with('<') {
                key.to_string()
            } else {
                format!("<{}>", key)
            };
            (token, v.into())
        })
        .collect()
}

/// Placeholders left in `text`, deduplicated and sorted
pub fn unresolved_placeholders(text: &str) -> Vec<String> {
    let mut found: Vec<String> = placeholder_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    found.sort();
    found.dedup();
    found
}

/// Substitute every placeholder in `template`
///
/// Fails when any placeholder survives substitution.
pub fn render_template(template: &str, values: &Replacements) -> DlcResult<String> {
    let mut rendered = template.to_string();
    for (token, value) in values {
        rendered = rendered.replace(token.as_str(), value);
    }

    let leftover = unresolved_placeholders(&rendered);
    if !leftover.is_empty() {
        return Err(DlcError::Template(format!(
            "unresolved placeholders: {}",
            leftover.join(", ")
        )));
    }
    Ok(rendered)
}

/// Render `template_path` into `output_path`
pub fn write_eks_yaml_file_from_template(
    template_path: &Path,
    output_path: &Path,
    values: &Replacements,
) -> DlcResult<()> {
    let template = std::fs::read_to_string(template_path).map_err(|e| {
        DlcError::Template(format!("cannot read {}: {}", template_path.display(), e))
    })?;
    let rendered = render_template(&template, values)
        .map_err(|e| DlcError::Template(format!("{}: {}", template_path.display(), e)))?;

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output_path, rendered)?;

    debug!(
        template = %template_path.display(),
        output = %output_path.display(),
        "Wrote manifest"
    );
    Ok(())
}

/// `{root}/{framework}/inference/single_node_{processor}_inference.yaml`
pub fn single_node_inference_template_path(
    templates_root: &Path,
    framework: &str,
    processor: Processor,
) -> PathBuf {
    templates_root
        .join(framework)
        .join("inference")
        .join(format!("single_node_{}_inference.yaml", processor.as_str()))
}
