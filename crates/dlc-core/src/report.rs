//! Test-type images report
//!
//! Downstream test stages read this JSON file to learn which images to test.

use crate::DlcResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Test stages that consume built images
pub const TEST_TYPES: [&str; 4] = ["sanity", "ec2", "eks", "sagemaker"];

/// Built images grouped by test type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestTypeImages {
    pub images: BTreeMap<String, Vec<String>>,
}

impl TestTypeImages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an image under the given test types
    pub fn add<I, S>(&mut self, image_uri: &str, test_types: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for test_type in test_types {
            let entry = self.images.entry(test_type.as_ref().to_string()).or_default();
            if !entry.iter().any(|i| i == image_uri) {
                entry.push(image_uri.to_string());
            }
        }
    }

    pub fn get(&self, test_type: &str) -> &[String] {
        self.images.get(test_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Write the report, replacing any existing file
    pub fn write_to_file(&self, path: &Path) -> DlcResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> DlcResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report_is_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_type_images.json");
        TestTypeImages::new().write_to_file(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_add_deduplicates() {
        let mut report = TestTypeImages::new();
        report.add("repo:tag", ["sanity", "ec2"]);
        report.add("repo:tag", ["sanity"]);
        assert_eq!(report.get("sanity"), &["repo:tag".to_string()]);
        assert_eq!(report.get("ec2").len(), 1);
        assert!(report.get("eks").is_empty());
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("images.json");
        let mut report = TestTypeImages::new();
        report.add("repo:a", TEST_TYPES);
        report.write_to_file(&path).unwrap();

        let read = TestTypeImages::read_from_file(&path).unwrap();
        assert_eq!(read, report);
    }
}
