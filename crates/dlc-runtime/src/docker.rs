//! Docker image builder
//!
//! Builds the selected buildspec images one after another, checks their size
//! against the recorded baseline and optionally pushes them.

use chrono::{DateTime, Utc};
use dlc_core::{Buildspec, DlcError, DlcResult, ImageSpec, TestTypeImages};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::traits::{CommandRunner, CommandSpec};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Builder settings
#[derive(Debug, Clone)]
pub struct ImageBuilderConfig {
    /// Scratch directory for build contexts
    pub build_root: PathBuf,
    /// Push images after a successful build
    pub push: bool,
    /// Fraction an image may exceed its size baseline
    pub size_tolerance: f64,
    /// Leave SageMaker out of the default test types
    pub disable_sagemaker_tests: bool,
}

impl Default for ImageBuilderConfig {
    fn default() -> Self {
        Self {
            build_root: std::env::temp_dir().join("dlc-build"),
            push: false,
            size_tolerance: 0.2,
            disable_sagemaker_tests: false,
        }
    }
}

/// Outcome of one image build
#[derive(Debug, Clone, Serialize)]
pub struct BuildRecord {
    pub id: Uuid,
    /// Buildspec image name
    pub name: String,
    pub uri: String,
    pub image_type: String,
    pub device_type: String,
    /// Size reported by `docker image inspect`, in MB
    pub size_mb: Option<u64>,
    pub pushed: bool,
    /// Test stages this image is scheduled for
    pub test_types: Vec<String>,
    pub built_at: DateTime<Utc>,
}

/// Test stages an image is scheduled for
pub fn test_types_for(image: &ImageSpec, disable_sagemaker_tests: bool) -> Vec<String> {
    if !image.test_platforms.is_empty() {
        return image.test_platforms.clone();
    }
    let mut types = vec!["sanity".to_string()];
    if image.target.as_deref() != Some("sagemaker") {
        types.push("ec2".to_string());
        types.push("eks".to_string());
    }
    if !disable_sagemaker_tests {
        types.push("sagemaker".to_string());
    }
    types
}

/// Group build records into the test-type images report
pub fn test_type_images(records: &[BuildRecord]) -> TestTypeImages {
    let mut report = TestTypeImages::new();
    for record in records {
        report.add(&record.uri, &record.test_types);
    }
    report
}

/// Builds buildspec images with the Docker CLI
pub struct ImageBuilder {
    runner: Arc<dyn CommandRunner>,
    config: ImageBuilderConfig,
}

impl ImageBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, config: ImageBuilderConfig) -> Self {
        Self { runner, config }
    }

    /// Build every image in order; the first failure aborts
    pub async fn build_all(
        &self,
        spec: &Buildspec,
        images: &[(&str, &ImageSpec)],
    ) -> DlcResult<Vec<BuildRecord>> {
        let mut records = Vec::with_capacity(images.len());
        for (name, image) in images {
            let record = self.build_image(spec, name, image).await.map_err(|e| {
                DlcError::Docker(format!("image {} failed: {}", name, e))
            })?;
            records.push(record);
        }
        info!(built = records.len(), "Finished building images");
        Ok(records)
    }

    /// Build, size-check and optionally push a single image
    pub async fn build_image(
        &self,
        spec: &Buildspec,
        name: &str,
        image: &ImageSpec,
    ) -> DlcResult<BuildRecord> {
        let uri = spec.image_uri(image).to_string();
        info!(image = name, uri = %uri, "Building image");

        let context_dir = self.prepare_context(spec, name, image).await?;
        let result = self.run_build(&uri, image, &context_dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(&context_dir).await {
            warn!(path = %context_dir.display(), error = %e, "Failed to clean build context");
        }
        result?;

        let size_mb = self.image_size_mb(&uri).await?;
        if let (Some(size), Some(baseline)) = (size_mb, image.image_size_baseline) {
            check_image_size(&uri, size, baseline, self.config.size_tolerance)?;
        }

        if self.config.push {
            info!(uri = %uri, "Pushing image");
            self.runner
                .run(&CommandSpec::new("docker").arg("push").arg(&uri))
                .await?;
        }

        Ok(BuildRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            uri,
            image_type: image.image_type.clone(),
            device_type: image.device_type.clone(),
            size_mb,
            pushed: self.config.push,
            test_types: test_types_for(image, self.config.disable_sagemaker_tests),
            built_at: Utc::now(),
        })
    }

    /// The `docker build` invocation for an image
    pub fn build_command(&self, uri: &str, image: &ImageSpec, context_dir: &Path) -> CommandSpec {
        let mut cmd = CommandSpec::new("docker")
            .arg("build")
            .arg("-t")
            .arg(uri)
            .arg("-f")
            .arg(context_dir.join("Dockerfile").display().to_string());

        for (key, value) in &image.build_args {
            cmd = cmd.arg("--build-arg").arg(format!("{}={}", key, value));
        }

        if let Some(target) = &image.target {
            cmd = cmd.arg("--target").arg(target);
        }

        cmd.arg(context_dir.display().to_string())
    }

    async fn run_build(&self, uri: &str, image: &ImageSpec, context_dir: &Path) -> DlcResult<()> {
        let cmd = self.build_command(uri, image, context_dir);
        self.runner.run(&cmd).await?;
        Ok(())
    }

    /// Copy the Dockerfile and context artifacts into a fresh directory
    async fn prepare_context(
        &self,
        spec: &Buildspec,
        name: &str,
        image: &ImageSpec,
    ) -> DlcResult<PathBuf> {
        let dir = self
            .config
            .build_root
            .join(format!("{}-{}", name, Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;

        if let Err(e) = populate_context(spec, image, &dir).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }
        Ok(dir)
    }

    async fn image_size_mb(&self, uri: &str) -> DlcResult<Option<u64>> {
        let output = self
            .runner
            .run(
                &CommandSpec::new("docker")
                    .args(["image", "inspect", "--format", "{{.Size}}"])
                    .arg(uri),
            )
            .await?;

        let raw = output.stdout.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let bytes: u64 = raw
            .parse()
            .map_err(|_| DlcError::Docker(format!("unexpected image size '{}'", raw)))?;
        Ok(Some(bytes / BYTES_PER_MB))
    }
}

async fn populate_context(spec: &Buildspec, image: &ImageSpec, dir: &Path) -> DlcResult<()> {
    let dockerfile = spec.resolve_path(&image.docker_file);
    copy_into(&dockerfile, &dir.join("Dockerfile")).await?;

    for (artifact, entry) in &image.context {
        let source = spec.resolve_path(&entry.source);
        copy_into(&source, &dir.join(&entry.target))
            .await
            .map_err(|e| DlcError::Docker(format!("context artifact '{}': {}", artifact, e)))?;
    }
    Ok(())
}

async fn copy_into(source: &Path, dest: &Path) -> DlcResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(source, dest).await.map_err(|e| {
        DlcError::Docker(format!("cannot copy {}: {}", source.display(), e))
    })?;
    Ok(())
}

/// Fail when an image outgrows its baseline by more than `tolerance`
pub fn check_image_size(uri: &str, size_mb: u64, baseline_mb: u64, tolerance: f64) -> DlcResult<()> {
    let limit = baseline_mb as f64 * (1.0 + tolerance);
    if size_mb as f64 > limit {
        return Err(DlcError::Docker(format!(
            "{} is {} MB, exceeding baseline {} MB by more than {:.0}%",
            uri,
            size_mb,
            baseline_mb,
            tolerance * 100.0
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::DryRunRunner;
    use crate::traits::CommandOutput;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn buildspec(dir: &Path, target: &str) -> Buildspec {
        let yaml = format!(
            r#"
account_id: "123456789012"
region: us-west-2
framework: pytorch
version: 2.0.1
images:
  cpu:
    build: true
    image_type: inference
    device_type: cpu
    python_version: py3
    tag: 2.0.1-cpu-py310
    docker_file: docker/Dockerfile.cpu
    target: {target}
    image_size_baseline: 1000
    build_args:
      TRANSFORMERS_VERSION: 4.28.1
    context:
      entrypoint:
        source: artifacts/entrypoint.sh
        target: entrypoint.sh
"#
        );
        let mut spec = Buildspec::parse(&yaml, |_| None).unwrap();
        spec.root = dir.to_path_buf();
        spec
    }

    fn builder(runner: Arc<DryRunRunner>, root: &Path, push: bool) -> ImageBuilder {
        ImageBuilder::new(
            runner,
            ImageBuilderConfig {
                build_root: root.join("contexts"),
                push,
                ..ImageBuilderConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_build_and_push() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "docker/Dockerfile.cpu", "FROM ubuntu");
        write(dir.path(), "artifacts/entrypoint.sh", "#!/bin/sh");
        let spec = buildspec(dir.path(), "ec2");

        let runner = Arc::new(DryRunRunner::new());
        runner.respond("image inspect", CommandOutput::ok(format!("{}\n", 900 * BYTES_PER_MB)));

        let images: Vec<_> = spec.images.iter().map(|(n, i)| (n.as_str(), i)).collect();
        let records = builder(runner.clone(), dir.path(), true)
            .build_all(&spec, &images)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size_mb, Some(900));
        assert!(records[0].pushed);
        assert_eq!(records[0].test_types, vec!["sanity", "ec2", "eks", "sagemaker"]);

        let builds = runner.commands_matching("docker build");
        assert_eq!(builds.len(), 1);
        assert!(builds[0].contains("-t 123456789012.dkr.ecr.us-west-2.amazonaws.com/pytorch-inference:2.0.1-cpu-py310"));
        assert!(builds[0].contains("--build-arg TRANSFORMERS_VERSION=4.28.1"));
        assert!(builds[0].contains("--target ec2"));
        assert_eq!(runner.commands_matching("docker push").len(), 1);

        // build contexts are cleaned up
        let leftovers = std::fs::read_dir(dir.path().join("contexts")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_oversized_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "docker/Dockerfile.cpu", "FROM ubuntu");
        write(dir.path(), "artifacts/entrypoint.sh", "#!/bin/sh");
        let spec = buildspec(dir.path(), "ec2");

        let runner = Arc::new(DryRunRunner::new());
        runner.respond("image inspect", CommandOutput::ok(format!("{}", 1300 * BYTES_PER_MB)));

        let images: Vec<_> = spec.images.iter().map(|(n, i)| (n.as_str(), i)).collect();
        let err = builder(runner.clone(), dir.path(), true)
            .build_all(&spec, &images)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeding baseline"));
        assert!(runner.commands_matching("docker push").is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_before_build() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "docker/Dockerfile.cpu", "FROM ubuntu");
        let spec = buildspec(dir.path(), "ec2");

        let runner = Arc::new(DryRunRunner::new());
        let images: Vec<_> = spec.images.iter().map(|(n, i)| (n.as_str(), i)).collect();
        let err = builder(runner.clone(), dir.path(), false)
            .build_all(&spec, &images)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("entrypoint"));
        assert!(runner.commands_matching("docker build").is_empty());
        let leftovers = std::fs::read_dir(dir.path().join("contexts")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_sagemaker_target_test_types() {
        let dir = tempfile::tempdir().unwrap();
        let spec = buildspec(dir.path(), "sagemaker");
        let image = &spec.images["cpu"];
        assert_eq!(test_types_for(image, false), vec!["sanity", "sagemaker"]);
        assert_eq!(test_types_for(image, true), vec!["sanity"]);
    }

    #[test]
    fn test_check_image_size() {
        assert!(check_image_size("x", 1200, 1000, 0.2).is_ok());
        assert!(check_image_size("x", 1201, 1000, 0.2).is_err());
    }
}
