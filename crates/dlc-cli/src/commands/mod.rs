//! CLI commands implementation

use anyhow::{bail, Context, Result};
use dlc_bench::{
    run_mxnet_inference_case, BenchOutcome, Ec2Connection, Ec2PerformanceTester, MxnetInferenceCase,
};
use dlc_core::{
    BuildSelection, BuilderGates, Buildspec, DlcResult, Environment, HarnessConfig, ImageUri,
    TestTypeImages,
};
use dlc_eks::{EksTensorflowTest, Kubectl, Outcome, Scenario, TfServingClient};
use dlc_runtime::{docker, CommandRunner, ImageBuilder, ImageBuilderConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Arguments of `dlc build`
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub buildspec: PathBuf,
    pub framework: String,
    pub device_types: String,
    pub image_types: String,
    pub py_versions: String,
    pub push: bool,
}

/// Build the selected images and write the test-type images report
pub async fn build(
    runner: Arc<dyn CommandRunner>,
    config: &HarnessConfig,
    env: &Environment,
    request: &BuildRequest,
) -> Result<TestTypeImages> {
    let report_path = &config.paths.test_type_images;

    // Downstream stages always find a report, even when nothing is built
    TestTypeImages::new()
        .write_to_file(report_path)
        .with_context(|| format!("Failed to initialize {}", report_path.display()))?;

    let gates = BuilderGates::evaluate(&request.framework, &config.build, env);
    if !gates.should_build() {
        info!(
            framework = %request.framework,
            context = %env.build_context,
            "Builds disabled for this builder, skipping"
        );
        println!("No images to build for {}", request.framework);
        return Ok(TestTypeImages::new());
    }

    let spec = Buildspec::from_file(&request.buildspec)?;
    let selection = BuildSelection::new(
        &request.framework,
        &request.device_types,
        &request.image_types,
        &request.py_versions,
    )
    .with_gates(&gates)
    .with_build_config(&config.build);
    let images = selection.select(&spec)?;
    if images.is_empty() {
        warn!(buildspec = %request.buildspec.display(), "No images matched the filters");
    }

    let builder = ImageBuilder::new(
        runner,
        ImageBuilderConfig {
            build_root: config.paths.build_root.clone(),
            push: request.push,
            size_tolerance: config.build.image_size_tolerance,
            disable_sagemaker_tests: config.build.disable_sagemaker_tests,
        },
    );
    let records = builder.build_all(&spec, &images).await?;

    let report = docker::test_type_images(&records);
    report.write_to_file(report_path)?;

    for record in &records {
        let size = record
            .size_mb
            .map(|s| format!("{} MB", s))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<45} {:<10} {}", record.name, size, record.uri);
    }
    println!(
        "Built {} image(s); report written to {}",
        records.len(),
        report_path.display()
    );
    Ok(report)
}

/// Run one or all EKS TensorFlow scenarios
pub async fn eks_tensorflow(
    runner: Arc<dyn CommandRunner>,
    config: &HarnessConfig,
    env: &Environment,
    image: &str,
    scenario: Option<&str>,
) -> Result<()> {
    let image: ImageUri = image.parse()?;
    let scenarios = match scenario {
        Some(name) => vec![name.parse::<Scenario>()?],
        None => Scenario::ALL.to_vec(),
    };

    let test = EksTensorflowTest::new(
        Kubectl::from_config(runner, &config.eks),
        TfServingClient::from_config(&config.eks)?,
        &config.paths.eks_templates,
        &config.paths.manifests,
        &config.eks,
    );

    let mut failed = Vec::new();
    for scenario in scenarios {
        match test.run(scenario, &image, env).await {
            Ok(Outcome::Passed(response)) => {
                println!("PASSED  {}: {}", scenario, response);
            }
            Ok(Outcome::Skipped(reason)) => {
                println!("SKIPPED {}: {}", scenario, reason);
            }
            Err(e) => {
                println!("FAILED  {}: {}", scenario, e);
                failed.push(scenario.to_string());
            }
        }
    }

    if !failed.is_empty() {
        bail!("EKS TensorFlow scenarios failed: {}", failed.join(", "));
    }
    Ok(())
}

/// Where the benchmark runs
#[derive(Debug, Clone)]
pub struct Ec2Target {
    pub host: String,
    pub user: String,
    pub key: Option<PathBuf>,
}

/// Run an MXNet inference benchmark case on an instance
pub async fn ec2_mxnet_performance(
    runner: Arc<dyn CommandRunner>,
    config: &HarnessConfig,
    env: &Environment,
    image: &str,
    target: &Ec2Target,
    case: &str,
) -> Result<()> {
    let image: ImageUri = image.parse()?;
    let case = case.parse::<MxnetInferenceCase>()?;

    let mut connection = Ec2Connection::new(runner, &target.host).with_user(&target.user);
    if let Some(key) = &target.key {
        connection = connection.with_key_file(key);
    }
    let tester = Ec2PerformanceTester::new(connection, config.benchmark.clone(), env.clone());

    match run_mxnet_inference_case(&tester, case, &image, &config.benchmark.container_tests_prefix)
        .await?
    {
        BenchOutcome::Passed(report) => {
            for statement in &report.statements {
                println!("{}", statement);
            }
            println!("Log uploaded to {}", report.s3_location);
        }
        BenchOutcome::Skipped(reason) => {
            println!("SKIPPED {}: {}", case, reason);
        }
    }
    Ok(())
}

/// Facts derived from an image URI
pub fn describe_image(uri: &str) -> DlcResult<Value> {
    let image: ImageUri = uri.parse()?;
    let (framework, version) = image.framework_and_version()?;
    Ok(json!({
        "uri": image.to_string(),
        "registry": image.registry,
        "repository": image.repository,
        "tag": image.tag,
        "framework": framework,
        "framework_version": version.to_string(),
        "processor": image.processor()?.as_str(),
        "python_version": image.python_version(),
        "work_type": image.work_type().to_string(),
        "graviton": image.is_graviton(),
        "eks_test_type": image.eks_test_type_label(),
    }))
}

/// Print the facts of an image URI
pub fn image(uri: &str) -> Result<()> {
    let facts = describe_image(uri)?;
    println!("{}", serde_json::to_string_pretty(&facts)?);
    Ok(())
}
