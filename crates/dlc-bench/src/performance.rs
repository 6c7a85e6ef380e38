//! EC2 inference performance runs

use chrono::Utc;
use dlc_core::{BenchmarkConfig, DlcError, DlcResult, Environment, ImageUri, WorkType};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::connection::Ec2Connection;

/// Metric name to value, e.g. `Throughput`
pub type Metrics = BTreeMap<String, f64>;

/// Extracts metrics from a benchmark log
pub type PostProcess = fn(&str) -> DlcResult<Metrics>;

/// Unit a metric is reported in
pub fn performance_unit(framework: &str, work_type: WorkType, data_source: &str) -> &'static str {
    match (work_type, framework) {
        (WorkType::Inference, "tensorflow") => "s",
        (WorkType::Inference, "pytorch") => "ms",
        (WorkType::Training, "pytorch") if data_source == "imagenet" => "s",
        _ => "images/sec",
    }
}

/// Whether every metric meets its threshold
///
/// Throughput must exceed its threshold; any other metric must not.
pub fn check_thresholds(metrics: &Metrics, thresholds: &Metrics) -> DlcResult<()> {
    if metrics.is_empty() {
        return Err(DlcError::Threshold("no performance metrics were produced".to_string()));
    }
    for (name, value) in metrics {
        let threshold = thresholds
            .get(name)
            .ok_or_else(|| DlcError::Config(format!("no threshold for metric {}", name)))?;
        let met = if name == "Throughput" {
            value > threshold
        } else {
            value <= threshold
        };
        if !met {
            return Err(DlcError::Threshold(format!(
                "{} {} does not reach the threshold {}",
                name, value, threshold
            )));
        }
    }
    Ok(())
}

/// What a performance run measured and where its log went
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub image: String,
    pub log_name: String,
    pub s3_location: String,
    pub metrics: Metrics,
    pub thresholds: Metrics,
    pub statements: Vec<String>,
}

/// Runs benchmark containers on a remote instance
pub struct Ec2PerformanceTester {
    connection: Ec2Connection,
    config: BenchmarkConfig,
    env: Environment,
}

impl Ec2PerformanceTester {
    pub fn new(connection: Ec2Connection, config: BenchmarkConfig, env: Environment) -> Self {
        Self {
            connection,
            config,
            env,
        }
    }

    pub fn connection(&self) -> &Ec2Connection {
        &self.connection
    }

    /// `{data_source}_results_{commit}_{timestamp}.txt`
    pub fn log_name(&self, data_source: &str) -> String {
        format!(
            "{}_results_{}_{}.txt",
            data_source,
            self.env.source_version,
            Utc::now().format("%Y-%m-%d-%H-%M-%S")
        )
    }

    /// Pull `image`, run `test_cmd` in it, then validate and upload the log
    pub async fn execute_ec2_inference_performance_test(
        &self,
        image: &ImageUri,
        test_cmd: &str,
        post_process: PostProcess,
        data_source: &str,
        thresholds: Metrics,
    ) -> DlcResult<PerformanceReport> {
        let docker = if image.is_gpu() { "nvidia-docker" } else { "docker" };

        if let Some(registry) = &image.registry {
            self.connection
                .run(&format!(
                    "aws ecr get-login-password --region {} | docker login --username AWS --password-stdin {}",
                    self.config.region, registry
                ))
                .await?;
        }
        self.connection
            .run(&format!("{} pull -q {}", docker, image))
            .await?;

        let log_name = self.log_name(data_source);
        let log_location = format!("{}/benchmark/logs/{}", self.config.container_tests_dir, log_name);

        info!(image = %image, log = %log_name, "Running benchmark");
        self.connection
            .run(&format!(
                "{docker} run --user root -e LOG_FILE=/test/benchmark/logs/{log} -e PR_CONTEXT={pr} \
                 -v {tests}:/test {image} /bin/bash -c {cmd}",
                docker = docker,
                log = log_name,
                pr = if self.env.build_context.is_pr() { 1 } else { 0 },
                tests = self.config.container_tests_dir,
                image = image,
                cmd = test_cmd,
            ))
            .await?;

        self.upload_result_and_validate(image, &log_location, &log_name, post_process, data_source, thresholds)
            .await
    }

    async fn upload_result_and_validate(
        &self,
        image: &ImageUri,
        log_location: &str,
        log_name: &str,
        post_process: PostProcess,
        data_source: &str,
        thresholds: Metrics,
    ) -> DlcResult<PerformanceReport> {
        let (framework, version) = image.framework_and_version()?;
        let work_type = image.work_type();
        let processor = if image.is_gpu() { "gpu" } else { "cpu" };
        let py_version = image.python_version();

        let s3_location = format!(
            "{}/{}/{}/ec2/{}/{}/{}/{}",
            self.config.results_bucket, framework, version, work_type, processor, py_version, log_name
        );

        if !self.connection.file_exists(log_location).await? {
            return Err(DlcError::Internal(format!(
                "benchmark log {} was not written",
                log_location
            )));
        }
        let metrics = post_process(&self.connection.read_file(log_location).await?)?;

        let unit = performance_unit(framework, work_type, data_source);
        let description = if unit == "s" || unit == "ms" { " p99 latency" } else { "" };
        let mut statements = Vec::new();
        for (name, value) in &metrics {
            let threshold = thresholds
                .get(name)
                .map(|t| t.to_string())
                .unwrap_or_else(|| "none".to_string());
            let statement = format!(
                "{} {} ec2 {} {} {} {} {}{}: {} {}, threshold: {} {}",
                framework,
                version,
                work_type,
                processor,
                py_version,
                data_source,
                name,
                description,
                value,
                unit,
                threshold,
                unit
            );
            self.connection
                .run(&format!("echo '{}' | sudo tee -a {}", statement, log_location))
                .await?;
            info!("{}", statement);
            statements.push(statement);
        }

        self.connection
            .run(&format!("aws s3 cp {} {}", log_location, s3_location))
            .await?;
        info!(location = %s3_location, "Uploaded benchmark log");

        if let Err(e) = check_thresholds(&metrics, &thresholds) {
            error!(image = %image, error = %e, "Benchmark below threshold");
            return Err(e);
        }

        Ok(PerformanceReport {
            image: image.to_string(),
            log_name: log_name.to_string(),
            s3_location,
            metrics,
            thresholds,
            statements,
        })
    }
}
