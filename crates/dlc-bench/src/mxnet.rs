//! MXNet ResNet50 inference benchmark on EC2

use dlc_core::{DlcError, DlcResult, ImageUri};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::info;

use crate::performance::{Ec2PerformanceTester, Metrics, PerformanceReport};
use crate::thresholds::{ThresholdTable, MXNET_INFERENCE_CPU_IMAGENET, MXNET_INFERENCE_GPU_IMAGENET};

fn speed_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s+samples/sec").expect("static regex"))
}

/// Average throughput over the non-warmup `samples/sec` lines of a log
pub fn post_process_mxnet_ec2_performance(log: &str) -> DlcResult<Metrics> {
    let samples: Vec<f64> = log
        .lines()
        .filter(|line| !line.contains("warmup"))
        .filter_map(|line| speed_regex().captures(line))
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .collect();

    if samples.is_empty() {
        return Err(DlcError::Internal(
            "no samples/sec measurements found in benchmark log".to_string(),
        ));
    }

    let throughput = samples.iter().sum::<f64>() / samples.len() as f64;
    Ok(Metrics::from([("Throughput".to_string(), throughput)]))
}

/// Instance families the benchmark runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MxnetInferenceCase {
    Gpu,
    Cpu,
    Graviton,
}

impl MxnetInferenceCase {
    pub const ALL: [MxnetInferenceCase; 3] = [
        MxnetInferenceCase::Gpu,
        MxnetInferenceCase::Cpu,
        MxnetInferenceCase::Graviton,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MxnetInferenceCase::Gpu => "gpu",
            MxnetInferenceCase::Cpu => "cpu",
            MxnetInferenceCase::Graviton => "graviton",
        }
    }

    pub fn instance_type(&self) -> &'static str {
        match self {
            MxnetInferenceCase::Gpu => "p3.16xlarge",
            MxnetInferenceCase::Cpu => "c5.18xlarge",
            MxnetInferenceCase::Graviton => "c6g.4xlarge",
        }
    }

    /// Benchmark script inside the container
    pub fn test_command(&self, container_tests_prefix: &str) -> String {
        let script = match self {
            MxnetInferenceCase::Gpu => "run_mxnet_inference_performance_gpu",
            _ => "run_mxnet_inference_performance_cpu",
        };
        format!("{}/benchmark/{}", container_tests_prefix.trim_end_matches('/'), script)
    }

    pub fn thresholds(&self) -> DlcResult<ThresholdTable> {
        match self {
            MxnetInferenceCase::Gpu => ThresholdTable::from_pairs(MXNET_INFERENCE_GPU_IMAGENET),
            _ => ThresholdTable::from_pairs(MXNET_INFERENCE_CPU_IMAGENET),
        }
    }

    /// Reason to skip this case for `image`, if any
    pub fn skip_reason(&self, image: &ImageUri) -> Option<String> {
        let py3 = image.python_version().starts_with("py3");
        match self {
            MxnetInferenceCase::Graviton => {
                Some("Enable when releasing MXNet Graviton Images".to_string())
            }
            MxnetInferenceCase::Gpu if !image.is_gpu() => Some("GPU images only".to_string()),
            MxnetInferenceCase::Cpu if image.is_gpu() || image.is_graviton() => {
                Some("CPU images only".to_string())
            }
            _ if !py3 => Some("Python 3 images only".to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for MxnetInferenceCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MxnetInferenceCase {
    type Err = DlcError;

    fn from_str(s: &str) -> DlcResult<Self> {
        MxnetInferenceCase::ALL
            .iter()
            .copied()
            .find(|case| case.as_str() == s)
            .ok_or_else(|| DlcError::Config(format!("unknown benchmark case '{}'", s)))
    }
}

/// Outcome of a benchmark case
#[derive(Debug)]
pub enum BenchOutcome {
    Passed(PerformanceReport),
    Skipped(String),
}

/// Run `case` against `image` on the tester's instance
pub async fn run_mxnet_inference_case(
    tester: &Ec2PerformanceTester,
    case: MxnetInferenceCase,
    image: &ImageUri,
    container_tests_prefix: &str,
) -> DlcResult<BenchOutcome> {
    if let Some(reason) = case.skip_reason(image) {
        info!(case = %case, reason = %reason, "Skipping benchmark");
        return Ok(BenchOutcome::Skipped(reason));
    }

    let version = image.framework_version()?;
    let threshold = case.thresholds()?.threshold_for_version(&version)?;
    info!(
        case = %case,
        instance_type = case.instance_type(),
        threshold = threshold,
        "Running MXNet inference benchmark"
    );

    let report = tester
        .execute_ec2_inference_performance_test(
            image,
            &case.test_command(container_tests_prefix),
            post_process_mxnet_ec2_performance,
            "imagenet",
            Metrics::from([("Throughput".to_string(), threshold)]),
        )
        .await?;
    Ok(BenchOutcome::Passed(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Ec2Connection;
    use dlc_core::{BenchmarkConfig, Environment};
    use dlc_runtime::{CommandOutput, DryRunRunner};
    use std::sync::Arc;

    const MX_GPU: &str =
        "123456789012.dkr.ecr.us-west-2.amazonaws.com/mxnet-inference:1.9.0-gpu-py38-cu112-ubuntu20.04-ec2";
    const MX_CPU: &str =
        "123456789012.dkr.ecr.us-west-2.amazonaws.com/mxnet-inference:1.9.0-cpu-py38-ubuntu20.04-ec2";

    const LOG: &str = "\
INFO:root:warmup Speed: 10.0 samples/sec
INFO:root:Batch [10] Speed: 4600.0 samples/sec
INFO:root:Batch [20] Speed: 4800.0 samples/sec
INFO:root:done
";

    fn tester(runner: Arc<DryRunRunner>) -> Ec2PerformanceTester {
        let env = Environment::from_lookup(|key| {
            (key == "CODEBUILD_RESOLVED_SOURCE_VERSION").then(|| "abc123".to_string())
        });
        Ec2PerformanceTester::new(
            Ec2Connection::new(runner, "bench-host"),
            BenchmarkConfig::default(),
            env,
        )
    }

    #[test]
    fn test_post_process_skips_warmup() {
        let metrics = post_process_mxnet_ec2_performance(LOG).unwrap();
        assert_eq!(metrics["Throughput"], 4700.0);
    }

    #[test]
    fn test_post_process_without_samples() {
        assert!(post_process_mxnet_ec2_performance("INFO:root:warmup 5 samples/sec\n").is_err());
        assert!(post_process_mxnet_ec2_performance("").is_err());
    }

    #[test]
    fn test_case_properties() {
        assert_eq!(MxnetInferenceCase::Gpu.instance_type(), "p3.16xlarge");
        assert_eq!(
            MxnetInferenceCase::Cpu.test_command("/test/bin"),
            "/test/bin/benchmark/run_mxnet_inference_performance_cpu"
        );
        assert_eq!("graviton".parse::<MxnetInferenceCase>().unwrap(), MxnetInferenceCase::Graviton);

        let gpu: ImageUri = MX_GPU.parse().unwrap();
        let cpu: ImageUri = MX_CPU.parse().unwrap();
        assert!(MxnetInferenceCase::Gpu.skip_reason(&gpu).is_none());
        assert!(MxnetInferenceCase::Gpu.skip_reason(&cpu).is_some());
        assert!(MxnetInferenceCase::Cpu.skip_reason(&cpu).is_none());
        assert!(MxnetInferenceCase::Graviton.skip_reason(&cpu).is_some());
    }

    #[tokio::test]
    async fn test_gpu_run_uploads_and_passes() {
        let runner = Arc::new(DryRunRunner::new());
        runner.respond("cat ", CommandOutput::ok(LOG));
        let tester = tester(runner.clone());
        let image: ImageUri = MX_GPU.parse().unwrap();

        let outcome = run_mxnet_inference_case(&tester, MxnetInferenceCase::Gpu, &image, "/test/bin")
            .await
            .unwrap();
        let report = match outcome {
            BenchOutcome::Passed(report) => report,
            other => panic!("unexpected outcome: {other:?}"),
        };

        assert!(report.log_name.starts_with("imagenet_results_abc123_"));
        assert_eq!(
            report.s3_location,
            format!(
                "s3://dlinfra-dlc-cicd-performance/mxnet/1.9.0/ec2/inference/gpu/py38/{}",
                report.log_name
            )
        );
        assert_eq!(
            report.statements,
            vec!["mxnet 1.9.0 ec2 inference gpu py38 imagenet Throughput: 4700 images/sec, threshold: 4500 images/sec"]
        );

        let history = runner.history();
        assert!(history[0].contains("aws ecr get-login-password --region us-west-2"));
        assert!(history[1].contains("nvidia-docker pull -q"));
        assert!(history[2].contains("nvidia-docker run --user root"));
        assert!(history[2].contains("/test/bin/benchmark/run_mxnet_inference_performance_gpu"));
        assert_eq!(runner.commands_matching("sudo tee -a").len(), 1);
        assert_eq!(runner.commands_matching("aws s3 cp").len(), 1);
    }

    #[tokio::test]
    async fn test_slow_run_fails_after_upload() {
        let runner = Arc::new(DryRunRunner::new());
        runner.respond("cat ", CommandOutput::ok("Batch [10] Speed: 50.5 samples/sec\n"));
        let tester = tester(runner.clone());
        let image: ImageUri = MX_CPU.parse().unwrap();

        let result =
            run_mxnet_inference_case(&tester, MxnetInferenceCase::Cpu, &image, "/test/bin").await;
        assert!(matches!(result, Err(DlcError::Threshold(_))));
        assert!(runner.history()[2].starts_with("ssh "));
        assert!(runner.commands_matching("docker run").iter().all(|c| !c.contains("nvidia")));
        assert_eq!(runner.commands_matching("aws s3 cp").len(), 1);
    }

    #[tokio::test]
    async fn test_missing_log() {
        let runner = Arc::new(DryRunRunner::new());
        runner.respond("test -e", CommandOutput::failed(1, ""));
        let tester = tester(runner.clone());
        let image: ImageUri = MX_CPU.parse().unwrap();

        let result =
            run_mxnet_inference_case(&tester, MxnetInferenceCase::Cpu, &image, "/test/bin").await;
        assert!(result.is_err());
        assert!(runner.commands_matching("aws s3 cp").is_empty());
    }
}
