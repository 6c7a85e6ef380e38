//! dlc-bench: EC2 performance benchmarks
//!
//! Runs benchmark containers on remote instances over SSH, averages the
//! reported throughput, uploads the log and compares against per-version
//! thresholds.

pub mod connection;
pub mod mxnet;
pub mod performance;
pub mod thresholds;

pub use connection::Ec2Connection;
pub use mxnet::{
    post_process_mxnet_ec2_performance, run_mxnet_inference_case, BenchOutcome, MxnetInferenceCase,
};
pub use performance::{
    check_thresholds, performance_unit, Ec2PerformanceTester, Metrics, PerformanceReport,
    PostProcess,
};
pub use thresholds::ThresholdTable;
