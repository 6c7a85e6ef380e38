//! Benchmark thresholds keyed by framework version ranges

use dlc_core::{DlcError, DlcResult, FrameworkVersion, SpecifierSet};

/// MXNet ResNet50 inference throughput on ImageNet, images/sec (p3.16xlarge)
pub const MXNET_INFERENCE_GPU_IMAGENET: &[(&str, f64)] =
    &[("<1.9", 4500.0), (">=1.9,<2.0", 4500.0), (">=2.0", 4500.0)];

/// MXNet ResNet50 inference throughput on ImageNet, images/sec (c5.18xlarge)
pub const MXNET_INFERENCE_CPU_IMAGENET: &[(&str, f64)] =
    &[("<1.9", 100.0), (">=1.9,<2.0", 100.0), (">=2.0", 100.0)];

/// Ordered `(specifier set, threshold)` entries
#[derive(Debug, Clone)]
pub struct ThresholdTable {
    entries: Vec<(SpecifierSet, f64)>,
}

impl ThresholdTable {
    pub fn from_pairs(pairs: &[(&str, f64)]) -> DlcResult<Self> {
        let entries = pairs
            .iter()
            .map(|(spec, value)| Ok((spec.parse::<SpecifierSet>()?, *value)))
            .collect::<DlcResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Threshold of the first entry whose specifier set contains `version`
    pub fn threshold_for_version(&self, version: &FrameworkVersion) -> DlcResult<f64> {
        self.entries
            .iter()
            .find(|(spec, _)| spec.contains(version))
            .map(|(_, value)| *value)
            .ok_or_else(|| {
                DlcError::Config(format!("no benchmark threshold defined for version {}", version))
            })
    }
}
