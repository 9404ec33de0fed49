//! Run configuration: one explicit structure per run, loadable from JSON.

use crate::alignment::AlignParams;
use crate::crowns::CrownParams;
use crate::error::{InputError, ParameterError};
use crate::imputation::ImputationParams;
use crate::merge::MergeParams;
use crate::tiling::TilingParams;
use crate::treetops::{RadiusModel, TreeTopParams};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration of a detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub tiling: TilingParams,
    pub treetops: TreeTopParams,
    /// Grow and merge crowns after tree-top detection.
    pub grow_crowns: bool,
    pub crowns: CrownParams,
    pub merge: MergeParams,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            tiling: TilingParams::default(),
            treetops: TreeTopParams::default(),
            grow_crowns: true,
            crowns: CrownParams::default(),
            merge: MergeParams::default(),
        }
    }
}

impl DetectionConfig {
    /// Load a JSON config from disk. Missing fields take their defaults.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, InputError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), InputError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        self.tiling.validate()?;
        self.treetops.validate()?;
        self.crowns.validate()?;
        self.merge.validate()
    }

    /// Name of the output folder of this radius model, e.g. `a0.0_b0.0325_c0.25`.
    pub fn experiment_name(&self) -> String {
        match self.treetops.radius {
            RadiusModel::Allometric { a, b, c } => format!("a{a:?}_b{b:?}_c{c:?}"),
            RadiusModel::Fixed { radius } => format!("r{radius:?}"),
        }
    }
}

/// Configuration of a plot-registration run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignConfig {
    pub align: AlignParams,
    pub imputation: ImputationParams,
}

impl AlignConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, InputError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), InputError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        self.align.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::OverlapMetric;
    use crate::treetops::ConfidenceFeature;

    #[test]
    fn test_defaults() {
        let cfg = DetectionConfig::default();
        assert_eq!(cfg.tiling.chip_size, 2000);
        assert_eq!(cfg.tiling.chip_stride, 1900);
        assert_eq!(cfg.tiling.resolution, 0.2);
        assert_eq!(cfg.treetops.confidence, ConfidenceFeature::Distance);
        assert_eq!(cfg.merge.overlap_metric, OverlapMetric::IntersectionOverSmaller);
        assert!(!cfg.merge.run_per_region_pass);
        assert_eq!(cfg.experiment_name(), "a0.0_b0.0325_c0.25");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let raw = r#"{
            "tiling": { "chip_size": 500, "chip_stride": 400 },
            "treetops": { "radius": { "kind": "fixed", "radius": 1.5 }, "confidence": "height" },
            "merge": { "overlap_metric": "iou", "overlap_threshold": 0.6 }
        }"#;
        let cfg: DetectionConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.tiling.chip_size, 500);
        assert_eq!(cfg.tiling.resolution, 0.2);
        assert_eq!(cfg.treetops.radius, RadiusModel::Fixed { radius: 1.5 });
        assert_eq!(cfg.treetops.confidence, ConfidenceFeature::Height);
        assert_eq!(cfg.treetops.min_height, 2.0);
        assert_eq!(cfg.merge.overlap_metric, OverlapMetric::IntersectionOverUnion);
        assert!(cfg.grow_crowns);
        assert_eq!(cfg.experiment_name(), "r1.5");
    }

    #[test]
    fn test_validation_reaches_every_section() {
        let mut cfg = DetectionConfig::default();
        cfg.tiling.chip_stride = 3000;
        assert!(matches!(cfg.validate(), Err(ParameterError::StrideOutOfRange { .. })));

        let mut cfg = DetectionConfig::default();
        cfg.merge.overlap_threshold = 2.0;
        assert!(matches!(cfg.validate(), Err(ParameterError::OutOfUnitRange { .. })));

        let mut cfg = AlignConfig::default();
        cfg.align.grid_step = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let mut cfg = DetectionConfig::default();
        cfg.crowns.crown_prop = Some(0.3);
        cfg.write_json(&path).unwrap();
        assert_eq!(DetectionConfig::load_json(&path).unwrap(), cfg);
    }
}
