//! Run configuration. The JSON payload is parsed into [`PipelineConfig`] and validated
//! once into [`PipelineSettings`], which every stage then borrows.
use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    calibrate::{CalibrationSettings, DEFAULT_PERCENTILE},
    error::{PipelineError, PipelineResult, Stage},
    platform::TargetPlatform,
    quantization::{BIT_WIDTH, CalibrationAlgorithm},
    rewrite::QuantizeSettings,
};

fn default_percentile() -> f32 {
    DEFAULT_PERCENTILE
}

fn default_true() -> bool {
    true
}

/// Configuration file as written by users.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub target_platform: String,
    pub bit_width: usize,
    pub batch_size: usize,
    pub calib_steps: usize,
    pub input_shape: Vec<usize>,
    /// No default: the choice of algorithm changes the artifact.
    pub calib_algorithm: Option<CalibrationAlgorithm>,
    #[serde(default = "default_percentile")]
    pub percentile: f32,
    #[serde(default)]
    pub per_channel: bool,
    #[serde(default = "default_true")]
    pub allow_mixed_precision: bool,
    #[serde(default)]
    pub model_name: Option<String>,
}

impl PipelineConfig {
    pub fn from_json(bytes: &[u8]) -> PipelineResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| PipelineError::invalid_config(Stage::Config, "<payload>", e))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(PipelineError::InputNotFound {
                stage: Stage::Config,
                path: path.to_path_buf(),
            });
        }
        let bytes = fs::read(path).map_err(|e| PipelineError::invalid_config(Stage::Config, path.display().to_string(), e))?;
        Self::from_json(&bytes)
    }

    pub fn validate(&self) -> PipelineResult<PipelineSettings> {
        let invalid = |field: &str, reason: String| PipelineError::invalid_config(Stage::Config, field, reason);

        let platform: TargetPlatform = self.target_platform.parse()?;
        if self.bit_width != BIT_WIDTH {
            return Err(invalid("bit_width", format!("only {BIT_WIDTH}-bit quantization is supported, got {}", self.bit_width)));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1".to_string()));
        }
        if self.calib_steps == 0 {
            return Err(invalid("calib_steps", "must be at least 1".to_string()));
        }
        match self.input_shape.as_slice() {
            [n, c, h, w] if [n, c, h, w].iter().all(|d| **d > 0) => {}
            other => return Err(invalid("input_shape", format!("expected [N, C, H, W] with positive dims, got {other:?}"))),
        }
        let Some(algorithm) = self.calib_algorithm else {
            return Err(invalid("calib_algorithm", "missing, expected one of min-max, percentile, kl".to_string()));
        };
        if !(self.percentile > 0.0 && self.percentile <= 100.0) {
            return Err(invalid("percentile", format!("{} is outside (0, 100]", self.percentile)));
        }

        Ok(PipelineSettings {
            platform,
            input_shape: self.input_shape.clone(),
            calibration: CalibrationSettings {
                num_batches: self.calib_steps,
                batch_size: self.batch_size,
                algorithm,
                percentile: self.percentile,
                per_channel: self.per_channel,
            },
            quantize: QuantizeSettings {
                platform,
                allow_mixed_precision: self.allow_mixed_precision,
            },
            model_name: self.model_name.clone(),
        })
    }
}

/// Validated, immutable settings of one pipeline run.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub platform: TargetPlatform,
    pub input_shape: Vec<usize>,
    pub calibration: CalibrationSettings,
    pub quantize: QuantizeSettings,
    pub model_name: Option<String>,
}

impl PipelineSettings {
    pub fn new(platform: TargetPlatform, input_shape: Vec<usize>, calibration: CalibrationSettings) -> Self {
        Self {
            platform,
            input_shape,
            calibration,
            quantize: QuantizeSettings {
                platform,
                allow_mixed_precision: true,
            },
            model_name: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        PipelineConfig::from_file(path)?.validate()
    }
}
