//! JSON sidecar describing how an artifact was produced.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ExportContext, TargetFormat};
use crate::{
    Element,
    analysis::AccuracyReport,
    platform::TargetPlatform,
    quantization::{BIT_WIDTH, CalibrationAlgorithm, QuantParamSet, TensorKind},
    rewrite::QuantizedGraph,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub kind: TensorKind,
    pub scales: Vec<f32>,
    pub zero_points: Vec<Element>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub axis: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    pub model_name: String,
    pub target_platform: TargetPlatform,
    pub target_format: TargetFormat,
    pub bit_width: usize,
    pub batch_size: Option<usize>,
    pub calib_steps: Option<usize>,
    pub input_shape: Vec<usize>,
    pub algorithm: Option<CalibrationAlgorithm>,
    pub percentile: Option<f32>,
    pub per_channel: Option<bool>,
    pub num_samples: Option<usize>,
    pub artifact: String,
    pub sha256: String,
    pub tensors: BTreeMap<String, TensorEntry>,
    pub float_nodes: Vec<String>,
    pub accuracy: Option<AccuracyReport>,
    pub producer: String,
}

fn entries(params: &QuantParamSet) -> BTreeMap<String, TensorEntry> {
    params
        .iter()
        .map(|(name, q)| {
            let entry = TensorEntry {
                kind: q.kind,
                scales: q.params.scales(),
                zero_points: q.params.zero_points(),
                axis: q.params.axis(),
            };
            (name.clone(), entry)
        })
        .collect()
}

impl Sidecar {
    pub(crate) fn new(
        ctx: &ExportContext,
        format: TargetFormat,
        quantized: Option<&QuantizedGraph>,
        artifact: String,
        sha256: String,
    ) -> Self {
        let calibration = ctx.calibration.as_ref();
        Self {
            model_name: ctx.model_name.clone(),
            target_platform: quantized.map_or(ctx.platform, |q| q.platform),
            target_format: format,
            bit_width: BIT_WIDTH,
            batch_size: calibration.map(|c| c.batch_size),
            calib_steps: calibration.map(|c| c.num_batches),
            input_shape: ctx.input_shape.clone(),
            algorithm: calibration.map(|c| c.algorithm),
            percentile: calibration.map(|c| c.percentile),
            per_channel: calibration.map(|c| c.per_channel),
            num_samples: quantized.map(|q| q.params.num_samples).filter(|n| *n > 0),
            artifact,
            sha256,
            tensors: quantized.map(|q| entries(&q.params)).unwrap_or_default(),
            float_nodes: quantized.map(|q| q.float_nodes.clone()).unwrap_or_default(),
            accuracy: ctx.accuracy.clone(),
            producer: format!("posequant {}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}
