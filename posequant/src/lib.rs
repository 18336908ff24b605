//! Calibration-driven post-training quantization for pose-estimation graphs.
//!
//! The pipeline loads a float ONNX graph, observes it on representative inputs,
//! derives 8-bit scale/zero-point parameters, rewrites the graph into QDQ form
//! and serializes it for an embedded target.
pub mod analysis;
pub mod calibrate;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod graph;
pub mod layers;
pub mod pipeline;
pub mod platform;
pub mod quantization;
pub mod rewrite;
pub mod tensor;

pub use calibrate::{CalibrationSettings, calibrate};
pub use config::{PipelineConfig, PipelineSettings};
pub use error::{PipelineError, PipelineResult, Stage};
pub use export::{ArtifactHandle, ExportContext, TargetFormat, export};
pub use graph::{Graph, load};
pub use pipeline::{Pipeline, lower_quantized};
pub use platform::TargetPlatform;
pub use quantization::{QuantParamSet, ScalingFactor};
pub use rewrite::{QuantizeSettings, QuantizedGraph, quantize};
pub use tensor::{Tensor, TensorData};

/// Integer type used for quantized values before they are narrowed to their storage type.
pub type Element = i64;
