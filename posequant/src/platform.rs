//! Registered target devices: which operator kinds they run in int8 and which formats
//! they accept.
use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, PipelineResult, Stage},
    export::TargetFormat,
    layers::OpKind,
};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPlatform {
    #[display("esp32p4")]
    #[serde(rename = "esp32p4")]
    Esp32P4,
    #[display("esp32s3")]
    #[serde(rename = "esp32s3")]
    Esp32S3,
    #[display("generic")]
    #[serde(rename = "generic")]
    Generic,
}

const ESP32P4_KINDS: &[OpKind] = &[
    OpKind::Conv,
    OpKind::Gemm,
    OpKind::MatMul,
    OpKind::Relu,
    OpKind::LeakyRelu,
    OpKind::Sigmoid,
    OpKind::Tanh,
    OpKind::HardSwish,
    OpKind::Add,
    OpKind::Sub,
    OpKind::Mul,
    OpKind::MaxPool,
    OpKind::AveragePool,
    OpKind::GlobalAveragePool,
    OpKind::Concat,
    OpKind::Reshape,
    OpKind::Flatten,
    OpKind::Transpose,
    OpKind::Resize,
    OpKind::Split,
    OpKind::Slice,
];

const ESP32S3_KINDS: &[OpKind] = &[
    OpKind::Conv,
    OpKind::Gemm,
    OpKind::MatMul,
    OpKind::Relu,
    OpKind::LeakyRelu,
    OpKind::Sigmoid,
    OpKind::HardSwish,
    OpKind::Add,
    OpKind::Mul,
    OpKind::MaxPool,
    OpKind::AveragePool,
    OpKind::GlobalAveragePool,
    OpKind::Concat,
    OpKind::Reshape,
    OpKind::Flatten,
    OpKind::Transpose,
    OpKind::Resize,
];

impl TargetPlatform {
    pub const ALL: [TargetPlatform; 3] = [TargetPlatform::Esp32P4, TargetPlatform::Esp32S3, TargetPlatform::Generic];

    /// Kinds the device executes in fixed point.
    pub fn native_kinds(&self) -> Vec<OpKind> {
        match self {
            TargetPlatform::Esp32P4 => ESP32P4_KINDS.to_vec(),
            TargetPlatform::Esp32S3 => ESP32S3_KINDS.to_vec(),
            TargetPlatform::Generic => OpKind::ALL.iter().copied().filter(OpKind::has_fixed_point_form).collect(),
        }
    }

    pub fn supports(&self, kind: OpKind) -> bool {
        kind.has_fixed_point_form()
            && match self {
                TargetPlatform::Esp32P4 => ESP32P4_KINDS.contains(&kind),
                TargetPlatform::Esp32S3 => ESP32S3_KINDS.contains(&kind),
                TargetPlatform::Generic => true,
            }
    }

    pub fn formats(&self) -> &'static [TargetFormat] {
        match self {
            TargetPlatform::Esp32P4 | TargetPlatform::Esp32S3 => &[TargetFormat::Onnx, TargetFormat::Espdl],
            TargetPlatform::Generic => &[TargetFormat::Onnx],
        }
    }

    /// Fails with `UnsupportedTarget` when the pair is not registered.
    pub fn check_format(&self, format: TargetFormat, stage: Stage) -> PipelineResult<()> {
        if self.formats().contains(&format) {
            Ok(())
        } else {
            Err(PipelineError::unsupported_target(stage, format!("{format} on {self}")))
        }
    }
}

impl FromStr for TargetPlatform {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetPlatform::ALL
            .into_iter()
            .find(|p| p.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::unsupported_target(Stage::Config, s))
    }
}
