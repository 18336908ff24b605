//! Error taxonomy of the conversion pipeline. Every variant names the stage that failed,
//! and `Display` renders as `[stage] message` so the CLI can print it on one line.
use std::path::PathBuf;

use derive_more::Display;
use serde::Serialize;
use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[display("load")]
    Load,
    #[display("data")]
    Data,
    #[display("calibrate")]
    Calibrate,
    #[display("quantize")]
    Quantize,
    #[display("export")]
    Export,
    #[display("config")]
    Config,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("[{stage}] input not found: {}", .path.display())]
    InputNotFound { stage: Stage, path: PathBuf },

    #[error("[{stage}] empty calibration set: {source_name}")]
    EmptyCalibrationSet { stage: Stage, source_name: String },

    #[error("[{stage}] malformed graph '{graph}': {reason}")]
    MalformedGraph {
        stage: Stage,
        graph: String,
        reason: String,
    },

    #[error("[{stage}] unsupported operator '{op_type}' at node '{node}'")]
    UnsupportedOperator {
        stage: Stage,
        op_type: String,
        node: String,
    },

    #[error(
        "[{stage}] operator '{op_type}' at node '{node}' has no fixed-point form on '{platform}' and mixed precision is disabled"
    )]
    UnsupportedPlatformMix {
        stage: Stage,
        op_type: String,
        node: String,
        platform: String,
    },

    #[error("[{stage}] unsupported target: {target}")]
    UnsupportedTarget { stage: Stage, target: String },

    #[error("[{stage}] calibration failed at '{at}': {reason}")]
    CalibrationFailed {
        stage: Stage,
        at: String,
        reason: String,
    },

    #[error("[{stage}] i/o failure on {}: {source}", .path.display())]
    ExportIo {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[{stage}] invalid configuration '{field}': {reason}")]
    InvalidConfig {
        stage: Stage,
        field: String,
        reason: String,
    },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::InputNotFound { stage, .. }
            | PipelineError::EmptyCalibrationSet { stage, .. }
            | PipelineError::MalformedGraph { stage, .. }
            | PipelineError::UnsupportedOperator { stage, .. }
            | PipelineError::UnsupportedPlatformMix { stage, .. }
            | PipelineError::UnsupportedTarget { stage, .. }
            | PipelineError::CalibrationFailed { stage, .. }
            | PipelineError::ExportIo { stage, .. }
            | PipelineError::InvalidConfig { stage, .. } => *stage,
        }
    }

    pub(crate) fn malformed(stage: Stage, graph: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        PipelineError::MalformedGraph {
            stage,
            graph: graph.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn calibration(at: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        PipelineError::CalibrationFailed {
            stage: Stage::Calibrate,
            at: at.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_config(
        stage: Stage,
        field: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        PipelineError::InvalidConfig {
            stage,
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn export_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::ExportIo {
            stage: Stage::Export,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn unsupported_target(stage: Stage, target: impl Into<String>) -> Self {
        PipelineError::UnsupportedTarget {
            stage,
            target: target.into(),
        }
    }
}
