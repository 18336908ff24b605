//! Serialization of float or quantized graphs into target formats, with an optional JSON
//! sidecar mirroring the run configuration.
pub mod espdl;
pub mod metadata;
pub(crate) mod onnx;

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::{
    analysis::AccuracyReport,
    calibrate::CalibrationSettings,
    error::{PipelineError, PipelineResult, Stage},
    graph::Graph,
    platform::TargetPlatform,
    rewrite::QuantizedGraph,
};
use metadata::Sidecar;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    #[display("onnx")]
    Onnx,
    #[display("espdl")]
    Espdl,
}

impl TargetFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Onnx => "onnx",
            TargetFormat::Espdl => "espdl",
        }
    }
}

impl FromStr for TargetFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(TargetFormat::Onnx),
            "espdl" => Ok(TargetFormat::Espdl),
            other => Err(PipelineError::unsupported_target(Stage::Config, other)),
        }
    }
}

/// Anything the exporter can serialize.
pub trait Exportable {
    fn graph(&self) -> &Graph;

    /// `Some` for QDQ graphs, which carry the parameters the sidecar reports.
    fn quantized(&self) -> Option<&QuantizedGraph> {
        None
    }
}

impl Exportable for Graph {
    fn graph(&self) -> &Graph {
        self
    }
}

impl Exportable for QuantizedGraph {
    fn graph(&self) -> &Graph {
        &self.graph
    }

    fn quantized(&self) -> Option<&QuantizedGraph> {
        Some(self)
    }
}

/// Run configuration echoed into the sidecar.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportContext {
    pub model_name: String,
    pub platform: TargetPlatform,
    pub input_shape: Vec<usize>,
    pub calibration: Option<CalibrationSettings>,
    pub accuracy: Option<AccuracyReport>,
    /// Write `<output>.json` when no explicit sidecar path is given.
    pub sidecar: bool,
}

impl ExportContext {
    pub fn new(model_name: impl Into<String>, platform: TargetPlatform) -> Self {
        Self {
            model_name: model_name.into(),
            platform,
            input_shape: vec![],
            calibration: None,
            accuracy: None,
            sidecar: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArtifactHandle {
    pub path: PathBuf,
    pub format: TargetFormat,
    pub sidecar: Option<PathBuf>,
    /// Lowercase hex SHA-256 of the artifact bytes.
    pub sha256: String,
}

fn write(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PipelineError::export_io(parent, e))?;
    }
    fs::write(path, bytes).map_err(|e| PipelineError::export_io(path, e))
}

/// Serialize `graph` to `output_path`, plus its sidecar when requested.
pub fn export<E: Exportable + ?Sized>(
    graph: &E,
    format: TargetFormat,
    output_path: &Path,
    config_path: Option<&Path>,
    ctx: &ExportContext,
) -> PipelineResult<ArtifactHandle> {
    // A quantized graph is bound to the platform it was classified for.
    let platform = graph.quantized().map_or(ctx.platform, |q| q.platform);
    platform.check_format(format, Stage::Export)?;
    let bytes = match format {
        TargetFormat::Onnx => onnx::encode(graph.graph()),
        TargetFormat::Espdl => {
            let Some(quantized) = graph.quantized() else {
                return Err(PipelineError::malformed(
                    Stage::Export,
                    &graph.graph().name,
                    format!("{format} needs a quantized graph, this one is float"),
                ));
            };
            espdl::lower(quantized)
                .and_then(|model| espdl::to_bytes(&model))
                .map_err(|e| PipelineError::MalformedGraph {
                    stage: Stage::Export,
                    graph: quantized.graph.name.clone(),
                    reason: format!("{e:#}"),
                })?
        }
    };
    write(output_path, &bytes)?;
    let sha256 = format!("{:x}", Sha256::digest(&bytes));
    info!("wrote {} ({} bytes, sha256 {})", output_path.display(), bytes.len(), sha256);

    let sidecar_path = config_path
        .map(Path::to_path_buf)
        .or_else(|| ctx.sidecar.then(|| output_path.with_extension("json")));
    if let Some(path) = &sidecar_path {
        let artifact = output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sidecar = Sidecar::new(ctx, format, graph.quantized(), artifact, sha256.clone());
        let json = sidecar.to_json().map_err(|e| PipelineError::export_io(path, e.into()))?;
        write(path, &json)?;
        info!("wrote {}", path.display());
    }

    Ok(ArtifactHandle {
        path: output_path.to_path_buf(),
        format,
        sidecar: sidecar_path,
        sha256,
    })
}
