//! End-to-end conversion: load, calibrate, quantize, analyse, export. Models that are
//! already in QDQ form can be lowered to the device format directly.
use std::path::{Path, PathBuf};

use tracing::{info, info_span, warn};

use crate::{
    analysis::{AccuracyReport, compare},
    calibrate::calibrate,
    config::PipelineSettings,
    data::CalibrationSource,
    error::PipelineResult,
    export::{ArtifactHandle, ExportContext, TargetFormat, export},
    graph::{Graph, load},
    platform::TargetPlatform,
    rewrite::{QuantizedGraph, quantize},
};

/// Result of the in-memory part of a run.
#[derive(Clone, Debug)]
pub struct Conversion {
    pub quantized: QuantizedGraph,
    pub accuracy: AccuracyReport,
}

/// One conversion run. Each run owns its graph, so independent pipelines can run
/// concurrently.
#[derive(Clone, Debug)]
pub struct Pipeline {
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// File an artifact of `format` is written to.
    pub fn artifact_path(output_dir: &Path, base_name: &str, format: TargetFormat) -> PathBuf {
        match format {
            TargetFormat::Onnx => output_dir.join(format!("{base_name}_int8.onnx")),
            TargetFormat::Espdl => output_dir.join(format!("{base_name}.espdl")),
        }
    }

    pub fn run(
        &self,
        model_path: &Path,
        source: &dyn CalibrationSource,
        output_dir: &Path,
        base_name: &str,
        formats: &[TargetFormat],
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        let graph = {
            let _span = info_span!("load").entered();
            let graph = load(model_path)?;
            info!("loaded {}", model_path.display());
            graph
        };
        let conversion = self.convert(graph.clone(), source)?;
        self.export_all(&graph, &conversion, output_dir, base_name, formats)
    }

    /// Calibrate and quantize `graph`, then measure the quantized graph on the first batch.
    pub fn convert(&self, mut graph: Graph, source: &dyn CalibrationSource) -> PipelineResult<Conversion> {
        let settings = &self.settings;
        graph.resolve_input_shape(&settings.input_shape)?;

        let params = {
            let _span = info_span!("calibrate").entered();
            calibrate(&graph, source, &settings.calibration)?
        };

        let quantized = {
            let _span = info_span!("quantize").entered();
            let quantized = quantize(&graph, &params, &settings.quantize)?;
            if !quantized.float_nodes.is_empty() {
                warn!(
                    "{} node(s) left in float on {}: {}",
                    quantized.float_nodes.len(),
                    settings.platform,
                    quantized.float_nodes.join(", ")
                );
            }
            quantized
        };

        let accuracy = {
            let _span = info_span!("analyse").entered();
            let samples = source
                .open()?
                .next_batch(settings.calibration.batch_size)
                .unwrap_or_default();
            let report = compare(&graph, &quantized.graph, &samples)?;
            if let Some(sqnr) = report.worst_sqnr_db() {
                info!("worst output SQNR over {} samples: {sqnr:.2} dB", report.samples);
            }
            report
        };

        Ok(Conversion { quantized, accuracy })
    }

    fn export_all(
        &self,
        source: &Graph,
        conversion: &Conversion,
        output_dir: &Path,
        base_name: &str,
        formats: &[TargetFormat],
    ) -> PipelineResult<Vec<ArtifactHandle>> {
        let _span = info_span!("export").entered();
        let settings = &self.settings;
        let ctx = ExportContext {
            input_shape: settings.input_shape.clone(),
            calibration: Some(settings.calibration.clone()),
            accuracy: Some(conversion.accuracy.clone()),
            ..ExportContext::new(
                settings.model_name.clone().unwrap_or_else(|| source.name.clone()),
                settings.platform,
            )
        };

        let mut handles = Vec::with_capacity(formats.len());
        for &format in formats {
            let path = Self::artifact_path(output_dir, base_name, format);
            let ctx = ExportContext {
                sidecar: format == TargetFormat::Espdl,
                ..ctx.clone()
            };
            let handle = export(&conversion.quantized, format, &path, None, &ctx)?;
            info!("{format} artifact: {}", handle.path.display());
            if let Some(sidecar) = &handle.sidecar {
                info!("metadata: {}", sidecar.display());
            }
            handles.push(handle);
        }
        Ok(handles)
    }
}

/// Lower a QDQ ONNX model, e.g. a previous `<name>_int8.onnx`, to `output_path` in the device
/// format without recalibrating. The sidecar lands next to it.
pub fn lower_quantized(model_path: &Path, platform: TargetPlatform, output_path: &Path) -> PipelineResult<ArtifactHandle> {
    let quantized = {
        let _span = info_span!("load").entered();
        let graph = load(model_path)?;
        info!("loaded {}", model_path.display());
        QuantizedGraph::from_qdq(graph, platform)?
    };
    if !quantized.float_nodes.is_empty() {
        warn!(
            "{} node(s) run in float on {}: {}",
            quantized.float_nodes.len(),
            platform,
            quantized.float_nodes.join(", ")
        );
    }

    let _span = info_span!("export").entered();
    let input_shape = quantized
        .graph
        .input_infos()
        .first()
        .and_then(|info| info.static_shape())
        .unwrap_or_default();
    let ctx = ExportContext {
        input_shape,
        sidecar: true,
        ..ExportContext::new(&quantized.graph.name, platform)
    };
    let handle = export(&quantized, TargetFormat::Espdl, output_path, None, &ctx)?;
    info!("espdl artifact: {}", handle.path.display());
    Ok(handle)
}
