//! Output error of a QDQ graph simulated in float against its source graph.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{PipelineError, PipelineResult, Stage},
    graph::{Executor, Graph},
    tensor::{Tensor, TensorData},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputError {
    pub max_abs_error: f32,
    pub mean_abs_error: f32,
    /// Signal to quantization noise ratio, `None` when the outputs match exactly.
    pub sqnr_db: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub samples: usize,
    pub outputs: BTreeMap<String, OutputError>,
}

impl AccuracyReport {
    /// Lowest SQNR over every output.
    pub fn worst_sqnr_db(&self) -> Option<f32> {
        self.outputs
            .values()
            .filter_map(|o| o.sqnr_db)
            .min_by(|a, b| a.total_cmp(b))
    }
}

#[derive(Default)]
struct Accumulator {
    max_abs: f32,
    abs_sum: f64,
    signal: f64,
    noise: f64,
    count: usize,
}

/// Run `float` and `quantized` on every sample and compare their outputs by name.
pub fn compare(float: &Graph, quantized: &Graph, samples: &[Tensor<f32>]) -> PipelineResult<AccuracyReport> {
    let simulation_error = |graph: &Graph, e: crate::graph::ExecError| PipelineError::MalformedGraph {
        stage: Stage::Quantize,
        graph: graph.name.clone(),
        reason: e.to_string(),
    };
    let reference = Executor::new(float, Stage::Quantize)?;
    let simulated = Executor::new(quantized, Stage::Quantize)?;
    let [input] = float.inputs() else {
        return Err(PipelineError::malformed(Stage::Quantize, &float.name, "expected a single graph input"));
    };

    let mut acc: BTreeMap<String, Accumulator> = BTreeMap::new();
    for sample in samples {
        let feed = || vec![(input.clone(), TensorData::F32(sample.clone()))];
        let expected = reference.run(feed()).map_err(|e| simulation_error(float, e))?;
        let actual = simulated.run(feed()).map_err(|e| simulation_error(quantized, e))?;
        for (name, value) in &expected {
            let (Ok(a), Some(Ok(b))) = (value.as_f32(), actual.get(name).map(TensorData::as_f32)) else {
                continue;
            };
            let entry = acc.entry(name.clone()).or_default();
            for (x, y) in a.get_data().iter().zip(b.get_data()) {
                let err = (x - y).abs();
                entry.max_abs = entry.max_abs.max(err);
                entry.abs_sum += err as f64;
                entry.signal += (*x as f64).powi(2);
                entry.noise += (err as f64).powi(2);
                entry.count += 1;
            }
        }
    }

    let outputs = acc
        .into_iter()
        .map(|(name, a)| {
            let report = OutputError {
                max_abs_error: a.max_abs,
                mean_abs_error: (a.abs_sum / a.count.max(1) as f64) as f32,
                sqnr_db: (a.noise > 0.0).then(|| (10.0 * (a.signal / a.noise).log10()) as f32),
            };
            info!(
                "output {}: max |err| {:.6}, mean |err| {:.6}, sqnr {}",
                name,
                report.max_abs_error,
                report.mean_abs_error,
                report.sqnr_db.map_or("exact".to_string(), |s| format!("{s:.2} dB"))
            );
            (name, report)
        })
        .collect();
    Ok(AccuracyReport {
        samples: samples.len(),
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Dim, GraphBuilder, Node};

    fn relu(name: &str, scale: f32) -> Graph {
        GraphBuilder::new(name)
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(4)])
            .initializer("k", Tensor::new(vec![1], vec![scale]).into())
            .node(Node::new("mul", "Mul", ["x", "k"], ["h"]))
            .node(Node::new("relu", "Relu", ["h"], ["y"]))
            .output("y")
            .build()
            .unwrap()
    }

    #[test]
    fn test_identical_graphs_are_exact() {
        let g = relu("a", 1.0);
        let samples = vec![Tensor::new(vec![1, 4], vec![1.0, -1.0, 2.0, 0.5])];
        let report = compare(&g, &g, &samples).unwrap();
        let y = &report.outputs["y"];
        assert_eq!(y.max_abs_error, 0.0);
        assert_eq!(y.sqnr_db, None);
        assert_eq!(report.samples, 1);
    }

    #[test]
    fn test_error_statistics() {
        let samples = vec![Tensor::new(vec![1, 4], vec![1.0, 1.0, 1.0, 1.0])];
        let report = compare(&relu("a", 1.0), &relu("b", 1.1), &samples).unwrap();
        let y = &report.outputs["y"];
        assert!((y.max_abs_error - 0.1).abs() < 1e-6);
        assert!((y.mean_abs_error - 0.1).abs() < 1e-6);
        // 10 * log10(1 / 0.01)
        assert!((y.sqnr_db.unwrap() - 20.0).abs() < 1e-3);
        assert_eq!(report.worst_sqnr_db(), y.sqnr_db);
    }
}
