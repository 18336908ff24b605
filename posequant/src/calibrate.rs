//! Observes a float graph on calibration samples and derives its quantization parameters.
//!
//! Statistics are gathered in up to two passes over the same batches: a min/max pass, then,
//! for strategies that need it, a histogram pass over ranges fixed by the first one. Each
//! batch is evaluated in parallel and folded into the run state only once every sample of
//! the batch has succeeded.
use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    data::CalibrationSource,
    error::{PipelineError, PipelineResult, Stage},
    graph::{ExecError, Executor, Graph},
    layers::{InputRole, OpKind, dense::Gemm},
    quantization::{
        CalibrationAlgorithm, HistogramObserver, QuantParamSet, QuantParams, RangeObserver, ScalingFactor,
        TensorKind, TensorQuantization, WEIGHT_DOMAIN,
    },
    tensor::{DataType, Tensor, TensorData},
};

pub const DEFAULT_PERCENTILE: f32 = 99.99;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Maximum number of batches drawn from the source.
    pub num_batches: usize,
    pub batch_size: usize,
    pub algorithm: CalibrationAlgorithm,
    /// Upper percentile kept by the percentile strategy, in (0, 100].
    pub percentile: f32,
    pub per_channel: bool,
}

impl CalibrationSettings {
    pub fn new(algorithm: CalibrationAlgorithm, num_batches: usize, batch_size: usize) -> Self {
        Self {
            num_batches,
            batch_size,
            algorithm,
            percentile: DEFAULT_PERCENTILE,
            per_channel: false,
        }
    }
}

/// Tensors that receive quantization parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct QuantTargets {
    pub activations: BTreeSet<String>,
    /// Weight initializers with the axis holding output channels, when they have one.
    pub weights: BTreeMap<String, Option<usize>>,
}

/// Activations are the f32 data inputs and outputs of every node with an int8 form; weights
/// are f32 initializers feeding such nodes through a weight or data slot.
pub(crate) fn quantization_targets(graph: &Graph, stage: Stage) -> PipelineResult<QuantTargets> {
    let mut targets = QuantTargets::default();
    let is_f32 = |name: &str| graph.tensor(name).is_some_and(|t| t.dtype == DataType::F32);
    for node in graph.nodes() {
        let kind = node.kind(stage)?;
        if !kind.has_fixed_point_form() {
            continue;
        }
        let spec = kind.spec();
        for (i, input) in node.inputs.iter().enumerate() {
            if input.is_empty() || !is_f32(input) {
                continue;
            }
            let role = spec.input_role(i);
            if !matches!(role, InputRole::Data | InputRole::Weight) {
                continue;
            }
            if graph.is_initializer(input) {
                let axis = match (kind, role) {
                    (OpKind::Conv, InputRole::Weight) => Some(0),
                    (OpKind::Gemm, InputRole::Weight) => Gemm::from_node(node)
                        .map(|g| g.output_channel_axis())
                        .map_err(|e| PipelineError::malformed(stage, &graph.name, format!("node '{}': {e:#}", node.name)))
                        .map(Some)?,
                    (OpKind::MatMul, _) if i == 1 => graph
                        .initializer(input)
                        .map(|w| w.get_shape().len())
                        .filter(|rank| *rank >= 2)
                        .map(|rank| rank - 1),
                    _ => None,
                };
                targets
                    .weights
                    .entry(input.clone())
                    .and_modify(|existing| {
                        if *existing != axis {
                            *existing = None;
                        }
                    })
                    .or_insert(axis);
            } else {
                targets.activations.insert(input.clone());
            }
        }
        for output in node.outputs.iter().filter(|o| !o.is_empty()) {
            if is_f32(output) {
                targets.activations.insert(output.clone());
            }
        }
    }
    Ok(targets)
}

/// Symmetric weight parameters, one factor per channel along `axis` when requested.
pub(crate) fn weight_params(t: &Tensor<f32>, axis: Option<usize>, per_channel: bool) -> QuantParams {
    match axis.filter(|a| per_channel && *a < t.rank()) {
        Some(axis) => {
            let shape = t.shape();
            let channels = shape[axis];
            let inner: usize = shape[axis + 1..].iter().product();
            let mut abs_max = vec![0f32; channels];
            for (i, v) in t.get_data().iter().enumerate() {
                let c = (i / inner) % channels;
                abs_max[c] = abs_max[c].max(v.abs());
            }
            QuantParams::PerChannel {
                axis,
                factors: abs_max
                    .into_iter()
                    .map(|a| ScalingFactor::from_absolute_max(a, Some(WEIGHT_DOMAIN)))
                    .collect(),
            }
        }
        None => QuantParams::PerTensor(ScalingFactor::from_tensor(t, Some(WEIGHT_DOMAIN))),
    }
}

fn exec_failure(e: ExecError) -> PipelineError {
    PipelineError::calibration(e.node, e.reason)
}

/// Run every sample of `batch` and fold what `observe` records into a single observer. Each
/// rayon split starts from `new_observer` and the partial observers are merged with `merge`,
/// which must be associative for the result to be independent of the split.
fn observe_batch<O, N, F, M>(
    exec: &Executor,
    input: &str,
    batch: &[Tensor<f32>],
    targets: &BTreeSet<String>,
    new_observer: N,
    observe: F,
    merge: M,
) -> PipelineResult<O>
where
    O: Send,
    N: Fn() -> O + Sync + Send,
    F: Fn(&mut O, &str, &Tensor<f32>) + Sync + Send,
    M: Fn(&mut O, O) + Sync + Send,
{
    batch
        .par_iter()
        .try_fold(&new_observer, |mut observer, sample| {
            exec.run_observed(vec![(input.to_string(), TensorData::F32(sample.clone()))], |name, value| {
                if let (true, TensorData::F32(t)) = (targets.contains(name), value) {
                    observe(&mut observer, name, t);
                }
            })
            .map_err(exec_failure)?;
            Ok::<_, PipelineError>(observer)
        })
        .try_reduce(&new_observer, |mut a, b| {
            merge(&mut a, b);
            Ok(a)
        })
}

/// Derive a parameter for every quantizable tensor of `graph` from the samples of `source`.
pub fn calibrate(
    graph: &Graph,
    source: &dyn CalibrationSource,
    settings: &CalibrationSettings,
) -> PipelineResult<QuantParamSet> {
    let exec = Executor::new(graph, Stage::Calibrate)?;
    let targets = quantization_targets(graph, Stage::Calibrate)?;
    let [input] = graph.inputs() else {
        return Err(PipelineError::calibration(
            &graph.name,
            format!("expected a single graph input, found {}", graph.inputs().len()),
        ));
    };
    let strategy = settings.algorithm.strategy(settings.percentile);
    info!(
        "calibrating '{}' with {} over at most {} batches of {}: {} activations, {} weights",
        graph.name,
        settings.algorithm,
        settings.num_batches,
        settings.batch_size,
        targets.activations.len(),
        targets.weights.len()
    );

    let mut ranges = RangeObserver::default();
    let mut num_samples = 0;
    let mut num_batches = 0;
    let mut reader = source.open()?;
    while num_batches < settings.num_batches {
        let Some(batch) = reader.next_batch(settings.batch_size) else {
            break;
        };
        let observed = observe_batch(
            &exec,
            input,
            &batch,
            &targets.activations,
            RangeObserver::default,
            |o: &mut RangeObserver, name, t| o.observe(name, t),
            RangeObserver::merge,
        )?;
        ranges.merge(observed);
        num_samples += batch.len();
        num_batches += 1;
        debug!("batch {} observed, {} samples so far", num_batches, num_samples);
    }
    drop(reader);

    if num_samples == 0 {
        return Err(PipelineError::EmptyCalibrationSet {
            stage: Stage::Calibrate,
            source_name: source.name(),
        });
    }
    if num_samples < settings.batch_size {
        return Err(PipelineError::calibration(
            source.name(),
            format!(
                "only {} samples observed, at least one full batch of {} is required",
                num_samples, settings.batch_size
            ),
        ));
    }

    let histograms = match strategy.histogram_mode() {
        Some(mode) => {
            let base = HistogramObserver::from_ranges(&ranges, mode);
            let mut merged = base.empty_like();
            let mut reader = source.open()?;
            for _ in 0..num_batches {
                let Some(batch) = reader.next_batch(settings.batch_size) else {
                    break;
                };
                let observed = observe_batch(
                    &exec,
                    input,
                    &batch,
                    &targets.activations,
                    || base.empty_like(),
                    |o: &mut HistogramObserver, name, t| o.observe(name, t),
                    HistogramObserver::merge,
                )?;
                merged.merge(observed);
            }
            info!("histogram pass done over {} batches", num_batches);
            Some(merged)
        }
        None => None,
    };

    let mut params = QuantParamSet::new(settings.algorithm, settings.per_channel, num_samples);
    for name in &targets.activations {
        let stats = ranges
            .get(name)
            .filter(|s| s.min <= s.max)
            .ok_or_else(|| PipelineError::calibration(name, "no finite value observed"))?;
        let factor = strategy.scaling_factor(stats, histograms.as_ref().and_then(|h| h.get(name)));
        debug!(
            "activation {}: observed [{}, {}], scale {} zero point {}",
            name,
            stats.min,
            stats.max,
            factor.scale(),
            factor.zero_point()
        );
        params.insert(
            name,
            TensorQuantization {
                kind: TensorKind::Activation,
                params: QuantParams::PerTensor(factor),
            },
        );
    }
    for (name, axis) in &targets.weights {
        let Some(TensorData::F32(w)) = graph.initializer(name) else {
            continue;
        };
        let q = weight_params(w, *axis, settings.per_channel);
        debug!("weight {}: {} scale(s), axis {:?}", name, q.num_channels(), q.axis());
        params.insert(
            name,
            TensorQuantization {
                kind: TensorKind::Weight,
                params: q,
            },
        );
    }
    info!(
        "calibrated {} tensors of '{}' from {} samples",
        params.len(),
        graph.name,
        num_samples
    );
    Ok(params)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        data::InMemorySource,
        graph::{Attribute, Dim, GraphBuilder, Node},
        quantization::HistogramMode,
    };

    /// x -> Conv(w, b) -> Relu -> y
    fn conv_relu() -> Graph {
        let w = Tensor::new(vec![2, 1, 1, 1], vec![0.5f32, -2.0]);
        GraphBuilder::new("conv_relu")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(1), Dim::Fixed(2), Dim::Fixed(2)])
            .initializer("w", w.into())
            .initializer("b", Tensor::new(vec![2], vec![0.1f32, 0.2]).into())
            .node(Node::new("conv", "Conv", ["x", "w", "b"], ["c"]))
            .node(Node::new("relu", "Relu", ["c"], ["y"]))
            .output("y")
            .build()
            .unwrap()
    }

    fn ramp(n: usize) -> InMemorySource {
        InMemorySource::new(
            (0..n)
                .map(|i| Tensor::new(vec![1, 1, 2, 2], vec![i as f32 / n as f32; 4]))
                .collect(),
        )
    }

    #[test]
    fn test_batch_folds_into_one_observer() {
        let g = conv_relu();
        let exec = Executor::new(&g, Stage::Calibrate).unwrap();
        let targets = quantization_targets(&g, Stage::Calibrate).unwrap().activations;
        let batch: Vec<_> = (0..16)
            .map(|i| Tensor::new(vec![1, 1, 2, 2], vec![i as f32 - 8.0, 0.5, i as f32 * 0.25, -1.0]))
            .collect();

        let mut sequential = RangeObserver::default();
        for sample in &batch {
            exec.run_observed(vec![("x".into(), sample.clone().into())], |name, value| {
                if let (true, TensorData::F32(t)) = (targets.contains(name), value) {
                    sequential.observe(name, t);
                }
            })
            .unwrap();
        }
        let folded = observe_batch(
            &exec,
            "x",
            &batch,
            &targets,
            RangeObserver::default,
            |o: &mut RangeObserver, name, t| o.observe(name, t),
            RangeObserver::merge,
        )
        .unwrap();
        let stats = |o: &RangeObserver| o.iter().map(|(n, s)| (n.clone(), *s)).collect::<Vec<_>>();
        assert_eq!(stats(&folded), stats(&sequential));
        assert_eq!(folded.get("x").unwrap().count, 64);

        let base = HistogramObserver::from_ranges(&sequential, HistogramMode::Signed);
        let mut expected = base.empty_like();
        for sample in &batch {
            expected.observe("x", sample);
        }
        let hist = observe_batch(
            &exec,
            "x",
            &batch,
            &targets,
            || base.empty_like(),
            |o: &mut HistogramObserver, name, t| o.observe(name, t),
            HistogramObserver::merge,
        )
        .unwrap();
        assert_eq!(hist.get("x"), expected.get("x"));
        assert_eq!(hist.get("x").unwrap().total(), 64);
    }

    #[test]
    fn test_targets() {
        let g = conv_relu();
        let t = quantization_targets(&g, Stage::Calibrate).unwrap();
        assert_eq!(t.activations.iter().collect::<Vec<_>>(), vec!["c", "x", "y"]);
        assert_eq!(t.weights.get("w"), Some(&Some(0)));
        assert!(!t.weights.contains_key("b"));
    }

    #[test]
    fn test_min_max_covers_observed_range() {
        let g = conv_relu();
        let settings = CalibrationSettings::new(CalibrationAlgorithm::MinMax, 4, 2);
        let params = calibrate(&g, &ramp(8), &settings).unwrap();
        assert_eq!(params.num_samples, 8);
        let x = params.activation("x").unwrap();
        assert_eq!(x.min(), 0.0);
        assert!((x.max() - 7.0 / 8.0).abs() < 1e-6);
        let c = params.activation("c").unwrap();
        assert!(c.min() < 0.0, "negative conv outputs widen the range");
        let w = params.get("w").unwrap();
        assert_eq!(w.kind, TensorKind::Weight);
        assert_eq!(w.params.zero_points(), vec![0]);
    }

    #[test]
    fn test_batches_are_limited() {
        let g = conv_relu();
        let settings = CalibrationSettings::new(CalibrationAlgorithm::MinMax, 2, 2);
        let params = calibrate(&g, &ramp(8), &settings).unwrap();
        assert_eq!(params.num_samples, 4);
    }

    #[test]
    fn test_per_channel_weights() {
        let g = conv_relu();
        let settings = CalibrationSettings {
            per_channel: true,
            ..CalibrationSettings::new(CalibrationAlgorithm::MinMax, 1, 1)
        };
        let params = calibrate(&g, &ramp(1), &settings).unwrap();
        let w = &params.get("w").unwrap().params;
        assert_eq!(w.axis(), Some(0));
        let scales = w.scales();
        assert!((scales[0] - 0.5 / 127.0).abs() < 1e-9);
        assert!((scales[1] - 2.0 / 127.0).abs() < 1e-9);
    }

    #[rstest]
    #[case(CalibrationAlgorithm::MinMax)]
    #[case(CalibrationAlgorithm::Percentile)]
    #[case(CalibrationAlgorithm::Kl)]
    fn test_deterministic(#[case] algorithm: CalibrationAlgorithm) {
        let g = conv_relu();
        let settings = CalibrationSettings::new(algorithm, 3, 3);
        let a = calibrate(&g, &ramp(9), &settings).unwrap();
        let b = calibrate(&g, &ramp(9), &settings).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.algorithm, Some(algorithm));
    }

    #[test]
    fn test_empty_source() {
        let g = conv_relu();
        let settings = CalibrationSettings::new(CalibrationAlgorithm::MinMax, 4, 2);
        let err = calibrate(&g, &InMemorySource::default(), &settings).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyCalibrationSet { .. }));
    }

    #[test]
    fn test_partial_batch_only() {
        let g = conv_relu();
        let settings = CalibrationSettings::new(CalibrationAlgorithm::MinMax, 4, 4);
        let err = calibrate(&g, &ramp(3), &settings).unwrap_err();
        assert!(matches!(err, PipelineError::CalibrationFailed { .. }));
    }

    #[test]
    fn test_wrong_sample_shape() {
        let g = conv_relu();
        let source = InMemorySource::new(vec![Tensor::new(vec![1, 3, 2, 2], vec![0.0; 12])]);
        let settings = CalibrationSettings::new(CalibrationAlgorithm::MinMax, 1, 1);
        let err = calibrate(&g, &source, &settings).unwrap_err();
        assert!(matches!(err, PipelineError::CalibrationFailed { ref at, .. } if at == "x"), "{err}");
    }

    #[test]
    fn test_unknown_operator() {
        let g = GraphBuilder::new("custom")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(1), Dim::Fixed(2), Dim::Fixed(2)])
            .node(Node::new("n3", "Foo", ["x"], ["y"]))
            .output("y")
            .build()
            .unwrap();
        let settings = CalibrationSettings::new(CalibrationAlgorithm::MinMax, 1, 1);
        let err = calibrate(&g, &ramp(1), &settings).unwrap_err();
        assert_eq!(err.to_string(), "[calibrate] unsupported operator 'Foo' at node 'n3'");
    }

    #[test]
    fn test_gemm_and_matmul_axes() {
        let g = GraphBuilder::new("dense")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(2)])
            .initializer("wt", Tensor::new(vec![3, 2], vec![0.0f32; 6]).into())
            .initializer("wm", Tensor::new(vec![3, 4], vec![0.0f32; 12]).into())
            .initializer("k", Tensor::new(vec![4], vec![1.0f32; 4]).into())
            .node(Node::new("gemm", "Gemm", ["x", "wt"], ["h"]).with_attr("transB", Attribute::Int(1)))
            .node(Node::new("mm", "MatMul", ["h", "wm"], ["m"]))
            .node(Node::new("add", "Add", ["m", "k"], ["y"]))
            .output("y")
            .build()
            .unwrap();
        let t = quantization_targets(&g, Stage::Calibrate).unwrap();
        assert_eq!(t.weights.get("wt"), Some(&Some(0)));
        assert_eq!(t.weights.get("wm"), Some(&Some(1)));
        assert_eq!(t.weights.get("k"), Some(&None));
    }
}
