//! Rewrites a float graph into QDQ form from a calibrated parameter set.
//!
//! Every activation read or written by an int8 node gets a QuantizeLinear/DequantizeLinear
//! pair right after its producer, weights are stored as int8 behind a DequantizeLinear that
//! keeps their original name, and biases of int8 Conv/Gemm nodes become int32 with scale
//! `s_input * s_weight`. Original nodes keep their order; only the Q/DQ nodes are new.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    Element,
    calibrate::{QuantTargets, quantization_targets},
    error::{PipelineError, PipelineResult, Stage},
    graph::{Attribute, Graph, GraphBuilder, Node, TensorRole},
    layers::InputRole,
    platform::TargetPlatform,
    quantization::{
        ACTIVATION_DOMAIN, BIAS_DOMAIN, QuantParamSet, QuantParams, ScalingFactor, TensorKind, TensorQuantization,
        WEIGHT_DOMAIN,
    },
    tensor::{DataType, Tensor, TensorData},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizeSettings {
    pub platform: TargetPlatform,
    /// Keep unsupported nodes in float instead of failing.
    pub allow_mixed_precision: bool,
}

/// QDQ graph plus what it was derived from. The source graph is not modified.
#[derive(Clone, Debug)]
pub struct QuantizedGraph {
    pub graph: Graph,
    pub params: QuantParamSet,
    pub platform: TargetPlatform,
    pub quantized_nodes: Vec<String>,
    pub float_nodes: Vec<String>,
}

impl QuantizedGraph {
    pub fn is_quantized(&self, node: &str) -> bool {
        self.quantized_nodes.iter().any(|n| n == node)
    }

    /// Recover parameters and node precision from a graph that is already in QDQ form.
    ///
    /// Activation factors come from QuantizeLinear nodes, weight factors from
    /// DequantizeLinear nodes over int8 initializers. A node runs in int8 when `platform`
    /// supports it, every float data or weight input is a DequantizeLinear output and every
    /// float output is quantized again. int32 biases are left to the device lowering.
    pub fn from_qdq(graph: Graph, platform: TargetPlatform) -> PipelineResult<Self> {
        let malformed = |reason: String| PipelineError::malformed(Stage::Load, &graph.name, reason);
        let mut params = QuantParamSet::recovered(false);
        let mut dequantized: BTreeSet<&str> = BTreeSet::new();
        for node in graph.nodes() {
            match node.op_type.as_str() {
                "QuantizeLinear" => {
                    let (Some(t), Some(scale)) = (node.input(0), qdq_operand(&graph, node, 1)?) else {
                        return Err(malformed(format!("node '{}' has no scale", node.name)));
                    };
                    let scale = scale.to_f32_vec();
                    let zero_point = qdq_zero_points(&graph, node, scale.len())?;
                    let ([scale], [zero_point]) = (scale.as_slice(), zero_point.as_slice()) else {
                        return Err(malformed(format!("activation '{t}' is not quantized per tensor")));
                    };
                    params.insert(
                        t,
                        TensorQuantization {
                            kind: TensorKind::Activation,
                            params: QuantParams::PerTensor(ScalingFactor::from_scale(
                                *scale,
                                *zero_point,
                                Some(ACTIVATION_DOMAIN),
                            )),
                        },
                    );
                }
                "DequantizeLinear" => {
                    let Some(out) = node.outputs.first().filter(|o| !o.is_empty()) else {
                        continue;
                    };
                    dequantized.insert(out.as_str());
                    let Some(TensorData::I8(w)) = node.input(0).and_then(|x| graph.initializer(x)) else {
                        continue;
                    };
                    let Some(scale) = qdq_operand(&graph, node, 1)? else {
                        return Err(malformed(format!("node '{}' has no scale", node.name)));
                    };
                    let scales = scale.to_f32_vec();
                    let zero_points = qdq_zero_points(&graph, node, scales.len())?;
                    if zero_points.len() != scales.len() {
                        return Err(malformed(format!(
                            "weight '{out}' has {} scales and {} zero points",
                            scales.len(),
                            zero_points.len()
                        )));
                    }
                    let factor = |(s, z): (&f32, &Element)| ScalingFactor::from_scale(*s, *z, Some(WEIGHT_DOMAIN));
                    let q = match scales.len() {
                        1 => QuantParams::PerTensor(factor((&scales[0], &zero_points[0]))),
                        channels => {
                            let rank = w.rank() as i64;
                            let axis = match node.attributes.get("axis") {
                                Some(Attribute::Int(a)) if *a < 0 => a + rank,
                                Some(Attribute::Int(a)) => *a,
                                _ => 1,
                            };
                            if axis < 0 || axis >= rank || w.shape()[axis as usize] != channels {
                                return Err(malformed(format!(
                                    "weight '{out}' has {channels} scales along axis {axis} of {:?}",
                                    w.shape()
                                )));
                            }
                            params.per_channel = true;
                            QuantParams::PerChannel {
                                axis: axis as usize,
                                factors: scales.iter().zip(zero_points.iter()).map(factor).collect(),
                            }
                        }
                    };
                    params.insert(
                        out.as_str(),
                        TensorQuantization {
                            kind: TensorKind::Weight,
                            params: q,
                        },
                    );
                }
                _ => {}
            }
        }
        if dequantized.is_empty() {
            return Err(malformed("no DequantizeLinear node, the graph is not quantized".to_string()));
        }

        let is_f32 = |name: &str| graph.tensor(name).map_or(true, |t| t.dtype == DataType::F32);
        let mut quantized_nodes = vec![];
        let mut float_nodes = vec![];
        for node in graph.nodes() {
            let kind = node.kind(Stage::Load)?;
            let spec = kind.spec();
            if spec.structural {
                continue;
            }
            let inputs_dequantized = node
                .inputs
                .iter()
                .enumerate()
                .filter(|(i, t)| {
                    !t.is_empty() && matches!(spec.input_role(*i), InputRole::Data | InputRole::Weight) && is_f32(t)
                })
                .all(|(_, t)| dequantized.contains(t.as_str()));
            let outputs_quantized = node
                .outputs
                .iter()
                .filter(|o| !o.is_empty() && is_f32(o))
                .all(|o| params.activation(o).is_some());
            if platform.supports(kind) && inputs_dequantized && outputs_quantized {
                quantized_nodes.push(node.name.clone());
            } else {
                float_nodes.push(node.name.clone());
            }
        }
        info!(
            "'{}' read back as QDQ: {} int8 nodes, {} float nodes, {} quantized tensors",
            graph.name,
            quantized_nodes.len(),
            float_nodes.len(),
            params.len()
        );
        Ok(Self {
            graph,
            params,
            platform,
            quantized_nodes,
            float_nodes,
        })
    }
}

/// Initializer read by input `i` of a Q/DQ node, `None` when the input is omitted.
fn qdq_operand<'g>(graph: &'g Graph, node: &Node, i: usize) -> PipelineResult<Option<&'g TensorData>> {
    match node.input(i) {
        None => Ok(None),
        Some(name) => graph.initializer(name).map(Some).ok_or_else(|| {
            PipelineError::malformed(
                Stage::Load,
                &graph.name,
                format!("node '{}' reads '{name}', which is not an initializer", node.name),
            )
        }),
    }
}

/// Zero points of a Q/DQ node, all zero when omitted.
fn qdq_zero_points(graph: &Graph, node: &Node, len: usize) -> PipelineResult<Vec<Element>> {
    match qdq_operand(graph, node, 2)? {
        Some(zp) => zp.to_i64_vec().map_err(|e| {
            PipelineError::malformed(Stage::Load, &graph.name, format!("node '{}' zero point: {e:#}", node.name))
        }),
        None => Ok(vec![0; len]),
    }
}

pub fn quantized_name(t: &str) -> String {
    format!("{t}_quantized")
}

pub fn dequantized_name(t: &str) -> String {
    format!("{t}_dequantized")
}

pub fn scale_name(t: &str) -> String {
    format!("{t}_scale")
}

pub fn zero_point_name(t: &str) -> String {
    format!("{t}_zero_point")
}

/// Q/DQ nodes being assembled.
#[derive(Default)]
struct Emitter {
    initializers: Vec<(String, TensorData)>,
    prologue: Vec<Node>,
}

impl Emitter {
    fn params(&mut self, t: &str, params: &QuantParams, zero_point: TensorData) {
        let scales = params.scales();
        let scale = match params.axis() {
            Some(_) => Tensor::new(vec![scales.len()], scales),
            None => Tensor::scalar(scales[0]),
        };
        self.initializers.push((scale_name(t), scale.into()));
        self.initializers.push((zero_point_name(t), zero_point));
    }

    fn with_axis(node: Node, params: &QuantParams) -> Node {
        match params.axis() {
            Some(axis) => node.with_attr("axis", Attribute::Int(axis as i64)),
            None => node,
        }
    }

    /// QuantizeLinear + DequantizeLinear on activation `t`, reading `t` and writing
    /// `t_dequantized`.
    fn activation(&mut self, t: &str, factor: &ScalingFactor) -> [Node; 2] {
        let zp = factor.zero_point() as i8;
        self.params(t, &QuantParams::PerTensor(*factor), Tensor::scalar(zp).into());
        let inputs = |x: String| vec![x, scale_name(t), zero_point_name(t)];
        [
            Node::new(format!("{t}_QuantizeLinear"), "QuantizeLinear", inputs(t.to_string()), vec![quantized_name(t)]),
            Node::new(
                format!("{t}_DequantizeLinear"),
                "DequantizeLinear",
                inputs(quantized_name(t)),
                vec![dequantized_name(t)],
            ),
        ]
    }

    /// Integer initializer `t_quantized` behind a DequantizeLinear that outputs `t`.
    fn constant(&mut self, t: &str, quantized: TensorData, params: &QuantParams, zero_point: TensorData) {
        self.initializers.push((quantized_name(t), quantized));
        self.params(t, params, zero_point);
        let node = Node::new(
            format!("{t}_DequantizeLinear"),
            "DequantizeLinear",
            vec![quantized_name(t), scale_name(t), zero_point_name(t)],
            vec![t.to_string()],
        );
        self.prologue.push(Self::with_axis(node, params));
    }
}

fn zero_points_i8(params: &QuantParams) -> TensorData {
    let zps: Vec<i8> = params.zero_points().into_iter().map(|z| z as i8).collect();
    match params.axis() {
        Some(_) => Tensor::new(vec![zps.len()], zps).into(),
        None => Tensor::scalar(zps[0]).into(),
    }
}

/// Bias parameters with scale `s_input * s_weight[c]`, or `None` when the bias layout does
/// not line up with the weight channels.
fn bias_params(bias: &Tensor<f32>, input: &ScalingFactor, weight: &QuantParams) -> Option<QuantParams> {
    let factor = |s_w: f32| ScalingFactor::from_scale(input.scale() * s_w, 0, Some(BIAS_DOMAIN));
    match weight {
        QuantParams::PerTensor(w) => Some(QuantParams::PerTensor(factor(w.scale()))),
        QuantParams::PerChannel { factors, .. } => (bias.shape() == [factors.len()]).then(|| QuantParams::PerChannel {
            axis: 0,
            factors: factors.iter().map(|w| factor(w.scale())).collect(),
        }),
    }
}

fn quantize_bias(bias: &Tensor<f32>, params: &QuantParams) -> Tensor<i32> {
    params.quantize_tensor(bias).map(|v| *v as i32)
}

fn quantize_weight(w: &Tensor<f32>, params: &QuantParams) -> Tensor<i8> {
    params.quantize_tensor(w).map(|v: &Element| *v as i8)
}

/// Classify every node, then emit the QDQ graph.
pub fn quantize(graph: &Graph, params: &QuantParamSet, settings: &QuantizeSettings) -> PipelineResult<QuantizedGraph> {
    let platform = settings.platform;
    let QuantTargets { activations, weights } = quantization_targets(graph, Stage::Quantize)?;
    info!("quantizing '{}' for {}", graph.name, platform);

    let mut quantized_nodes = vec![];
    let mut float_nodes = vec![];
    let mut qdq_tensors: BTreeSet<&str> = BTreeSet::new();
    let mut int8_weights: BTreeSet<&str> = BTreeSet::new();
    // bias name -> (consumer node, input activation, weight) for every int8 consumer
    let mut biases: BTreeMap<&str, Vec<(&str, &str, &str)>> = BTreeMap::new();

    for node in graph.nodes() {
        let kind = node.kind(Stage::Quantize)?;
        let spec = kind.spec();
        if spec.structural {
            continue;
        }
        let data_tensors = node
            .inputs
            .iter()
            .enumerate()
            .filter(|(i, t)| {
                !t.is_empty()
                    && matches!(spec.input_role(*i), InputRole::Data | InputRole::Weight)
                    && (activations.contains(*t) || weights.contains_key(*t))
            })
            .map(|(_, t)| t)
            .chain(node.outputs.iter().filter(|o| activations.contains(*o)));
        let calibrated = data_tensors.clone().all(|t| params.contains(t));
        if kind.has_fixed_point_form() && platform.supports(kind) && calibrated {
            for t in data_tensors {
                if weights.contains_key(t) {
                    int8_weights.insert(t.as_str());
                } else {
                    qdq_tensors.insert(t.as_str());
                }
            }
            if let (Some(b), Some(x), Some(w)) = (node.input(2), node.input(0), node.input(1)) {
                if spec.bias_input == Some(2) && int8_weights.contains(w) && graph.is_initializer(b) {
                    biases.entry(b).or_default().push((node.name.as_str(), x, w));
                }
            }
            quantized_nodes.push(node.name.clone());
        } else {
            if !settings.allow_mixed_precision {
                return Err(PipelineError::UnsupportedPlatformMix {
                    stage: Stage::Quantize,
                    op_type: node.op_type.clone(),
                    node: node.name.clone(),
                    platform: platform.to_string(),
                });
            }
            warn!("node '{}' ({}) stays in float on {}", node.name, node.op_type, platform);
            float_nodes.push(node.name.clone());
        }
    }

    let mut emitter = Emitter::default();
    let mut replaced: BTreeSet<&str> = BTreeSet::new();
    for w in &int8_weights {
        let (Some(TensorData::F32(value)), Some(q)) = (graph.initializer(w), params.get(w)) else {
            continue;
        };
        debug_assert_eq!(q.kind, TensorKind::Weight);
        emitter.constant(w, quantize_weight(value, &q.params).into(), &q.params, zero_points_i8(&q.params));
        replaced.insert(*w);
    }
    // consumer node -> name of its own int32 bias
    let mut bias_inputs: HashMap<&str, String> = HashMap::new();
    let mut folded_biases = 0;
    for (b, uses) in &biases {
        let Some(TensorData::F32(bias)) = graph.initializer(b) else {
            continue;
        };
        let consumers = graph.nodes().iter().filter(|n| n.inputs.iter().any(|i| i == b)).count();
        // A bias read by several nodes gets one copy per consumer, each with its own scale.
        let shared = uses.len() > 1 || consumers > 1;
        let mut folded = 0;
        for &(node, x, w) in uses {
            let (Some(input), Some(weight)) = (params.activation(x), params.get(w)) else {
                continue;
            };
            let Some(q) = bias_params(bias, input, &weight.params) else {
                debug!("bias {} of {} keeps float, its layout does not match {}", b, node, w);
                continue;
            };
            let zero_point: TensorData = match q.axis() {
                Some(_) => Tensor::<i32>::zeros(vec![q.num_channels()]).into(),
                None => Tensor::scalar(0i32).into(),
            };
            let name = if shared { format!("{b}_{node}") } else { b.to_string() };
            emitter.constant(&name, quantize_bias(bias, &q).into(), &q, zero_point);
            if shared {
                bias_inputs.insert(node, name);
            }
            folded += 1;
        }
        folded_biases += folded;
        if folded == consumers {
            replaced.insert(*b);
        }
    }

    let mut builder = GraphBuilder::new(&graph.name)
        .stage(Stage::Quantize)
        .opset(graph.opset.max(13));
    for info in graph.input_infos() {
        builder = builder.typed_input(&info.name, info.shape.clone(), info.dtype);
    }
    for info in graph.output_infos() {
        builder = builder.typed_output(&info.name, info.shape.clone(), info.dtype);
    }
    for info in graph.tensors().filter(|t| t.role == TensorRole::Intermediate) {
        builder = builder.value_info(info.clone());
    }
    for (name, value) in graph.initializers().iter().filter(|(n, _)| !replaced.contains(n.as_str())) {
        builder = builder.initializer(name, value.clone());
    }

    let rewire = |node: &Node| -> Node {
        let mut node = node.clone();
        for input in node.inputs.iter_mut() {
            if qdq_tensors.contains(input.as_str()) {
                *input = dequantized_name(input);
            }
        }
        if let (Some(bias), Some(slot)) = (bias_inputs.get(node.name.as_str()), node.inputs.get_mut(2)) {
            *slot = bias.clone();
        }
        node
    };
    let mut nodes = vec![];
    let mut pairs = 0;
    for input in graph.inputs().iter().filter(|i| qdq_tensors.contains(i.as_str())) {
        if let Some(factor) = params.activation(input) {
            nodes.extend(emitter.activation(input, factor));
            pairs += 1;
        }
    }
    nodes.append(&mut emitter.prologue);
    for node in graph.nodes() {
        nodes.push(rewire(node));
        for out in node.outputs.iter().filter(|o| qdq_tensors.contains(o.as_str())) {
            if let Some(factor) = params.activation(out) {
                nodes.extend(emitter.activation(out, factor));
                pairs += 1;
            }
        }
    }
    for (name, value) in emitter.initializers {
        builder = builder.initializer(name, value);
    }
    let rewritten = builder.nodes(nodes).build()?;

    info!(
        "'{}': {} int8 nodes, {} float nodes, {} activation pairs, {} weights and {} biases folded",
        graph.name,
        quantized_nodes.len(),
        float_nodes.len(),
        pairs,
        int8_weights.len(),
        folded_biases
    );
    Ok(QuantizedGraph {
        graph: rewritten,
        params: params.clone(),
        platform,
        quantized_nodes,
        float_nodes,
    })
}

/// Count of each op type, used to compare a rewritten graph with its source.
pub fn op_histogram(graph: &Graph) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for node in graph.nodes() {
        *counts.entry(node.op_type.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibrate::{CalibrationSettings, calibrate},
        data::InMemorySource,
        graph::{Dim, Executor},
        quantization::CalibrationAlgorithm,
    };

    /// x -> Conv -> Relu -> GlobalAveragePool -> Flatten -> Gemm -> Softmax -> y
    fn pose_head() -> Graph {
        let conv_w = Tensor::random_seeded(vec![4, 3, 3, 3], 1).map(|v| v - 0.5);
        let gemm_w = Tensor::random_seeded(vec![5, 4], 2).map(|v| v - 0.5);
        GraphBuilder::new("head")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(3), Dim::Fixed(8), Dim::Fixed(8)])
            .initializer("conv_w", conv_w.into())
            .initializer("conv_b", Tensor::new(vec![4], vec![0.1f32, -0.1, 0.2, 0.0]).into())
            .initializer("fc_w", gemm_w.into())
            .initializer("fc_b", Tensor::new(vec![5], vec![0.05f32; 5]).into())
            .node(
                Node::new("conv", "Conv", ["x", "conv_w", "conv_b"], ["c"])
                    .with_attr("pads", Attribute::Ints(vec![1, 1, 1, 1])),
            )
            .node(Node::new("relu", "Relu", ["c"], ["r"]))
            .node(Node::new("gap", "GlobalAveragePool", ["r"], ["p"]))
            .node(Node::new("flat", "Flatten", ["p"], ["f"]))
            .node(Node::new("fc", "Gemm", ["f", "fc_w", "fc_b"], ["logits"]).with_attr("transB", Attribute::Int(1)))
            .node(Node::new("softmax", "Softmax", ["logits"], ["y"]))
            .output("y")
            .build()
            .unwrap()
    }

    fn samples(n: usize) -> InMemorySource {
        InMemorySource::new((0..n).map(|i| Tensor::random_seeded(vec![1, 3, 8, 8], 100 + i as u64)).collect())
    }

    fn calibrated(per_channel: bool) -> (Graph, QuantParamSet) {
        let g = pose_head();
        let settings = CalibrationSettings {
            per_channel,
            ..CalibrationSettings::new(CalibrationAlgorithm::MinMax, 4, 2)
        };
        let params = calibrate(&g, &samples(8), &settings).unwrap();
        (g, params)
    }

    fn mixed(platform: TargetPlatform) -> QuantizeSettings {
        QuantizeSettings {
            platform,
            allow_mixed_precision: true,
        }
    }

    #[test]
    fn test_classification_and_names() {
        let (g, params) = calibrated(false);
        let q = quantize(&g, &params, &mixed(TargetPlatform::Esp32P4)).unwrap();
        assert_eq!(q.quantized_nodes, vec!["conv", "relu", "gap", "flat", "fc"]);
        assert_eq!(q.float_nodes, vec!["softmax"]);
        let out = &q.graph;
        for t in ["x", "c", "r", "p", "f", "logits"] {
            assert!(out.node(&format!("{t}_QuantizeLinear")).is_some(), "{t}");
            assert!(out.is_initializer(&scale_name(t)));
            assert_eq!(out.initializer(&zero_point_name(t)).unwrap().data_type(), crate::tensor::DataType::I8);
        }
        assert_eq!(out.initializer("conv_w_quantized").unwrap().data_type(), crate::tensor::DataType::I8);
        assert_eq!(out.initializer("conv_b_quantized").unwrap().data_type(), crate::tensor::DataType::I32);
        assert!(!out.is_initializer("conv_w"));
        // consumers read the dequantized activation, weights keep their names
        let conv = out.node("conv").unwrap();
        assert_eq!(conv.inputs, vec!["x_dequantized", "conv_w", "conv_b"]);
        assert_eq!(out.node("softmax").unwrap().inputs, vec!["logits_dequantized"]);
        assert!(g.node("conv").unwrap().inputs[0] == "x", "source untouched");
    }

    #[test]
    fn test_structure_is_preserved() {
        let (g, params) = calibrated(true);
        let q = quantize(&g, &params, &mixed(TargetPlatform::Generic)).unwrap();
        let before = op_histogram(&g);
        let after = op_histogram(&q.graph);
        for (op, count) in &before {
            assert_eq!(after.get(op), Some(count), "{op}");
        }
        assert!(after.keys().all(|op| before.contains_key(op) || op.ends_with("QuantizeLinear")));
        // originals keep their relative order
        let order: Vec<_> = q
            .graph
            .nodes()
            .iter()
            .filter(|n| g.node(&n.name).is_some())
            .map(|n| n.name.clone())
            .collect();
        let expected: Vec<_> = g.nodes().iter().map(|n| n.name.clone()).collect();
        assert_eq!(order, expected);
        assert_eq!(q.graph.inputs(), g.inputs());
        assert_eq!(q.graph.outputs(), g.outputs());
        assert_eq!(q.graph.tensor("x"), g.tensor("x"));
        let w_dq = q.graph.node("conv_w_DequantizeLinear").unwrap();
        assert_eq!(w_dq.attributes.get("axis"), Some(&Attribute::Int(0)));
    }

    #[test]
    fn test_simulation_stays_close_to_float() {
        let (g, params) = calibrated(true);
        let q = quantize(&g, &params, &mixed(TargetPlatform::Esp32P4)).unwrap();
        let float = Executor::new(&g, Stage::Quantize).unwrap();
        let sim = Executor::new(&q.graph, Stage::Quantize).unwrap();
        for i in 0..4 {
            let x: TensorData = Tensor::random_seeded(vec![1, 3, 8, 8], 100 + i).into();
            let a = float.run(vec![("x".into(), x.clone())]).unwrap();
            let b = sim.run(vec![("x".into(), x)]).unwrap();
            let (a, b) = (a["y"].as_f32().unwrap(), b["y"].as_f32().unwrap());
            for (u, v) in a.get_data().iter().zip(b.get_data()) {
                assert!((u - v).abs() < 0.05, "float {u} vs simulated {v}");
            }
        }
    }

    #[test]
    fn test_mixed_precision_refused() {
        let (g, params) = calibrated(false);
        let settings = QuantizeSettings {
            platform: TargetPlatform::Esp32P4,
            allow_mixed_precision: false,
        };
        let err = quantize(&g, &params, &settings).unwrap_err();
        match err {
            PipelineError::UnsupportedPlatformMix { op_type, platform, .. } => {
                assert_eq!(op_type, "Softmax");
                assert_eq!(platform, "esp32p4");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_platform_without_kind_falls_back() {
        let g = GraphBuilder::new("tanh")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(4)])
            .node(Node::new("t", "Tanh", ["x"], ["y"]))
            .output("y")
            .build()
            .unwrap();
        let source = InMemorySource::new(vec![Tensor::new(vec![1, 4], vec![-1.0, 0.0, 0.5, 1.0])]);
        let params = calibrate(&g, &source, &CalibrationSettings::new(CalibrationAlgorithm::MinMax, 1, 1)).unwrap();
        let q = quantize(&g, &params, &mixed(TargetPlatform::Esp32S3)).unwrap();
        assert_eq!(q.float_nodes, vec!["t"]);
        assert_eq!(q.graph.nodes().len(), 1);
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let g = GraphBuilder::new("custom")
            .input("x", vec![Dim::Fixed(1)])
            .node(Node::new("n3", "Foo", ["x"], ["y"]))
            .output("y")
            .build()
            .unwrap();
        let params = QuantParamSet::new(CalibrationAlgorithm::MinMax, false, 1);
        let err = quantize(&g, &params, &mixed(TargetPlatform::Generic)).unwrap_err();
        assert_eq!(err.to_string(), "[quantize] unsupported operator 'Foo' at node 'n3'");
    }

    #[test]
    fn test_bias_scale_is_product() {
        let (g, params) = calibrated(false);
        let q = quantize(&g, &params, &mixed(TargetPlatform::Generic)).unwrap();
        let s_x = params.activation("x").unwrap().scale();
        let s_w = params.get("conv_w").unwrap().params.scales()[0];
        let s_b = q.graph.initializer("conv_b_scale").unwrap().as_f32().unwrap().get_data()[0];
        assert_eq!(s_b, s_x * s_w);
    }

    #[test]
    fn test_shared_bias_gets_one_copy_per_consumer() {
        let g = GraphBuilder::new("shared")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(1), Dim::Fixed(2), Dim::Fixed(2)])
            .initializer("w1", Tensor::new(vec![2, 1, 1, 1], vec![0.5f32, -2.0]).into())
            .initializer("w2", Tensor::new(vec![2, 2, 1, 1], vec![3.0f32, 1.0, -0.25, 0.5]).into())
            .initializer("b", Tensor::new(vec![2], vec![0.1f32, -0.2]).into())
            .node(Node::new("conv1", "Conv", ["x", "w1", "b"], ["c1"]))
            .node(Node::new("conv2", "Conv", ["c1", "w2", "b"], ["y"]))
            .output("y")
            .build()
            .unwrap();
        let source = InMemorySource::new((0..4).map(|i| Tensor::new(vec![1, 1, 2, 2], vec![i as f32 * 0.5; 4])).collect());
        let params = calibrate(&g, &source, &CalibrationSettings::new(CalibrationAlgorithm::MinMax, 2, 2)).unwrap();
        let q = quantize(&g, &params, &mixed(TargetPlatform::Generic)).unwrap();
        let out = &q.graph;

        assert!(!out.is_initializer("b"), "no float copy is left behind");
        assert_eq!(out.node("conv1").unwrap().inputs, vec!["x_dequantized", "w1", "b_conv1"]);
        assert_eq!(out.node("conv2").unwrap().inputs, vec!["c1_dequantized", "w2", "b_conv2"]);
        let bias_scale = |name: &str| out.initializer(&scale_name(name)).unwrap().as_f32().unwrap().get_data()[0];
        let weight_scale = |name: &str| params.get(name).unwrap().params.scales()[0];
        assert_eq!(bias_scale("b_conv1"), params.activation("x").unwrap().scale() * weight_scale("w1"));
        assert_eq!(bias_scale("b_conv2"), params.activation("c1").unwrap().scale() * weight_scale("w2"));
        assert_ne!(bias_scale("b_conv1"), bias_scale("b_conv2"));
        for name in ["b_conv1", "b_conv2"] {
            assert_eq!(
                out.initializer(&quantized_name(name)).unwrap().data_type(),
                crate::tensor::DataType::I32
            );
        }

        let float = Executor::new(&g, Stage::Quantize).unwrap();
        let sim = Executor::new(out, Stage::Quantize).unwrap();
        let x: TensorData = Tensor::new(vec![1, 1, 2, 2], vec![0.0f32, 0.5, 1.0, 1.5]).into();
        let a = float.run(vec![("x".into(), x.clone())]).unwrap();
        let b = sim.run(vec![("x".into(), x)]).unwrap();
        for (u, v) in a["y"].as_f32().unwrap().get_data().iter().zip(b["y"].as_f32().unwrap().get_data()) {
            assert!((u - v).abs() < 0.1, "float {u} vs simulated {v}");
        }
    }

    #[test]
    fn test_bias_shared_with_float_node_stays_available() {
        let g = GraphBuilder::new("mixed_bias")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(2), Dim::Fixed(1), Dim::Fixed(1)])
            .initializer("w", Tensor::new(vec![2, 2, 1, 1], vec![1.0f32, 0.5, -0.5, 1.0]).into())
            .initializer("b", Tensor::new(vec![2], vec![0.1f32, 0.2]).into())
            .node(Node::new("conv", "Conv", ["x", "w", "b"], ["c"]))
            .node(Node::new("flat", "Flatten", ["c"], ["f"]))
            .node(Node::new("div", "Div", ["f", "b"], ["y"]))
            .output("y")
            .build()
            .unwrap();
        let source = InMemorySource::new((0..2).map(|i| Tensor::new(vec![1, 2, 1, 1], vec![i as f32, 1.0])).collect());
        let params = calibrate(&g, &source, &CalibrationSettings::new(CalibrationAlgorithm::MinMax, 1, 2)).unwrap();
        let q = quantize(&g, &params, &mixed(TargetPlatform::Esp32S3)).unwrap();
        assert_eq!(q.graph.node("conv").unwrap().inputs[2], "b_conv");
        assert!(q.graph.is_initializer("b"));
        assert_eq!(q.float_nodes, vec!["div"]);
        assert_eq!(q.graph.node("div").unwrap().inputs[1], "b");
    }

    #[rstest::rstest]
    #[case(false, TargetPlatform::Esp32P4)]
    #[case(true, TargetPlatform::Esp32P4)]
    #[case(true, TargetPlatform::Generic)]
    fn test_qdq_graph_reads_back(#[case] per_channel: bool, #[case] platform: TargetPlatform) {
        let (g, params) = calibrated(per_channel);
        let q = quantize(&g, &params, &mixed(platform)).unwrap();
        let lifted = QuantizedGraph::from_qdq(q.graph.clone(), platform).unwrap();
        assert_eq!(lifted.quantized_nodes, q.quantized_nodes);
        assert_eq!(lifted.float_nodes, q.float_nodes);
        assert_eq!(lifted.platform, platform);
        assert_eq!(lifted.params.algorithm, None);
        assert_eq!(lifted.params.per_channel, per_channel);

        let names: Vec<_> = lifted.params.iter().map(|(n, _)| n.as_str()).collect();
        let activations: Vec<_> = q
            .graph
            .nodes()
            .iter()
            .filter(|n| n.op_type == "QuantizeLinear")
            .map(|n| n.inputs[0].as_str())
            .collect();
        assert_eq!(names.len(), activations.len() + 2);
        assert!(names.contains(&"conv_w") && names.contains(&"fc_w"));
        for (name, read) in lifted.params.iter() {
            let original = params.get(name).unwrap();
            assert_eq!(read.kind, original.kind, "{name}");
            assert_eq!(read.params.scales(), original.params.scales(), "{name}");
            assert_eq!(read.params.zero_points(), original.params.zero_points(), "{name}");
            assert_eq!(read.params.axis(), original.params.axis(), "{name}");
        }
    }

    #[test]
    fn test_float_graph_is_not_qdq() {
        let (g, _) = calibrated(false);
        let err = QuantizedGraph::from_qdq(g, TargetPlatform::Esp32P4).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedGraph { stage: Stage::Load, .. }), "{err}");
    }

    #[test]
    fn test_qdq_scale_must_be_initializer() {
        let g = GraphBuilder::new("loose")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(4)])
            .input("s", vec![])
            .node(Node::new("q", "QuantizeLinear", ["x", "s"], ["xq"]))
            .node(Node::new("dq", "DequantizeLinear", ["xq", "s"], ["y"]))
            .output("y")
            .build()
            .unwrap();
        let err = QuantizedGraph::from_qdq(g, TargetPlatform::Generic).unwrap_err();
        assert_eq!(
            err.to_string(),
            "[load] malformed graph 'loose': node 'q' reads 's', which is not an initializer"
        );
    }
}
