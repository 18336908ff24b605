//! Device binary: a small header followed by a MessagePack encoded [`DeviceModel`].
//!
//! ```text
//! "PQDL" | version: u32 LE | payload length: u64 LE | payload
//! ```
//!
//! Activation Q/DQ pairs are folded into per-tensor quantization records. A `Quantize` or
//! `Dequantize` layer is only emitted where a value crosses between int8 and float layers.
use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    graph::{Attribute, Dim, Graph},
    platform::TargetPlatform,
    rewrite::{QuantizedGraph, dequantized_name, quantized_name},
    tensor::TensorData,
};

pub const MAGIC: &[u8; 4] = b"PQDL";
pub const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Int8,
    Float32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantInfo {
    pub scales: Vec<f32>,
    pub zero_points: Vec<i64>,
    pub axis: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceIo {
    pub name: String,
    /// -1 for dimensions left dynamic.
    pub shape: Vec<i64>,
    pub quant: Option<QuantInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceTensor {
    pub name: String,
    pub value: TensorData,
    pub quant: Option<QuantInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceLayer {
    pub name: String,
    pub op_type: String,
    pub precision: Precision,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, Attribute>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceModel {
    pub name: String,
    pub platform: TargetPlatform,
    pub inputs: Vec<DeviceIo>,
    pub outputs: Vec<DeviceIo>,
    pub tensors: Vec<DeviceTensor>,
    /// Quantization of every int8 activation, by tensor name.
    pub activations: BTreeMap<String, QuantInfo>,
    pub layers: Vec<DeviceLayer>,
}

impl DeviceModel {
    pub fn layer(&self, name: &str) -> Option<&DeviceLayer> {
        self.layers.iter().find(|l| l.name == name)
    }
}

fn quant_info(graph: &Graph, scale: &str, zero_point: &str, axis: Option<usize>) -> Result<QuantInfo> {
    let scales = graph.initializer(scale).context("missing scale")?.to_f32_vec();
    let zero_points = match graph.initializer(zero_point) {
        Some(zp) => zp.to_i64_vec()?,
        None => vec![0; scales.len()],
    };
    Ok(QuantInfo {
        scales,
        zero_points,
        axis,
    })
}

fn io_shape(graph: &Graph, name: &str) -> Vec<i64> {
    graph
        .tensor(name)
        .and_then(|t| t.shape.as_ref())
        .map(|dims| {
            dims.iter()
                .map(|d| match d {
                    Dim::Fixed(v) => *v as i64,
                    Dim::Dynamic(_) => -1,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// A folded activation pair: `source` is the float tensor that was quantized.
struct Pair<'a> {
    source: &'a str,
    info: QuantInfo,
    int8_producer: bool,
}

/// Lower a QDQ graph to the device layer table.
pub fn lower(q: &QuantizedGraph) -> Result<DeviceModel> {
    let graph = &q.graph;
    let producers = graph.producers();
    let is_int8 = |node: &str| q.is_quantized(node);

    // Q nodes keyed by their output, then DQ nodes on top of them or on constants.
    let mut quantize_nodes: HashMap<&str, usize> = HashMap::new();
    for (i, node) in graph.nodes().iter().enumerate() {
        if node.op_type == "QuantizeLinear" {
            quantize_nodes.insert(node.outputs[0].as_str(), i);
        }
    }
    let mut pairs: HashMap<&str, Pair> = HashMap::new();
    let mut constants: Vec<DeviceTensor> = vec![];
    let mut folded: HashSet<usize> = HashSet::new();
    for (i, node) in graph.nodes().iter().enumerate() {
        if node.op_type != "DequantizeLinear" {
            continue;
        }
        let (Some(x), Some(scale)) = (node.input(0), node.input(1)) else {
            continue;
        };
        let zero_point = node.input(2).unwrap_or_default();
        let axis = match node.attributes.get("axis") {
            Some(Attribute::Int(a)) => Some(*a as usize),
            _ => None,
        };
        if let Some(value) = graph.initializer(x) {
            constants.push(DeviceTensor {
                name: node.outputs[0].clone(),
                value: value.clone(),
                quant: Some(quant_info(graph, scale, zero_point, axis)?),
            });
            folded.insert(i);
        } else if let Some(&qi) = quantize_nodes.get(x) {
            let source = graph.nodes()[qi].inputs[0].as_str();
            let int8_producer = producers.get(source).is_some_and(|p| is_int8(&graph.nodes()[*p].name));
            pairs.insert(
                node.outputs[0].as_str(),
                Pair {
                    source,
                    info: quant_info(graph, scale, zero_point, None)?,
                    int8_producer,
                },
            );
            folded.insert(i);
            folded.insert(qi);
        }
    }

    let mut layers = vec![];
    let mut activations = BTreeMap::new();
    let mut transitions: HashSet<String> = HashSet::new();
    for pair in pairs.values().filter(|p| p.int8_producer) {
        activations.insert(pair.source.to_string(), pair.info.clone());
    }
    for (i, node) in graph.nodes().iter().enumerate() {
        if folded.contains(&i) {
            continue;
        }
        let precision = if is_int8(&node.name) {
            Precision::Int8
        } else {
            Precision::Float32
        };
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            let Some(pair) = pairs.get(input.as_str()) else {
                inputs.push(input.clone());
                continue;
            };
            let resolved = match (pair.int8_producer, precision) {
                (true, Precision::Int8) | (false, Precision::Float32) => pair.source.to_string(),
                (true, Precision::Float32) => {
                    let name = dequantized_name(pair.source);
                    if transitions.insert(name.clone()) {
                        layers.push(DeviceLayer {
                            name: format!("{}_dequantize", pair.source),
                            op_type: "Dequantize".to_string(),
                            precision: Precision::Float32,
                            inputs: vec![pair.source.to_string()],
                            outputs: vec![name.clone()],
                            attributes: BTreeMap::new(),
                        });
                    }
                    name
                }
                (false, Precision::Int8) => {
                    let name = quantized_name(pair.source);
                    if transitions.insert(name.clone()) {
                        activations.insert(name.clone(), pair.info.clone());
                        layers.push(DeviceLayer {
                            name: format!("{}_quantize", pair.source),
                            op_type: "Quantize".to_string(),
                            precision: Precision::Int8,
                            inputs: vec![pair.source.to_string()],
                            outputs: vec![name.clone()],
                            attributes: BTreeMap::new(),
                        });
                    }
                    name
                }
            };
            inputs.push(resolved);
        }
        layers.push(DeviceLayer {
            name: node.name.clone(),
            op_type: node.op_type.clone(),
            precision,
            inputs,
            outputs: node.outputs.clone(),
            attributes: node.attributes.clone(),
        });
    }

    let referenced: HashSet<&str> = layers.iter().flat_map(|l| l.inputs.iter().map(String::as_str)).collect();
    let mut tensors: Vec<DeviceTensor> = graph
        .initializers()
        .iter()
        .filter(|(name, _)| referenced.contains(name.as_str()))
        .map(|(name, value)| DeviceTensor {
            name: name.clone(),
            value: value.clone(),
            quant: None,
        })
        .collect();
    tensors.extend(constants.into_iter().filter(|c| referenced.contains(c.name.as_str())));
    tensors.sort_by(|a, b| a.name.cmp(&b.name));

    let io = |name: &String| DeviceIo {
        name: name.clone(),
        shape: io_shape(graph, name),
        quant: activations.get(name).cloned(),
    };
    let inputs = graph.inputs().iter().map(io).collect();
    let outputs = graph.outputs().iter().map(io).collect();
    Ok(DeviceModel {
        name: graph.name.clone(),
        platform: q.platform,
        inputs,
        outputs,
        tensors,
        activations,
        layers,
    })
}

pub fn to_bytes(model: &DeviceModel) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(model).context("encoding device model")?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn from_bytes(bytes: &[u8]) -> Result<DeviceModel> {
    ensure!(bytes.len() >= HEADER_LEN && &bytes[..4] == MAGIC, "not a device model");
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(version);
    ensure!(version == FORMAT_VERSION, "unsupported device model version {}", version);
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[8..16]);
    let len = u64::from_le_bytes(len) as usize;
    ensure!(bytes.len() == HEADER_LEN + len, "truncated device model");
    rmp_serde::from_slice(&bytes[HEADER_LEN..]).context("decoding device model")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibrate::{CalibrationSettings, calibrate},
        data::InMemorySource,
        graph::{GraphBuilder, Node},
        quantization::CalibrationAlgorithm,
        rewrite::{QuantizeSettings, quantize},
        tensor::Tensor,
    };

    /// x -> Conv -> Relu -> Softmax -> y, Softmax stays in float.
    fn lowered() -> DeviceModel {
        let g = GraphBuilder::new("net")
            .input("x", vec![Dim::Fixed(1), Dim::Fixed(2), Dim::Fixed(2), Dim::Fixed(2)])
            .initializer("w", Tensor::random_seeded(vec![3, 2, 1, 1], 5).into())
            .initializer("b", Tensor::new(vec![3], vec![0.0f32, 0.1, -0.1]).into())
            .node(Node::new("conv", "Conv", ["x", "w", "b"], ["c"]))
            .node(Node::new("relu", "Relu", ["c"], ["r"]))
            .node(Node::new("sm", "Softmax", ["r"], ["y"]).with_attr("axis", Attribute::Int(1)))
            .output("y")
            .build()
            .unwrap();
        let source = InMemorySource::new((0..4).map(|i| Tensor::random_seeded(vec![1, 2, 2, 2], i)).collect());
        let params = calibrate(&g, &source, &CalibrationSettings::new(CalibrationAlgorithm::MinMax, 2, 2)).unwrap();
        let settings = QuantizeSettings {
            platform: TargetPlatform::Esp32P4,
            allow_mixed_precision: true,
        };
        lower(&quantize(&g, &params, &settings).unwrap()).unwrap()
    }

    #[test]
    fn test_pairs_fused_between_int8_layers() {
        let model = lowered();
        let ops: Vec<_> = model.layers.iter().map(|l| l.op_type.as_str()).collect();
        assert_eq!(ops, vec!["Quantize", "Conv", "Relu", "Dequantize", "Softmax"]);
        assert_eq!(model.layer("conv").unwrap().inputs, vec!["x_quantized", "w", "b"]);
        assert_eq!(model.layer("relu").unwrap().inputs, vec!["c"]);
        assert_eq!(model.layer("sm").unwrap().inputs, vec!["r_dequantized"]);
        assert!(model.activations.contains_key("c") && model.activations.contains_key("x_quantized"));
        assert_eq!(model.outputs[0].name, "y");
        assert!(model.outputs[0].quant.is_none());
    }

    #[test]
    fn test_constants_are_integer() {
        let model = lowered();
        let names: Vec<_> = model.tensors.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["b", "w"]);
        let w = &model.tensors[1];
        assert!(matches!(w.value, TensorData::I8(_)));
        assert_eq!(w.quant.as_ref().unwrap().zero_points, vec![0]);
        assert!(matches!(model.tensors[0].value, TensorData::I32(_)));
    }

    #[test]
    fn test_binary_layout() {
        let model = lowered();
        let bytes = to_bytes(&model).unwrap();
        assert_eq!(&bytes[..4], b"PQDL");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), FORMAT_VERSION);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()) as usize, bytes.len() - 16);
        assert_eq!(from_bytes(&bytes).unwrap(), model);
        assert!(from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
