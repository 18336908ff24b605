//! Decoding of ONNX protobuf models into [`Graph`].
use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
#[cfg(test)]
use prost_tract_compat::Message;
use tracing::{debug, warn};
use tract_onnx::prelude::Framework;
use tract_onnx::pb::{
    ModelProto, NodeProto, TensorProto, ValueInfoProto, attribute_proto::AttributeType,
    tensor_proto::DataType as OnnxType, tensor_shape_proto::dimension, type_proto,
};

use super::{Attribute, Dim, Graph, GraphBuilder, Node, TensorInfo, TensorRole, builder::DEFAULT_OPSET};
use crate::{
    error::{PipelineError, PipelineResult, Stage},
    tensor::{DataType, Tensor, TensorData},
};


pub(crate) fn load(path: &Path) -> PipelineResult<Graph> {
    if !path.is_file() {
        return Err(PipelineError::InputNotFound {
            stage: Stage::Load,
            path: path.to_path_buf(),
        });
    }
    let fallback = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let model = tract_onnx::onnx()
        .proto_model_for_path(path)
        .map_err(|e| PipelineError::malformed(Stage::Load, &fallback, format!("cannot decode protobuf: {e:?}")))?;
    from_proto(model, &fallback)
}

/// Decode a serialized `ModelProto`.
#[cfg(test)]
pub(crate) fn decode(bytes: &[u8], fallback_name: &str) -> PipelineResult<Graph> {
    let model = ModelProto::decode(bytes)
        .map_err(|e| PipelineError::malformed(Stage::Load, fallback_name, format!("cannot decode protobuf: {e}")))?;
    from_proto(model, fallback_name)
}

pub(crate) fn from_proto(model: ModelProto, fallback_name: &str) -> PipelineResult<Graph> {
    let Some(proto) = model.graph else {
        return Err(PipelineError::malformed(Stage::Load, fallback_name, "model has no graph"));
    };
    let name = if proto.name.is_empty() {
        fallback_name.to_string()
    } else {
        proto.name.clone()
    };
    let malformed = |e: anyhow::Error| PipelineError::malformed(Stage::Load, &name, format!("{e:#}"));

    let opset = model
        .opset_import
        .iter()
        .filter(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
        .max()
        .unwrap_or_else(|| {
            warn!("model '{}' declares no default opset, assuming {}", name, DEFAULT_OPSET);
            DEFAULT_OPSET
        });
    debug!("loading '{}': ir {} opset {} with {} nodes", name, model.ir_version, opset, proto.node.len());

    let mut builder = GraphBuilder::new(&name).opset(opset);
    for init in &proto.initializer {
        let value = tensor_from_proto(init)
            .with_context(|| format!("initializer '{}'", init.name))
            .map_err(malformed)?;
        builder = builder.initializer(&init.name, value);
    }
    for vi in &proto.input {
        let (shape, dtype) = value_info_type(vi).map_err(malformed)?;
        builder = builder.typed_input(&vi.name, shape, dtype);
    }
    for vi in &proto.value_info {
        // Descriptors of non-numeric intermediates carry nothing the pipeline uses.
        if let Ok((shape, dtype)) = value_info_type(vi) {
            builder = builder.value_info(TensorInfo::new(&vi.name, shape, dtype, TensorRole::Intermediate));
        }
    }
    for vi in &proto.output {
        let (shape, dtype) = value_info_type(vi).map_err(malformed)?;
        builder = builder.typed_output(&vi.name, shape, dtype);
    }
    for node in &proto.node {
        builder = builder.node(node_from_proto(node).map_err(malformed)?);
    }
    builder.build()
}

fn node_from_proto(proto: &NodeProto) -> Result<Node> {
    let mut node = Node::new(&proto.name, &proto.op_type, &proto.input, &proto.output).with_domain(&proto.domain);
    for attr in &proto.attribute {
        let value = match AttributeType::from_i32(attr.r#type) {
            Some(AttributeType::Float) => Attribute::Float(attr.f),
            Some(AttributeType::Int) => Attribute::Int(attr.i),
            Some(AttributeType::String) => Attribute::String(String::from_utf8_lossy(&attr.s).into_owned()),
            Some(AttributeType::Floats) => Attribute::Floats(attr.floats.clone()),
            Some(AttributeType::Ints) => Attribute::Ints(attr.ints.clone()),
            Some(AttributeType::Tensor) => {
                let t = attr
                    .t
                    .as_ref()
                    .with_context(|| format!("attribute '{}' of '{}' has no tensor", attr.name, proto.name))?;
                Attribute::Tensor(tensor_from_proto(t)?)
            }
            other => {
                debug!("node '{}': skipping attribute '{}' of type {:?}", proto.name, attr.name, other);
                continue;
            }
        };
        node = node.with_attr(&attr.name, value);
    }
    Ok(node)
}

fn dtype_from_onnx(elem_type: i32) -> Result<DataType> {
    Ok(match OnnxType::from_i32(elem_type) {
        Some(OnnxType::Float) | Some(OnnxType::Double) => DataType::F32,
        Some(OnnxType::Int8) => DataType::I8,
        Some(OnnxType::Int32) => DataType::I32,
        Some(OnnxType::Int64) => DataType::I64,
        other => bail!("unsupported element type {:?}", other),
    })
}


fn value_info_type(vi: &ValueInfoProto) -> Result<(Option<Vec<Dim>>, DataType)> {
    let Some(type_proto::Value::TensorType(tensor)) = vi.r#type.as_ref().and_then(|t| t.value.as_ref()) else {
        bail!("'{}' is not a tensor", vi.name);
    };
    let dtype = dtype_from_onnx(tensor.elem_type).with_context(|| format!("tensor '{}'", vi.name))?;
    let shape = tensor.shape.as_ref().map(|s| {
        s.dim
            .iter()
            .map(|d| match &d.value {
                Some(dimension::Value::DimValue(v)) if *v >= 0 => Dim::Fixed(*v as usize),
                Some(dimension::Value::DimParam(p)) => Dim::Dynamic(p.clone()),
                _ => Dim::Dynamic(String::new()),
            })
            .collect()
    });
    Ok((shape, dtype))
}

/// Little-endian fixed-width elements out of `raw_data`.
fn from_raw<const N: usize, T>(raw: &[u8], decode: fn([u8; N]) -> T) -> Vec<T> {
    raw.chunks_exact(N)
        .map(|c| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(c);
            decode(bytes)
        })
        .collect()
}

pub(crate) fn tensor_from_proto(proto: &TensorProto) -> Result<TensorData> {
    ensure!(proto.data_location.unwrap_or(0) == 0, "externally stored tensors are not supported");
    let shape = proto
        .dims
        .iter()
        .map(|d| usize::try_from(*d).context("negative dimension"))
        .collect::<Result<Vec<_>>>()?;
    let raw = !proto.raw_data.is_empty();
    let value = match OnnxType::from_i32(proto.data_type) {
        Some(OnnxType::Float) => {
            let data = if raw {
                from_raw(&proto.raw_data, f32::from_le_bytes)
            } else {
                proto.float_data.clone()
            };
            TensorData::F32(Tensor::try_new(shape, data)?)
        }
        Some(OnnxType::Double) => {
            let data = if raw {
                from_raw(&proto.raw_data, f64::from_le_bytes)
            } else {
                proto.double_data.clone()
            };
            TensorData::F32(Tensor::try_new(shape, data.into_iter().map(|v| v as f32).collect())?)
        }
        Some(OnnxType::Int8) => {
            let data = if raw {
                proto.raw_data.iter().map(|b| *b as i8).collect()
            } else {
                proto.int32_data.iter().map(|v| *v as i8).collect()
            };
            TensorData::I8(Tensor::try_new(shape, data)?)
        }
        Some(OnnxType::Int32) => {
            let data = if raw {
                from_raw(&proto.raw_data, i32::from_le_bytes)
            } else {
                proto.int32_data.clone()
            };
            TensorData::I32(Tensor::try_new(shape, data)?)
        }
        Some(OnnxType::Int64) => {
            let data = if raw {
                from_raw(&proto.raw_data, i64::from_le_bytes)
            } else {
                proto.int64_data.clone()
            };
            TensorData::I64(Tensor::try_new(shape, data)?)
        }
        other => bail!("unsupported tensor type {:?}", other),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::onnx::encode;

    fn sample() -> Graph {
        GraphBuilder::new("sample")
            .input("x", vec![Dim::Dynamic("N".into()), Dim::Fixed(2)])
            .initializer("w", Tensor::new(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0]).into())
            .initializer("shape", Tensor::new(vec![2], vec![-1i64, 2]).into())
            .initializer("zp", Tensor::scalar(-3i8).into())
            .node(Node::new("mm", "MatMul", ["x", "w"], ["h"]))
            .node(Node::new("act", "LeakyRelu", ["h"], ["a"]).with_attr("alpha", Attribute::Float(0.2)))
            .node(Node::new("r", "Reshape", ["a", "shape"], ["y"]))
            .output("y")
            .build()
            .unwrap()
    }

    #[test]
    fn test_encode_decode_preserves_graph() {
        let g = sample();
        let back = decode(&encode(&g), "fallback").unwrap();
        assert_eq!(back.name, "sample");
        assert_eq!(back.nodes(), g.nodes());
        assert_eq!(back.initializers(), g.initializers());
        assert_eq!(back.tensor("x"), g.tensor("x"));
        assert_eq!(back.opset, DEFAULT_OPSET);
    }

    #[test]
    fn test_typed_fields_are_read() {
        let proto = TensorProto {
            dims: vec![3],
            data_type: OnnxType::Float as i32,
            float_data: vec![1.0, 2.0, 3.0],
            ..Default::default()
        };
        let t = tensor_from_proto(&proto).unwrap();
        assert_eq!(t.as_f32().unwrap().get_data(), &[1.0, 2.0, 3.0]);
        let bad = TensorProto {
            dims: vec![4],
            data_type: OnnxType::Float as i32,
            float_data: vec![1.0],
            ..Default::default()
        };
        assert!(tensor_from_proto(&bad).is_err());
    }

    #[test]
    fn test_garbage_bytes_are_malformed() {
        let err = decode(&[0xff, 0xff, 0xff, 0x01, 0x02], "junk").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedGraph { .. }), "{err}");
    }

    #[test]
    fn test_missing_file() {
        let err = load(Path::new("/nonexistent/model.onnx")).unwrap_err();
        assert!(matches!(err, PipelineError::InputNotFound { stage: Stage::Load, .. }));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.onnx");
        std::fs::write(&path, encode(&sample())).unwrap();
        let g = load(&path).unwrap();
        assert_eq!(g.nodes().len(), 3);
    }
}
