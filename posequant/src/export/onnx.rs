//! ONNX interchange writer.
use prost_tract_compat::Message;
use tract_onnx::pb::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeProto, TypeProto,
    ValueInfoProto, attribute_proto::AttributeType, tensor_proto::DataType as OnnxType,
    tensor_shape_proto::{Dimension, dimension},
    type_proto,
};

use crate::{
    graph::{Attribute, Dim, Graph, TensorInfo, TensorRole},
    tensor::{DataType, TensorData},
};

/// Lowest opset accepted by readers of per-channel QDQ graphs.
const MIN_OPSET: i64 = 13;
const IR_VERSION: i64 = 8;
const PRODUCER: &str = "posequant";

fn dtype_to_onnx(dtype: DataType) -> OnnxType {
    match dtype {
        DataType::F32 => OnnxType::Float,
        DataType::I8 => OnnxType::Int8,
        DataType::I32 => OnnxType::Int32,
        DataType::I64 => OnnxType::Int64,
    }
}

fn tensor_to_proto(name: &str, value: &TensorData) -> TensorProto {
    let raw_data = match value {
        TensorData::F32(t) => t.get_data().iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::I8(t) => t.get_data().iter().map(|v| *v as u8).collect(),
        TensorData::I32(t) => t.get_data().iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::I64(t) => t.get_data().iter().flat_map(|v| v.to_le_bytes()).collect(),
    };
    TensorProto {
        name: name.to_string(),
        dims: value.get_shape().into_iter().map(|d| d as i64).collect(),
        data_type: dtype_to_onnx(value.data_type()) as i32,
        raw_data,
        ..Default::default()
    }
}

fn value_info_to_proto(info: &TensorInfo) -> ValueInfoProto {
    let shape = info.shape.as_ref().map(|dims| TensorShapeProto {
        dim: dims
            .iter()
            .map(|d| Dimension {
                value: Some(match d {
                    Dim::Fixed(v) => dimension::Value::DimValue(*v as i64),
                    Dim::Dynamic(p) => dimension::Value::DimParam(p.clone()),
                }),
                ..Default::default()
            })
            .collect(),
    });
    ValueInfoProto {
        name: info.name.clone(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: dtype_to_onnx(info.dtype) as i32,
                shape,
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn attribute_to_proto(name: &str, value: &Attribute) -> AttributeProto {
    let attr = AttributeProto {
        name: name.to_string(),
        ..Default::default()
    };
    match value {
        Attribute::Float(f) => AttributeProto {
            r#type: AttributeType::Float as i32,
            f: *f,
            ..attr
        },
        Attribute::Int(i) => AttributeProto {
            r#type: AttributeType::Int as i32,
            i: *i,
            ..attr
        },
        Attribute::String(s) => AttributeProto {
            r#type: AttributeType::String as i32,
            s: s.as_bytes().to_vec(),
            ..attr
        },
        Attribute::Floats(v) => AttributeProto {
            r#type: AttributeType::Floats as i32,
            floats: v.clone(),
            ..attr
        },
        Attribute::Ints(v) => AttributeProto {
            r#type: AttributeType::Ints as i32,
            ints: v.clone(),
            ..attr
        },
        Attribute::Tensor(t) => AttributeProto {
            r#type: AttributeType::Tensor as i32,
            t: Some(tensor_to_proto("", t)),
            ..attr
        },
    }
}

/// Encode `graph` as a standard ONNX model. Per-channel QDQ needs opset 13, so older
/// models are bumped.
pub(crate) fn to_model_proto(graph: &Graph) -> ModelProto {
    let nodes = graph
        .nodes()
        .iter()
        .map(|n| NodeProto {
            name: n.name.clone(),
            op_type: n.op_type.clone(),
            domain: n.domain.clone(),
            input: n.inputs.clone(),
            output: n.outputs.clone(),
            attribute: n.attributes.iter().map(|(k, v)| attribute_to_proto(k, v)).collect(),
            ..Default::default()
        })
        .collect();
    let value_info = graph
        .tensors()
        .filter(|t| t.role == TensorRole::Intermediate)
        .map(value_info_to_proto)
        .collect();
    let proto = GraphProto {
        name: graph.name.clone(),
        node: nodes,
        initializer: graph
            .initializers()
            .iter()
            .map(|(name, value)| tensor_to_proto(name, value))
            .collect(),
        input: graph.input_infos().into_iter().map(value_info_to_proto).collect(),
        output: graph.output_infos().into_iter().map(value_info_to_proto).collect(),
        value_info,
        ..Default::default()
    };
    ModelProto {
        ir_version: IR_VERSION,
        producer_name: PRODUCER.to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: graph.opset.max(MIN_OPSET),
        }],
        graph: Some(proto),
        ..Default::default()
    }
}

pub(crate) fn encode(graph: &Graph) -> Vec<u8> {
    to_model_proto(graph).encode_to_vec()
}
