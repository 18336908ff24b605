//! Operator vocabulary and float reference kernels.
//!
//! Every supported op type maps to an [`OpKind`]; [`OpKind::spec`] is the handler table
//! telling the calibrator and the rewriter how to treat the node's inputs, and how to build
//! the typed [`Layer`] the executor runs.
pub mod activation;
pub mod common;
pub mod convolution;
pub mod dense;
pub mod elementwise;
pub mod pooling;
pub mod quant;
pub mod resize;
pub mod shape;
pub mod softmax;

use anyhow::{Result, anyhow, ensure};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    graph::Node,
    tensor::{Tensor, TensorData},
};
use activation::Activation;
use convolution::Convolution;
use dense::{Gemm, MatMul};
use elementwise::BinaryOp;
use pooling::Pooling;
use quant::{DequantizeLinear, QuantizeLinear};
use resize::Resize;
use shape::{Concat, Flatten, Reshape, Slice, Split, Transpose};
use softmax::Softmax;

macro_rules! op_kinds {
    ($($kind:ident),* $(,)?) => {
        #[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum OpKind {
            $( $kind ),*
        }

        impl OpKind {
            pub const ALL: &'static [OpKind] = &[$( OpKind::$kind ),*];

            /// Kind of an ONNX op type in the default domain.
            pub fn from_op_type(op_type: &str) -> Option<Self> {
                match op_type {
                    $( stringify!($kind) => Some(OpKind::$kind), )*
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( OpKind::$kind => stringify!($kind) ),*
                }
            }
        }
    };
}

op_kinds!(
    Conv,
    Gemm,
    MatMul,
    Relu,
    LeakyRelu,
    Sigmoid,
    Tanh,
    HardSwish,
    Add,
    Sub,
    Mul,
    Div,
    MaxPool,
    AveragePool,
    GlobalAveragePool,
    Concat,
    Reshape,
    Flatten,
    Transpose,
    Resize,
    Split,
    Slice,
    Softmax,
    Identity,
    Constant,
    QuantizeLinear,
    DequantizeLinear,
);

/// Which inputs of a node carry activations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataInputs {
    /// Every input, e.g. Concat.
    All,
    /// The first `n` inputs; the rest are shapes, scales, axes or parameters.
    Leading(usize),
}

/// How an input slot is treated by calibration and rewriting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputRole {
    Data,
    Weight,
    Bias,
    Auxiliary,
}

/// Static description of an operator kind.
#[derive(Clone, Copy, Debug)]
pub struct OpSpec {
    pub min_inputs: usize,
    /// `None` for variadic operators.
    pub max_inputs: Option<usize>,
    pub data_inputs: DataInputs,
    pub weight_input: Option<usize>,
    pub bias_input: Option<usize>,
    /// Whether the kind has an int8 implementation at all.
    pub fixed_point: bool,
    /// Structural helpers never force a float fallback.
    pub structural: bool,
    pub build: fn(&Node) -> Result<Layer>,
}

impl OpSpec {
    fn unary(build: fn(&Node) -> Result<Layer>) -> Self {
        Self {
            min_inputs: 1,
            max_inputs: Some(1),
            data_inputs: DataInputs::Leading(1),
            weight_input: None,
            bias_input: None,
            fixed_point: true,
            structural: false,
            build,
        }
    }

    fn binary(build: fn(&Node) -> Result<Layer>) -> Self {
        Self {
            min_inputs: 2,
            max_inputs: Some(2),
            data_inputs: DataInputs::Leading(2),
            ..Self::unary(build)
        }
    }

    /// Data tensor followed by optional non-data operands.
    fn leading(min_inputs: usize, max_inputs: usize, build: fn(&Node) -> Result<Layer>) -> Self {
        Self {
            min_inputs,
            max_inputs: Some(max_inputs),
            ..Self::unary(build)
        }
    }

    fn float(self) -> Self {
        Self {
            fixed_point: false,
            ..self
        }
    }

    fn structural(self) -> Self {
        Self {
            fixed_point: false,
            structural: true,
            ..self
        }
    }

    pub fn input_role(&self, i: usize) -> InputRole {
        if self.bias_input == Some(i) {
            InputRole::Bias
        } else if self.weight_input == Some(i) {
            InputRole::Weight
        } else {
            match self.data_inputs {
                DataInputs::All => InputRole::Data,
                DataInputs::Leading(n) if i < n => InputRole::Data,
                DataInputs::Leading(_) => InputRole::Auxiliary,
            }
        }
    }
}

impl OpKind {
    pub fn spec(&self) -> OpSpec {
        match self {
            OpKind::Conv => OpSpec {
                min_inputs: 2,
                max_inputs: Some(3),
                weight_input: Some(1),
                bias_input: Some(2),
                ..OpSpec::unary(|n| Ok(Layer::Convolution(Convolution::from_node(n)?)))
            },
            OpKind::Gemm => OpSpec {
                min_inputs: 2,
                max_inputs: Some(3),
                weight_input: Some(1),
                bias_input: Some(2),
                ..OpSpec::unary(|n| Ok(Layer::Gemm(Gemm::from_node(n)?)))
            },
            OpKind::MatMul => OpSpec::binary(|_| Ok(Layer::MatMul(MatMul))),
            OpKind::Relu => OpSpec::unary(|_| Ok(Layer::Activation(Activation::Relu))),
            OpKind::LeakyRelu => OpSpec::unary(|n| {
                Ok(Layer::Activation(Activation::LeakyRelu {
                    alpha: n.attr_float("alpha", 0.01)?,
                }))
            }),
            OpKind::Sigmoid => OpSpec::unary(|_| Ok(Layer::Activation(Activation::Sigmoid))),
            OpKind::Tanh => OpSpec::unary(|_| Ok(Layer::Activation(Activation::Tanh))),
            OpKind::HardSwish => OpSpec::unary(|_| Ok(Layer::Activation(Activation::HardSwish))),
            OpKind::Add => OpSpec::binary(|_| Ok(Layer::Binary(BinaryOp::Add))),
            OpKind::Sub => OpSpec::binary(|_| Ok(Layer::Binary(BinaryOp::Sub))),
            OpKind::Mul => OpSpec::binary(|_| Ok(Layer::Binary(BinaryOp::Mul))),
            OpKind::Div => OpSpec::binary(|_| Ok(Layer::Binary(BinaryOp::Div))).float(),
            OpKind::MaxPool => OpSpec::unary(|n| Ok(Layer::Pooling(Pooling::max_from_node(n)?))),
            OpKind::AveragePool => OpSpec::unary(|n| Ok(Layer::Pooling(Pooling::average_from_node(n)?))),
            OpKind::GlobalAveragePool => OpSpec::unary(|_| Ok(Layer::Pooling(Pooling::GlobalAverage))),
            OpKind::Concat => OpSpec {
                min_inputs: 1,
                max_inputs: None,
                data_inputs: DataInputs::All,
                ..OpSpec::unary(|n| Ok(Layer::Concat(Concat::from_node(n)?)))
            },
            OpKind::Reshape => OpSpec::leading(2, 2, |n| Ok(Layer::Reshape(Reshape::from_node(n)?))),
            OpKind::Flatten => OpSpec::unary(|n| Ok(Layer::Flatten(Flatten::from_node(n)?))),
            OpKind::Transpose => OpSpec::unary(|n| Ok(Layer::Transpose(Transpose::from_node(n)?))),
            OpKind::Resize => OpSpec::leading(1, 4, |n| Ok(Layer::Resize(Resize::from_node(n)?))),
            OpKind::Split => OpSpec::leading(1, 2, |n| Ok(Layer::Split(Split::from_node(n)?))),
            OpKind::Slice => OpSpec::leading(1, 5, |n| Ok(Layer::Slice(Slice::from_node(n)?))),
            OpKind::Softmax => OpSpec::unary(|n| Ok(Layer::Softmax(Softmax::from_node(n)?))).float(),
            OpKind::Identity => OpSpec::unary(|_| Ok(Layer::Identity)).structural(),
            OpKind::Constant => OpSpec {
                min_inputs: 0,
                max_inputs: Some(0),
                data_inputs: DataInputs::Leading(0),
                ..OpSpec::unary(|n| Ok(Layer::Constant(shape::constant_from_node(n)?)))
            }
            .structural(),
            OpKind::QuantizeLinear => {
                OpSpec::leading(2, 3, |n| Ok(Layer::Quantize(QuantizeLinear::from_node(n)?))).structural()
            }
            OpKind::DequantizeLinear => {
                OpSpec::leading(2, 3, |n| Ok(Layer::Dequantize(DequantizeLinear::from_node(n)?))).structural()
            }
        }
    }

    pub fn has_fixed_point_form(&self) -> bool {
        self.spec().fixed_point
    }
}

pub trait OpInfo {
    fn describe(&self) -> String;
}

/// Float reference evaluation. `inputs[i]` is `None` for an omitted optional input.
pub trait Evaluate {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>>;
}

/// A node with its attributes parsed, ready to run.
#[derive(Clone, Debug, PartialEq)]
pub enum Layer {
    Convolution(Convolution),
    Gemm(Gemm),
    MatMul(MatMul),
    Activation(Activation),
    Binary(BinaryOp),
    Pooling(Pooling),
    Concat(Concat),
    Reshape(Reshape),
    Flatten(Flatten),
    Transpose(Transpose),
    Resize(Resize),
    Split(Split),
    Slice(Slice),
    Softmax(Softmax),
    Identity,
    Constant(TensorData),
    Quantize(QuantizeLinear),
    Dequantize(DequantizeLinear),
}

impl Layer {
    pub fn from_node(node: &Node, kind: OpKind) -> Result<Self> {
        (kind.spec().build)(node)
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl OpInfo for Layer {
    fn describe(&self) -> String {
        match self {
            Layer::Convolution(c) => c.describe(),
            Layer::Gemm(g) => g.describe(),
            Layer::MatMul(_) => "MatMul".to_string(),
            Layer::Activation(a) => a.describe(),
            Layer::Binary(b) => format!("{b:?}"),
            Layer::Pooling(p) => p.describe(),
            Layer::Concat(c) => format!("Concat(axis={})", c.axis),
            Layer::Reshape(_) => "Reshape".to_string(),
            Layer::Flatten(fl) => format!("Flatten(axis={})", fl.axis),
            Layer::Transpose(t) => format!("Transpose({:?})", t.perm),
            Layer::Resize(r) => r.describe(),
            Layer::Split(s) => format!("Split(axis={})", s.axis),
            Layer::Slice(_) => "Slice".to_string(),
            Layer::Softmax(s) => format!("Softmax(axis={})", s.axis),
            Layer::Identity => "Identity".to_string(),
            Layer::Constant(t) => format!("Constant({:?})", t.get_shape()),
            Layer::Quantize(_) => "QuantizeLinear".to_string(),
            Layer::Dequantize(_) => "DequantizeLinear".to_string(),
        }
    }
}

impl Evaluate for Layer {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
        let single = |t: Tensor<f32>| Ok(vec![TensorData::F32(t)]);
        match self {
            Layer::Convolution(conv) => single(conv.op(
                required_f32(inputs, 0)?,
                required_f32(inputs, 1)?,
                optional_f32(inputs, 2)?,
            )?),
            Layer::Gemm(gemm) => single(gemm.op(
                required_f32(inputs, 0)?,
                required_f32(inputs, 1)?,
                optional_f32(inputs, 2)?,
            )?),
            Layer::MatMul(mm) => single(mm.op(required_f32(inputs, 0)?, required_f32(inputs, 1)?)?),
            Layer::Activation(act) => single(act.op(required_f32(inputs, 0)?)),
            Layer::Binary(op) => single(op.op(required_f32(inputs, 0)?, required_f32(inputs, 1)?)?),
            Layer::Pooling(pool) => single(pool.op(required_f32(inputs, 0)?)?),
            Layer::Softmax(sm) => single(sm.op(required_f32(inputs, 0)?)?),
            Layer::Resize(r) => r.evaluate(inputs),
            Layer::Concat(c) => c.evaluate(inputs),
            Layer::Reshape(r) => r.evaluate(inputs),
            Layer::Flatten(fl) => fl.evaluate(inputs),
            Layer::Transpose(t) => t.evaluate(inputs),
            Layer::Split(s) => s.evaluate(inputs),
            Layer::Slice(s) => s.evaluate(inputs),
            Layer::Identity => Ok(vec![required(inputs, 0)?.clone()]),
            Layer::Constant(t) => Ok(vec![t.clone()]),
            Layer::Quantize(q) => q.evaluate(inputs),
            Layer::Dequantize(dq) => dq.evaluate(inputs),
        }
    }
}

pub(crate) fn required<'a>(inputs: &[Option<&'a TensorData>], i: usize) -> Result<&'a TensorData> {
    inputs
        .get(i)
        .copied()
        .flatten()
        .ok_or_else(|| anyhow!("missing required input #{i}"))
}

pub(crate) fn required_f32<'a>(inputs: &[Option<&'a TensorData>], i: usize) -> Result<&'a Tensor<f32>> {
    required(inputs, i)?.as_f32()
}

pub(crate) fn optional<'a>(inputs: &[Option<&'a TensorData>], i: usize) -> Option<&'a TensorData> {
    inputs.get(i).copied().flatten()
}

pub(crate) fn optional_f32<'a>(inputs: &[Option<&'a TensorData>], i: usize) -> Result<Option<&'a Tensor<f32>>> {
    optional(inputs, i).map(TensorData::as_f32).transpose()
}

/// Resolve a possibly negative axis against `rank`.
pub(crate) fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    ensure!(
        resolved >= 0 && (resolved as usize) < rank.max(1),
        "axis {} out of range for rank {}",
        axis,
        rank
    );
    Ok(resolved as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_type_round_trip() {
        for kind in OpKind::ALL {
            assert_eq!(OpKind::from_op_type(kind.as_str()), Some(*kind));
        }
        assert_eq!(OpKind::from_op_type("Foo"), None);
    }

    #[test]
    fn test_float_only_kinds() {
        assert!(!OpKind::Div.has_fixed_point_form());
        assert!(!OpKind::Softmax.has_fixed_point_form());
        assert!(OpKind::Conv.has_fixed_point_form());
        assert!(OpKind::Identity.spec().structural);
    }

    #[test]
    fn test_input_roles() {
        let conv = OpKind::Conv.spec();
        assert_eq!(conv.input_role(0), InputRole::Data);
        assert_eq!(conv.input_role(1), InputRole::Weight);
        assert_eq!(conv.input_role(2), InputRole::Bias);
        let reshape = OpKind::Reshape.spec();
        assert_eq!(reshape.input_role(1), InputRole::Auxiliary);
        assert_eq!(OpKind::Concat.spec().input_role(5), InputRole::Data);
    }

    #[test]
    fn test_normalize_axis() {
        assert_eq!(normalize_axis(-1, 4).unwrap(), 3);
        assert_eq!(normalize_axis(1, 4).unwrap(), 1);
        assert!(normalize_axis(4, 4).is_err());
    }
}
