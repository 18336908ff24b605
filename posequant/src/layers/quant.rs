//! QuantizeLinear / DequantizeLinear, used to simulate QDQ graphs in float.
use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};

use super::{Evaluate, normalize_axis, optional, required, required_f32};
use crate::{
    graph::Node,
    quantization::{MAX, MIN},
    tensor::{Tensor, TensorData},
};

/// Channel index of every element when a parameter vector of length `len` is applied along
/// `axis`; scalars map everything to 0.
fn channel_of(shape: &[usize], axis: i64, len: usize) -> Result<impl Fn(usize) -> usize> {
    let (inner, channels) = if len <= 1 {
        (1, 1)
    } else {
        let axis = normalize_axis(axis, shape.len())?;
        ensure!(
            shape[axis] == len,
            "{} quantization parameters for axis {} of shape {:?}",
            len,
            axis,
            shape
        );
        (shape[axis + 1..].iter().product::<usize>(), len)
    };
    Ok(move |i: usize| (i / inner) % channels)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizeLinear {
    pub axis: i64,
}

impl QuantizeLinear {
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(Self {
            axis: node.attr_int("axis", 1)?,
        })
    }
}

impl Evaluate for QuantizeLinear {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
        let x = required_f32(inputs, 0)?;
        let scale = required_f32(inputs, 1)?.get_data();
        let zero_point = match optional(inputs, 2) {
            None => vec![0.0; scale.len()],
            Some(TensorData::I8(zp)) => zp.get_data().iter().map(|v| *v as f32).collect(),
            Some(other) => bail!("unsupported zero point type {}", other.data_type()),
        };
        ensure!(zero_point.len() == scale.len(), "scale and zero point lengths differ");
        let channel = channel_of(x.shape(), self.axis, scale.len())?;
        let data = x
            .get_data()
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let c = channel(i);
                // ONNX rounds half to even
                ((v / scale[c]).round_ties_even() + zero_point[c]).clamp(MIN as f32, MAX as f32) as i8
            })
            .collect();
        Ok(vec![Tensor::new(x.get_shape(), data).into()])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DequantizeLinear {
    pub axis: i64,
}

impl DequantizeLinear {
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(Self {
            axis: node.attr_int("axis", 1)?,
        })
    }
}

impl Evaluate for DequantizeLinear {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
        let x = required(inputs, 0)?;
        ensure!(
            matches!(x, TensorData::I8(_) | TensorData::I32(_)),
            "cannot dequantize {} values",
            x.data_type()
        );
        let shape = x.get_shape();
        let values = x.to_f32_vec();
        let scale = required_f32(inputs, 1)?.get_data();
        let zero_point = optional(inputs, 2)
            .map(TensorData::to_f32_vec)
            .unwrap_or_else(|| vec![0.0; scale.len()]);
        ensure!(zero_point.len() == scale.len(), "scale and zero point lengths differ");
        let channel = channel_of(&shape, self.axis, scale.len())?;
        let data = values
            .iter()
            .enumerate()
            .map(|(i, q)| {
                let c = channel(i);
                (q - zero_point[c]) * scale[c]
            })
            .collect();
        Ok(vec![Tensor::new(shape, data).into()])
    }
}
