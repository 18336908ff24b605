use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::normalize_axis;
use crate::{graph::Node, tensor::Tensor};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Softmax {
    pub axis: i64,
}

impl Softmax {
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(Self {
            axis: node.attr_int("axis", -1)?,
        })
    }

    pub fn op(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let shape = input.get_shape();
        let axis = normalize_axis(self.axis, shape.len())?;
        let len = shape[axis];
        let inner: usize = shape[axis + 1..].iter().product();
        let outer: usize = shape[..axis].iter().product();
        let x = input.get_data();
        let mut out = vec![0f32; x.len()];
        for o in 0..outer {
            for k in 0..inner {
                let idx = |i: usize| (o * len + i) * inner + k;
                let max = (0..len).map(|i| x[idx(i)]).fold(f32::NEG_INFINITY, f32::max);
                let sum: f32 = (0..len).map(|i| (x[idx(i)] - max).exp()).sum();
                for i in 0..len {
                    out[idx(i)] = (x[idx(i)] - max).exp() / sum;
                }
            }
        }
        Ok(Tensor::new(shape, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_sum_to_one() {
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0]);
        let out = Softmax { axis: -1 }.op(&t).unwrap();
        let d = out.get_data();
        assert!((d[..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((d[3] - 1.0 / 3.0).abs() < 1e-6);
        assert!(d[2] > d[1] && d[1] > d[0]);
    }
}
