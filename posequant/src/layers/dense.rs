use anyhow::{Result, ensure};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::OpInfo;
use crate::{
    graph::Node,
    tensor::{Tensor, broadcast_shapes, strides},
};

/// Y = alpha * op(A) * op(B) + beta * C
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gemm {
    pub alpha: f32,
    pub beta: f32,
    pub trans_a: bool,
    pub trans_b: bool,
}

impl Gemm {
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(Self {
            alpha: node.attr_float("alpha", 1.0)?,
            beta: node.attr_float("beta", 1.0)?,
            trans_a: node.attr_int("transA", 0)? != 0,
            trans_b: node.attr_int("transB", 0)? != 0,
        })
    }

    pub fn op(&self, a: &Tensor<f32>, b: &Tensor<f32>, c: Option<&Tensor<f32>>) -> Result<Tensor<f32>> {
        ensure!(a.rank() == 2 && b.rank() == 2, "gemm operands must be matrices: {:?} x {:?}", a.shape(), b.shape());
        let a = if self.trans_a { a.transpose(&[1, 0])? } else { a.clone() };
        let b = if self.trans_b { b.transpose(&[1, 0])? } else { b.clone() };
        let mut y = matmul_2d(&a, &b)?;
        if self.alpha != 1.0 {
            y.data.iter_mut().for_each(|v| *v *= self.alpha);
        }
        match c {
            Some(c) => {
                let beta = self.beta;
                let out = y.broadcast_with(c, |y, c| y + beta * c)?;
                ensure!(out.shape() == y.shape(), "gemm bias {:?} broadcasts beyond {:?}", c.shape(), y.shape());
                Ok(out)
            }
            None => Ok(y),
        }
    }

    /// Axis of the weight operand holding output channels.
    pub fn output_channel_axis(&self) -> usize {
        if self.trans_b { 0 } else { 1 }
    }
}

impl OpInfo for Gemm {
    fn describe(&self) -> String {
        format!("Gemm(transA={}, transB={})", self.trans_a, self.trans_b)
    }
}

/// Numpy-style matrix product with broadcast batch dimensions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatMul;

impl MatMul {
    pub fn op(&self, a: &Tensor<f32>, b: &Tensor<f32>) -> Result<Tensor<f32>> {
        ensure!(a.rank() >= 1 && b.rank() >= 1, "matmul operands cannot be scalars");
        let a_vec = a.rank() == 1;
        let b_vec = b.rank() == 1;
        let a = if a_vec { a.clone().reshape(vec![1, a.len()])? } else { a.clone() };
        let b = if b_vec { b.clone().reshape(vec![b.len(), 1])? } else { b.clone() };
        let (m, k) = (a.shape()[a.rank() - 2], a.shape()[a.rank() - 1]);
        let (k2, n) = (b.shape()[b.rank() - 2], b.shape()[b.rank() - 1]);
        ensure!(k == k2, "matmul inner dimensions differ: {:?} x {:?}", a.shape(), b.shape());

        let a_batch = &a.shape()[..a.rank() - 2];
        let b_batch = &b.shape()[..b.rank() - 2];
        let batch = broadcast_shapes(a_batch, b_batch)?;
        let batch_len: usize = batch.iter().product();
        let offset = |shape: &[usize], idx: usize| -> usize {
            // batch index of a broadcast operand
            let pad = batch.len() - shape.len();
            let src_strides = strides(shape);
            let out_strides = strides(&batch);
            let mut rem = idx;
            let mut src = 0;
            for (axis, stride) in out_strides.iter().enumerate() {
                let coord = rem / stride;
                rem %= stride;
                if axis >= pad && shape[axis - pad] != 1 {
                    src += coord * src_strides[axis - pad];
                }
            }
            src
        };
        let mut data = Vec::with_capacity(batch_len * m * n);
        for bi in 0..batch_len {
            let ai = offset(a_batch, bi);
            let bj = offset(b_batch, bi);
            let lhs = Tensor::new(vec![m, k], a.data[ai * m * k..(ai + 1) * m * k].to_vec());
            let rhs = Tensor::new(vec![k, n], b.data[bj * k * n..(bj + 1) * k * n].to_vec());
            data.extend(matmul_2d(&lhs, &rhs)?.into_data());
        }
        let mut shape = batch;
        if !a_vec {
            shape.push(m);
        }
        if !b_vec {
            shape.push(n);
        }
        Ok(Tensor::new(shape, data))
    }
}

pub(crate) fn matmul_2d(a: &Tensor<f32>, b: &Tensor<f32>) -> Result<Tensor<f32>> {
    let (m, k) = (a.shape()[0], a.shape()[1]);
    let (k2, n) = (b.shape()[0], b.shape()[1]);
    ensure!(k == k2, "matrix dimensions differ: {:?} x {:?}", a.shape(), b.shape());
    let bt = b.transpose(&[1, 0])?;
    let (ad, bd) = (a.get_data(), bt.get_data());
    let data = (0..m * n)
        .into_par_iter()
        .map(|idx| {
            let (i, j) = (idx / n, idx % n);
            ad[i * k..(i + 1) * k]
                .iter()
                .zip(bd[j * k..(j + 1) * k].iter())
                .map(|(x, y)| x * y)
                .sum()
        })
        .collect();
    Ok(Tensor::new(vec![m, n], data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Attribute;

    #[test]
    fn test_gemm_trans_b_with_bias() {
        let node = Node::new("g", "Gemm", ["a", "b", "c"], ["y"]).with_attr("transB", Attribute::Int(1));
        let gemm = Gemm::from_node(&node).unwrap();
        let a = Tensor::new(vec![1, 2], vec![1.0, 2.0]);
        let b = Tensor::new(vec![3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let c = Tensor::new(vec![3], vec![0.5, 0.5, 0.5]);
        let y = gemm.op(&a, &b, Some(&c)).unwrap();
        assert_eq!(y.get_shape(), vec![1, 3]);
        assert_eq!(y.get_data(), &[1.5, 2.5, 3.5]);
        assert_eq!(gemm.output_channel_axis(), 0);
    }

    #[test]
    fn test_matmul_batched_broadcast() {
        let a = Tensor::new(vec![2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = Tensor::new(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]);
        let y = MatMul.op(&a, &b).unwrap();
        assert_eq!(y.get_shape(), vec![2, 1, 2]);
        assert_eq!(y.get_data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_matmul_vector_operand() {
        let a = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let v = Tensor::new(vec![3], vec![1.0, 1.0, 1.0]);
        let y = MatMul.op(&a, &v).unwrap();
        assert_eq!(y.get_shape(), vec![2]);
        assert_eq!(y.get_data(), &[6.0, 15.0]);
    }
}
