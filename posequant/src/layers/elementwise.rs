use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Broadcasting arithmetic between two f32 tensors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    pub fn op(&self, a: &Tensor<f32>, b: &Tensor<f32>) -> Result<Tensor<f32>> {
        a.broadcast_with(b, |x, y| self.apply(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_broadcast() {
        let x = Tensor::new(vec![1, 2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let per_channel = Tensor::new(vec![2, 1, 1], vec![10.0, 100.0]);
        let out = BinaryOp::Mul.op(&x, &per_channel).unwrap();
        assert_eq!(out.get_data(), &[10.0, 20.0, 300.0, 400.0]);
        let out = BinaryOp::Sub.op(&x, &Tensor::scalar(1.0)).unwrap();
        assert_eq!(out.get_data(), &[0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_incompatible_shapes() {
        let a = Tensor::new(vec![2, 3], vec![0.0; 6]);
        let b = Tensor::new(vec![2], vec![0.0; 2]);
        assert!(BinaryOp::Add.op(&a, &b).is_err());
    }
}
