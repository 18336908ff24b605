use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::OpInfo;
use crate::tensor::Tensor;

/// Element-wise nonlinearities.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    LeakyRelu { alpha: f32 },
    Sigmoid,
    Tanh,
    /// x * relu6(x + 3) / 6
    HardSwish,
}

impl Activation {
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu { alpha } => {
                if x >= 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Tanh => x.tanh(),
            Activation::HardSwish => x * (x + 3.0).clamp(0.0, 6.0) / 6.0,
        }
    }

    pub fn op(&self, input: &Tensor<f32>) -> Tensor<f32> {
        Tensor::new(
            input.get_shape(),
            input.get_data().par_iter().map(|x| self.apply(*x)).collect(),
        )
    }
}

impl OpInfo for Activation {
    fn describe(&self) -> String {
        match self {
            Activation::LeakyRelu { alpha } => format!("LeakyRelu(alpha={alpha})"),
            other => format!("{other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Activation::Relu, -1.0, 0.0)]
    #[case(Activation::Relu, 2.0, 2.0)]
    #[case(Activation::LeakyRelu { alpha: 0.1 }, -2.0, -0.2)]
    #[case(Activation::Sigmoid, 0.0, 0.5)]
    #[case(Activation::Tanh, 0.0, 0.0)]
    #[case(Activation::HardSwish, -4.0, 0.0)]
    #[case(Activation::HardSwish, 4.0, 4.0)]
    #[case(Activation::HardSwish, 1.0, 4.0 / 6.0)]
    fn test_apply(#[case] act: Activation, #[case] x: f32, #[case] expected: f32) {
        assert!((act.apply(x) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_op_keeps_shape() {
        let t = Tensor::new(vec![1, 2, 2], vec![-1.0, 1.0, -2.0, 2.0]);
        let out = Activation::Relu.op(&t);
        assert_eq!(out.get_shape(), vec![1, 2, 2]);
        assert_eq!(out.get_data(), &[0.0, 1.0, 0.0, 2.0]);
    }
}
