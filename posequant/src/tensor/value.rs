//! Type agnostic tensor payloads, used wherever a graph value may hold
//! a float activation, a quantized weight or an integer shape operand.
use anyhow::{Result, bail};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use super::Tensor;

/// Element datatypes carried by graph values.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    #[display("f32")]
    F32,
    #[display("i8")]
    I8,
    #[display("i32")]
    I32,
    #[display("i64")]
    I64,
}

macro_rules! tensor_data_constructor {
    ($(($t:ty, $var:ident)), *) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
        pub enum TensorData {
            $( $var(Tensor<$t>) ),*
        }

        impl TensorData {
            pub fn data_type(&self) -> DataType {
                match self {
                    $( TensorData::$var(_) => DataType::$var ),*
                }
            }

            pub fn get_shape(&self) -> Vec<usize> {
                match self {
                    $( TensorData::$var(t) => t.get_shape() ),*
                }
            }

            pub fn len(&self) -> usize {
                match self {
                    $( TensorData::$var(t) => t.len() ),*
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            /// Same payload under a new shape.
            pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
                Ok(match self {
                    $( TensorData::$var(t) => TensorData::$var(t.reshape(shape)?) ),*
                })
            }

            pub fn transpose(&self, perm: &[usize]) -> Result<Self> {
                Ok(match self {
                    $( TensorData::$var(t) => TensorData::$var(t.transpose(perm)?) ),*
                })
            }

            pub fn slice(&self, ranges: &[(i64, i64, i64)]) -> Result<Self> {
                Ok(match self {
                    $( TensorData::$var(t) => TensorData::$var(t.slice(ranges)?) ),*
                })
            }

            pub fn split(&self, axis: usize, sizes: &[usize]) -> Result<Vec<Self>> {
                Ok(match self {
                    $( TensorData::$var(t) => t.split(axis, sizes)?.into_iter().map(TensorData::$var).collect() ),*
                })
            }
        }
    };
}

tensor_data_constructor!((f32, F32), (i8, I8), (i32, I32), (i64, I64));

impl TensorData {
    pub fn as_f32(&self) -> Result<&Tensor<f32>> {
        match self {
            TensorData::F32(t) => Ok(t),
            other => bail!("expected an f32 tensor, got {}", other.data_type()),
        }
    }

    pub fn as_i8(&self) -> Result<&Tensor<i8>> {
        match self {
            TensorData::I8(t) => Ok(t),
            other => bail!("expected an i8 tensor, got {}", other.data_type()),
        }
    }

    pub fn as_i32(&self) -> Result<&Tensor<i32>> {
        match self {
            TensorData::I32(t) => Ok(t),
            other => bail!("expected an i32 tensor, got {}", other.data_type()),
        }
    }

    /// Integer view used by shape-like operands (Reshape shape, Slice starts, Split sizes).
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        Ok(match self {
            TensorData::I64(t) => t.get_data().to_vec(),
            TensorData::I32(t) => t.get_data().iter().map(|v| *v as i64).collect(),
            TensorData::I8(t) => t.get_data().iter().map(|v| *v as i64).collect(),
            TensorData::F32(_) => bail!("expected an integer tensor, got f32"),
        })
    }

    /// Float view used by zero-point and scale operands, whatever their integer width.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            TensorData::F32(t) => t.get_data().to_vec(),
            TensorData::I8(t) => t.get_data().iter().map(|v| *v as f32).collect(),
            TensorData::I32(t) => t.get_data().iter().map(|v| *v as f32).collect(),
            TensorData::I64(t) => t.get_data().iter().map(|v| *v as f32).collect(),
        }
    }

    /// Concatenate same-typed payloads along `axis`.
    pub fn concat(values: &[&TensorData], axis: usize) -> Result<Self> {
        macro_rules! gather {
            ($var:ident) => {{
                let tensors = values
                    .iter()
                    .map(|v| match v {
                        TensorData::$var(t) => Ok(t),
                        other => bail!("concat mixes {} with {}", DataType::$var, other.data_type()),
                    })
                    .collect::<Result<Vec<_>>>()?;
                TensorData::$var(Tensor::concat(&tensors, axis)?)
            }};
        }
        let Some(first) = values.first() else {
            bail!("concat needs at least one input");
        };
        Ok(match first.data_type() {
            DataType::F32 => gather!(F32),
            DataType::I8 => gather!(I8),
            DataType::I32 => gather!(I32),
            DataType::I64 => gather!(I64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_follows_variant() {
        let v: TensorData = Tensor::new(vec![2], vec![1i8, -1]).into();
        assert_eq!(v.data_type(), DataType::I8);
        assert_eq!(v.to_i64_vec().unwrap(), vec![1, -1]);
        assert!(v.as_f32().is_err());
    }

    #[test]
    fn test_concat_rejects_mixed_types() {
        let a: TensorData = Tensor::new(vec![1], vec![1.0f32]).into();
        let b: TensorData = Tensor::new(vec![1], vec![1i64]).into();
        assert!(TensorData::concat(&[&a, &b], 0).is_err());
        let c = TensorData::concat(&[&a, &a], 0).unwrap();
        assert_eq!(c.get_shape(), vec![2]);
    }
}
