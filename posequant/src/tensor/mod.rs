//! Dense row-major tensors used by the float reference kernels and the quantizer.
mod utilities;
mod value;

use anyhow::{Result, bail, ensure};
use itertools::Itertools;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

pub use utilities::{broadcast_shapes, strides};
pub use value::{DataType, TensorData};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T> {
    pub(crate) shape: Vec<usize>,
    pub(crate) data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Panics if `data` does not hold exactly `shape.iter().product()` elements.
    pub fn new(shape: Vec<usize>, data: Vec<T>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} does not match data length {}",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    pub fn try_new(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        ensure!(
            shape.iter().product::<usize>() == data.len(),
            "shape {:?} does not match data length {}",
            shape,
            data.len()
        );
        Ok(Self { shape, data })
    }

    pub fn get_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn get_data(&self) -> &[T] {
        &self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reinterpret the data under a new shape with the same number of elements.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        ensure!(
            shape.iter().product::<usize>() == self.data.len(),
            "cannot reshape {:?} into {:?}",
            self.shape,
            shape
        );
        Ok(Self {
            shape,
            data: self.data,
        })
    }

    pub fn map<U, F: Fn(&T) -> U>(&self, f: F) -> Tensor<U> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(f).collect(),
        }
    }
}

impl<T: Copy + Default> Tensor<T> {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![T::default(); len],
        }
    }

    pub fn scalar(value: T) -> Self {
        Self {
            shape: vec![],
            data: vec![value],
        }
    }

    /// Permute the axes, `perm[i]` being the source axis of output axis `i`.
    pub fn transpose(&self, perm: &[usize]) -> Result<Self> {
        ensure!(
            perm.len() == self.rank() && perm.iter().sorted().copied().eq(0..self.rank()),
            "invalid permutation {:?} for rank {}",
            perm,
            self.rank()
        );
        let out_shape = perm.iter().map(|&p| self.shape[p]).collect_vec();
        let in_strides = strides(&self.shape);
        let out_strides = strides(&out_shape);
        let mut data = vec![T::default(); self.data.len()];
        for (out_idx, slot) in data.iter_mut().enumerate() {
            let mut rem = out_idx;
            let mut src = 0;
            for (axis, stride) in out_strides.iter().enumerate() {
                let coord = rem / stride;
                rem %= stride;
                src += coord * in_strides[perm[axis]];
            }
            *slot = self.data[src];
        }
        Ok(Self {
            shape: out_shape,
            data,
        })
    }

    /// Concatenate tensors along `axis`. All other dimensions must agree.
    pub fn concat(tensors: &[&Tensor<T>], axis: usize) -> Result<Self> {
        let Some(first) = tensors.first() else {
            bail!("concat needs at least one input");
        };
        ensure!(axis < first.rank(), "concat axis {} out of range", axis);
        for t in tensors.iter().skip(1) {
            ensure!(
                t.rank() == first.rank()
                    && t
                        .shape
                        .iter()
                        .zip(first.shape.iter())
                        .enumerate()
                        .all(|(i, (a, b))| i == axis || a == b),
                "concat shape mismatch: {:?} vs {:?}",
                first.shape,
                t.shape
            );
        }
        let outer: usize = first.shape[..axis].iter().product();
        let mut out_shape = first.shape.clone();
        out_shape[axis] = tensors.iter().map(|t| t.shape[axis]).sum();
        let mut data = Vec::with_capacity(out_shape.iter().product());
        for o in 0..outer {
            for t in tensors {
                let chunk: usize = t.shape[axis..].iter().product();
                data.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
            }
        }
        Ok(Self {
            shape: out_shape,
            data,
        })
    }

    /// Split along `axis` into consecutive pieces of the given sizes.
    pub fn split(&self, axis: usize, sizes: &[usize]) -> Result<Vec<Self>> {
        ensure!(axis < self.rank(), "split axis {} out of range", axis);
        ensure!(
            sizes.iter().sum::<usize>() == self.shape[axis],
            "split sizes {:?} do not cover axis of length {}",
            sizes,
            self.shape[axis]
        );
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let mut offset = 0;
        let mut outputs = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let mut shape = self.shape.clone();
            shape[axis] = size;
            let mut data = Vec::with_capacity(outer * size * inner);
            for o in 0..outer {
                let start = (o * self.shape[axis] + offset) * inner;
                data.extend_from_slice(&self.data[start..start + size * inner]);
            }
            outputs.push(Self { shape, data });
            offset += size;
        }
        Ok(outputs)
    }

    /// Strided slice. `ranges[axis] = (start, end, step)` with already clamped bounds;
    /// a negative step walks backwards from `start` down to (excluding) `end`.
    pub fn slice(&self, ranges: &[(i64, i64, i64)]) -> Result<Self> {
        ensure!(
            ranges.len() == self.rank(),
            "slice needs one range per axis"
        );
        let axis_indices = ranges
            .iter()
            .map(|&(start, end, step)| {
                ensure!(step != 0, "slice step cannot be zero");
                let mut idx = vec![];
                let mut i = start;
                while (step > 0 && i < end) || (step < 0 && i > end) {
                    idx.push(i as usize);
                    i += step;
                }
                Ok(idx)
            })
            .collect::<Result<Vec<_>>>()?;
        let out_shape = axis_indices.iter().map(|v| v.len()).collect_vec();
        let in_strides = strides(&self.shape);
        let data = axis_indices
            .iter()
            .multi_cartesian_product()
            .map(|coords| {
                let offset: usize = coords
                    .iter()
                    .zip(in_strides.iter())
                    .map(|(c, s)| **c * s)
                    .sum();
                self.data[offset]
            })
            .collect_vec();
        // multi_cartesian_product yields nothing for rank 0
        if out_shape.is_empty() {
            return Ok(self.clone());
        }
        Ok(Self {
            shape: out_shape,
            data,
        })
    }
}

impl Tensor<f32> {
    /// Uniform values in [0, 1) drawn from a seeded generator.
    pub fn random_seeded(shape: Vec<usize>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = shape.iter().product();
        Self {
            shape,
            data: (0..len).map(|_| rng.gen::<f32>()).collect(),
        }
    }

    pub fn min_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
    }

    /// Element-wise binary operation with numpy-style broadcasting.
    pub fn broadcast_with<F: Fn(f32, f32) -> f32>(&self, other: &Self, f: F) -> Result<Self> {
        let out_shape = broadcast_shapes(&self.shape, &other.shape)?;
        let a_idx = utilities::broadcast_index_map(&self.shape, &out_shape);
        let b_idx = utilities::broadcast_index_map(&other.shape, &out_shape);
        let data = a_idx
            .into_iter()
            .zip(b_idx)
            .map(|(i, j)| f(self.data[i], other.data[j]))
            .collect();
        Ok(Self {
            shape: out_shape,
            data,
        })
    }
}
