//! Layout operators. They move data without arithmetic and accept every element type.
use anyhow::{Result, bail, ensure};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{Evaluate, normalize_axis, optional, required};
use crate::{
    graph::{Attribute, Node},
    tensor::{Tensor, TensorData},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Concat {
    pub axis: i64,
}

impl Concat {
    pub fn from_node(node: &Node) -> Result<Self> {
        match node.attributes.get("axis") {
            Some(Attribute::Int(axis)) => Ok(Self { axis: *axis }),
            _ => bail!("Concat '{}' requires an integer axis", node.name),
        }
    }
}

impl Evaluate for Concat {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
        let values = inputs.iter().flatten().copied().collect_vec();
        let Some(first) = values.first() else {
            bail!("concat needs at least one input");
        };
        let axis = normalize_axis(self.axis, first.get_shape().len())?;
        Ok(vec![TensorData::concat(&values, axis)?])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reshape {
    pub allow_zero: bool,
}

impl Reshape {
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(Self {
            allow_zero: node.attr_int("allowzero", 0)? != 0,
        })
    }

    /// Resolve a requested shape: 0 copies the input dimension, -1 is inferred.
    pub fn target_shape(&self, input: &[usize], requested: &[i64]) -> Result<Vec<usize>> {
        let total: usize = input.iter().product();
        let mut shape = Vec::with_capacity(requested.len());
        let mut inferred = None;
        for (i, d) in requested.iter().enumerate() {
            match *d {
                -1 => {
                    ensure!(inferred.is_none(), "reshape has more than one -1 in {:?}", requested);
                    inferred = Some(i);
                    shape.push(1);
                }
                0 if !self.allow_zero => {
                    ensure!(i < input.len(), "reshape copies missing dimension {}", i);
                    shape.push(input[i]);
                }
                d if d >= 0 => shape.push(d as usize),
                d => bail!("invalid reshape dimension {}", d),
            }
        }
        if let Some(i) = inferred {
            let known: usize = shape.iter().product();
            ensure!(known > 0 && total % known == 0, "cannot infer dimension of {:?} from {:?}", requested, input);
            shape[i] = total / known;
        }
        Ok(shape)
    }
}

impl Evaluate for Reshape {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
        let data = required(inputs, 0)?;
        let requested = required(inputs, 1)?.to_i64_vec()?;
        let shape = self.target_shape(&data.get_shape(), &requested)?;
        Ok(vec![data.clone().reshape(shape)?])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flatten {
    pub axis: i64,
}

impl Flatten {
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(Self {
            axis: node.attr_int("axis", 1)?,
        })
    }
}

impl Evaluate for Flatten {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
        let data = required(inputs, 0)?;
        let shape = data.get_shape();
        let axis = if self.axis < 0 { self.axis + shape.len() as i64 } else { self.axis };
        ensure!(axis >= 0 && axis as usize <= shape.len(), "flatten axis {} out of range", self.axis);
        let outer: usize = shape[..axis as usize].iter().product();
        let inner: usize = shape[axis as usize..].iter().product();
        Ok(vec![data.clone().reshape(vec![outer, inner])?])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transpose {
    /// `None` reverses the axes.
    pub perm: Option<Vec<usize>>,
}

impl Transpose {
    pub fn from_node(node: &Node) -> Result<Self> {
        let perm = node
            .attr_ints("perm")?
            .map(|p| {
                p.into_iter()
                    .map(|a| {
                        ensure!(a >= 0, "negative permutation entry {}", a);
                        Ok(a as usize)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        Ok(Self { perm })
    }
}

impl Evaluate for Transpose {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
        let data = required(inputs, 0)?;
        let rank = data.get_shape().len();
        let perm = self.perm.clone().unwrap_or_else(|| (0..rank).rev().collect());
        Ok(vec![data.transpose(&perm)?])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub axis: i64,
    /// Sizes from the legacy `split` attribute.
    pub split: Option<Vec<i64>>,
    pub num_outputs: usize,
}

impl Split {
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(Self {
            axis: node.attr_int("axis", 0)?,
            split: node.attr_ints("split")?,
            num_outputs: node.outputs.len(),
        })
    }
}

impl Evaluate for Split {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
        let data = required(inputs, 0)?;
        let shape = data.get_shape();
        let axis = normalize_axis(self.axis, shape.len())?;
        let sizes = match optional(inputs, 1).map(TensorData::to_i64_vec).transpose()? {
            Some(sizes) => sizes,
            None => self.split.clone().unwrap_or_default(),
        };
        let sizes = if sizes.is_empty() {
            ensure!(self.num_outputs > 0, "split has no outputs");
            let chunk = shape[axis].div_ceil(self.num_outputs);
            (0..self.num_outputs)
                .map(|i| chunk.min(shape[axis].saturating_sub(i * chunk)))
                .collect_vec()
        } else {
            ensure!(sizes.iter().all(|s| *s >= 0), "negative split size in {:?}", sizes);
            sizes.into_iter().map(|s| s as usize).collect_vec()
        };
        data.split(axis, &sizes)
    }
}

/// Opset 10+ slice: starts, ends, axes and steps come as inputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    /// Opset 1 attributes `(starts, ends, axes)`.
    pub legacy: Option<(Vec<i64>, Vec<i64>, Option<Vec<i64>>)>,
}

impl Slice {
    pub fn from_node(node: &Node) -> Result<Self> {
        let legacy = match (node.attr_ints("starts")?, node.attr_ints("ends")?) {
            (Some(starts), Some(ends)) => Some((starts, ends, node.attr_ints("axes")?)),
            _ => None,
        };
        Ok(Self { legacy })
    }

    /// Clamped `(start, end, step)` per axis.
    pub fn ranges(
        shape: &[usize],
        starts: &[i64],
        ends: &[i64],
        axes: Option<&[i64]>,
        steps: Option<&[i64]>,
    ) -> Result<Vec<(i64, i64, i64)>> {
        ensure!(starts.len() == ends.len(), "slice starts and ends differ in length");
        let mut ranges = shape.iter().map(|d| (0, *d as i64, 1)).collect_vec();
        for i in 0..starts.len() {
            let axis = match axes {
                Some(axes) => normalize_axis(axes[i], shape.len())?,
                None => i,
            };
            ensure!(axis < shape.len(), "slice axis {} out of range", axis);
            let step = steps.map_or(1, |s| s[i]);
            ensure!(step != 0, "slice step cannot be zero");
            let dim = shape[axis] as i64;
            let resolve = |v: i64| if v < 0 { v + dim } else { v };
            let (start, end) = if step > 0 {
                (resolve(starts[i]).clamp(0, dim), resolve(ends[i]).clamp(0, dim))
            } else {
                (resolve(starts[i]).clamp(0, dim - 1), resolve(ends[i]).clamp(-1, dim - 1))
            };
            ranges[axis] = (start, end, step);
        }
        Ok(ranges)
    }
}

impl Evaluate for Slice {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
        let data = required(inputs, 0)?;
        let shape = data.get_shape();
        let ranges = match &self.legacy {
            Some((starts, ends, axes)) => Self::ranges(&shape, starts, ends, axes.as_deref(), None)?,
            None => {
                let starts = required(inputs, 1)?.to_i64_vec()?;
                let ends = required(inputs, 2)?.to_i64_vec()?;
                let axes = optional(inputs, 3).map(TensorData::to_i64_vec).transpose()?;
                let steps = optional(inputs, 4).map(TensorData::to_i64_vec).transpose()?;
                Self::ranges(&shape, &starts, &ends, axes.as_deref(), steps.as_deref())?
            }
        };
        Ok(vec![data.slice(&ranges)?])
    }
}

pub fn constant_from_node(node: &Node) -> Result<TensorData> {
    if let Some(t) = node.attr_tensor("value") {
        return Ok(t.clone());
    }
    let attrs = &node.attributes;
    Ok(match (
        attrs.get("value_float"),
        attrs.get("value_floats"),
        attrs.get("value_int"),
        attrs.get("value_ints"),
    ) {
        (Some(Attribute::Float(f)), ..) => Tensor::scalar(*f).into(),
        (_, Some(Attribute::Floats(v)), ..) => Tensor::new(vec![v.len()], v.clone()).into(),
        (_, _, Some(Attribute::Int(i)), _) => Tensor::scalar(*i).into(),
        (.., Some(Attribute::Ints(v))) => Tensor::new(vec![v.len()], v.clone()).into(),
        _ => bail!("Constant '{}' has no supported value attribute", node.name),
    })
}
