use anyhow::{Result, bail, ensure};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{Evaluate, OpInfo, optional, required_f32};
use crate::{
    graph::Node,
    tensor::{Tensor, TensorData},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeMode {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinateTransform {
    HalfPixel,
    PytorchHalfPixel,
    AlignCorners,
    Asymmetric,
    TfHalfPixelForNn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NearestMode {
    RoundPreferFloor,
    RoundPreferCeil,
    Floor,
    Ceil,
}

/// Separable nearest or linear resampling of every axis whose size changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resize {
    pub mode: ResizeMode,
    pub transform: CoordinateTransform,
    pub nearest_mode: NearestMode,
}

impl Resize {
    pub fn from_node(node: &Node) -> Result<Self> {
        let mode = match node.attr_string("mode", "nearest")?.as_str() {
            "nearest" => ResizeMode::Nearest,
            "linear" | "bilinear" => ResizeMode::Linear,
            other => bail!("resize mode '{}' is not supported", other),
        };
        let transform = match node.attr_string("coordinate_transformation_mode", "half_pixel")?.as_str() {
            "half_pixel" => CoordinateTransform::HalfPixel,
            "pytorch_half_pixel" => CoordinateTransform::PytorchHalfPixel,
            "align_corners" => CoordinateTransform::AlignCorners,
            "asymmetric" => CoordinateTransform::Asymmetric,
            "tf_half_pixel_for_nn" => CoordinateTransform::TfHalfPixelForNn,
            other => bail!("coordinate transformation '{}' is not supported", other),
        };
        let nearest_mode = match node.attr_string("nearest_mode", "round_prefer_floor")?.as_str() {
            "round_prefer_floor" => NearestMode::RoundPreferFloor,
            "round_prefer_ceil" => NearestMode::RoundPreferCeil,
            "floor" => NearestMode::Floor,
            "ceil" => NearestMode::Ceil,
            other => bail!("nearest mode '{}' is not supported", other),
        };
        Ok(Self {
            mode,
            transform,
            nearest_mode,
        })
    }

    fn source_coordinate(&self, o: usize, in_len: usize, out_len: usize, scale: f32) -> f32 {
        let o = o as f32;
        match self.transform {
            CoordinateTransform::HalfPixel => (o + 0.5) / scale - 0.5,
            CoordinateTransform::PytorchHalfPixel if out_len > 1 => (o + 0.5) / scale - 0.5,
            CoordinateTransform::PytorchHalfPixel => 0.0,
            CoordinateTransform::AlignCorners if out_len > 1 => {
                o * (in_len - 1) as f32 / (out_len - 1) as f32
            }
            CoordinateTransform::AlignCorners => 0.0,
            CoordinateTransform::Asymmetric => o / scale,
            CoordinateTransform::TfHalfPixelForNn => (o + 0.5) / scale,
        }
    }

    /// `(lower, upper, weight of upper)` source taps for output index `o`.
    fn tap(&self, o: usize, in_len: usize, out_len: usize, scale: f32) -> (usize, usize, f32) {
        let x = self.source_coordinate(o, in_len, out_len, scale);
        let last = (in_len - 1) as f32;
        match self.mode {
            ResizeMode::Nearest => {
                let frac = x - x.floor();
                let i = match self.nearest_mode {
                    NearestMode::RoundPreferFloor if frac == 0.5 => x.floor(),
                    NearestMode::RoundPreferCeil if frac == 0.5 => x.ceil(),
                    NearestMode::RoundPreferFloor | NearestMode::RoundPreferCeil => x.round(),
                    NearestMode::Floor => x.floor(),
                    NearestMode::Ceil => x.ceil(),
                };
                let i = i.clamp(0.0, last) as usize;
                (i, i, 0.0)
            }
            ResizeMode::Linear => {
                let x = x.clamp(0.0, last);
                let lo = x.floor() as usize;
                let hi = (lo + 1).min(in_len - 1);
                (lo, hi, x - lo as f32)
            }
        }
    }

    fn resample_axis(&self, t: &Tensor<f32>, axis: usize, out_len: usize, scale: f32) -> Tensor<f32> {
        let shape = t.get_shape();
        let in_len = shape[axis];
        let outer: usize = shape[..axis].iter().product();
        let inner: usize = shape[axis + 1..].iter().product();
        let taps = (0..out_len).map(|o| self.tap(o, in_len, out_len, scale)).collect_vec();
        let src = t.get_data();
        let mut data = Vec::with_capacity(outer * out_len * inner);
        for b in 0..outer {
            for (lo, hi, w) in &taps {
                let lo_off = (b * in_len + lo) * inner;
                let hi_off = (b * in_len + hi) * inner;
                for k in 0..inner {
                    data.push(src[lo_off + k] * (1.0 - w) + src[hi_off + k] * w);
                }
            }
        }
        let mut out_shape = shape;
        out_shape[axis] = out_len;
        Tensor::new(out_shape, data)
    }
}

impl Evaluate for Resize {
    fn evaluate(&self, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>> {
        let x = required_f32(inputs, 0)?;
        let rank = x.rank();
        let non_empty = |i: usize| optional(inputs, i).filter(|t| !t.is_empty());
        // opset 10 takes scales as the second input
        let (scales, sizes) = if inputs.len() == 2 {
            (non_empty(1), None)
        } else {
            (non_empty(2), non_empty(3))
        };
        let plan: Vec<(usize, f32)> = match (sizes, scales) {
            (Some(sizes), _) => {
                let sizes = sizes.to_i64_vec()?;
                ensure!(sizes.len() == rank, "resize sizes {:?} do not match rank {}", sizes, rank);
                sizes
                    .iter()
                    .zip(x.shape())
                    .map(|(s, d)| (*s as usize, *s as f32 / *d as f32))
                    .collect()
            }
            (None, Some(scales)) => {
                let scales = scales.as_f32()?.get_data().to_vec();
                ensure!(scales.len() == rank, "resize scales {:?} do not match rank {}", scales, rank);
                scales
                    .iter()
                    .zip(x.shape())
                    .map(|(s, d)| (((*d as f32) * s).floor() as usize, *s))
                    .collect()
            }
            (None, None) => bail!("resize needs either scales or sizes"),
        };
        let mut out = x.clone();
        for (axis, (out_len, scale)) in plan.into_iter().enumerate() {
            ensure!(out_len > 0, "resize produces an empty axis {}", axis);
            if out_len != x.shape()[axis] {
                out = self.resample_axis(&out, axis, out_len, scale);
            }
        }
        Ok(vec![out.into()])
    }
}

impl OpInfo for Resize {
    fn describe(&self) -> String {
        format!("Resize({:?}, {:?})", self.mode, self.transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Attribute;

    fn resize(mode: &str, transform: &str) -> Resize {
        let node = Node::new("r", "Resize", ["x", "", "s"], ["y"])
            .with_attr("mode", Attribute::String(mode.into()))
            .with_attr("coordinate_transformation_mode", Attribute::String(transform.into()));
        Resize::from_node(&node).unwrap()
    }

    #[test]
    fn test_nearest_upsample_2x() {
        let x: TensorData = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).into();
        let scales: TensorData = Tensor::new(vec![4], vec![1.0, 1.0, 2.0, 2.0]).into();
        let out = resize("nearest", "asymmetric").evaluate(&[Some(&x), None, Some(&scales)]).unwrap();
        let out = out[0].as_f32().unwrap();
        assert_eq!(out.get_shape(), vec![1, 1, 4, 4]);
        assert_eq!(&out.get_data()[..8], &[1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_linear_align_corners_sizes() {
        let x: TensorData = Tensor::new(vec![1, 1, 1, 2], vec![0.0, 3.0]).into();
        let sizes: TensorData = Tensor::new(vec![4], vec![1i64, 1, 1, 4]).into();
        let out = resize("linear", "align_corners")
            .evaluate(&[Some(&x), None, None, Some(&sizes)])
            .unwrap();
        let got = out[0].as_f32().unwrap().get_data();
        for (g, e) in got.iter().zip([0.0, 1.0, 2.0, 3.0]) {
            assert!((g - e).abs() < 1e-5, "{got:?}");
        }
    }

    #[test]
    fn test_unsupported_mode() {
        let node = Node::new("r", "Resize", ["x"], ["y"]).with_attr("mode", Attribute::String("cubic".into()));
        assert!(Resize::from_node(&node).is_err());
    }
}
