use anyhow::{Result, ensure};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{OpInfo, common::Window2d};
use crate::{graph::Node, tensor::Tensor};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Pooling {
    Max(Window2d),
    Average { window: Window2d, count_include_pad: bool },
    GlobalAverage,
}

impl Pooling {
    pub fn max_from_node(node: &Node) -> Result<Self> {
        let window = Window2d::from_node(node)?;
        ensure!(window.kernel.is_some(), "MaxPool '{}' has no kernel_shape", node.name);
        Ok(Pooling::Max(window))
    }

    pub fn average_from_node(node: &Node) -> Result<Self> {
        let window = Window2d::from_node(node)?;
        ensure!(window.kernel.is_some(), "AveragePool '{}' has no kernel_shape", node.name);
        Ok(Pooling::Average {
            window,
            count_include_pad: node.attr_int("count_include_pad", 0)? != 0,
        })
    }

    pub fn op(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        ensure!(input.rank() == 4, "pooling input must be NCHW, got {:?}", input.shape());
        let (n, c, h, w) = (input.shape()[0], input.shape()[1], input.shape()[2], input.shape()[3]);
        match self {
            Pooling::GlobalAverage => {
                let data = input
                    .get_data()
                    .chunks(h * w)
                    .map(|plane| plane.iter().sum::<f32>() / (h * w) as f32)
                    .collect();
                Ok(Tensor::new(vec![n, c, 1, 1], data))
            }
            Pooling::Max(window) => window_reduce(input, window, |values, _| {
                values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
            }),
            Pooling::Average {
                window,
                count_include_pad,
            } => window_reduce(input, window, |values, padded_count| {
                let count = if *count_include_pad { padded_count } else { values.len() };
                values.iter().sum::<f32>() / count.max(1) as f32
            }),
        }
    }
}

/// Applies `reduce(valid_values, window_size_within_padding)` over every window.
fn window_reduce<F>(input: &Tensor<f32>, window: &Window2d, reduce: F) -> Result<Tensor<f32>>
where
    F: Fn(&[f32], usize) -> f32 + Sync,
{
    let (n, c, h, w) = (input.shape()[0], input.shape()[1], input.shape()[2], input.shape()[3]);
    let kernel = window.kernel.unwrap_or([1, 1]);
    let pads = window.resolve_pads([h, w], kernel);
    let [oh, ow] = window.output_hw([h, w], kernel, pads)?;
    let [sh, sw] = window.strides;
    let [dh, dw] = window.dilations;
    let x = input.get_data();
    let planes: Vec<Vec<f32>> = (0..n * c)
        .into_par_iter()
        .map(|plane| {
            let off = plane * h * w;
            let mut out = Vec::with_capacity(oh * ow);
            let mut values = Vec::with_capacity(kernel[0] * kernel[1]);
            for oy in 0..oh {
                for ox in 0..ow {
                    values.clear();
                    let mut padded = 0;
                    for ky in 0..kernel[0] {
                        let iy = (oy * sh + ky * dh) as isize - pads[0] as isize;
                        for kx in 0..kernel[1] {
                            let ix = (ox * sw + kx * dw) as isize - pads[1] as isize;
                            // positions past the bottom/right pads (ceil mode) are not counted
                            if iy < h as isize + pads[2] as isize && ix < w as isize + pads[3] as isize {
                                padded += 1;
                            }
                            if iy >= 0 && iy < h as isize && ix >= 0 && ix < w as isize {
                                values.push(x[off + iy as usize * w + ix as usize]);
                            }
                        }
                    }
                    out.push(reduce(&values, padded));
                }
            }
            out
        })
        .collect();
    Ok(Tensor::new(vec![n, c, oh, ow], planes.concat()))
}

impl OpInfo for Pooling {
    fn describe(&self) -> String {
        match self {
            Pooling::Max(w) => format!("MaxPool(kernel={:?}, strides={:?})", w.kernel, w.strides),
            Pooling::Average { window, .. } => {
                format!("AveragePool(kernel={:?}, strides={:?})", window.kernel, window.strides)
            }
            Pooling::GlobalAverage => "GlobalAveragePool".to_string(),
        }
    }
}
