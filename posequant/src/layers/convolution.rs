use anyhow::{Result, ensure};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{OpInfo, common::Window2d};
use crate::{graph::Node, tensor::Tensor};

/// 2D convolution over NCHW inputs with OIHW filters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Convolution {
    pub window: Window2d,
    pub group: usize,
}

impl Convolution {
    pub fn from_node(node: &Node) -> Result<Self> {
        let group = node.attr_int("group", 1)?;
        ensure!(group >= 1, "group must be positive, got {}", group);
        Ok(Self {
            window: Window2d::from_node(node)?,
            group: group as usize,
        })
    }

    pub fn op(&self, input: &Tensor<f32>, weight: &Tensor<f32>, bias: Option<&Tensor<f32>>) -> Result<Tensor<f32>> {
        ensure!(input.rank() == 4, "conv input must be NCHW, got {:?}", input.shape());
        ensure!(weight.rank() == 4, "conv weight must be OIHW, got {:?}", weight.shape());
        let (n, c, h, w) = (input.shape()[0], input.shape()[1], input.shape()[2], input.shape()[3]);
        let (m, cg, kh, kw) = (weight.shape()[0], weight.shape()[1], weight.shape()[2], weight.shape()[3]);
        ensure!(
            c == cg * self.group && m % self.group == 0,
            "conv channels mismatch: input {} channels, weight {:?}, group {}",
            c,
            weight.shape(),
            self.group
        );
        if let Some(kernel) = self.window.kernel {
            ensure!(kernel == [kh, kw], "kernel_shape {:?} disagrees with weight {:?}", kernel, weight.shape());
        }
        if let Some(b) = bias {
            ensure!(b.len() == m, "conv bias has {} values for {} output channels", b.len(), m);
        }
        let pads = self.window.resolve_pads([h, w], [kh, kw]);
        let [oh, ow] = self.window.output_hw([h, w], [kh, kw], pads)?;
        let [sh, sw] = self.window.strides;
        let [dh, dw] = self.window.dilations;
        let m_per_group = m / self.group;
        let x = input.get_data();
        let k = weight.get_data();

        let planes: Vec<Vec<f32>> = (0..n * m)
            .into_par_iter()
            .map(|idx| {
                let (b, oc) = (idx / m, idx % m);
                let g = oc / m_per_group;
                let base = bias.map_or(0.0, |bias| bias.get_data()[oc]);
                let mut plane = vec![base; oh * ow];
                for ic in 0..cg {
                    let in_c = g * cg + ic;
                    let x_off = (b * c + in_c) * h * w;
                    let k_off = (oc * cg + ic) * kh * kw;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let kv = k[k_off + ky * kw + kx];
                            for oy in 0..oh {
                                let iy = (oy * sh + ky * dh) as isize - pads[0] as isize;
                                if iy < 0 || iy >= h as isize {
                                    continue;
                                }
                                let row = x_off + iy as usize * w;
                                for ox in 0..ow {
                                    let ix = (ox * sw + kx * dw) as isize - pads[1] as isize;
                                    if ix < 0 || ix >= w as isize {
                                        continue;
                                    }
                                    plane[oy * ow + ox] += kv * x[row + ix as usize];
                                }
                            }
                        }
                    }
                }
                plane
            })
            .collect();
        Ok(Tensor::new(vec![n, m, oh, ow], planes.concat()))
    }
}

impl OpInfo for Convolution {
    fn describe(&self) -> String {
        format!(
            "Conv(strides={:?}, pads={:?}, dilations={:?}, group={})",
            self.window.strides, self.window.pads, self.window.dilations, self.group
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Attribute;

    fn conv(attrs: Vec<(&str, Attribute)>) -> Convolution {
        let node = attrs
            .into_iter()
            .fold(Node::new("c", "Conv", ["x", "w"], ["y"]), |n, (k, v)| n.with_attr(k, v));
        Convolution::from_node(&node).unwrap()
    }

    #[test]
    fn test_identity_kernel() {
        let input = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let weight = Tensor::new(vec![1, 1, 1, 1], vec![2.0]);
        let bias = Tensor::new(vec![1], vec![0.5]);
        let out = conv(vec![]).op(&input, &weight, Some(&bias)).unwrap();
        assert_eq!(out.get_data(), &[2.5, 4.5, 6.5, 8.5]);
    }

    #[test]
    fn test_padded_3x3_sum() {
        let input = Tensor::new(vec![1, 1, 3, 3], vec![1.0; 9]);
        let weight = Tensor::new(vec![1, 1, 3, 3], vec![1.0; 9]);
        let out = conv(vec![("pads", Attribute::Ints(vec![1, 1, 1, 1]))])
            .op(&input, &weight, None)
            .unwrap();
        assert_eq!(out.get_shape(), vec![1, 1, 3, 3]);
        assert_eq!(out.get_data(), &[4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn test_depthwise_groups() {
        let input = Tensor::new(vec![1, 2, 1, 1], vec![3.0, 5.0]);
        let weight = Tensor::new(vec![2, 1, 1, 1], vec![10.0, 100.0]);
        let out = conv(vec![("group", Attribute::Int(2))]).op(&input, &weight, None).unwrap();
        assert_eq!(out.get_data(), &[30.0, 500.0]);
    }

    #[test]
    fn test_strided_output_shape() {
        let input = Tensor::new(vec![1, 3, 8, 8], vec![0.5; 192]);
        let weight = Tensor::new(vec![4, 3, 3, 3], vec![0.1; 108]);
        let out = conv(vec![
            ("strides", Attribute::Ints(vec![2, 2])),
            ("pads", Attribute::Ints(vec![1, 1, 1, 1])),
        ])
        .op(&input, &weight, None)
        .unwrap();
        assert_eq!(out.get_shape(), vec![1, 4, 4, 4]);
    }

    #[test]
    fn test_rejects_channel_mismatch() {
        let input = Tensor::new(vec![1, 2, 2, 2], vec![0.0; 8]);
        let weight = Tensor::new(vec![1, 3, 1, 1], vec![0.0; 3]);
        assert!(conv(vec![]).op(&input, &weight, None).is_err());
    }
}
