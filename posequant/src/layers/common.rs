//! Sliding-window geometry shared by convolution and pooling.
use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::graph::Node;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoPad {
    NotSet,
    Valid,
    SameUpper,
    SameLower,
}

impl AutoPad {
    fn from_node(node: &Node) -> Result<Self> {
        Ok(match node.attr_string("auto_pad", "NOTSET")?.as_str() {
            "NOTSET" | "" => AutoPad::NotSet,
            "VALID" => AutoPad::Valid,
            "SAME_UPPER" => AutoPad::SameUpper,
            "SAME_LOWER" => AutoPad::SameLower,
            other => bail!("unknown auto_pad '{}'", other),
        })
    }
}

/// 2D window parameters. Pads are `[top, left, bottom, right]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Window2d {
    /// `None` when the kernel size comes from the weight tensor.
    pub kernel: Option<[usize; 2]>,
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub pads: [usize; 4],
    pub auto_pad: AutoPad,
    pub ceil_mode: bool,
}

fn pair(values: Option<Vec<i64>>, default: usize, what: &str) -> Result<[usize; 2]> {
    match values.as_deref() {
        None => Ok([default, default]),
        Some([a, b]) if *a > 0 && *b > 0 => Ok([*a as usize, *b as usize]),
        Some(other) => bail!("{} must hold two positive values, got {:?}", what, other),
    }
}

impl Window2d {
    pub fn from_node(node: &Node) -> Result<Self> {
        let kernel = match node.attr_ints("kernel_shape")? {
            None => None,
            some => Some(pair(some, 1, "kernel_shape")?),
        };
        let pads = match node.attr_ints("pads")?.as_deref() {
            None => [0; 4],
            Some([t, l, b, r]) if [t, l, b, r].iter().all(|p| **p >= 0) => {
                [*t as usize, *l as usize, *b as usize, *r as usize]
            }
            Some(other) => bail!("pads must hold four non-negative values, got {:?}", other),
        };
        Ok(Self {
            kernel,
            strides: pair(node.attr_ints("strides")?, 1, "strides")?,
            dilations: pair(node.attr_ints("dilations")?, 1, "dilations")?,
            pads,
            auto_pad: AutoPad::from_node(node)?,
            ceil_mode: node.attr_int("ceil_mode", 0)? != 0,
        })
    }

    /// Effective pads for an input of spatial size `hw` and kernel `kernel`.
    pub fn resolve_pads(&self, hw: [usize; 2], kernel: [usize; 2]) -> [usize; 4] {
        match self.auto_pad {
            AutoPad::NotSet => self.pads,
            AutoPad::Valid => [0; 4],
            AutoPad::SameUpper | AutoPad::SameLower => {
                let mut pads = [0; 4];
                for axis in 0..2 {
                    let out = hw[axis].div_ceil(self.strides[axis]);
                    let extent = self.dilations[axis] * (kernel[axis] - 1) + 1;
                    let total = ((out - 1) * self.strides[axis] + extent).saturating_sub(hw[axis]);
                    let small = total / 2;
                    let (begin, end) = if self.auto_pad == AutoPad::SameUpper {
                        (small, total - small)
                    } else {
                        (total - small, small)
                    };
                    pads[axis] = begin;
                    pads[axis + 2] = end;
                }
                pads
            }
        }
    }

    /// Output spatial size with the resolved pads.
    pub fn output_hw(&self, hw: [usize; 2], kernel: [usize; 2], pads: [usize; 4]) -> Result<[usize; 2]> {
        let mut out = [0; 2];
        for axis in 0..2 {
            let extent = self.dilations[axis] * (kernel[axis] - 1) + 1;
            let padded = hw[axis] + pads[axis] + pads[axis + 2];
            ensure!(
                padded >= extent,
                "window of extent {} does not fit padded input of size {}",
                extent,
                padded
            );
            let span = padded - extent;
            out[axis] = if self.ceil_mode {
                span.div_ceil(self.strides[axis]) + 1
            } else {
                span / self.strides[axis] + 1
            };
        }
        Ok(out)
    }
}
