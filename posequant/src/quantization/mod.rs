//! Module that takes care of deriving and applying 8-bit affine quantization parameters
mod observer;
mod strategy;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Element, tensor::Tensor};
pub use observer::{HISTOGRAM_BINS, Histogram, HistogramMode, HistogramObserver, RangeObserver, RangeStats};
pub use strategy::{CalibrationAlgorithm, KlDivergence, MinMax, Percentile, RangeStrategy};

/// Bit width of every quantized activation and weight.
pub const BIT_WIDTH: usize = 8;

/// Asymmetric activation range
pub const MIN: Element = -(1 << (BIT_WIDTH - 1));
pub const MAX: Element = (1 << (BIT_WIDTH - 1)) - 1;
/// Symmetric weight range, -127 keeps the domain centred on zero
pub const SYMMETRIC_MIN: Element = -MAX;

pub const ACTIVATION_DOMAIN: (Element, Element) = (MIN, MAX);
pub const WEIGHT_DOMAIN: (Element, Element) = (SYMMETRIC_MIN, MAX);
/// Biases are stored as i32 with scale `s_input * s_weight`.
pub const BIAS_DOMAIN: (Element, Element) = (-(i32::MAX as Element), i32::MAX as Element);

/// Affine mapping between a float span and an integer domain.
/// q = clamp(round(x / S) + Z), x ~ (q - Z) * S
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingFactor {
    min: f32,
    max: f32,
    scale: f32,
    zero_point: Element,
    quantized_domain: (Element, Element),
}

impl ScalingFactor {
    /// Symmetric factor over [-a, a], zero point is always 0.
    pub fn from_absolute_max(abs_max: f32, quantized_domain: Option<(Element, Element)>) -> Self {
        let domain = quantized_domain.unwrap_or(WEIGHT_DOMAIN);
        let a = abs_max.abs();
        let half = (domain.1 - domain.0) as f32 / 2.0;
        let scale = if a > f32::EPSILON && a.is_finite() {
            a / half
        } else {
            1.0
        };
        Self {
            min: -a,
            max: a,
            scale,
            zero_point: 0,
            quantized_domain: domain,
        }
    }

    pub fn from_tensor(t: &Tensor<f32>, quantized_domain: Option<(Element, Element)>) -> Self {
        Self::from_absolute_max(t.max_abs(), quantized_domain)
    }

    /// Asymmetric factor over [min, max]. The span is widened to contain 0 so that zero is
    /// exactly representable.
    pub fn from_span(min: f32, max: f32, quantized_domain: Option<(Element, Element)>) -> Self {
        let domain = quantized_domain.unwrap_or(ACTIVATION_DOMAIN);
        let min = min.min(0.0);
        let max = max.max(0.0);
        let span = max - min;
        let scale = if span > f32::EPSILON && span.is_finite() {
            span / (domain.1 - domain.0) as f32
        } else {
            1.0
        };
        let zero_point =
            (domain.0 - (min / scale).round() as Element).clamp(domain.0, domain.1);
        Self {
            min,
            max,
            scale,
            zero_point,
            quantized_domain: domain,
        }
    }

    /// Initialize a scaling factor whose `scale()` and `zero_point()` are the given values.
    pub fn from_scale(
        scale: f32,
        zero_point: Element,
        quantized_domain: Option<(Element, Element)>,
    ) -> Self {
        let domain = quantized_domain.unwrap_or(ACTIVATION_DOMAIN);
        Self {
            min: (domain.0 - zero_point) as f32 * scale,
            max: (domain.1 - zero_point) as f32 * scale,
            scale,
            zero_point,
            quantized_domain: domain,
        }
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn zero_point(&self) -> Element {
        self.zero_point
    }

    pub fn domain(&self) -> (Element, Element) {
        self.quantized_domain
    }

    /// Take a floating point number and quantize it into the integer domain.
    pub fn quantize(&self, value: &f32) -> Element {
        let scaled = (*value / self.scale).round() as Element + self.zero_point;
        if scaled < self.quantized_domain.0 || scaled > self.quantized_domain.1 {
            warn!(
                "Quantized value {} from {} is out of range [{}, {}]",
                scaled, value, self.quantized_domain.0, self.quantized_domain.1
            );
        }
        scaled.clamp(self.quantized_domain.0, self.quantized_domain.1)
    }

    /// Same as `quantize` without the out-of-range diagnostic, for bulk tensors where
    /// clipping is expected.
    pub fn quantize_saturating(&self, value: f32) -> Element {
        ((value / self.scale).round() as Element + self.zero_point)
            .clamp(self.quantized_domain.0, self.quantized_domain.1)
    }

    pub fn dequantize(&self, value: &Element) -> f32 {
        (*value - self.zero_point) as f32 * self.scale
    }
}

impl Default for ScalingFactor {
    fn default() -> Self {
        Self::from_absolute_max(1.0, None)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorKind {
    Activation,
    Weight,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QuantParams {
    PerTensor(ScalingFactor),
    PerChannel {
        axis: usize,
        factors: Vec<ScalingFactor>,
    },
}

impl QuantParams {
    pub fn scales(&self) -> Vec<f32> {
        match self {
            QuantParams::PerTensor(f) => vec![f.scale()],
            QuantParams::PerChannel { factors, .. } => factors.iter().map(|f| f.scale()).collect(),
        }
    }

    pub fn zero_points(&self) -> Vec<Element> {
        match self {
            QuantParams::PerTensor(f) => vec![f.zero_point()],
            QuantParams::PerChannel { factors, .. } => {
                factors.iter().map(|f| f.zero_point()).collect()
            }
        }
    }

    pub fn axis(&self) -> Option<usize> {
        match self {
            QuantParams::PerTensor(_) => None,
            QuantParams::PerChannel { axis, .. } => Some(*axis),
        }
    }

    /// Factor applying to channel `c`; a per-tensor factor applies to every channel.
    pub fn factor(&self, c: usize) -> Option<&ScalingFactor> {
        match self {
            QuantParams::PerTensor(f) => Some(f),
            QuantParams::PerChannel { factors, .. } => factors.get(c),
        }
    }

    pub fn num_channels(&self) -> usize {
        match self {
            QuantParams::PerTensor(_) => 1,
            QuantParams::PerChannel { factors, .. } => factors.len(),
        }
    }

    /// Quantize every element of `t`, routing each one through its channel's factor.
    pub fn quantize_tensor(&self, t: &Tensor<f32>) -> Tensor<Element> {
        match self {
            QuantParams::PerTensor(f) => t.map(|v| f.quantize_saturating(*v)),
            QuantParams::PerChannel { axis, factors } => {
                let shape = t.shape();
                let inner: usize = shape[axis + 1..].iter().product();
                let channels = shape[*axis];
                let data = t
                    .get_data()
                    .iter()
                    .enumerate()
                    .map(|(i, v)| factors[(i / inner) % channels].quantize_saturating(*v))
                    .collect();
                Tensor::new(t.get_shape(), data)
            }
        }
    }
}

/// Quantization of one named tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorQuantization {
    pub kind: TensorKind,
    pub params: QuantParams,
}

/// Everything the calibrator learned, keyed by tensor name. Read-only once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantParamSet {
    tensors: BTreeMap<String, TensorQuantization>,
    /// `None` when the parameters were read back from an already quantized graph.
    pub algorithm: Option<CalibrationAlgorithm>,
    pub per_channel: bool,
    pub num_samples: usize,
}

impl QuantParamSet {
    pub fn new(algorithm: CalibrationAlgorithm, per_channel: bool, num_samples: usize) -> Self {
        Self {
            tensors: BTreeMap::new(),
            algorithm: Some(algorithm),
            per_channel,
            num_samples,
        }
    }

    /// Parameters recovered from Q/DQ initializers rather than observed.
    pub(crate) fn recovered(per_channel: bool) -> Self {
        Self {
            tensors: BTreeMap::new(),
            algorithm: None,
            per_channel,
            num_samples: 0,
        }
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, q: TensorQuantization) {
        self.tensors.insert(name.into(), q);
    }

    pub fn get(&self, name: &str) -> Option<&TensorQuantization> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TensorQuantization)> {
        self.tensors.iter()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Per-tensor activation factor, if `name` is a calibrated activation.
    pub fn activation(&self, name: &str) -> Option<&ScalingFactor> {
        match self.tensors.get(name) {
            Some(TensorQuantization {
                kind: TensorKind::Activation,
                params: QuantParams::PerTensor(f),
            }) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(MIN, -128);
        assert_eq!(MAX, 127);
        assert_eq!(SYMMETRIC_MIN, -127);
    }

    #[test]
    fn test_span_formula() {
        let sf = ScalingFactor::from_span(-1.0, 3.0, None);
        assert!((sf.scale() - 4.0 / 255.0).abs() < 1e-7);
        assert_eq!(sf.zero_point(), -128 - (-1.0f32 / sf.scale()).round() as Element);
        assert_eq!(sf.quantize(&-1.0), -128);
        assert_eq!(sf.quantize(&3.0), 127);
        assert_eq!(sf.dequantize(&sf.quantize(&0.0)), 0.0);
    }

    #[rstest]
    #[case(0.5, 1.0)]
    #[case(-2.0, -0.5)]
    fn test_span_widened_to_zero(#[case] min: f32, #[case] max: f32) {
        let sf = ScalingFactor::from_span(min, max, None);
        assert!(sf.min() <= 0.0 && sf.max() >= 0.0);
        assert_eq!(sf.dequantize(&sf.quantize(&0.0)), 0.0);
    }

    #[test]
    fn test_symmetric_zero_point() {
        let sf = ScalingFactor::from_absolute_max(2.54, None);
        assert_eq!(sf.zero_point(), 0);
        assert!((sf.scale() - 0.02).abs() < 1e-6);
        assert_eq!(sf.quantize(&2.54), 127);
        assert_eq!(sf.quantize(&-10.0), -127);
    }

    #[test]
    fn test_degenerate_range_falls_back_to_unit_scale() {
        assert_eq!(ScalingFactor::from_absolute_max(0.0, None).scale(), 1.0);
        let sf = ScalingFactor::from_span(0.0, 0.0, None);
        assert_eq!(sf.scale(), 1.0);
        assert_eq!(sf.dequantize(&sf.quantize(&0.0)), 0.0);
    }

    #[test]
    fn test_from_scale_roundtrip() {
        let sf = ScalingFactor::from_scale(0.5, 3, None);
        assert_eq!(sf.scale(), 0.5);
        assert_eq!(sf.zero_point(), 3);
        assert_eq!(sf.quantize(&1.0), 5);
    }

    #[rstest]
    #[case::span_across_zero(ScalingFactor::from_span(-1.0, 3.0, None))]
    #[case::span_above_zero(ScalingFactor::from_span(0.5, 1.0, None))]
    #[case::span_below_zero(ScalingFactor::from_span(-2.0, -0.5, None))]
    #[case::span_skewed(ScalingFactor::from_span(-0.3, 7.0, None))]
    #[case::span_empty(ScalingFactor::from_span(0.0, 0.0, None))]
    #[case::symmetric(ScalingFactor::from_absolute_max(2.54, None))]
    #[case::symmetric_small(ScalingFactor::from_absolute_max(0.01, None))]
    #[case::symmetric_activation(ScalingFactor::from_absolute_max(6.0, Some(ACTIVATION_DOMAIN)))]
    fn test_dequantized_value_within_one_step(#[case] sf: ScalingFactor) {
        let steps = 100;
        for i in 0..=steps {
            let v = sf.min() + (sf.max() - sf.min()) * i as f32 / steps as f32;
            let back = sf.dequantize(&sf.quantize(&v));
            assert!(
                (back - v).abs() <= sf.scale() * (1.0 + 1e-5),
                "{v} came back as {back} with scale {}",
                sf.scale()
            );
        }
    }

    #[test]
    fn test_per_channel_quantize_tensor() {
        let t = Tensor::new(vec![2, 2], vec![1.0, -1.0, 10.0, -10.0]);
        let params = QuantParams::PerChannel {
            axis: 0,
            factors: vec![
                ScalingFactor::from_absolute_max(1.0, None),
                ScalingFactor::from_absolute_max(10.0, None),
            ],
        };
        let q = params.quantize_tensor(&t);
        assert_eq!(q.get_data(), &[127, -127, 127, -127]);
    }
}
