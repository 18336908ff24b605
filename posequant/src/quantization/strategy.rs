//! Strategies turning observed statistics into an activation clipping range.
use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{
    ACTIVATION_DOMAIN, ScalingFactor,
    observer::{Histogram, HistogramMode, RangeStats},
};

/// Number of quantized levels the KL search merges a candidate distribution into.
const KL_TARGET_BINS: usize = 128;
const KL_EPSILON: f64 = 1e-12;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationAlgorithm {
    #[display("min-max")]
    #[serde(rename = "min-max", alias = "minmax")]
    MinMax,
    #[display("percentile")]
    #[serde(rename = "percentile")]
    Percentile,
    #[display("kl")]
    #[serde(rename = "kl", alias = "kl-divergence")]
    Kl,
}

impl CalibrationAlgorithm {
    pub fn strategy(&self, percentile: f32) -> Box<dyn RangeStrategy> {
        match self {
            CalibrationAlgorithm::MinMax => Box::new(MinMax),
            CalibrationAlgorithm::Percentile => Box::new(Percentile(percentile)),
            CalibrationAlgorithm::Kl => Box::new(KlDivergence),
        }
    }
}

pub trait RangeStrategy: Send + Sync {
    /// Histogram the strategy needs from a second pass, if any.
    fn histogram_mode(&self) -> Option<HistogramMode>;

    /// Float range to map onto the activation domain.
    fn clip_range(&self, stats: &RangeStats, hist: Option<&Histogram>) -> (f32, f32);

    fn scaling_factor(&self, stats: &RangeStats, hist: Option<&Histogram>) -> ScalingFactor {
        let (lo, hi) = self.clip_range(stats, hist);
        ScalingFactor::from_span(lo, hi, Some(ACTIVATION_DOMAIN))
    }
}

pub struct MinMax;

impl RangeStrategy for MinMax {
    fn histogram_mode(&self) -> Option<HistogramMode> {
        None
    }

    fn clip_range(&self, stats: &RangeStats, _hist: Option<&Histogram>) -> (f32, f32) {
        (stats.min, stats.max)
    }
}

/// Clip both tails at the given percentile, e.g. 99.99.
pub struct Percentile(pub f32);

impl RangeStrategy for Percentile {
    fn histogram_mode(&self) -> Option<HistogramMode> {
        Some(HistogramMode::Signed)
    }

    fn clip_range(&self, stats: &RangeStats, hist: Option<&Histogram>) -> (f32, f32) {
        match hist {
            Some(h) if h.total() > 0 => {
                // p below 50 names the lower tail first.
                let (a, b) = (h.percentile(100.0 - self.0), h.percentile(self.0));
                (a.min(b), a.max(b))
            }
            _ => (stats.min, stats.max),
        }
    }
}

/// Entropy calibration: the threshold minimising KL(P || Q) between the clipped
/// reference distribution and its 128-level quantization.
pub struct KlDivergence;

impl RangeStrategy for KlDivergence {
    fn histogram_mode(&self) -> Option<HistogramMode> {
        Some(HistogramMode::Absolute)
    }

    fn clip_range(&self, stats: &RangeStats, hist: Option<&Histogram>) -> (f32, f32) {
        let threshold = match hist {
            Some(h) if h.total() > 0 => {
                let bin = kl_threshold_bin(h.bins());
                bin as f32 / h.bins().len() as f32 * h.hi()
            }
            _ => stats.abs_max(),
        };
        if stats.min >= 0.0 {
            (0.0, threshold)
        } else {
            (-threshold, threshold)
        }
    }
}

/// Index `i` such that clipping the histogram at bin `i` loses the least information.
pub(crate) fn kl_threshold_bin(bins: &[u64]) -> usize {
    let num_bins = bins.len();
    if num_bins < KL_TARGET_BINS {
        return num_bins;
    }
    let total: u64 = bins.iter().sum();
    if total == 0 {
        return num_bins;
    }
    let reference: Vec<f64> = bins.iter().map(|&c| c as f64 / total as f64).collect();

    let mut best_divergence = f64::INFINITY;
    let mut best_bin = num_bins;
    for threshold_bin in KL_TARGET_BINS..=num_bins {
        let sliced = &reference[..threshold_bin];
        let mut clipped = sliced.to_vec();
        let outliers: f64 = reference[threshold_bin..].iter().sum();
        if let Some(last) = clipped.last_mut() {
            *last += outliers;
        }

        // Q is built from the slice without the outlier mass, so clipping is penalised.
        let per_level = threshold_bin as f64 / KL_TARGET_BINS as f64;
        let mut levels = vec![0f64; KL_TARGET_BINS];
        for (i, p) in sliced.iter().enumerate() {
            let q = ((i as f64 / per_level) as usize).min(KL_TARGET_BINS - 1);
            levels[q] += p;
        }

        let mut expanded = vec![0f64; threshold_bin];
        for (q, mass) in levels.iter().enumerate() {
            let start = (q as f64 * per_level) as usize;
            let end = if q == KL_TARGET_BINS - 1 {
                threshold_bin
            } else {
                (((q + 1) as f64 * per_level) as usize).min(threshold_bin)
            };
            if start >= end {
                continue;
            }
            let nonzero = clipped[start..end].iter().filter(|p| **p > KL_EPSILON).count();
            if nonzero == 0 {
                continue;
            }
            let avg = mass / nonzero as f64;
            for j in start..end {
                if clipped[j] > KL_EPSILON {
                    expanded[j] = avg;
                }
            }
        }

        let divergence = kl_divergence(&clipped, &expanded);
        if divergence < best_divergence {
            best_divergence = divergence;
            best_bin = threshold_bin;
        }
    }
    best_bin
}

/// KL(P || Q) after normalising both sides. Bins where Q vanishes under a non-zero P are
/// charged as if Q held `KL_EPSILON`.
fn kl_divergence(p: &[f64], q: &[f64]) -> f64 {
    let p_sum: f64 = p.iter().sum();
    let q_sum: f64 = q.iter().sum();
    if p_sum <= KL_EPSILON || q_sum <= KL_EPSILON {
        return f64::INFINITY;
    }
    p.iter()
        .zip(q.iter())
        .filter(|(p, _)| **p > KL_EPSILON)
        .map(|(p, q)| {
            let p = p / p_sum;
            let q = (q / q_sum).max(KL_EPSILON);
            p * (p / q).ln()
        })
        .sum()
}
