//! Statistics accumulated over calibration batches.
//!
//! Both observers are built per batch and merged into the run state only once the
//! batch has been fully evaluated, so a failing batch never leaves partial statistics.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Histogram resolution used by the percentile and KL strategies.
pub const HISTOGRAM_BINS: usize = 2048;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeStats {
    pub min: f32,
    pub max: f32,
    pub count: u64,
}

impl RangeStats {
    pub fn abs_max(&self) -> f32 {
        self.min.abs().max(self.max.abs())
    }

    fn update(&mut self, t: &Tensor<f32>) {
        for v in t.get_data().iter().filter(|v| v.is_finite()) {
            self.min = self.min.min(*v);
            self.max = self.max.max(*v);
        }
        self.count += t.len() as u64;
    }

    fn merge(&mut self, other: &RangeStats) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }
}

impl Default for RangeStats {
    fn default() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            count: 0,
        }
    }
}

/// Running min/max of every observed tensor.
#[derive(Clone, Debug, Default)]
pub struct RangeObserver {
    ranges: BTreeMap<String, RangeStats>,
}

impl RangeObserver {
    pub fn observe(&mut self, name: &str, t: &Tensor<f32>) {
        self.ranges.entry(name.to_string()).or_default().update(t);
    }

    pub fn merge(&mut self, other: RangeObserver) {
        for (name, stats) in other.ranges {
            self.ranges.entry(name).or_default().merge(&stats);
        }
    }

    pub fn get(&self, name: &str) -> Option<&RangeStats> {
        self.ranges.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RangeStats)> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Whether a histogram bins signed values or their magnitudes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistogramMode {
    Signed,
    Absolute,
}

/// Fixed-range histogram. Values outside `[lo, hi]` land in the edge bins, which keeps
/// merging a plain element-wise sum.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    lo: f32,
    hi: f32,
    bins: Vec<u64>,
}

impl Histogram {
    pub fn new(lo: f32, hi: f32, num_bins: usize) -> Self {
        Self {
            lo,
            hi,
            bins: vec![0; num_bins.max(1)],
        }
    }

    pub fn lo(&self) -> f32 {
        self.lo
    }

    pub fn hi(&self) -> f32 {
        self.hi
    }

    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }

    fn bin_width(&self) -> f32 {
        (self.hi - self.lo) / self.bins.len() as f32
    }

    pub fn add(&mut self, value: f32) {
        if !value.is_finite() {
            return;
        }
        let width = self.bin_width();
        let idx = if width > 0.0 {
            (((value - self.lo) / width).floor().max(0.0) as usize).min(self.bins.len() - 1)
        } else {
            0
        };
        self.bins[idx] += 1;
    }

    pub fn merge(&mut self, other: &Histogram) {
        debug_assert_eq!(self.bins.len(), other.bins.len());
        for (a, b) in self.bins.iter_mut().zip(other.bins.iter()) {
            *a += b;
        }
    }

    /// Value at percentile `pct` in [0, 100], interpolated within the containing bin.
    pub fn percentile(&self, pct: f32) -> f32 {
        let total = self.total();
        if total == 0 {
            return self.lo;
        }
        let target = (pct.clamp(0.0, 100.0) as f64 / 100.0) * total as f64;
        let width = self.bin_width();
        let mut cumulative = 0f64;
        for (i, &count) in self.bins.iter().enumerate() {
            let next = cumulative + count as f64;
            if next >= target && count > 0 {
                let frac = ((target - cumulative) / count as f64) as f32;
                return self.lo + width * (i as f32 + frac.clamp(0.0, 1.0));
            }
            cumulative = next;
        }
        self.hi
    }
}

/// Histograms of every observed tensor over ranges fixed by a previous min/max pass.
#[derive(Clone, Debug)]
pub struct HistogramObserver {
    mode: HistogramMode,
    histograms: BTreeMap<String, Histogram>,
}

impl HistogramObserver {
    /// Empty histograms covering the ranges of `ranges`: [min, max] in signed mode,
    /// [0, absmax] in absolute mode.
    pub fn from_ranges(ranges: &RangeObserver, mode: HistogramMode) -> Self {
        let histograms = ranges
            .iter()
            .map(|(name, stats)| {
                let (lo, hi) = match mode {
                    HistogramMode::Signed => (stats.min, stats.max),
                    HistogramMode::Absolute => (0.0, stats.abs_max()),
                };
                (name.clone(), Histogram::new(lo, hi, HISTOGRAM_BINS))
            })
            .collect();
        Self { mode, histograms }
    }

    /// Same tensors and ranges, all counts reset.
    pub fn empty_like(&self) -> Self {
        Self {
            mode: self.mode,
            histograms: self
                .histograms
                .iter()
                .map(|(n, h)| (n.clone(), Histogram::new(h.lo, h.hi, h.bins.len())))
                .collect(),
        }
    }

    /// Tensors without a range from the min/max pass are ignored.
    pub fn observe(&mut self, name: &str, t: &Tensor<f32>) {
        let Some(hist) = self.histograms.get_mut(name) else {
            return;
        };
        match self.mode {
            HistogramMode::Signed => t.get_data().iter().for_each(|v| hist.add(*v)),
            HistogramMode::Absolute => t.get_data().iter().for_each(|v| hist.add(v.abs())),
        }
    }

    pub fn merge(&mut self, other: HistogramObserver) {
        for (name, hist) in other.histograms {
            match self.histograms.get_mut(&name) {
                Some(existing) => existing.merge(&hist),
                None => {
                    self.histograms.insert(name, hist);
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Histogram> {
        self.histograms.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_observer_merge() {
        let mut a = RangeObserver::default();
        a.observe("x", &Tensor::new(vec![3], vec![-1.0, 0.5, 2.0]));
        let mut b = RangeObserver::default();
        b.observe("x", &Tensor::new(vec![2], vec![-3.0, 1.0]));
        b.observe("y", &Tensor::new(vec![1], vec![4.0]));
        a.merge(b);
        let x = a.get("x").unwrap();
        assert_eq!((x.min, x.max, x.count), (-3.0, 2.0, 5));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_histogram_percentile_interpolates() {
        let mut h = Histogram::new(0.0, 100.0, 100);
        (0..100).for_each(|v| h.add(v as f32 + 0.5));
        assert_eq!(h.total(), 100);
        assert!((h.percentile(50.0) - 50.0).abs() < 1e-4);
        assert!((h.percentile(100.0) - 100.0).abs() < 1e-4);
        assert!((h.percentile(0.0) - 0.0).abs() < 1e-4);
    }

    #[test]
    fn test_histogram_clamps_out_of_range_values() {
        let mut h = Histogram::new(0.0, 1.0, 4);
        h.add(-5.0);
        h.add(5.0);
        h.add(f32::NAN);
        assert_eq!(h.bins(), &[1, 0, 0, 1]);
    }

    #[test]
    fn test_absolute_histogram_uses_magnitudes() {
        let mut ranges = RangeObserver::default();
        let t = Tensor::new(vec![2], vec![-4.0, 2.0]);
        ranges.observe("t", &t);
        let mut hists = HistogramObserver::from_ranges(&ranges, HistogramMode::Absolute);
        hists.observe("t", &t);
        let h = hists.get("t").unwrap();
        assert_eq!((h.lo(), h.hi()), (0.0, 4.0));
        assert_eq!(h.bins()[HISTOGRAM_BINS - 1], 1);
        assert_eq!(h.bins()[HISTOGRAM_BINS / 2], 1);
    }

    #[test]
    fn test_histogram_merge_is_associative() {
        let mut ranges = RangeObserver::default();
        let t1 = Tensor::new(vec![2], vec![0.0, 1.0]);
        let t2 = Tensor::new(vec![2], vec![0.25, 0.75]);
        ranges.observe("t", &t1);
        let base = HistogramObserver::from_ranges(&ranges, HistogramMode::Signed);
        let mut all = base.empty_like();
        all.observe("t", &t1);
        all.observe("t", &t2);
        let mut split = base.empty_like();
        let mut part = base.empty_like();
        split.observe("t", &t1);
        part.observe("t", &t2);
        split.merge(part);
        assert_eq!(all.get("t"), split.get("t"));
    }
}
