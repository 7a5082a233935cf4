//! Outlier rejection.
//!
//! After each solve the residuals are compared against their own spread:
//!
//! - `var` is the mean squared residual over inlier pixel coordinates and
//!   inlier triangulated pairs
//! - a round finds something new if any inlier exceeds `k1²·var`, or an inlier
//!   triangulated pair diverges
//! - only then everything above the looser `k0²·var` is marked
//!
//! [`classify`] only reads; [`mark`] is the one place observations change.

use crate::core::{MeasurementLayout, Observations};
use faer::Mat;
use std::collections::BTreeSet;

/// Thresholds of the outlier controller, in standard deviations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierConfig {
    /// Measurements beyond `k0·σ` are marked once a round finds something
    pub k0: f64,
    /// A round finds something only if a measurement is beyond `k1·σ`
    pub k1: f64,
    /// Cap on solve-mark-resolve rounds
    pub max_iterations: usize,
    /// Floor on σ, in pixels. Keeps round-off on noise-free data from
    /// looking like outliers.
    pub min_sigma: f64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            k0: 4.0,
            k1: 5.0,
            max_iterations: 20,
            min_sigma: 1e-6,
        }
    }
}

impl OutlierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(mut self, k0: f64, k1: f64) -> Self {
        self.k0 = k0;
        self.k1 = k1;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_min_sigma(mut self, min_sigma: f64) -> Self {
        self.min_sigma = min_sigma;
        self
    }
}

/// What one round of outlier detection decided to mark
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Some inlier exceeded `k1·σ` or a pair diverged
    pub found_new: bool,
    /// Mean squared inlier residual, floored at `min_sigma²`
    pub variance: f64,
    /// Indices into [`Observations::board_pixels`]
    pub board_corners: Vec<usize>,
    /// Indices into [`Observations::points`]
    pub points: Vec<usize>,
    /// Indices into [`Observations::triangulated`], at most one per set
    pub triangulated: Vec<usize>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.board_corners.is_empty() && self.points.is_empty() && self.triangulated.is_empty()
    }
}

/// Newly marked observations of one [`mark`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkSummary {
    pub board_corners: usize,
    pub points: usize,
    pub triangulated: usize,
}

impl MarkSummary {
    pub fn total(&self) -> usize {
        self.board_corners + self.points + self.triangulated
    }
}

/// Decide which observations to mark, given the residuals of a solve.
///
/// `divergent` flags each triangulated pair in layout order, as returned by
/// [`crate::core::assembler::Assembler::divergent_pairs`].
pub fn classify(
    residuals: &Mat<f64>,
    layout: &MeasurementLayout,
    observations: &Observations,
    divergent: &[bool],
    config: &OutlierConfig,
) -> Classification {
    let pixel = |row: usize| (residuals[(row, 0)], residuals[(row + 1, 0)]);

    let board_rows = observations
        .board_pixels
        .iter()
        .enumerate()
        .filter(|(_, px)| !px.is_outlier())
        .map(|(k, _)| (k, layout.board.start + 2 * k));
    let point_rows = observations
        .points
        .iter()
        .enumerate()
        .filter(|(_, o)| !o.px.is_outlier())
        .map(|(k, _)| (k, layout.points.start + 2 * k));
    let pairs = inlier_pairs(layout, observations);

    let mut sum = 0.0;
    let mut count = 0usize;
    for (_, row) in board_rows.clone().chain(point_rows.clone()) {
        let (dx, dy) = pixel(row);
        sum += dx * dx + dy * dy;
        count += 2;
    }
    for pair in &pairs {
        let r = residuals[(pair.row, 0)];
        sum += r * r;
        count += 1;
    }
    if count == 0 {
        return Classification::default();
    }
    let variance = (sum / count as f64).max(config.min_sigma * config.min_sigma);
    let k0_limit = config.k0 * config.k0 * variance;
    let k1_limit = config.k1 * config.k1 * variance;

    let exceeds = |row: usize, limit: f64| {
        let (dx, dy) = pixel(row);
        dx * dx > limit || dy * dy > limit
    };

    let mut classification = Classification {
        variance,
        ..Default::default()
    };
    for (k, row) in board_rows {
        classification.found_new |= exceeds(row, k1_limit);
        if exceeds(row, k0_limit) {
            classification.board_corners.push(k);
        }
    }
    for (k, row) in point_rows {
        classification.found_new |= exceeds(row, k1_limit);
        if exceeds(row, k0_limit) {
            classification.points.push(k);
        }
    }

    for set in &layout.triangulated_sets {
        let mut offending = vec![0.0; set.len()];
        for pair in pairs.iter().filter(|p| set.contains(&p.i)) {
            let r = residuals[(pair.row, 0)];
            let is_divergent = divergent.get(pair.index).copied().unwrap_or(false);
            classification.found_new |= is_divergent || r * r > k1_limit;
            if is_divergent || r * r > k0_limit {
                offending[pair.i - set.start] += r.abs();
                offending[pair.j - set.start] += r.abs();
            }
        }
        let worst = offending
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > 0.0)
            .max_by(|a, b| a.1.total_cmp(b.1));
        if let Some((k, _)) = worst {
            classification.triangulated.push(set.start + k);
        }
    }

    if !classification.found_new {
        classification.board_corners.clear();
        classification.points.clear();
        classification.triangulated.clear();
    }
    classification
}

/// One triangulated pair with both observations inliers
struct InlierPair {
    /// Position among all pairs, in layout order
    index: usize,
    row: usize,
    i: usize,
    j: usize,
}

fn inlier_pairs(layout: &MeasurementLayout, observations: &Observations) -> Vec<InlierPair> {
    let mut pairs = Vec::new();
    let mut index = 0;
    for set in &layout.triangulated_sets {
        for i in set.clone() {
            for j in i + 1..set.end {
                if !observations.triangulated[i].outlier && !observations.triangulated[j].outlier {
                    pairs.push(InlierPair {
                        index,
                        row: layout.triangulated.start + index,
                        i,
                        j,
                    });
                }
                index += 1;
            }
        }
    }
    pairs
}

/// Apply a classification. Triangulated sets left with fewer than two
/// inliers are marked entirely.
pub fn mark(classification: &Classification, observations: &mut Observations) -> MarkSummary {
    let mut summary = MarkSummary::default();
    for &k in &classification.board_corners {
        let px = &mut observations.board_pixels[k];
        if !px.is_outlier() {
            px.mark_outlier();
            summary.board_corners += 1;
        }
    }
    for &k in &classification.points {
        let px = &mut observations.points[k].px;
        if !px.is_outlier() {
            px.mark_outlier();
            summary.points += 1;
        }
    }

    let touched: BTreeSet<usize> = classification.triangulated.iter().copied().collect();
    for &k in &touched {
        if !observations.triangulated[k].outlier {
            observations.triangulated[k].outlier = true;
            summary.triangulated += 1;
        }
    }
    for set in observations.triangulated_sets() {
        if !set.clone().any(|k| touched.contains(&k)) {
            continue;
        }
        let inliers = set
            .clone()
            .filter(|&k| !observations.triangulated[k].outlier)
            .count();
        if inliers < 2 {
            for k in set {
                if !observations.triangulated[k].outlier {
                    observations.triangulated[k].outlier = true;
                    summary.triangulated += 1;
                }
            }
        }
    }
    summary
}
