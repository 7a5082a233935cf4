//! Regularization terms.
//!
//! The distortion and centering terms are light priors that keep poorly
//! observed intrinsics from wandering. They are scaled so that, at their
//! expected magnitudes, together they make up a fixed fraction of the pixel
//! cost expected at one pixel of noise per measurement.

use crate::lensmodel::LensModel;

/// Weights and expected magnitudes of the regularization terms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegularizationConfig {
    /// Share of the expected pixel cost the distortion and centering terms
    /// may contribute
    pub target_fraction: f64,
    /// Expected magnitude of a distortion parameter
    pub normal_distortion_value: f64,
    /// Expected distance of the principal point from the imager center, in pixels
    pub normal_centering_error: f64,
    /// Extra weight of the OpenCV rational denominator terms `k4..k6`
    pub rational_penalty: f64,
    /// Weight of the `|t₀|² = 1` term, multiplied by `sqrt(N_px)`
    pub unity_cam01_weight: f64,
    /// Weight of the point-range term, multiplied by `sqrt(N_px)`
    pub point_range_weight: f64,
}

impl Default for RegularizationConfig {
    fn default() -> Self {
        Self {
            target_fraction: 0.005,
            normal_distortion_value: 0.2,
            normal_centering_error: 500.0,
            rational_penalty: 5.0,
            unity_cam01_weight: 1.0,
            point_range_weight: 1.0,
        }
    }
}

impl RegularizationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_fraction(mut self, fraction: f64) -> Self {
        self.target_fraction = fraction;
        self
    }

    pub fn with_normal_distortion_value(mut self, value: f64) -> Self {
        self.normal_distortion_value = value;
        self
    }

    pub fn with_normal_centering_error(mut self, pixels: f64) -> Self {
        self.normal_centering_error = pixels;
        self
    }

    pub fn with_rational_penalty(mut self, factor: f64) -> Self {
        self.rational_penalty = factor;
        self
    }

    pub fn with_unity_cam01_weight(mut self, weight: f64) -> Self {
        self.unity_cam01_weight = weight;
        self
    }

    pub fn with_point_range_weight(mut self, weight: f64) -> Self {
        self.point_range_weight = weight;
        self
    }
}

/// Row weights derived from a [`RegularizationConfig`] for one problem
#[derive(Debug, Clone, PartialEq)]
pub struct RegularizationScales {
    /// Weight of each distortion parameter, indexed from the first distortion
    pub distortion: Vec<f64>,
    pub centering: f64,
    pub unity_cam01: f64,
    pub point_range: f64,
}

impl RegularizationScales {
    /// `n_pixel_measurements` counts board and point rows
    pub fn new(
        config: &RegularizationConfig,
        model: &LensModel,
        n_cameras: usize,
        n_pixel_measurements: usize,
    ) -> Self {
        let n_px = n_pixel_measurements as f64;
        let n_distortion = model.num_distortion_params();
        let budget = config.target_fraction * n_px;

        let base_distortion = if n_distortion > 0 && n_cameras > 0 {
            (budget
                / (n_cameras as f64
                    * n_distortion as f64
                    * config.normal_distortion_value.powi(2)))
            .sqrt()
        } else {
            0.0
        };
        let distortion = (0..n_distortion)
            .map(|k| {
                if is_rational_denominator(model, k) {
                    base_distortion * config.rational_penalty
                } else {
                    base_distortion
                }
            })
            .collect();

        let centering = if n_cameras > 0 {
            (budget / (n_cameras as f64 * 2.0 * config.normal_centering_error.powi(2))).sqrt()
        } else {
            0.0
        };

        Self {
            distortion,
            centering,
            unity_cam01: config.unity_cam01_weight * n_px.sqrt(),
            point_range: config.point_range_weight * n_px.sqrt(),
        }
    }
}

/// `k4..k6` of the OpenCV models with a rational denominator
fn is_rational_denominator(model: &LensModel, distortion_index: usize) -> bool {
    matches!(model, LensModel::OpenCv8 | LensModel::OpenCv12) && (5..=7).contains(&distortion_index)
}

/// Range penalty of a point at `distance` from its camera, with its derivative
/// with respect to the distance
pub fn point_range_error(distance: f64, min: Option<f64>, max: Option<f64>) -> (f64, f64) {
    if let Some(min) = min
        && distance < min
    {
        return (min - distance, -1.0);
    }
    if let Some(max) = max
        && distance > max
    {
        return (distance - max, 1.0);
    }
    (0.0, 0.0)
}
