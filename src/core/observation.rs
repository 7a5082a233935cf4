//! Observations of boards, points and triangulated features.
//!
//! Board and point observations flag outliers with a negative weight;
//! triangulated observations carry an explicit flag. Only the outlier
//! controller's mark phase changes either.

use crate::core::{CoreError, CoreResult};
use std::ops::Range;

/// An observed pixel and its weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservedPixel {
    pub x: f64,
    pub y: f64,
    /// Measurement weight. Negative marks an outlier.
    pub weight: f64,
}

impl ObservedPixel {
    pub fn new(x: f64, y: f64, weight: f64) -> Self {
        Self { x, y, weight }
    }

    pub fn is_outlier(&self) -> bool {
        self.weight < 0.0
    }

    pub fn mark_outlier(&mut self) {
        self.weight = if self.weight > 0.0 { -self.weight } else { -1.0 };
    }
}

/// Which intrinsics and which extrinsics describe a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraIndex {
    pub intrinsics: usize,
    /// `None` for the reference camera
    pub extrinsics: Option<usize>,
}

impl CameraIndex {
    pub fn new(intrinsics: usize, extrinsics: Option<usize>) -> Self {
        Self {
            intrinsics,
            extrinsics,
        }
    }

    /// The camera that defines the reference frame
    pub fn reference(intrinsics: usize) -> Self {
        Self::new(intrinsics, None)
    }
}

/// One camera's view of the calibration board in one frame. The pixels live
/// in [`Observations::board_pixels`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardObservation {
    pub camera: CameraIndex,
    pub frame: usize,
}

/// One camera's view of a 3D point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointObservation {
    pub camera: CameraIndex,
    pub point: usize,
    pub px: ObservedPixel,
}

/// One ray of a triangulated feature.
///
/// A set of observations of the same feature is a contiguous run ending with
/// `last_in_set`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangulatedObservation {
    pub camera: CameraIndex,
    pub last_in_set: bool,
    pub outlier: bool,
    pub px: ObservedPixel,
}

/// All observations of a calibration problem
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observations {
    pub boards: Vec<BoardObservation>,
    /// `W·H` pixels per board observation, row-major, in `boards` order
    pub board_pixels: Vec<ObservedPixel>,
    pub points: Vec<PointObservation>,
    pub triangulated: Vec<TriangulatedObservation>,
}

impl Observations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a board observation with its `W·H` pixels
    pub fn add_board(&mut self, camera: CameraIndex, frame: usize, pixels: &[ObservedPixel]) {
        self.boards.push(BoardObservation { camera, frame });
        self.board_pixels.extend_from_slice(pixels);
    }

    pub fn add_point(&mut self, camera: CameraIndex, point: usize, px: ObservedPixel) {
        self.points.push(PointObservation { camera, point, px });
    }

    /// Add one triangulated feature seen by several cameras
    pub fn add_triangulated_set(&mut self, rays: &[(CameraIndex, ObservedPixel)]) {
        let n = rays.len();
        self.triangulated
            .extend(rays.iter().enumerate().map(|(i, (camera, px))| TriangulatedObservation {
                camera: *camera,
                last_in_set: i + 1 == n,
                outlier: false,
                px: *px,
            }));
    }

    /// Index ranges of the triangulated sets. A trailing run without a
    /// terminator is returned as a set of its own.
    pub fn triangulated_sets(&self) -> Vec<Range<usize>> {
        let mut sets = Vec::new();
        let mut start = 0;
        for (i, observation) in self.triangulated.iter().enumerate() {
            if observation.last_in_set {
                sets.push(start..i + 1);
                start = i + 1;
            }
        }
        if start < self.triangulated.len() {
            sets.push(start..self.triangulated.len());
        }
        sets
    }

    /// Pixels of board observation `i`
    pub fn board(&self, i: usize, corners_per_board: usize) -> &[ObservedPixel] {
        &self.board_pixels[i * corners_per_board..(i + 1) * corners_per_board]
    }

    pub fn num_board_outliers(&self) -> usize {
        self.board_pixels.iter().filter(|px| px.is_outlier()).count()
    }

    pub fn num_point_outliers(&self) -> usize {
        self.points.iter().filter(|o| o.px.is_outlier()).count()
    }

    pub fn num_triangulated_outliers(&self) -> usize {
        self.triangulated.iter().filter(|o| o.outlier).count()
    }

    fn cameras(&self) -> impl Iterator<Item = &CameraIndex> {
        self.boards
            .iter()
            .map(|o| &o.camera)
            .chain(self.points.iter().map(|o| &o.camera))
            .chain(self.triangulated.iter().map(|o| &o.camera))
    }

    /// The extrinsics paired with intrinsics `icam_intrinsics`, `None` for the
    /// reference camera.
    ///
    /// Only defined for stationary cameras, where each lens is mounted at one
    /// place: fails when the observations pair this intrinsics index with
    /// more than one extrinsics index, or never use it.
    pub fn extrinsics_for_intrinsics(
        &self,
        icam_intrinsics: usize,
        n_cameras_intrinsics: usize,
        n_cameras_extrinsics: usize,
    ) -> CoreResult<Option<usize>> {
        if n_cameras_intrinsics != n_cameras_extrinsics
            && n_cameras_intrinsics != n_cameras_extrinsics + 1
        {
            return Err(CoreError::InvalidInput(format!(
                "{n_cameras_intrinsics} intrinsics and {n_cameras_extrinsics} extrinsics do not describe stationary cameras"
            ))
            .log());
        }
        if icam_intrinsics >= n_cameras_intrinsics {
            return Err(CoreError::IndexOutOfRange(format!(
                "intrinsics {icam_intrinsics} of {n_cameras_intrinsics}"
            ))
            .log());
        }

        let mut found: Option<Option<usize>> = None;
        for camera in self.cameras().filter(|c| c.intrinsics == icam_intrinsics) {
            match found {
                None => found = Some(camera.extrinsics),
                Some(extrinsics) if extrinsics != camera.extrinsics => {
                    return Err(CoreError::InvalidInput(format!(
                        "intrinsics {icam_intrinsics} is observed through extrinsics {extrinsics:?} and {:?}",
                        camera.extrinsics
                    ))
                    .log());
                }
                Some(_) => {}
            }
        }
        found.ok_or_else(|| {
            CoreError::InvalidInput(format!("intrinsics {icam_intrinsics} is never observed")).log()
        })
    }

    /// [`Self::extrinsics_for_intrinsics`] for every intrinsics index
    pub fn extrinsics_by_intrinsics(
        &self,
        n_cameras_intrinsics: usize,
        n_cameras_extrinsics: usize,
    ) -> CoreResult<Vec<Option<usize>>> {
        (0..n_cameras_intrinsics)
            .map(|icam| {
                self.extrinsics_for_intrinsics(icam, n_cameras_intrinsics, n_cameras_extrinsics)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outlier_marking_keeps_magnitude() {
        let mut px = ObservedPixel::new(1.0, 2.0, 0.5);
        assert!(!px.is_outlier());
        px.mark_outlier();
        assert!(px.is_outlier());
        assert_eq!(px.weight, -0.5);

        let mut zero = ObservedPixel::new(0.0, 0.0, 0.0);
        zero.mark_outlier();
        assert!(zero.is_outlier());
    }

    #[test]
    fn test_extrinsics_for_each_intrinsics() -> Result<(), Box<dyn std::error::Error>> {
        let px = ObservedPixel::new(0.0, 0.0, 1.0);
        let mut observations = Observations::new();
        observations.add_board(CameraIndex::reference(0), 0, &[px]);
        observations.add_board(CameraIndex::new(1, Some(0)), 0, &[px]);
        observations.add_point(CameraIndex::new(2, Some(1)), 0, px);
        observations.add_triangulated_set(&[
            (CameraIndex::new(1, Some(0)), px),
            (CameraIndex::new(2, Some(1)), px),
        ]);

        assert_eq!(
            observations.extrinsics_by_intrinsics(3, 2)?,
            vec![None, Some(0), Some(1)]
        );
        assert_eq!(observations.extrinsics_for_intrinsics(2, 3, 2)?, Some(1));
        assert!(matches!(
            observations.extrinsics_for_intrinsics(3, 3, 2),
            Err(CoreError::IndexOutOfRange(_))
        ));
        assert!(observations.extrinsics_for_intrinsics(0, 3, 5).is_err());
        assert!(observations.extrinsics_for_intrinsics(3, 4, 3).is_err());

        // The same lens seen from two places is a moving camera
        observations.add_point(CameraIndex::new(1, Some(1)), 0, px);
        assert!(matches!(
            observations.extrinsics_for_intrinsics(1, 3, 2),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(observations.extrinsics_by_intrinsics(3, 2).is_err());
        Ok(())
    }

    #[test]
    fn test_triangulated_sets() {
        let px = ObservedPixel::new(0.0, 0.0, 1.0);
        let mut observations = Observations::new();
        observations.add_triangulated_set(&[
            (CameraIndex::reference(0), px),
            (CameraIndex::new(1, Some(0)), px),
        ]);
        observations.add_triangulated_set(&[
            (CameraIndex::reference(0), px),
            (CameraIndex::new(1, Some(0)), px),
            (CameraIndex::new(2, Some(1)), px),
        ]);
        assert_eq!(observations.triangulated_sets(), vec![0..2, 2..5]);

        observations.triangulated[4].last_in_set = false;
        assert_eq!(observations.triangulated_sets(), vec![0..2, 2..5]);
    }
}
