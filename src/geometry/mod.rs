//! Rigid-body poses and calibration-target geometry.

pub mod rotation;

pub use rotation::{rodrigues, rodrigues_with_jacobian, rotation_to_vector};

use nalgebra::{Matrix3, Matrix3xX, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::camera::Resolution;

/// Pose of a calibration target relative to a camera.
///
/// A target point `X` maps to the camera frame as `R(rotation) * X + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewPose {
    /// Axis-angle rotation vector.
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for ViewPose {
    fn default() -> Self {
        Self::identity()
    }
}

impl ViewPose {
    pub fn new(rotation: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), Vector3::zeros())
    }

    pub fn from_matrix(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self::new(rotation_to_vector(rotation), translation)
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        rodrigues(&self.rotation)
    }

    /// Maps a target point into the camera frame.
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation_matrix() * point + self.translation
    }

    /// Composes `self` after `first`: the result maps `X` to `self(first(X))`.
    pub fn compose(&self, first: &ViewPose) -> ViewPose {
        let rotation = self.rotation_matrix();
        ViewPose::from_matrix(
            &(rotation * first.rotation_matrix()),
            rotation * first.translation + self.translation,
        )
    }
}

/// Component-wise median of a set of vectors.
///
/// For an even count the upper of the two middle elements is taken.
/// Returns `None` for an empty input.
pub fn median_vector(vectors: &[Vector3<f64>]) -> Option<Vector3<f64>> {
    if vectors.is_empty() {
        return None;
    }
    let mut median = Vector3::zeros();
    for axis in 0..3 {
        let mut values: Vec<f64> = vectors.iter().map(|v| v[axis]).collect();
        values.sort_by(f64::total_cmp);
        median[axis] = values[values.len() / 2];
    }
    Some(median)
}

/// Generates a planar grid of target points on `z = 0`, centred on the origin.
///
/// # Arguments
///
/// * `cols` - Number of points along x.
/// * `rows` - Number of points along y.
/// * `spacing` - Distance between neighbouring points.
pub fn planar_grid(cols: usize, rows: usize, spacing: f64) -> Matrix3xX<f64> {
    let x0 = (cols.saturating_sub(1)) as f64 * spacing * 0.5;
    let y0 = (rows.saturating_sub(1)) as f64 * spacing * 0.5;
    let mut points = Matrix3xX::zeros(cols * rows);
    for row in 0..rows {
        for col in 0..cols {
            points.set_column(
                row * cols + col,
                &Vector3::new(col as f64 * spacing - x0, row as f64 * spacing - y0, 0.0),
            );
        }
    }
    points
}

/// Generates `count` target poses looking at the target from roughly
/// `distance` away, with tilts and lateral offsets that vary from view to view.
pub fn orbit_poses(count: usize, distance: f64) -> Vec<ViewPose> {
    (0..count)
        .map(|i| {
            let phase = std::f64::consts::TAU * i as f64 / count.max(1) as f64;
            let rotation = Vector3::new(
                0.45 * phase.sin(),
                0.45 * phase.cos(),
                0.2 * (2.0 * phase).sin(),
            );
            let translation = Vector3::new(
                0.3 * (1.3 * phase + 0.4).cos(),
                0.18 * (0.7 * phase + 1.1).sin(),
                distance * (1.0 + 0.25 * (2.0 * phase).cos()),
            );
            ViewPose::new(rotation, translation)
        })
        .collect()
}

/// Generate a `cols x rows` grid of pixel positions covering the image,
/// shrunk towards the image centre by `scale`.
pub fn image_grid(resolution: &Resolution, cols: usize, rows: usize, scale: f64) -> Vec<Vector2<f64>> {
    let width = resolution.width as f64;
    let height = resolution.height as f64;
    let centre = Vector2::new(width * 0.5, height * 0.5);
    let step_x = width / cols.saturating_sub(1).max(1) as f64;
    let step_y = height / rows.saturating_sub(1).max(1) as f64;

    let mut points = Vec::with_capacity(cols * rows);
    for row in 0..rows {
        for col in 0..cols {
            let pixel = Vector2::new(col as f64 * step_x, row as f64 * step_y);
            points.push(centre + (pixel - centre) * scale);
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_planar_grid_is_centred() {
        let grid = planar_grid(4, 3, 0.1);
        assert_eq!(grid.ncols(), 12);
        let mean = grid.column_mean();
        assert_relative_eq!(mean, Vector3::zeros(), epsilon = 1e-12);
        assert!(grid.row(2).iter().all(|z| *z == 0.0));
        assert_relative_eq!(grid[(0, 1)] - grid[(0, 0)], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_median_vector() {
        let vectors = vec![
            Vector3::new(1.0, 5.0, -1.0),
            Vector3::new(3.0, 4.0, -3.0),
            Vector3::new(2.0, 6.0, -2.0),
        ];
        assert_eq!(
            median_vector(&vectors),
            Some(Vector3::new(2.0, 5.0, -2.0))
        );
        assert_eq!(median_vector(&[]), None);
    }

    #[test]
    fn test_pose_compose() {
        let first = ViewPose::new(Vector3::new(0.1, -0.2, 0.3), Vector3::new(0.5, 0.0, 1.0));
        let second = ViewPose::new(Vector3::new(-0.3, 0.1, 0.05), Vector3::new(-0.1, 0.2, 0.0));
        let composed = second.compose(&first);
        let point = Vector3::new(0.2, -0.4, 0.3);
        assert_relative_eq!(
            composed.transform_point(&point),
            second.transform_point(&first.transform_point(&point)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_orbit_poses_stay_in_front() {
        let grid = planar_grid(8, 6, 0.05);
        for pose in orbit_poses(12, 0.6) {
            for point in grid.column_iter() {
                assert!(pose.transform_point(&point.into_owned()).z > 0.2);
            }
        }
    }

    #[test]
    fn test_image_grid_bounds() {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let points = image_grid(&resolution, 5, 4, 0.5);
        assert_eq!(points.len(), 20);
        for point in points {
            assert!(point.x >= 160.0 && point.x <= 480.0);
            assert!(point.y >= 120.0 && point.y <= 360.0);
        }
    }
}
