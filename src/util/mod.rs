use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::camera::FisheyeModel;
use crate::geometry::ViewPose;
use crate::optimization::{CalibrationResult, CalibrationView, StereoCalibrationResult};

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Zero projection points")]
    ZeroProjectionPoints,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Failed to serialize results: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Ensure the parent directory of `path` exists.
pub fn ensure_output_dir(path: &Path) -> Result<(), UtilError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| {
                UtilError::InvalidParams(format!("Failed to create output directory: {e}"))
            })?;
        }
    }
    Ok(())
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Summary statistics of per-point pixel errors.
    pub fn from_errors(errors: &[f64]) -> Result<Self, UtilError> {
        if errors.is_empty() {
            return Err(UtilError::ZeroProjectionPoints);
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Ok(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// Per-point reprojection errors of every view under its pose.
pub fn reprojection_errors(
    camera: &FisheyeModel,
    views: &[CalibrationView],
    poses: &[ViewPose],
) -> Result<Vec<f64>, UtilError> {
    if views.len() != poses.len() {
        return Err(UtilError::InvalidParams(format!(
            "{} views but {} poses",
            views.len(),
            poses.len()
        )));
    }
    Ok(views
        .iter()
        .zip(poses.iter())
        .flat_map(|(view, pose)| {
            let projected = camera.project_points(&view.object_points, pose);
            (projected - &view.image_points)
                .column_iter()
                .map(|c| c.norm())
                .collect::<Vec<_>>()
        })
        .collect())
}

/// Reprojection error statistics of a calibrated camera over its views.
pub fn compute_reprojection_error(
    camera: &FisheyeModel,
    views: &[CalibrationView],
    poses: &[ViewPose],
) -> Result<ProjectionError, UtilError> {
    ProjectionError::from_errors(&reprojection_errors(camera, views, poses)?)
}

/// Logs a calibration summary at `info` level.
pub fn display_calibration_results(result: &CalibrationResult) {
    let camera = &result.camera;
    let errors = result.uncertainty.intrinsic_errors(0);
    info!("Calibration finished after {} iterations ({:?})", result.iterations, result.status);
    info!(
        "  fx = {:.6} ± {:.6}, fy = {:.6} ± {:.6}",
        camera.intrinsics.fx, errors[0], camera.intrinsics.fy, errors[1]
    );
    info!(
        "  cx = {:.6} ± {:.6}, cy = {:.6} ± {:.6}",
        camera.intrinsics.cx, errors[2], camera.intrinsics.cy, errors[3]
    );
    info!("  alpha = {:.8} ± {:.8}", camera.skew, errors[4]);
    info!("  K = {}", camera.camera_matrix());
    for (i, k) in camera.distortions.iter().enumerate() {
        info!("  k{} = {:.8} ± {:.8}", i + 1, k, errors[5 + i]);
    }
    info!(
        "  rms = {:.6} px, pixel std = ({:.6}, {:.6})",
        result.rms, result.uncertainty.pixel_std.x, result.uncertainty.pixel_std.y
    );
    if result.uncertainty.ill_conditioned {
        info!(
            "  warning: worst view condition number {:e}",
            result.uncertainty.max_view_condition
        );
    }
}

/// Writes a result as pretty-printed JSON.
pub fn export_calibration_json<T: Serialize>(result: &T, path: &Path) -> Result<(), UtilError> {
    ensure_output_dir(path)?;
    let mut file = File::create(path)?;
    serde_json::to_writer_pretty(&mut file, result)?;
    writeln!(file)?;
    Ok(())
}

/// Writes a plain-text report of a stereo calibration.
pub fn export_stereo_report(result: &StereoCalibrationResult, path: &Path) -> Result<(), UtilError> {
    ensure_output_dir(path)?;
    let mut report = File::create(path)?;

    writeln!(report, "FISHEYE STEREO CALIBRATION REPORT")?;
    writeln!(report, "=================================")?;
    writeln!(report)?;
    writeln!(report, "Iterations: {} ({:?})", result.iterations, result.status)?;
    writeln!(report, "RMS: {:.6} px", result.rms)?;
    writeln!(report)?;
    writeln!(
        report,
        "{:<8} | {:>12} | {:>12} | {:>12} | {:>12}",
        "Camera", "fx", "fy", "cx", "cy"
    )?;
    writeln!(report, "{:-<8}-+-{:-<12}-+-{:-<12}-+-{:-<12}-+-{:-<12}", "", "", "", "", "")?;
    for (name, camera) in [("left", &result.left), ("right", &result.right)] {
        let i = &camera.intrinsics;
        writeln!(
            report,
            "{:<8} | {:>12.4} | {:>12.4} | {:>12.4} | {:>12.4}",
            name, i.fx, i.fy, i.cx, i.cy
        )?;
    }
    writeln!(report)?;
    writeln!(report, "Relative rotation: {:?}", result.relative.rotation.as_slice())?;
    writeln!(report, "Relative translation: {:?}", result.relative.translation.as_slice())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::fisheye::tests::sample_fisheye_model;
    use crate::geometry::{orbit_poses, planar_grid};
    use approx::assert_relative_eq;

    #[test]
    fn test_projection_error_statistics() {
        let stats = ProjectionError::from_errors(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.rmse, 7.5f64.sqrt());
        assert_relative_eq!(stats.stddev, 1.25f64.sqrt());
        assert_eq!((stats.min, stats.max), (1.0, 4.0));

        assert!(matches!(
            ProjectionError::from_errors(&[]),
            Err(UtilError::ZeroProjectionPoints)
        ));
    }

    #[test]
    fn test_compute_reprojection_error() {
        let camera = sample_fisheye_model();
        let grid = planar_grid(4, 3, 0.05);
        let poses = orbit_poses(3, 0.6);
        let mut views: Vec<_> = poses
            .iter()
            .map(|pose| CalibrationView::new(grid.clone(), camera.project_points(&grid, pose)))
            .collect();
        views[0].image_points[(0, 0)] += 3.0;

        let stats = compute_reprojection_error(&camera, &views, &poses).unwrap();
        assert_relative_eq!(stats.max, 3.0, epsilon = 1e-9);
        assert_relative_eq!(stats.mean, 3.0 / 36.0, epsilon = 1e-9);

        assert!(compute_reprojection_error(&camera, &views, &poses[..2]).is_err());
    }

    #[test]
    fn test_export_json() {
        let camera = sample_fisheye_model();
        let path = std::env::temp_dir().join("fisheye_calib_export").join("camera.json");
        export_calibration_json(&camera, &path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let restored: FisheyeModel = serde_json::from_str(&text).unwrap();
        assert_eq!(restored.resolution, camera.resolution);
        for (a, b) in restored.parameters().iter().zip(camera.parameters().iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        fs::remove_file(&path).ok();
    }
}
