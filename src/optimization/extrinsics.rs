//! Per-view pose estimation with the camera held fixed.

use log::debug;
use nalgebra::{DMatrix, DVector, Vector3};

use crate::camera::FisheyeModel;
use crate::geometry::ViewPose;
use crate::optimization::homography::init_extrinsics;
use crate::optimization::params::POSE_COUNT;
use crate::optimization::{condition_number, CalibrationError, CalibrationView, CONDITION_THRESHOLD};

/// Iteration cap of the per-view Gauss-Newton refinement.
pub const EXTRINSIC_REFINE_ITERATIONS: usize = 20;

/// Relative pose change below which the refinement stops.
const EXTRINSIC_MIN_CHANGE: f64 = 1e-10;

/// Stacks the pose Jacobian (`2N x 6`) and the residuals
/// `observed - projected` (`2N`) of one view.
pub fn pose_jacobian(
    view: &CalibrationView,
    camera: &FisheyeModel,
    pose: &ViewPose,
) -> (DMatrix<f64>, DVector<f64>) {
    let n = view.len();
    let mut jacobian = DMatrix::zeros(2 * n, POSE_COUNT);
    let mut residuals = DVector::zeros(2 * n);
    for (i, (object, observed)) in view
        .object_points
        .column_iter()
        .zip(view.image_points.column_iter())
        .enumerate()
    {
        let projection = camera.project_point_with_jacobian(&object.into_owned(), pose);
        jacobian
            .view_mut((2 * i, 0), (2, POSE_COUNT))
            .copy_from(&projection.d_pose);
        residuals
            .rows_mut(2 * i, 2)
            .copy_from(&(observed - projection.pixel));
    }
    (jacobian, residuals)
}

/// Condition number of the pose Jacobian of one view.
pub fn pose_condition(view: &CalibrationView, camera: &FisheyeModel, pose: &ViewPose) -> f64 {
    condition_number(&pose_jacobian(view, camera, pose).0)
}

/// Refines the pose of one view by Gauss-Newton on its reprojection error.
///
/// Stops after `max_iterations`, once the relative change of the pose
/// falls below `1e-10`, or as soon as the pose Jacobian becomes
/// ill-conditioned.
pub fn refine_extrinsics(
    view: &CalibrationView,
    camera: &FisheyeModel,
    initial: &ViewPose,
    max_iterations: usize,
) -> ViewPose {
    let mut pose = *initial;
    let mut change = 1.0;
    let mut iteration = 0;

    while change > EXTRINSIC_MIN_CHANGE && iteration < max_iterations {
        let (jacobian, residuals) = pose_jacobian(view, camera, &pose);
        let condition = condition_number(&jacobian);
        if condition > CONDITION_THRESHOLD {
            debug!("Pose refinement stopped: condition number {condition:e}");
            break;
        }

        let svd = jacobian.svd(true, true);
        let Ok(step) = svd.solve(&residuals, f64::EPSILON) else {
            break;
        };

        let updated = ViewPose::new(
            pose.rotation + Vector3::new(step[0], step[1], step[2]),
            pose.translation + Vector3::new(step[3], step[4], step[5]),
        );
        let updated_norm = updated.rotation.norm_squared() + updated.translation.norm_squared();
        change = step.norm() / updated_norm.sqrt();
        pose = updated;
        iteration += 1;
    }

    pose
}

/// Estimates one pose per view: homography initialization followed by
/// Gauss-Newton refinement.
///
/// # Errors
///
/// With `check_cond`, returns [`CalibrationError::IllConditioned`] for the
/// first view whose final pose Jacobian has a condition number above
/// [`CONDITION_THRESHOLD`].
pub fn calibrate_extrinsics(
    views: &[CalibrationView],
    camera: &FisheyeModel,
    check_cond: bool,
) -> Result<Vec<ViewPose>, CalibrationError> {
    views
        .iter()
        .enumerate()
        .map(|(index, view)| {
            let initial = init_extrinsics(view, camera);
            let pose = refine_extrinsics(view, camera, &initial, EXTRINSIC_REFINE_ITERATIONS);
            if check_cond {
                let condition = pose_condition(view, camera, &pose);
                if condition > CONDITION_THRESHOLD {
                    return Err(CalibrationError::IllConditioned {
                        view: index,
                        condition,
                    });
                }
            }
            Ok(pose)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::fisheye::tests::sample_fisheye_model;
    use crate::geometry::{orbit_poses, planar_grid};
    use approx::assert_relative_eq;
    use nalgebra::Matrix3xX;

    #[test]
    fn test_refine_extrinsics_from_perturbed_pose() {
        let camera = sample_fisheye_model();
        let grid = planar_grid(8, 6, 0.05);
        let truth = orbit_poses(5, 0.6)[2];
        let view = CalibrationView::new(grid.clone(), camera.project_points(&grid, &truth));

        let start = ViewPose::new(
            truth.rotation + Vector3::new(0.02, -0.03, 0.01),
            truth.translation + Vector3::new(0.01, 0.02, -0.03),
        );
        let refined = refine_extrinsics(&view, &camera, &start, EXTRINSIC_REFINE_ITERATIONS);
        assert_relative_eq!(refined.rotation, truth.rotation, epsilon = 1e-9);
        assert_relative_eq!(refined.translation, truth.translation, epsilon = 1e-9);
    }

    #[test]
    fn test_calibrate_extrinsics_all_views() {
        let camera = sample_fisheye_model();
        let grid = planar_grid(8, 6, 0.05);
        let poses = orbit_poses(8, 0.6);
        let views: Vec<_> = poses
            .iter()
            .map(|pose| CalibrationView::new(grid.clone(), camera.project_points(&grid, pose)))
            .collect();

        let estimated = calibrate_extrinsics(&views, &camera, true).unwrap();
        for (estimated, truth) in estimated.iter().zip(poses.iter()) {
            assert_relative_eq!(estimated.rotation, truth.rotation, epsilon = 1e-9);
            assert_relative_eq!(estimated.translation, truth.translation, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_collinear_view_is_ill_conditioned() {
        let camera = sample_fisheye_model();
        let pose = ViewPose::new(Vector3::new(0.1, 0.2, 0.0), Vector3::new(-0.1, 0.05, 0.6));
        let line = Matrix3xX::from_fn(10, |row, col| if row == 0 { col as f64 * 0.04 } else { 0.0 });
        let grid = planar_grid(6, 5, 0.05);
        let views = vec![
            CalibrationView::new(grid.clone(), camera.project_points(&grid, &pose)),
            CalibrationView::new(line.clone(), camera.project_points(&line, &pose)),
        ];

        match calibrate_extrinsics(&views, &camera, true) {
            Err(CalibrationError::IllConditioned { view, condition }) => {
                assert_eq!(view, 1);
                assert!(condition > CONDITION_THRESHOLD);
            }
            other => panic!("expected an ill-conditioned view, got {other:?}"),
        }

        // Without the check the degenerate view passes through.
        assert!(calibrate_extrinsics(&views, &camera, false).is_ok());
    }
}
