//! Joint calibration of a rigidly coupled camera pair.
//!
//! Both cameras observe the same target in every view. The left camera's
//! view poses and one shared relative pose are estimated; a target point `X`
//! of view `i` is seen by the right camera at
//!
//! ```text
//! Y_r = R_rel * (R_i * X + T_i) + T_rel
//! ```
//!
//! so the relative pose maps left-camera coordinates to right-camera
//! coordinates.

use log::{debug, info};
use nalgebra::{Matrix2xX, Matrix3, Matrix3x6, Matrix3xX, SVector, Vector3};
use serde::Serialize;

use crate::camera::{validation, CameraModel, FisheyeModel, Intrinsics, Resolution};
use crate::geometry::{median_vector, rodrigues_with_jacobian, rotation_to_vector, ViewPose};
use crate::optimization::extrinsics::calibrate_extrinsics;
use crate::optimization::fisheye::calibrate;
use crate::optimization::params::POSE_COUNT;
use crate::optimization::uncertainty::{uncertainty_from_system, Uncertainty};
use crate::optimization::{
    check_view_sizes, CalibrationError, CalibrationFlags, CalibrationView, EstimateMask,
    LinearSystem, Optimizer, ParameterBlock, ParameterLayout, TermCriteria, TerminationStatus,
};

/// Largest residual component, in pixels, tolerated in any view.
pub const STEREO_PAIR_THRESHOLD: f64 = 50.0;

/// One stereo observation of the target.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoView {
    pub object_points: Matrix3xX<f64>,
    pub left_points: Matrix2xX<f64>,
    pub right_points: Matrix2xX<f64>,
}

impl StereoView {
    pub fn new(
        object_points: Matrix3xX<f64>,
        left_points: Matrix2xX<f64>,
        right_points: Matrix2xX<f64>,
    ) -> Self {
        StereoView {
            object_points,
            left_points,
            right_points,
        }
    }

    pub fn len(&self) -> usize {
        self.object_points.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn left(&self) -> CalibrationView {
        CalibrationView::new(self.object_points.clone(), self.left_points.clone())
    }

    pub fn right(&self) -> CalibrationView {
        CalibrationView::new(self.object_points.clone(), self.right_points.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StereoCalibrationResult {
    pub left: FisheyeModel,
    pub right: FisheyeModel,
    /// Maps left-camera coordinates to right-camera coordinates.
    pub relative: ViewPose,
    /// Target pose of every view in the left camera.
    pub poses: Vec<ViewPose>,
    pub rms: f64,
    pub iterations: usize,
    pub status: TerminationStatus,
    pub uncertainty: Uncertainty,
}

fn validate_stereo_views(views: &[StereoView]) -> Result<(), CalibrationError> {
    if views.is_empty() {
        return Err(CalibrationError::NoViews);
    }
    for (view, data) in views.iter().enumerate() {
        check_view_sizes(
            view,
            data.object_points.ncols(),
            &[data.left_points.ncols(), data.right_points.ncols()],
        )?;
    }
    Ok(())
}

/// Stacks left then right residuals of every view, with derivatives with
/// respect to both cameras, the relative pose and the left view poses.
pub(crate) fn assemble_stereo(
    views: &[StereoView],
    block: &ParameterBlock,
    resolution: Resolution,
) -> LinearSystem {
    let layout = block.layout();
    let left = block.camera(0, resolution);
    let right = block.camera(1, resolution);
    let relative = block.relative_pose().unwrap_or_default();
    let relative_offset = layout.relative_offset().unwrap_or(layout.len());
    let (r_rel, dr_rel) = rodrigues_with_jacobian(&relative.rotation);

    let rows = 4 * views.iter().map(StereoView::len).sum::<usize>();
    let mut system = LinearSystem::zeros(rows, layout.free_count(), views.len());

    let mut row = 0;
    for (v, view) in views.iter().enumerate() {
        let pose = block.pose(v);
        let pose_offset = layout.view_offset(v);
        let (r_left, dr_left) = rodrigues_with_jacobian(&pose.rotation);
        let start = row;

        for (object, observed) in view
            .object_points
            .column_iter()
            .zip(view.left_points.column_iter())
        {
            let projection = left.project_point_with_jacobian(&object.into_owned(), &pose);
            system
                .residuals
                .rows_mut(row, 2)
                .copy_from(&(observed - projection.pixel));
            system.scatter(row, &projection.d_intrinsics, layout.intrinsics_offset(0), layout);
            system.scatter(row, &projection.d_pose, pose_offset, layout);
            row += 2;
        }

        for (object, observed) in view
            .object_points
            .column_iter()
            .zip(view.right_points.column_iter())
        {
            let object: Vector3<f64> = object.into_owned();
            let y_left = r_left * object + pose.translation;
            let y_right = r_rel * y_left + relative.translation;
            let projection = right.project_camera_point_with_jacobian(&y_right);

            let mut d_relative = Matrix3x6::zeros();
            let mut d_pose = Matrix3x6::zeros();
            for i in 0..3 {
                d_relative.set_column(i, &(dr_rel[i] * y_left));
                d_pose.set_column(i, &(r_rel * dr_left[i] * object));
            }
            d_relative
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&Matrix3::identity());
            d_pose.fixed_view_mut::<3, 3>(0, 3).copy_from(&r_rel);

            system
                .residuals
                .rows_mut(row, 2)
                .copy_from(&(observed - projection.pixel));
            system.scatter(row, &projection.d_intrinsics, layout.intrinsics_offset(1), layout);
            system.scatter(row, &(projection.d_point * d_relative), relative_offset, layout);
            system.scatter(row, &(projection.d_point * d_pose), pose_offset, layout);
            row += 2;
        }
        system.view_rows.push((start, row - start));
    }
    system
}

/// Rejects the first view whose residuals exceed [`STEREO_PAIR_THRESHOLD`].
fn check_stereo_pairs(system: &LinearSystem) -> Result<(), CalibrationError> {
    for (view, &(start, count)) in system.view_rows.iter().enumerate() {
        let max_error = system.residuals.rows(start, count).amax();
        if max_error >= STEREO_PAIR_THRESHOLD {
            return Err(CalibrationError::BadStereoPair {
                view,
                max_error,
                threshold: STEREO_PAIR_THRESHOLD,
            });
        }
    }
    Ok(())
}

/// Relative pose of the right camera, as the component-wise median over
/// views of `R_r R_l^T` and `T_r - R_rel T_l`.
pub fn median_relative_pose(left: &[ViewPose], right: &[ViewPose]) -> ViewPose {
    let (rotations, translations): (Vec<_>, Vec<_>) = left
        .iter()
        .zip(right.iter())
        .map(|(l, r)| {
            let rotation = r.rotation_matrix() * l.rotation_matrix().transpose();
            (
                rotation_to_vector(&rotation),
                r.translation - rotation * l.translation,
            )
        })
        .unzip();
    ViewPose::new(
        median_vector(&rotations).unwrap_or_else(Vector3::zeros),
        median_vector(&translations).unwrap_or_else(Vector3::zeros),
    )
}

/// Solver state for a stereo calibration.
#[derive(Debug, Clone)]
pub struct StereoOptimizationCost {
    views: Vec<StereoView>,
    resolution: Resolution,
    left_guess: Option<FisheyeModel>,
    right_guess: Option<FisheyeModel>,
    flags: CalibrationFlags,
    criteria: TermCriteria,
    block: ParameterBlock,
    initialized: bool,
    iterations: usize,
    status: TerminationStatus,
}

impl StereoOptimizationCost {
    /// Creates the solver state.
    ///
    /// # Errors
    ///
    /// Returns an error for empty or inconsistent views, unbounded criteria,
    /// or, with `fix_intrinsic`, a missing camera.
    pub fn new(
        views: Vec<StereoView>,
        resolution: Resolution,
        left_guess: Option<&FisheyeModel>,
        right_guess: Option<&FisheyeModel>,
        flags: CalibrationFlags,
        criteria: TermCriteria,
    ) -> Result<Self, CalibrationError> {
        validate_stereo_views(&views)?;
        criteria.validate()?;
        validation::validate_resolution(&resolution)?;
        if flags.fix_intrinsic && (left_guess.is_none() || right_guess.is_none()) {
            return Err(CalibrationError::MissingGuess(
                "fix_intrinsic requires both cameras".to_string(),
            ));
        }

        let mask = EstimateMask::from_flags(&flags);
        let layout = ParameterLayout::stereo(&mask, &mask, views.len());
        Ok(StereoOptimizationCost {
            views,
            resolution,
            left_guess: left_guess.cloned(),
            right_guess: right_guess.cloned(),
            flags,
            criteria,
            block: ParameterBlock::new(layout),
            initialized: false,
            iterations: 0,
            status: TerminationStatus::MaxIterationsReached,
        })
    }

    pub fn left(&self) -> FisheyeModel {
        self.block.camera(0, self.resolution)
    }

    pub fn right(&self) -> FisheyeModel {
        self.block.camera(1, self.resolution)
    }

    pub fn relative_pose(&self) -> ViewPose {
        self.block.relative_pose().unwrap_or_default()
    }

    pub fn status(&self) -> TerminationStatus {
        self.status
    }

    /// Packs the solver state into a [`StereoCalibrationResult`].
    pub fn into_result(self) -> StereoCalibrationResult {
        let system = assemble_stereo(&self.views, &self.block, self.resolution);
        let uncertainty = uncertainty_from_system(&system, self.block.layout());
        StereoCalibrationResult {
            left: self.left(),
            right: self.right(),
            relative: self.relative_pose(),
            poses: self.block.poses(),
            rms: uncertainty.rms,
            iterations: self.iterations,
            status: self.status,
            uncertainty,
        }
    }

    /// Camera and view poses of one side, from a guess or a mono calibration.
    fn seed_camera(
        &self,
        views: &[CalibrationView],
        guess: Option<&FisheyeModel>,
    ) -> Result<(FisheyeModel, Vec<ViewPose>), CalibrationError> {
        match guess {
            Some(camera) if self.flags.fix_intrinsic => {
                let camera = FisheyeModel {
                    resolution: self.resolution,
                    ..camera.clone()
                };
                let poses = calibrate_extrinsics(views, &camera, self.flags.check_cond)?;
                Ok((camera, poses))
            }
            _ => {
                let flags = CalibrationFlags {
                    fix_intrinsic: false,
                    ..self.flags
                };
                let result = calibrate(views, self.resolution, guess, flags, TermCriteria::default())?;
                Ok((result.camera, result.poses))
            }
        }
    }
}

impl Optimizer for StereoOptimizationCost {
    /// Refines the relative pose, the left view poses and, unless
    /// `fix_intrinsic` is set, both cameras with full Gauss-Newton steps.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::BadStereoPair`] - a view's residual reaches
    ///   [`STEREO_PAIR_THRESHOLD`].
    /// * [`CalibrationError::IllConditioned`] - `check_cond` is set and a
    ///   view's pose block degenerates.
    /// * [`CalibrationError::Diverged`] - the parameters stop being finite.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if !self.initialized {
            self.linear_estimation()?;
        }
        let layout = self.block.layout().clone();
        if verbose {
            info!(
                "Starting stereo calibration: {} views, {} free parameters",
                self.views.len(),
                layout.free_count()
            );
            info!("Initial relative pose: {:?}", self.relative_pose());
        }

        let mut change: f64 = 1.0;
        let mut iteration = 0;
        self.status = loop {
            if self.criteria.converged(change) {
                break TerminationStatus::Converged;
            }
            if self.criteria.iterations_exhausted(iteration) {
                break TerminationStatus::MaxIterationsReached;
            }

            let system = assemble_stereo(&self.views, &self.block, self.resolution);
            check_stereo_pairs(&system)?;
            if self.flags.check_cond {
                system.check_conditioning(&layout)?;
            }
            let step = system.solve()?;

            let previous = pose_vector(&self.relative_pose());
            self.block.apply_step(&step, 1.0, true);
            if !self.block.is_finite() {
                return Err(CalibrationError::Diverged(format!(
                    "non-finite parameters after iteration {iteration}"
                )));
            }
            let current = pose_vector(&self.relative_pose());
            change = relative_change(&previous, &current);
            iteration += 1;
            debug!("Stereo iteration {iteration}: rms {:.8} px, change {change:e}", system.rms());
        };
        self.iterations = iteration;

        if verbose {
            info!(
                "Stereo calibration finished after {} iterations ({:?})",
                self.iterations, self.status
            );
            info!("Relative pose: {:?}", self.relative_pose());
        }
        Ok(())
    }

    /// Seeds both cameras, the left view poses and the relative pose.
    ///
    /// In joint mode each camera is first calibrated on its own; with
    /// `fix_intrinsic` the given cameras are kept and only their view poses
    /// are estimated.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized,
    {
        let left_views: Vec<_> = self.views.iter().map(StereoView::left).collect();
        let right_views: Vec<_> = self.views.iter().map(StereoView::right).collect();

        let (left, left_poses) = self.seed_camera(&left_views, self.left_guess.as_ref())?;
        let (right, right_poses) = self.seed_camera(&right_views, self.right_guess.as_ref())?;

        self.block.set_camera(0, &left);
        self.block.set_camera(1, &right);
        for (v, pose) in left_poses.iter().enumerate() {
            self.block.set_pose(v, pose);
        }
        self.block
            .set_relative_pose(&median_relative_pose(&left_poses, &right_poses));
        self.initialized = true;
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.left().get_intrinsics()
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.left().get_distortion()
    }
}

fn pose_vector(pose: &ViewPose) -> SVector<f64, POSE_COUNT> {
    let mut v = SVector::<f64, POSE_COUNT>::zeros();
    v.fixed_rows_mut::<3>(0).copy_from(&pose.rotation);
    v.fixed_rows_mut::<3>(3).copy_from(&pose.translation);
    v
}

/// Size of a relative pose update relative to the updated pose. Stays finite
/// when the pose is zero.
fn relative_change(
    previous: &SVector<f64, POSE_COUNT>,
    current: &SVector<f64, POSE_COUNT>,
) -> f64 {
    (current - previous).norm() / current.norm().max(f64::EPSILON)
}

/// Calibrates a stereo pair from views of a known target.
///
/// Without `fix_intrinsic`, both cameras are estimated, starting from the
/// guesses when `use_intrinsic_guess` is set. With `fix_intrinsic`, both
/// guesses are required and kept unchanged.
///
/// # Errors
///
/// See [`StereoOptimizationCost::new`] and [`Optimizer::optimize`].
pub fn stereo_calibrate(
    views: &[StereoView],
    resolution: Resolution,
    left_guess: Option<&FisheyeModel>,
    right_guess: Option<&FisheyeModel>,
    flags: CalibrationFlags,
    criteria: TermCriteria,
) -> Result<StereoCalibrationResult, CalibrationError> {
    let mut cost = StereoOptimizationCost::new(
        views.to_vec(),
        resolution,
        left_guess,
        right_guess,
        flags,
        criteria,
    )?;
    cost.linear_estimation()?;
    cost.optimize(false)?;
    Ok(cost.into_result())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::fisheye::tests::sample_fisheye_model;
    use crate::geometry::{orbit_poses, planar_grid};
    use approx::assert_relative_eq;

    struct Rig {
        left: FisheyeModel,
        right: FisheyeModel,
        relative: ViewPose,
        poses: Vec<ViewPose>,
        views: Vec<StereoView>,
    }

    fn stereo_rig(count: usize) -> Rig {
        let left = sample_fisheye_model();
        let mut right = left.clone();
        right.intrinsics.fx = 552.0;
        right.intrinsics.fy = 553.5;
        right.intrinsics.cx = 631.0;
        right.intrinsics.cy = 377.0;
        right.distortions = [0.002, -0.004, 0.005, -0.003];
        let relative = ViewPose::new(
            Vector3::new(0.01, -0.02, 0.005),
            Vector3::new(-0.1, 0.002, 0.001),
        );

        let grid = planar_grid(8, 6, 0.05);
        let poses = orbit_poses(count, 0.6);
        let views = poses
            .iter()
            .map(|pose| {
                StereoView::new(
                    grid.clone(),
                    left.project_points(&grid, pose),
                    right.project_points(&grid, &relative.compose(pose)),
                )
            })
            .collect();
        Rig {
            left,
            right,
            relative,
            poses,
            views,
        }
    }

    #[test]
    fn test_median_relative_pose() {
        let relative = ViewPose::new(Vector3::new(0.0, 0.1, 0.0), Vector3::new(-0.2, 0.0, 0.0));
        let left = orbit_poses(5, 0.6);
        let mut right: Vec<_> = left.iter().map(|pose| relative.compose(pose)).collect();
        // One corrupted view does not move the median.
        right[2].translation.x += 1.0;

        let estimated = median_relative_pose(&left, &right);
        assert_relative_eq!(estimated.rotation, relative.rotation, epsilon = 1e-12);
        assert_relative_eq!(estimated.translation, relative.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_relative_change_of_zero_pose() {
        let zero = SVector::<f64, POSE_COUNT>::zeros();
        let change = relative_change(&zero, &zero);
        assert_eq!(change, 0.0);
        let criteria = TermCriteria {
            max_iterations: None,
            min_change: Some(1e-10),
        };
        assert!(criteria.converged(change));

        let previous = pose_vector(&ViewPose::new(Vector3::zeros(), Vector3::new(-0.1, 0.0, 0.0)));
        let current = pose_vector(&ViewPose::new(Vector3::zeros(), Vector3::new(-0.2, 0.0, 0.0)));
        assert_relative_eq!(relative_change(&previous, &current), 0.5, epsilon = 1e-15);
    }

    #[test]
    fn test_fix_intrinsic_recovers_relative_pose() {
        let rig = stereo_rig(8);
        let flags = CalibrationFlags {
            fix_intrinsic: true,
            ..CalibrationFlags::default()
        };
        let result = stereo_calibrate(
            &rig.views,
            rig.left.resolution,
            Some(&rig.left),
            Some(&rig.right),
            flags,
            TermCriteria::stereo(),
        )
        .unwrap();

        assert_eq!(result.left, rig.left);
        assert_eq!(result.right, rig.right);
        assert_relative_eq!(result.relative.rotation, rig.relative.rotation, epsilon = 1e-9);
        assert_relative_eq!(result.relative.translation, rig.relative.translation, epsilon = 1e-9);
        for (pose, truth) in result.poses.iter().zip(rig.poses.iter()) {
            assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-9);
        }
        assert!(result.rms < 1e-8);
        assert_eq!(result.uncertainty.intrinsic_errors(1), [0.0; 9]);
    }

    #[test]
    fn test_joint_calibration_recovers_both_cameras() {
        let rig = stereo_rig(10);
        let result = stereo_calibrate(
            &rig.views,
            rig.left.resolution,
            None,
            None,
            CalibrationFlags::default(),
            TermCriteria::new(30, 1e-14),
        )
        .unwrap();

        for (estimated, truth) in [(&result.left, &rig.left), (&result.right, &rig.right)] {
            for (e, t) in estimated.parameters().iter().zip(truth.parameters().iter()) {
                assert!((e - t).abs() < 1e-5, "{e} vs {t}");
            }
        }
        assert_relative_eq!(result.relative.rotation, rig.relative.rotation, epsilon = 1e-8);
        assert_relative_eq!(result.relative.translation, rig.relative.translation, epsilon = 1e-8);
        assert!(result.rms < 1e-6);
    }

    #[test]
    fn test_stereo_iteration_limit_is_not_an_error() {
        let rig = stereo_rig(6);
        let criteria = TermCriteria {
            max_iterations: Some(2),
            min_change: None,
        };
        let result = stereo_calibrate(
            &rig.views,
            rig.left.resolution,
            None,
            None,
            CalibrationFlags::default(),
            criteria,
        )
        .unwrap();

        assert_eq!(result.status, TerminationStatus::MaxIterationsReached);
        assert_eq!(result.iterations, 2);
        assert!(result.rms.is_finite());
        assert_relative_eq!(result.relative.translation, rig.relative.translation, epsilon = 1e-3);
    }

    #[test]
    fn test_bad_stereo_pair_is_rejected() {
        let mut rig = stereo_rig(8);
        // Shift the right observations of one view far from the rig geometry.
        rig.views[3].right_points.row_mut(0).add_scalar_mut(80.0);

        let flags = CalibrationFlags {
            fix_intrinsic: true,
            ..CalibrationFlags::default()
        };
        let result = stereo_calibrate(
            &rig.views,
            rig.left.resolution,
            Some(&rig.left),
            Some(&rig.right),
            flags,
            TermCriteria::stereo(),
        );
        match result {
            Err(CalibrationError::BadStereoPair { view, max_error, .. }) => {
                assert_eq!(view, 3);
                assert!(max_error >= STEREO_PAIR_THRESHOLD);
            }
            other => panic!("expected a bad stereo pair, got {other:?}"),
        }
    }

    #[test]
    fn test_fix_intrinsic_requires_both_cameras() {
        let rig = stereo_rig(3);
        let flags = CalibrationFlags {
            fix_intrinsic: true,
            ..CalibrationFlags::default()
        };
        let result = stereo_calibrate(
            &rig.views,
            rig.left.resolution,
            Some(&rig.left),
            None,
            flags,
            TermCriteria::stereo(),
        );
        assert!(matches!(result, Err(CalibrationError::MissingGuess(_))));
    }

    #[test]
    fn test_mismatched_stereo_view() {
        let rig = stereo_rig(2);
        let mut views = rig.views.clone();
        views[1].right_points = views[1].right_points.columns(0, 20).into_owned();
        let result = stereo_calibrate(
            &views,
            rig.left.resolution,
            None,
            None,
            CalibrationFlags::default(),
            TermCriteria::stereo(),
        );
        assert!(matches!(
            result,
            Err(CalibrationError::InputMismatch {
                view: 1,
                image_points: 20,
                ..
            })
        ));
    }
}
