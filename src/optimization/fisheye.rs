//! Single-camera fisheye calibration.
//!
//! [`FisheyeOptimizationCost`] holds the target views and a
//! [`ParameterBlock`] with the camera intrinsics and one pose per view. The
//! refinement is a damped Gauss-Newton iteration over all free parameters;
//! the damping starts at `0.4` and approaches a full step as the iterations
//! proceed.

use log::{debug, info};
use serde::Serialize;

use crate::camera::{validation, CameraModel, FisheyeModel, Intrinsics, Resolution};
use crate::geometry::ViewPose;
use crate::optimization::extrinsics::calibrate_extrinsics;
use crate::optimization::uncertainty::{estimate_uncertainties, Uncertainty};
use crate::optimization::{
    validate_views, CalibrationError, CalibrationFlags, CalibrationView, EstimateMask,
    LinearSystem, Optimizer, ParameterBlock, ParameterLayout, TermCriteria, TerminationStatus,
};

/// Share of the Gauss-Newton step taken on the first iteration. Iteration
/// `i` takes `1 - (1 - SMOOTHING)^(i + 1)` of the step.
const SMOOTHING: f64 = 0.4;

/// Outcome of a single-camera calibration.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationResult {
    pub camera: FisheyeModel,
    /// Target pose of every view, in input order.
    pub poses: Vec<ViewPose>,
    pub rms: f64,
    pub iterations: usize,
    pub status: TerminationStatus,
    /// RMS before the first step and after every iteration.
    pub rms_history: Vec<f64>,
    pub uncertainty: Uncertainty,
}

/// Stacks the Jacobian and residuals of every view of a mono problem.
pub(crate) fn assemble_mono(
    views: &[CalibrationView],
    block: &ParameterBlock,
    resolution: Resolution,
) -> LinearSystem {
    let layout = block.layout();
    let camera = block.camera(0, resolution);
    let rows = 2 * views.iter().map(CalibrationView::len).sum::<usize>();
    let mut system = LinearSystem::zeros(rows, layout.free_count(), views.len());
    let intrinsics_offset = layout.intrinsics_offset(0);

    let mut row = 0;
    for (v, view) in views.iter().enumerate() {
        let pose = block.pose(v);
        let pose_offset = layout.view_offset(v);
        let start = row;
        for (object, observed) in view
            .object_points
            .column_iter()
            .zip(view.image_points.column_iter())
        {
            let projection = camera.project_point_with_jacobian(&object.into_owned(), &pose);
            system
                .residuals
                .rows_mut(row, 2)
                .copy_from(&(observed - projection.pixel));
            system.scatter(row, &projection.d_intrinsics, intrinsics_offset, layout);
            system.scatter(row, &projection.d_pose, pose_offset, layout);
            row += 2;
        }
        system.view_rows.push((start, row - start));
    }
    system
}

/// Cost function and solver state for calibrating one [`FisheyeModel`].
#[derive(Debug, Clone)]
pub struct FisheyeOptimizationCost {
    model: FisheyeModel,
    views: Vec<CalibrationView>,
    flags: CalibrationFlags,
    criteria: TermCriteria,
    block: ParameterBlock,
    /// Poses used instead of the homography seeds when the caller opts out
    /// of extrinsic recomputation.
    seed_poses: Option<Vec<ViewPose>>,
    initialized: bool,
    iterations: usize,
    status: TerminationStatus,
    rms_history: Vec<f64>,
}

impl FisheyeOptimizationCost {
    /// Creates the solver state.
    ///
    /// With [`CalibrationFlags::use_intrinsic_guess`], `guess` is the starting
    /// camera and is required; otherwise the starting camera is derived from
    /// `resolution` and `guess` is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error for empty or inconsistent views, unbounded
    /// criteria, or a missing or invalid guess.
    pub fn new(
        views: Vec<CalibrationView>,
        resolution: Resolution,
        guess: Option<&FisheyeModel>,
        flags: CalibrationFlags,
        criteria: TermCriteria,
    ) -> Result<Self, CalibrationError> {
        validate_views(&views)?;
        criteria.validate()?;
        validation::validate_resolution(&resolution)?;

        let model = if flags.use_intrinsic_guess {
            let guess = guess.ok_or_else(|| {
                CalibrationError::MissingGuess(
                    "use_intrinsic_guess is set but no camera was given".to_string(),
                )
            })?;
            let model = FisheyeModel {
                resolution,
                ..guess.clone()
            };
            model.validate_params()?;
            model
        } else {
            FisheyeModel::initial_guess(resolution)
        };

        let layout = ParameterLayout::mono(&EstimateMask::from_flags(&flags), views.len());
        Ok(FisheyeOptimizationCost {
            model,
            views,
            flags,
            criteria,
            block: ParameterBlock::new(layout),
            seed_poses: None,
            initialized: false,
            iterations: 0,
            status: TerminationStatus::MaxIterationsReached,
            rms_history: Vec::new(),
        })
    }

    /// Supplies one pose per view to start from. They are only used when the
    /// intrinsics come from a guess and `recompute_extrinsic` is off.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::InputMismatch`] if the count differs from
    /// the number of views.
    pub fn with_initial_poses(mut self, poses: Vec<ViewPose>) -> Result<Self, CalibrationError> {
        if poses.len() != self.views.len() {
            return Err(CalibrationError::InputMismatch {
                view: poses.len().min(self.views.len()),
                object_points: self.views.len(),
                image_points: poses.len(),
            });
        }
        self.seed_poses = Some(poses);
        Ok(self)
    }

    pub fn model(&self) -> &FisheyeModel {
        &self.model
    }

    pub fn block(&self) -> &ParameterBlock {
        &self.block
    }

    pub fn poses(&self) -> Vec<ViewPose> {
        self.block.poses()
    }

    pub fn status(&self) -> TerminationStatus {
        self.status
    }

    pub fn rms_history(&self) -> &[f64] {
        &self.rms_history
    }

    /// Current RMS reprojection error over all views.
    pub fn rms(&self) -> f64 {
        assemble_mono(&self.views, &self.block, self.model.resolution).rms()
    }

    /// Packs the solver state into a [`CalibrationResult`].
    ///
    /// # Errors
    ///
    /// With `check_cond`, fails if a view is ill-conditioned at the solution.
    pub fn into_result(self) -> Result<CalibrationResult, CalibrationError> {
        let uncertainty = estimate_uncertainties(
            &self.views,
            &self.block,
            self.model.resolution,
            self.flags.check_cond,
        )?;
        Ok(CalibrationResult {
            poses: self.block.poses(),
            rms: uncertainty.rms,
            iterations: self.iterations,
            status: self.status,
            rms_history: self.rms_history,
            uncertainty,
            camera: self.model,
        })
    }

    fn sync_model(&mut self) {
        self.model = self.block.camera(0, self.model.resolution);
    }
}

impl Optimizer for FisheyeOptimizationCost {
    /// Refines intrinsics, distortion and poses of all views together.
    ///
    /// Runs [`Optimizer::linear_estimation`] first if it has not been called.
    /// Each iteration solves the normal equations of the stacked system and
    /// takes a damped step. With `recompute_extrinsic` the poses are instead
    /// re-estimated from the updated camera after every step.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::IllConditioned`] - `check_cond` is set and a
    ///   view's pose block degenerates.
    /// * [`CalibrationError::Diverged`] - the parameters stop being finite or
    ///   the camera becomes invalid.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if !self.initialized {
            self.linear_estimation()?;
        }
        let resolution = self.model.resolution;
        let layout = self.block.layout().clone();

        self.rms_history = vec![self.rms()];
        if verbose {
            info!(
                "Starting fisheye calibration: {} views, {} free parameters",
                self.views.len(),
                layout.free_count()
            );
            info!("Initial model: {:?}", self.model);
            info!("Initial RMS: {:.6} px", self.rms_history[0]);
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

            let system = assemble_mono(&self.views, &self.block, resolution);
            if self.flags.check_cond {
                system.check_conditioning(&layout)?;
            }
            let step = system.solve()?;

            let previous = self.block.intrinsic_values();
            let scale = 1.0 - (1.0 - SMOOTHING).powi(iteration as i32 + 1);
            self.block
                .apply_step(&step, scale, !self.flags.recompute_extrinsic);
            if !self.block.is_finite() {
                return Err(CalibrationError::Diverged(format!(
                    "non-finite parameters after iteration {iteration}"
                )));
            }
            self.sync_model();
            self.model
                .validate_params()
                .map_err(|e| CalibrationError::Diverged(e.to_string()))?;

            if self.flags.recompute_extrinsic {
                let poses = calibrate_extrinsics(&self.views, &self.model, self.flags.check_cond)?;
                for (v, pose) in poses.iter().enumerate() {
                    self.block.set_pose(v, pose);
                }
            }

            let current = self.block.intrinsic_values();
            change = (&current - &previous).norm() / current.norm();
            iteration += 1;

            let rms = self.rms();
            self.rms_history.push(rms);
            debug!("Iteration {iteration}: rms {rms:.8} px, change {change:e}");
        };
        self.iterations = iteration;

        if verbose {
            info!(
                "Fisheye calibration finished after {} iterations ({:?})",
                self.iterations, self.status
            );
            info!("Optimized model: {:?}", self.model);
            if let Some(rms) = self.rms_history.last() {
                info!("Final RMS: {rms:.6} px");
            }
        }
        Ok(())
    }

    /// Seeds the parameter block: the starting camera chosen in
    /// [`FisheyeOptimizationCost::new`] and one pose per view, either the
    /// caller's seeds or a homography estimate refined with the camera fixed.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized,
    {
        self.block.set_camera(0, &self.model);

        let use_seeds = self.flags.use_intrinsic_guess && !self.flags.recompute_extrinsic;
        let poses = match (&self.seed_poses, use_seeds) {
            (Some(seeds), true) => seeds.clone(),
            _ => calibrate_extrinsics(&self.views, &self.model, self.flags.check_cond)?,
        };
        for (v, pose) in poses.iter().enumerate() {
            self.block.set_pose(v, pose);
        }
        self.initialized = true;
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.model.get_intrinsics()
    }

    fn get_resolution(&self) -> Resolution {
        self.model.get_resolution()
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.model.get_distortion()
    }
}

/// Calibrates a fisheye camera from views of a known target.
///
/// # Arguments
///
/// * `views` - Target points and their observed pixels, one entry per image.
/// * `resolution` - Size of the calibrated images.
/// * `guess` - Starting camera, required with `use_intrinsic_guess`.
/// * `flags` - Which parameters to estimate, see [`CalibrationFlags`].
/// * `criteria` - Iteration and convergence bounds of the refinement.
///
/// # Errors
///
/// See [`FisheyeOptimizationCost::new`] and [`Optimizer::optimize`].
pub fn calibrate(
    views: &[CalibrationView],
    resolution: Resolution,
    guess: Option<&FisheyeModel>,
    flags: CalibrationFlags,
    criteria: TermCriteria,
) -> Result<CalibrationResult, CalibrationError> {
    let mut cost = FisheyeOptimizationCost::new(views.to_vec(), resolution, guess, flags, criteria)?;
    cost.linear_estimation()?;
    cost.optimize(false)?;
    cost.into_result()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::fisheye::tests::sample_fisheye_model;
    use crate::geometry::{orbit_poses, planar_grid};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3xX, Vector3};

    /// Noise-free views of an 8x6 target seen by `camera` from `count` poses.
    pub(crate) fn synthetic_views(camera: &FisheyeModel, count: usize) -> Vec<CalibrationView> {
        let grid = planar_grid(8, 6, 0.05);
        orbit_poses(count, 0.6)
            .iter()
            .map(|pose| CalibrationView::new(grid.clone(), camera.project_points(&grid, pose)))
            .collect()
    }

    fn assert_camera_eq(estimated: &FisheyeModel, truth: &FisheyeModel, eps: f64) {
        let estimated = estimated.parameters();
        for (i, (e, t)) in estimated.iter().zip(truth.parameters().iter()).enumerate() {
            assert!((e - t).abs() < eps, "parameter {i}: {e} vs {t}");
        }
    }

    #[test]
    fn test_calibrate_recovers_camera_from_scratch() {
        let truth = sample_fisheye_model();
        let views = synthetic_views(&truth, 12);

        let result = calibrate(
            &views,
            truth.resolution,
            None,
            CalibrationFlags::default(),
            TermCriteria::new(40, 1e-15),
        )
        .unwrap();

        assert_camera_eq(&result.camera, &truth, 1e-10);
        assert!(result.rms < 1e-8, "rms {}", result.rms);
        assert_eq!(result.poses.len(), 12);
        for (pose, expected) in result.poses.iter().zip(orbit_poses(12, 0.6).iter()) {
            assert_relative_eq!(pose.rotation, expected.rotation, epsilon = 1e-8);
            assert_relative_eq!(pose.translation, expected.translation, epsilon = 1e-8);
        }
        assert_eq!(result.rms_history.len(), result.iterations + 1);
    }

    #[test]
    fn test_iteration_limit_is_not_an_error() {
        let truth = sample_fisheye_model();
        let views = synthetic_views(&truth, 10);
        let flags = CalibrationFlags {
            check_cond: true,
            ..CalibrationFlags::default()
        };

        let result = calibrate(&views, truth.resolution, None, flags, TermCriteria::new(3, 1e-15))
            .unwrap();
        assert_eq!(result.status, TerminationStatus::MaxIterationsReached);
        assert_eq!(result.iterations, 3);
        assert_eq!(result.rms_history.len(), 4);
        assert!(result.rms.is_finite());
        assert!(result.camera.validate_params().is_ok());
    }

    #[test]
    fn test_rms_is_non_increasing() {
        let truth = sample_fisheye_model();
        let views = synthetic_views(&truth, 10);
        let mut guess = truth.clone();
        guess.intrinsics.fx *= 1.01;
        guess.intrinsics.fy *= 0.99;
        guess.intrinsics.cx += 3.0;
        guess.intrinsics.cy -= 2.0;
        guess.distortions = [0.0; 4];

        let flags = CalibrationFlags {
            use_intrinsic_guess: true,
            ..CalibrationFlags::default()
        };
        let result = calibrate(&views, truth.resolution, Some(&guess), flags, TermCriteria::new(15, 1e-14))
            .unwrap();

        assert!(result.rms_history[0] > 0.1);
        for pair in result.rms_history.windows(2) {
            assert!(pair[1] <= pair[0] * (1.0 + 1e-9) + 1e-9, "{pair:?}");
        }
        assert_camera_eq(&result.camera, &truth, 1e-6);
    }

    #[test]
    fn test_views_with_different_point_counts() {
        let truth = sample_fisheye_model();
        let grid = planar_grid(8, 6, 0.05);
        let poses = orbit_poses(8, 0.6);
        let views: Vec<_> = poses
            .iter()
            .enumerate()
            .map(|(v, pose)| {
                let count = if v % 2 == 0 { 10 } else { 48 };
                let points = grid.columns(0, count).into_owned();
                CalibrationView::new(points.clone(), truth.project_points(&points, pose))
            })
            .collect();

        let flags = CalibrationFlags {
            use_intrinsic_guess: true,
            ..CalibrationFlags::default()
        };
        let result = calibrate(&views, truth.resolution, Some(&truth), flags, TermCriteria::default())
            .unwrap();
        assert!(result.rms < 1e-6);
        assert_camera_eq(&result.camera, &truth, 1e-5);
    }

    #[test]
    fn test_fixed_parameters_stay_put() {
        let truth = sample_fisheye_model();
        let views = synthetic_views(&truth, 10);
        let mut guess = truth.clone();
        guess.distortions[3] = 0.0;
        guess.intrinsics.fx += 5.0;

        let flags = CalibrationFlags {
            use_intrinsic_guess: true,
            fix_k: [false, false, false, true],
            ..CalibrationFlags::default()
        };
        let result = calibrate(&views, truth.resolution, Some(&guess), flags, TermCriteria::default())
            .unwrap();
        assert_eq!(result.camera.distortions[3], 0.0);
        assert_eq!(result.camera.skew, 0.0);
        assert_eq!(result.uncertainty.intrinsic_errors(0)[8], 0.0);
        // The remaining coefficients absorb the missing term.
        assert!(result.rms < 0.5, "rms {}", result.rms);
    }

    #[test]
    fn test_recompute_extrinsic() {
        let truth = sample_fisheye_model();
        let views = synthetic_views(&truth, 10);
        let mut guess = truth.clone();
        guess.intrinsics.fx *= 1.02;
        guess.intrinsics.fy *= 1.02;

        let flags = CalibrationFlags {
            use_intrinsic_guess: true,
            recompute_extrinsic: true,
            check_cond: true,
            ..CalibrationFlags::default()
        };
        let result = calibrate(&views, truth.resolution, Some(&guess), flags, TermCriteria::new(30, 1e-12))
            .unwrap();
        assert_camera_eq(&result.camera, &truth, 1e-4);
        assert!(!result.uncertainty.ill_conditioned);
    }

    #[test]
    fn test_seed_poses_are_used() {
        let truth = sample_fisheye_model();
        let views = synthetic_views(&truth, 6);
        let flags = CalibrationFlags {
            use_intrinsic_guess: true,
            ..CalibrationFlags::default()
        };
        let mut cost = FisheyeOptimizationCost::new(
            views.clone(),
            truth.resolution,
            Some(&truth),
            flags,
            TermCriteria::default(),
        )
        .unwrap()
        .with_initial_poses(orbit_poses(6, 0.6))
        .unwrap();
        cost.linear_estimation().unwrap();
        assert_eq!(cost.poses(), orbit_poses(6, 0.6));
        assert!(cost.rms() < 1e-9);

        // With nothing to correct, the first step already converges.
        cost.optimize(false).unwrap();
        assert_eq!(cost.status(), TerminationStatus::Converged);

        let wrong_count = FisheyeOptimizationCost::new(
            views,
            truth.resolution,
            Some(&truth),
            flags,
            TermCriteria::default(),
        )
        .unwrap()
        .with_initial_poses(orbit_poses(2, 0.6));
        assert!(matches!(wrong_count, Err(CalibrationError::InputMismatch { .. })));
    }

    #[test]
    fn test_missing_guess() {
        let truth = sample_fisheye_model();
        let views = synthetic_views(&truth, 3);
        let flags = CalibrationFlags {
            use_intrinsic_guess: true,
            ..CalibrationFlags::default()
        };
        let result = calibrate(&views, truth.resolution, None, flags, TermCriteria::default());
        assert!(matches!(result, Err(CalibrationError::MissingGuess(_))));
    }

    #[test]
    fn test_degenerate_view_fails_condition_check() {
        let truth = sample_fisheye_model();
        let mut views = synthetic_views(&truth, 6);
        let line = Matrix3xX::from_fn(10, |row, col| if row == 0 { col as f64 * 0.04 } else { 0.0 });
        let pose = ViewPose::new(Vector3::new(0.1, 0.2, 0.0), Vector3::new(-0.1, 0.05, 0.6));
        views.push(CalibrationView::new(line.clone(), truth.project_points(&line, &pose)));

        let flags = CalibrationFlags {
            check_cond: true,
            ..CalibrationFlags::default()
        };
        let result = calibrate(&views, truth.resolution, None, flags, TermCriteria::default());
        match result {
            Err(CalibrationError::IllConditioned { view, .. }) => assert_eq!(view, 6),
            other => panic!("expected an ill-conditioned view, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        let truth = sample_fisheye_model();
        assert!(matches!(
            calibrate(&[], truth.resolution, None, CalibrationFlags::default(), TermCriteria::default()),
            Err(CalibrationError::NoViews)
        ));

        let views = synthetic_views(&truth, 2);
        let unbounded = TermCriteria {
            max_iterations: None,
            min_change: None,
        };
        assert!(matches!(
            calibrate(&views, truth.resolution, None, CalibrationFlags::default(), unbounded),
            Err(CalibrationError::InvalidCriteria)
        ));
    }
}
