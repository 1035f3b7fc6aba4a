//! The `optimization` module calibrates fisheye cameras from target views.
//!
//! Calibration runs in two stages:
//! 1. A linear initialization: the intrinsics are seeded from the image size
//!    (or a caller-supplied guess) and every view pose is seeded from a
//!    plane-to-image homography, see [`homography`] and [`extrinsics`].
//! 2. A damped Gauss-Newton refinement of intrinsics, distortion and poses
//!    over all views at once, see [`fisheye`] for a single camera and
//!    [`stereo`] for a rigidly coupled pair.
//!
//! After the refinement [`uncertainty`] turns the final Jacobian into
//! standard errors for every estimated parameter.

use nalgebra::{DMatrix, DVector, Matrix2xX, Matrix3xX, SMatrix};
use serde::{Deserialize, Serialize};

pub mod extrinsics;
pub mod fisheye;
pub mod homography;
pub mod params;
pub mod stereo;
pub mod uncertainty;

pub use fisheye::{calibrate, CalibrationResult, FisheyeOptimizationCost};
pub use params::{EstimateMask, ParameterBlock, ParameterLayout};
pub use stereo::{stereo_calibrate, StereoCalibrationResult, StereoView};
pub use uncertainty::{estimate_uncertainties, Uncertainty};

use crate::camera::{CameraModelError, Intrinsics, Resolution};
use crate::optimization::params::POSE_COUNT;

/// Minimum number of correspondences per view.
pub const MIN_VIEW_POINTS: usize = 4;

/// Pose blocks with a larger condition number are rejected when
/// [`CalibrationFlags::check_cond`] is set.
pub const CONDITION_THRESHOLD: f64 = 1e6;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("No calibration views were provided")]
    NoViews,
    #[error("View {view}: {object_points} object points but {image_points} image points")]
    InputMismatch {
        view: usize,
        object_points: usize,
        image_points: usize,
    },
    #[error("View {view}: at least {required} correspondences are required, got {found}")]
    TooFewPoints {
        view: usize,
        required: usize,
        found: usize,
    },
    #[error("An initial camera is required: {0}")]
    MissingGuess(String),
    #[error("Termination criteria must bound the iteration count or the parameter change")]
    InvalidCriteria,
    #[error("View {view} is ill-conditioned (condition number {condition:e})")]
    IllConditioned { view: usize, condition: f64 },
    #[error("Stereo view {view}: reprojection error {max_error:.3} px exceeds {threshold} px")]
    BadStereoPair {
        view: usize,
        max_error: f64,
        threshold: f64,
    },
    #[error("Optimization diverged: {0}")]
    Diverged(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

/// Options controlling which parameters are estimated and how.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFlags {
    /// Start from the caller's camera instead of the image-size heuristic.
    pub use_intrinsic_guess: bool,
    /// Re-derive every view pose from the updated intrinsics after each step.
    pub recompute_extrinsic: bool,
    /// Fail with [`CalibrationError::IllConditioned`] on degenerate views.
    pub check_cond: bool,
    pub fix_skew: bool,
    pub fix_focal_length: bool,
    pub fix_principal_point: bool,
    /// Keep `k1..k4` at their initial values (zero without a guess).
    pub fix_k: [bool; 4],
    /// Stereo only: keep both cameras' intrinsics and refine the poses alone.
    pub fix_intrinsic: bool,
}

impl Default for CalibrationFlags {
    fn default() -> Self {
        CalibrationFlags {
            use_intrinsic_guess: false,
            recompute_extrinsic: false,
            check_cond: false,
            fix_skew: true,
            fix_focal_length: false,
            fix_principal_point: false,
            fix_k: [false; 4],
            fix_intrinsic: false,
        }
    }
}

/// When to stop an iterative solve. At least one bound must be set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TermCriteria {
    pub max_iterations: Option<usize>,
    /// Stop once the relative parameter change drops to this value.
    pub min_change: Option<f64>,
}

impl Default for TermCriteria {
    fn default() -> Self {
        TermCriteria::new(20, 1e-6)
    }
}

impl TermCriteria {
    pub fn new(max_iterations: usize, min_change: f64) -> Self {
        TermCriteria {
            max_iterations: Some(max_iterations),
            min_change: Some(min_change),
        }
    }

    /// Defaults of the joint stereo refinement: 100 iterations, or until the
    /// relative pose stops changing to machine precision.
    pub fn stereo() -> Self {
        TermCriteria::new(100, f64::EPSILON)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.max_iterations.is_none() && self.min_change.is_none() {
            return Err(CalibrationError::InvalidCriteria);
        }
        Ok(())
    }

    pub fn iterations_exhausted(&self, iteration: usize) -> bool {
        self.max_iterations.is_some_and(|max| iteration >= max)
    }

    pub fn converged(&self, change: f64) -> bool {
        self.min_change.is_some_and(|eps| change <= eps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationStatus {
    Converged,
    MaxIterationsReached,
}

/// Target points of one view and where they were observed in the image.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationView {
    pub object_points: Matrix3xX<f64>,
    pub image_points: Matrix2xX<f64>,
}

impl CalibrationView {
    pub fn new(object_points: Matrix3xX<f64>, image_points: Matrix2xX<f64>) -> Self {
        CalibrationView {
            object_points,
            image_points,
        }
    }

    pub fn len(&self) -> usize {
        self.object_points.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Checks view count, per-view correspondence counts and minimum sizes.
pub fn validate_views(views: &[CalibrationView]) -> Result<(), CalibrationError> {
    if views.is_empty() {
        return Err(CalibrationError::NoViews);
    }
    for (view, data) in views.iter().enumerate() {
        check_view_sizes(view, data.object_points.ncols(), &[data.image_points.ncols()])?;
    }
    Ok(())
}

pub(crate) fn check_view_sizes(
    view: usize,
    object_points: usize,
    image_points: &[usize],
) -> Result<(), CalibrationError> {
    for &count in image_points {
        if count != object_points {
            return Err(CalibrationError::InputMismatch {
                view,
                object_points,
                image_points: count,
            });
        }
    }
    if object_points < MIN_VIEW_POINTS {
        return Err(CalibrationError::TooFewPoints {
            view,
            required: MIN_VIEW_POINTS,
            found: object_points,
        });
    }
    Ok(())
}

/// Ratio of the largest to the smallest singular value.
///
/// Returns infinity for rank-deficient or non-finite input.
pub fn condition_number(matrix: &DMatrix<f64>) -> f64 {
    if matrix.is_empty() || matrix.iter().any(|v| !v.is_finite()) {
        return f64::INFINITY;
    }
    let singular_values = matrix.singular_values();
    let max = singular_values.max();
    let min = singular_values.min();
    if min <= 0.0 || !min.is_finite() {
        f64::INFINITY
    } else {
        max / min
    }
}

/// Stacked Jacobian (free columns only) and residuals `observed - projected`
/// of a whole problem, with the row range of every view.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub jacobian: DMatrix<f64>,
    pub residuals: DVector<f64>,
    /// `(first row, row count)` per view.
    pub view_rows: Vec<(usize, usize)>,
}

impl LinearSystem {
    pub(crate) fn zeros(rows: usize, columns: usize, views: usize) -> Self {
        LinearSystem {
            jacobian: DMatrix::zeros(rows, columns),
            residuals: DVector::zeros(rows),
            view_rows: Vec::with_capacity(views),
        }
    }

    /// Copies the columns of a `2 x K` derivative block whose parameters
    /// start at `offset` into rows `row..row + 2`, skipping fixed entries.
    pub(crate) fn scatter<const K: usize>(
        &mut self,
        row: usize,
        block: &SMatrix<f64, 2, K>,
        offset: usize,
        layout: &ParameterLayout,
    ) {
        for k in 0..K {
            if let Some(column) = layout.column(offset + k) {
                self.jacobian
                    .view_mut((row, column), (2, 1))
                    .copy_from(&block.column(k));
            }
        }
    }

    /// Number of observed points (two residual rows each).
    pub fn point_count(&self) -> usize {
        self.residuals.len() / 2
    }

    /// Root mean square of the per-point reprojection error.
    pub fn rms(&self) -> f64 {
        match self.point_count() {
            0 => 0.0,
            n => (self.residuals.norm_squared() / n as f64).sqrt(),
        }
    }

    /// Condition number of every view's pose block.
    pub fn view_conditions(&self, layout: &ParameterLayout) -> Vec<f64> {
        self.view_rows
            .iter()
            .enumerate()
            .map(|(view, &(start, count))| {
                match layout.column(layout.view_offset(view)) {
                    Some(column) => condition_number(
                        &self
                            .jacobian
                            .view((start, column), (count, POSE_COUNT))
                            .into_owned(),
                    ),
                    None => f64::INFINITY,
                }
            })
            .collect()
    }

    /// First view whose pose block exceeds [`CONDITION_THRESHOLD`].
    pub fn check_conditioning(&self, layout: &ParameterLayout) -> Result<f64, CalibrationError> {
        let conditions = self.view_conditions(layout);
        if let Some((view, &condition)) = conditions
            .iter()
            .enumerate()
            .find(|(_, c)| **c > CONDITION_THRESHOLD)
        {
            return Err(CalibrationError::IllConditioned { view, condition });
        }
        Ok(conditions.into_iter().fold(0.0, f64::max))
    }

    /// Gauss-Newton step: solves `JtJ * step = Jt * e`, by LU decomposition
    /// first and by SVD when the normal matrix is singular.
    pub fn solve(&self) -> Result<DVector<f64>, CalibrationError> {
        let jt = self.jacobian.transpose();
        let jtj = &jt * &self.jacobian;
        let jte = &jt * &self.residuals;
        if jtj.iter().chain(jte.iter()).any(|v| !v.is_finite()) {
            return Err(CalibrationError::Diverged(
                "non-finite normal equations".to_string(),
            ));
        }

        if let Some(step) = jtj.clone().lu().solve(&jte) {
            if step.iter().all(|v| v.is_finite()) {
                return Ok(step);
            }
        }
        jtj.svd(true, true)
            .solve(&jte, f64::EPSILON)
            .map_err(|e| CalibrationError::Diverged(e.to_string()))
    }
}

/// A trait for camera model optimization tasks.
///
/// Types implementing `Optimizer` hold a set of target views and refine the
/// parameters of a camera model against them by minimizing the reprojection
/// error.
pub trait Optimizer {
    /// Performs non-linear optimization to refine the camera model parameters.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, solver progress is logged at `info` level.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the optimization finished, converged or not.
    /// * `Err(CalibrationError)` - If the input is degenerate or the
    ///   parameters stopped being finite.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError>;

    /// Produces the starting point of the optimization: initial intrinsics
    /// and one pose per view from a closed-form estimate.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized;

    /// Retrieves the current intrinsic parameters from the underlying camera model.
    fn get_intrinsics(&self) -> Intrinsics;

    /// Retrieves the current resolution from the underlying camera model.
    fn get_resolution(&self) -> Resolution;

    /// Retrieves the current distortion parameters from the underlying camera model.
    fn get_distortion(&self) -> Vec<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_criteria() {
        let criteria = TermCriteria::default();
        assert!(criteria.validate().is_ok());
        assert!(criteria.iterations_exhausted(20));
        assert!(!criteria.iterations_exhausted(19));
        assert!(criteria.converged(1e-7));
        assert!(!criteria.converged(1e-3));

        let unbounded = TermCriteria {
            max_iterations: None,
            min_change: None,
        };
        assert!(matches!(
            unbounded.validate(),
            Err(CalibrationError::InvalidCriteria)
        ));
    }

    #[test]
    fn test_validate_views() {
        assert!(matches!(validate_views(&[]), Err(CalibrationError::NoViews)));

        let mismatched = CalibrationView::new(Matrix3xX::zeros(6), Matrix2xX::zeros(5));
        assert!(matches!(
            validate_views(&[mismatched]),
            Err(CalibrationError::InputMismatch {
                view: 0,
                object_points: 6,
                image_points: 5
            })
        ));

        let small = CalibrationView::new(Matrix3xX::zeros(3), Matrix2xX::zeros(3));
        assert!(matches!(
            validate_views(&[small]),
            Err(CalibrationError::TooFewPoints { found: 3, .. })
        ));
    }

    #[test]
    fn test_condition_number() {
        let well = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 1.0]);
        assert!((condition_number(&well) - 2.0).abs() < 1e-12);

        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert!(condition_number(&singular) > 1e12);

        let broken = DMatrix::from_row_slice(1, 2, &[f64::NAN, 1.0]);
        assert_eq!(condition_number(&broken), f64::INFINITY);
    }

    #[test]
    fn test_linear_system_solve_and_rms() {
        let layout = ParameterLayout::mono(&EstimateMask::none(), 1);
        let mut system = LinearSystem::zeros(6, layout.free_count(), 1);
        // Three points observing a pure translation step in x.
        let block = SMatrix::<f64, 2, 6>::from_row_slice(&[
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 0.0, 1.0, 0.0,
        ]);
        for point in 0..3 {
            system.scatter(2 * point, &block, layout.view_offset(0), &layout);
            system.residuals[2 * point] = 2.0;
        }
        system.view_rows.push((0, 6));

        assert_eq!(system.point_count(), 3);
        assert!((system.rms() - 2.0).abs() < 1e-12);

        let step = system.solve().unwrap();
        assert!((step[3] - 2.0).abs() < 1e-12);
        assert!(step[4].abs() < 1e-12);

        // Only two of the six pose directions are observed.
        assert!(system.view_conditions(&layout)[0] > CONDITION_THRESHOLD);
        assert!(matches!(
            system.check_conditioning(&layout),
            Err(CalibrationError::IllConditioned { view: 0, .. })
        ));
    }
}
