//! Parameter uncertainties from the Jacobian at the solution.
//!
//! The residual variance is estimated from the final reprojection errors and
//! propagated through the pseudo-inverse of `JtJ`. Fixed parameters have no
//! Jacobian column and report an error of exactly zero.

use nalgebra::{DVector, Vector2};
use serde::Serialize;

use crate::camera::fisheye::INTRINSIC_COUNT;
use crate::camera::Resolution;
use crate::optimization::fisheye::assemble_mono;
use crate::optimization::{
    CalibrationError, CalibrationView, LinearSystem, ParameterBlock, ParameterLayout,
    CONDITION_THRESHOLD,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Uncertainty {
    /// One-sigma error of every entry of the parameter block.
    pub standard_errors: DVector<f64>,
    /// Sample standard deviation of the residuals along x and y.
    pub pixel_std: Vector2<f64>,
    /// Residual standard deviation corrected for the estimated parameters.
    pub sigma: f64,
    pub rms: f64,
    /// Largest condition number of a view's pose block.
    pub max_view_condition: f64,
    pub ill_conditioned: bool,
}

impl Uncertainty {
    /// One-sigma errors of one camera block, `[fx, fy, cx, cy, alpha, k1..k4]`.
    pub fn intrinsic_errors(&self, camera: usize) -> [f64; INTRINSIC_COUNT] {
        let start = camera * INTRINSIC_COUNT;
        let mut errors = [0.0; INTRINSIC_COUNT];
        for (i, error) in errors.iter_mut().enumerate() {
            *error = self.standard_errors.get(start + i).copied().unwrap_or(0.0);
        }
        errors
    }

    /// Three-sigma bounds of every entry.
    pub fn three_sigma(&self) -> DVector<f64> {
        &self.standard_errors * 3.0
    }
}

/// Uncertainty of a single-camera solution described by `block`.
///
/// # Errors
///
/// With `check_cond`, returns [`CalibrationError::IllConditioned`] if any
/// view's pose block is degenerate at the solution.
pub fn estimate_uncertainties(
    views: &[CalibrationView],
    block: &ParameterBlock,
    resolution: Resolution,
    check_cond: bool,
) -> Result<Uncertainty, CalibrationError> {
    let system = assemble_mono(views, block, resolution);
    if check_cond {
        system.check_conditioning(block.layout())?;
    }
    Ok(uncertainty_from_system(&system, block.layout()))
}

/// Uncertainty of any problem, given its stacked system at the solution.
pub fn uncertainty_from_system(system: &LinearSystem, layout: &ParameterLayout) -> Uncertainty {
    let residual_count = system.residuals.len();
    let n = system.point_count();

    let mut pixel_std = Vector2::zeros();
    if n > 1 {
        for axis in 0..2 {
            let values: Vec<f64> = system.residuals.iter().skip(axis).step_by(2).copied().collect();
            pixel_std[axis] = sample_std(&values, 1);
        }
    }

    let values: Vec<f64> = system.residuals.iter().copied().collect();
    let free = layout.free_count();
    let sigma = if residual_count > free {
        sample_std(&values, free)
    } else {
        f64::INFINITY
    };

    let max_view_condition = system
        .view_conditions(layout)
        .into_iter()
        .fold(0.0, f64::max);

    let mut standard_errors = DVector::zeros(layout.len());
    let jtj = system.jacobian.tr_mul(&system.jacobian);
    let covariance = if jtj.iter().all(|v| v.is_finite()) {
        jtj.pseudo_inverse(f64::EPSILON).ok()
    } else {
        None
    };
    for (index, column) in layout.free_entries() {
        standard_errors[index] = match &covariance {
            Some(covariance) => sigma * covariance[(column, column)].max(0.0).sqrt(),
            None => f64::INFINITY,
        };
    }

    Uncertainty {
        standard_errors,
        pixel_std,
        sigma,
        rms: system.rms(),
        max_view_condition,
        ill_conditioned: max_view_condition > CONDITION_THRESHOLD,
    }
}

/// Standard deviation about the mean with `dof` degrees of freedom removed.
fn sample_std(values: &[f64], dof: usize) -> f64 {
    if values.len() <= dof {
        return f64::INFINITY;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_sq / (values.len() - dof) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::fisheye::tests::{normal, sample_fisheye_model};
    use crate::geometry::{orbit_poses, planar_grid};
    use crate::optimization::{CalibrationFlags, EstimateMask};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn noisy_problem(sigma: f64) -> (Vec<CalibrationView>, ParameterBlock) {
        let camera = sample_fisheye_model();
        let grid = planar_grid(8, 6, 0.05);
        let poses = orbit_poses(10, 0.6);
        let mut rng = StdRng::seed_from_u64(7);
        let views: Vec<_> = poses
            .iter()
            .map(|pose| {
                let mut pixels = camera.project_points(&grid, pose);
                pixels.iter_mut().for_each(|v| *v += normal(&mut rng, 0.0, sigma));
                CalibrationView::new(grid.clone(), pixels)
            })
            .collect();

        let mask = EstimateMask::from_flags(&CalibrationFlags::default());
        let mut block = ParameterBlock::new(ParameterLayout::mono(&mask, views.len()));
        block.set_camera(0, &camera);
        for (v, pose) in poses.iter().enumerate() {
            block.set_pose(v, pose);
        }
        (views, block)
    }

    #[test]
    fn test_fixed_parameters_have_zero_error() {
        let (views, block) = noisy_problem(0.5);
        let camera = sample_fisheye_model();
        let uncertainty =
            estimate_uncertainties(&views, &block, camera.resolution, true).unwrap();

        let errors = uncertainty.intrinsic_errors(0);
        // skew is fixed by default
        assert_eq!(errors[4], 0.0);
        for (i, error) in errors.iter().enumerate() {
            if i != 4 {
                assert!(*error > 0.0 && error.is_finite(), "entry {i}: {error}");
            }
        }
        assert_eq!(uncertainty.standard_errors.len(), block.layout().len());
        assert_relative_eq!(uncertainty.three_sigma()[0], 3.0 * errors[0]);
        assert!(!uncertainty.ill_conditioned);
    }

    #[test]
    fn test_residual_statistics_track_noise() {
        let (views, block) = noisy_problem(0.5);
        let camera = sample_fisheye_model();
        let uncertainty =
            estimate_uncertainties(&views, &block, camera.resolution, false).unwrap();

        // 480 points with 0.5 px of noise per axis.
        assert!((uncertainty.pixel_std.x - 0.5).abs() < 0.1);
        assert!((uncertainty.pixel_std.y - 0.5).abs() < 0.1);
        assert!((uncertainty.sigma - 0.5).abs() < 0.1);
        assert!((uncertainty.rms - 0.5 * 2f64.sqrt()).abs() < 0.15);
        // The focal length of a well covered camera is known to a few pixels.
        assert!(uncertainty.intrinsic_errors(0)[0] < 5.0);
    }

    #[test]
    fn test_sample_std() {
        assert_relative_eq!(sample_std(&[1.0, 3.0], 1), 2f64.sqrt());
        assert_eq!(sample_std(&[1.0], 1), f64::INFINITY);
    }
}
