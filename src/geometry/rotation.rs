//! Axis-angle rotation helpers.
//!
//! Rotations are stored as 3-vectors whose direction is the rotation axis and
//! whose norm is the angle in radians. The conversion to a matrix comes with
//! its analytic derivative, which the calibration solvers chain into their
//! pose Jacobians.

use nalgebra::{Matrix3, Vector3};

/// Below this angle a rotation vector is treated as the identity.
const SMALL_ANGLE: f64 = f64::EPSILON;

/// Converts an axis-angle vector to a rotation matrix.
pub fn rodrigues(rotation: &Vector3<f64>) -> Matrix3<f64> {
    let theta = rotation.norm();
    if theta < SMALL_ANGLE {
        return Matrix3::identity();
    }

    let axis = rotation / theta;
    let (s, c) = theta.sin_cos();
    Matrix3::identity() * c + axis * axis.transpose() * (1.0 - c) + axis.cross_matrix() * s
}

/// Converts an axis-angle vector to a rotation matrix together with the
/// derivative of that matrix with respect to each of the three vector
/// components.
///
/// # Returns
///
/// `(R, [dR/dr0, dR/dr1, dR/dr2])`
pub fn rodrigues_with_jacobian(rotation: &Vector3<f64>) -> (Matrix3<f64>, [Matrix3<f64>; 3]) {
    let theta = rotation.norm();
    if theta < SMALL_ANGLE {
        let derivatives = [
            Vector3::x().cross_matrix(),
            Vector3::y().cross_matrix(),
            Vector3::z().cross_matrix(),
        ];
        return (Matrix3::identity(), derivatives);
    }

    let axis = rotation / theta;
    let (s, c) = theta.sin_cos();
    let c1 = 1.0 - c;
    let itheta = 1.0 / theta;

    let outer = axis * axis.transpose();
    let axis_cross = axis.cross_matrix();
    let rotation_matrix = Matrix3::identity() * c + outer * c1 + axis_cross * s;

    let derivatives = [0, 1, 2].map(|i| {
        let e = Vector3::ith(i, 1.0);
        let ui = axis[i];
        let a0 = -s * ui;
        let a1 = (s - 2.0 * c1 * itheta) * ui;
        let a2 = c1 * itheta;
        let a3 = (c - s * itheta) * ui;
        let a4 = s * itheta;
        Matrix3::identity() * a0
            + outer * a1
            + (e * axis.transpose() + axis * e.transpose()) * a2
            + axis_cross * a3
            + e.cross_matrix() * a4
    });

    (rotation_matrix, derivatives)
}

/// Converts a rotation matrix to an axis-angle vector.
///
/// The input is first projected onto the closest orthonormal matrix, so
/// slightly non-orthogonal matrices (for example the output of a homography
/// decomposition) are accepted.
pub fn rotation_to_vector(rotation: &Matrix3<f64>) -> Vector3<f64> {
    let svd = rotation.svd(true, true);
    let r = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => u * v_t,
        _ => *rotation,
    };

    let mut axis = Vector3::new(
        r[(2, 1)] - r[(1, 2)],
        r[(0, 2)] - r[(2, 0)],
        r[(1, 0)] - r[(0, 1)],
    );
    let s = (axis.norm_squared() * 0.25).sqrt();
    let c = ((r.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = c.acos();

    if s < 1e-5 {
        if c > 0.0 {
            return Vector3::zeros();
        }

        // Rotation by pi: recover the axis from the diagonal.
        let x = ((r[(0, 0)] + 1.0) * 0.5).max(0.0).sqrt();
        let mut y = ((r[(1, 1)] + 1.0) * 0.5).max(0.0).sqrt();
        let mut z = ((r[(2, 2)] + 1.0) * 0.5).max(0.0).sqrt();
        if r[(0, 1)] < 0.0 {
            y = -y;
        }
        if r[(0, 2)] < 0.0 {
            z = -z;
        }
        if x.abs() < y.abs() && x.abs() < z.abs() && (r[(1, 2)] > 0.0) != (y * z > 0.0) {
            z = -z;
        }
        axis = Vector3::new(x, y, z);
        let norm = axis.norm();
        if norm > 0.0 {
            axis *= theta / norm;
        }
        return axis;
    }

    axis * (theta / (2.0 * s))
}
