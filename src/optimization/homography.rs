//! Closed-form pose initialization from a plane-to-image homography.
//!
//! The homography `H` maps target-plane points `(X, Y, 1)` to undistorted
//! normalized image points `x ~ H X`. It is estimated with a normalized DLT
//! and, when the view has more than four correspondences, refined with a few
//! Gauss-Newton steps on the reprojection error. Its first two columns then
//! give the target's rotation and its third column the translation.

use log::warn;
use nalgebra::{DMatrix, DVector, Matrix2xX, Matrix3, Matrix3xX, Vector2, Vector3};

use crate::camera::FisheyeModel;
use crate::geometry::ViewPose;
use crate::optimization::CalibrationView;

/// Gauss-Newton steps used to polish the DLT solution.
const HOMOGRAPHY_REFINE_ITERATIONS: usize = 10;

/// Maps pixels to undistorted normalized coordinates, removing skew.
///
/// Pixels the distortion cannot be inverted for keep their distorted
/// normalized position.
pub fn normalize_pixels(image_points: &Matrix2xX<f64>, camera: &FisheyeModel) -> Matrix2xX<f64> {
    let mut normalized = Matrix2xX::zeros(image_points.ncols());
    for (col, pixel) in image_points.column_iter().enumerate() {
        let distorted = camera.pixel_to_normalized(&pixel.into_owned());
        let undistorted = camera.undistort_normalized(&distorted).unwrap_or(distorted);
        normalized.set_column(col, &undistorted);
    }
    normalized
}

/// Estimates the homography mapping `plane` points to `image` points.
///
/// Both inputs hold one point per column; at least four are required.
/// The result is scaled so that `H[(2, 2)] == 1`. Returns `None` when the
/// configuration is degenerate.
pub fn compute_homography(image: &Matrix2xX<f64>, plane: &Matrix2xX<f64>) -> Option<Matrix3<f64>> {
    let n = image.ncols();
    if n < 4 || plane.ncols() != n {
        return None;
    }

    // Normalize the image side: zero mean, unit mean absolute deviation.
    let mean = image.column_mean();
    let scale = Vector2::new(
        image.row(0).iter().map(|x| (x - mean.x).abs()).sum::<f64>() / n as f64,
        image.row(1).iter().map(|y| (y - mean.y).abs()).sum::<f64>() / n as f64,
    );
    if !(scale.x > 0.0 && scale.y > 0.0) || !scale.iter().all(|s| s.is_finite()) {
        return None;
    }
    let h_norm = Matrix3::new(
        1.0 / scale.x,
        0.0,
        -mean.x / scale.x,
        0.0,
        1.0 / scale.y,
        -mean.y / scale.y,
        0.0,
        0.0,
        1.0,
    );
    let inv_h_norm = Matrix3::new(scale.x, 0.0, mean.x, 0.0, scale.y, mean.y, 0.0, 0.0, 1.0);

    let mut l = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let m = plane.column(i).push(1.0);
        let mn = h_norm * image.column(i).push(1.0);
        for j in 0..3 {
            l[(2 * i, j)] = m[j];
            l[(2 * i, 6 + j)] = -mn.x * m[j];
            l[(2 * i + 1, 3 + j)] = m[j];
            l[(2 * i + 1, 6 + j)] = -mn.y * m[j];
        }
    }
    if l.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let system = if n > 4 {
        l.transpose() * &l
    } else {
        let mut padded = DMatrix::<f64>::zeros(9, 9);
        padded.view_mut((0, 0), (2 * n, 9)).copy_from(&l);
        padded
    };

    let svd = system.svd(false, true);
    let v_t = svd.v_t?;
    let null_index = svd.singular_values.imin();
    let h = v_t.row(null_index);
    if h[8].abs() < f64::EPSILON {
        return None;
    }
    let scaled: Vec<f64> = h.iter().map(|v| v / h[8]).collect();
    let h_rem = Matrix3::from_row_slice(&scaled);
    let mut homography = inv_h_norm * h_rem;

    if n > 4 {
        homography = refine_homography(homography, image, plane);
    }

    homography.iter().all(|v| v.is_finite()).then_some(homography)
}

/// Gauss-Newton refinement of the eight free homography entries.
fn refine_homography(
    mut homography: Matrix3<f64>,
    image: &Matrix2xX<f64>,
    plane: &Matrix2xX<f64>,
) -> Matrix3<f64> {
    let n = image.ncols();
    for _ in 0..HOMOGRAPHY_REFINE_ITERATIONS {
        let mut jacobian = DMatrix::<f64>::zeros(2 * n, 8);
        let mut residual = DVector::<f64>::zeros(2 * n);

        for i in 0..n {
            let m = plane.column(i).push(1.0);
            let projected = homography * m;
            let w = projected.z;
            let u = projected.x / w;
            let v = projected.y / w;
            let scaled = m / w;

            residual[2 * i] = image[(0, i)] - u;
            residual[2 * i + 1] = image[(1, i)] - v;
            for j in 0..3 {
                jacobian[(2 * i, j)] = scaled[j];
                jacobian[(2 * i + 1, 3 + j)] = scaled[j];
            }
            for j in 0..2 {
                jacobian[(2 * i, 6 + j)] = -u * scaled[j];
                jacobian[(2 * i + 1, 6 + j)] = -v * scaled[j];
            }
        }

        let jt = jacobian.transpose();
        let Some(inverse) = (&jt * &jacobian).try_inverse() else {
            break;
        };
        let innovation = inverse * jt * residual;
        for k in 0..8 {
            homography[(k / 3, k % 3)] += innovation[k];
        }
    }
    homography
}

/// Rotation that whitens a point cloud: its rows are the principal
/// directions of the centred points, largest spread first.
fn principal_axes(centred: &Matrix3xX<f64>) -> Matrix3<f64> {
    let covariance = centred * centred.transpose();
    if covariance.iter().any(|v| !v.is_finite()) {
        return Matrix3::identity();
    }
    let svd = covariance.svd(false, true);
    let Some(v_t) = svd.v_t else {
        return Matrix3::identity();
    };

    let mut order = [0usize, 1, 2];
    order.sort_by(|a, b| svd.singular_values[*b].total_cmp(&svd.singular_values[*a]));
    let mut rotation = Matrix3::zeros();
    for (row, &index) in order.iter().enumerate() {
        rotation.set_row(row, &v_t.row(index));
    }
    rotation
}

/// Seeds the pose of one view with the current camera.
///
/// The target points are moved into a frame where they lie (close to) the
/// `z = 0` plane, the plane-to-image homography is fitted and decomposed
/// into a rotation and translation, and the result is mapped back to the
/// original target frame. Degenerate homographies fall back to an identity
/// rotation one unit in front of the camera.
pub fn init_extrinsics(view: &CalibrationView, camera: &FisheyeModel) -> ViewPose {
    let normalized = normalize_pixels(&view.image_points, camera);

    let mean = view.object_points.column_mean();
    let mut centred = view.object_points.clone();
    for mut column in centred.column_iter_mut() {
        column -= &mean;
    }

    let mut rotation = principal_axes(&centred);
    if Vector2::new(rotation[(0, 2)], rotation[(1, 2)]).norm() < 1e-6 {
        rotation = Matrix3::identity();
    }
    if rotation.determinant() < 0.0 {
        rotation = -rotation;
    }
    let translation = -rotation * mean;

    let mut plane_points = Matrix2xX::zeros(view.len());
    for (col, point) in view.object_points.column_iter().enumerate() {
        let p = rotation * point + translation;
        plane_points.set_column(col, &Vector2::new(p.x, p.y));
    }

    let fallback = || {
        warn!("Degenerate homography, falling back to an identity rotation");
        ViewPose::from_matrix(&rotation, translation + Vector3::z())
    };

    let Some(homography) = compute_homography(&normalized, &plane_points) else {
        return fallback();
    };

    let h1 = homography.column(0).into_owned();
    let h2 = homography.column(1).into_owned();
    let sc = 0.5 * (h1.norm() + h2.norm());
    if !(sc > f64::EPSILON) {
        return fallback();
    }
    let h = homography / sc;

    let u1 = h.column(0).normalize();
    let u2 = h.column(1) - u1 * u1.dot(&h.column(1));
    let u2_norm = u2.norm();
    if !(u2_norm > f64::EPSILON) || !u1.iter().all(|v| v.is_finite()) {
        return fallback();
    }
    let u2 = u2 / u2_norm;
    let u3 = u1.cross(&u2);
    let plane_rotation = Matrix3::from_columns(&[u1, u2, u3]);

    let plane_pose = ViewPose::from_matrix(&plane_rotation, h.column(2).into_owned());
    let rotation_ckk = plane_pose.rotation_matrix();
    ViewPose::from_matrix(
        &(rotation_ckk * rotation),
        plane_pose.translation + rotation_ckk * translation,
    )
}
