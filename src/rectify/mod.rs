//! Stereo rectification and new-camera-matrix estimation for fisheye cameras.
//!
//! Rectification rotates both cameras so that their x-axes are parallel to
//! the baseline, then picks pinhole projection matrices with a shared focal
//! length and row. The pinhole camera of each side is chosen by
//! [`estimate_new_camera_matrix`], which undistorts the midpoints of the four
//! image edges and fits a focal length between "keep everything" and "crop
//! to valid pixels".

use log::debug;
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::camera::{FisheyeModel, Resolution};
use crate::geometry::{rodrigues, rotation_to_vector};

#[derive(thiserror::Error, Debug)]
pub enum RectifyError {
    #[error("Failed to undistort the image edge point ({0}, {1})")]
    UndistortFailed(f64, f64),
    #[error("Degenerate image extent after undistortion")]
    DegenerateExtent,
    #[error("The baseline has no horizontal component")]
    DegenerateBaseline,
}

/// Configuration of [`stereo_rectify`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RectifyOptions {
    /// Share both principal points, so that points at infinity have zero
    /// disparity. Otherwise only the rows are shared.
    pub zero_disparity: bool,
    /// Size of the rectified images, the input size when `None`.
    pub new_size: Option<Resolution>,
    /// `0` keeps only valid pixels, `1` keeps the whole field of view.
    pub balance: f64,
    /// Divisor of the chosen focal length.
    pub fov_scale: f64,
}

impl Default for RectifyOptions {
    fn default() -> Self {
        RectifyOptions {
            zero_disparity: true,
            new_size: None,
            balance: 0.0,
            fov_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RectificationResult {
    /// Rotation of the left camera into the rectified frame.
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    /// Projection matrix of the rectified left camera.
    pub p1: Matrix3x4<f64>,
    /// Projection matrix of the rectified right camera, with the baseline
    /// term in `(0, 3)`.
    pub p2: Matrix3x4<f64>,
    /// Disparity-to-depth matrix.
    pub q: Matrix4<f64>,
}

/// Estimates a pinhole camera matrix for undistorting (and rotating by
/// `rectification`) images of `camera`.
///
/// # Arguments
///
/// * `image_size` - Size of the distorted input image.
/// * `rectification` - Rotation applied to the undistorted rays.
/// * `balance` - Clamped to `[0, 1]`; interpolates between the smallest
///   (`1`) and the largest (`0`) focal length candidate.
/// * `new_size` - Output size; the matrix is rescaled from `image_size`.
/// * `fov_scale` - Divisor of the focal length when positive.
///
/// # Errors
///
/// Fails if an edge midpoint cannot be undistorted or the undistorted
/// extent collapses.
pub fn estimate_new_camera_matrix(
    camera: &FisheyeModel,
    image_size: Resolution,
    rectification: &Matrix3<f64>,
    balance: f64,
    new_size: Option<Resolution>,
    fov_scale: f64,
) -> Result<Matrix3<f64>, RectifyError> {
    let w = f64::from(image_size.width);
    let h = f64::from(image_size.height);
    let half_w = f64::from(image_size.width / 2);
    let half_h = f64::from(image_size.height / 2);
    let balance = balance.clamp(0.0, 1.0);

    let edges = [
        Vector2::new(half_w, 0.0),
        Vector2::new(w, half_h),
        Vector2::new(half_w, h),
        Vector2::new(0.0, half_h),
    ];
    let mut points = [Vector2::zeros(); 4];
    for (point, edge) in points.iter_mut().zip(edges.iter()) {
        *point = camera
            .undistort_point(edge, Some(rectification), None)
            .ok_or(RectifyError::UndistortFailed(edge.x, edge.y))?;
    }

    let aspect = camera.intrinsics.fx / camera.intrinsics.fy;
    let mut center = points.iter().sum::<Vector2<f64>>() / 4.0;
    center.y *= aspect;
    for point in points.iter_mut() {
        point.y *= aspect;
    }

    let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
    let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
    for point in &points {
        min_x = min_x.min(point.x);
        max_x = max_x.max(point.x);
        min_y = min_y.min(point.y);
        max_y = max_y.max(point.y);
    }

    let candidates = [
        w * 0.5 / (center.x - min_x),
        w * 0.5 / (max_x - center.x),
        h * 0.5 * aspect / (center.y - min_y),
        h * 0.5 * aspect / (max_y - center.y),
    ];
    let f_min = candidates.iter().copied().fold(f64::INFINITY, f64::min);
    let f_max = candidates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(f_min.is_finite() && f_max.is_finite()) {
        return Err(RectifyError::DegenerateExtent);
    }

    let mut f = balance * f_min + (1.0 - balance) * f_max;
    if fov_scale > 0.0 {
        f /= fov_scale;
    }
    debug!("New camera focal candidates {candidates:?}, chosen {f}");

    let mut new_f = Vector2::new(f, f / aspect);
    let mut new_c = -center * f + Vector2::new(w, h * aspect) * 0.5;
    new_c.y /= aspect;

    if let Some(size) = new_size {
        let scale = Vector2::new(
            f64::from(size.width) / w,
            f64::from(size.height) / h,
        );
        new_f.component_mul_assign(&scale);
        new_c.component_mul_assign(&scale);
    }

    Ok(Matrix3::new(
        new_f.x, 0.0, new_c.x, //
        0.0, new_f.y, new_c.y, //
        0.0, 0.0, 1.0,
    ))
}

/// Computes rectification rotations, projection matrices and the
/// disparity-to-depth matrix of a calibrated fisheye pair.
///
/// `rotation` and `translation` map left-camera coordinates to
/// right-camera coordinates.
///
/// # Errors
///
/// Fails if the baseline has no x component or a new camera matrix cannot
/// be estimated.
pub fn stereo_rectify(
    left: &FisheyeModel,
    right: &FisheyeModel,
    image_size: Resolution,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    options: &RectifyOptions,
) -> Result<RectificationResult, RectifyError> {
    // Rotate each camera half way towards the other.
    let half_rotation = rodrigues(&(rotation_to_vector(rotation) * -0.5));
    let t = half_rotation * translation;

    // Global rotation taking the baseline onto the x-axis.
    let axis = Vector3::new(if t.x > 0.0 { 1.0 } else { -1.0 }, 0.0, 0.0);
    let mut ww = t.cross(&axis);
    let nw = ww.norm();
    if nw > 0.0 {
        ww *= (t.x.abs() / t.norm()).acos() / nw;
    }
    let wr = rodrigues(&ww);

    let r1 = wr * half_rotation.transpose();
    let r2 = wr * half_rotation;
    let t_new = r2 * translation;
    if t_new.x == 0.0 || !t_new.x.is_finite() {
        return Err(RectifyError::DegenerateBaseline);
    }

    let new_k1 = estimate_new_camera_matrix(
        left,
        image_size,
        &r1,
        options.balance,
        options.new_size,
        options.fov_scale,
    )?;
    let new_k2 = estimate_new_camera_matrix(
        right,
        image_size,
        &r2,
        options.balance,
        options.new_size,
        options.fov_scale,
    )?;

    // Both rectified cameras use the smaller vertical focal length.
    let fc = new_k1[(1, 1)].min(new_k2[(1, 1)]);
    let mut c1 = Vector2::new(new_k1[(0, 2)], new_k1[(1, 2)]);
    let mut c2 = Vector2::new(new_k2[(0, 2)], new_k2[(1, 2)]);
    if options.zero_disparity {
        c1 = (c1 + c2) * 0.5;
        c2 = c1;
    } else {
        let row = (c1.y + c2.y) * 0.5;
        c1.y = row;
        c2.y = row;
    }

    let p1 = Matrix3x4::new(
        fc, 0.0, c1.x, 0.0, //
        0.0, fc, c1.y, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    );
    let p2 = Matrix3x4::new(
        fc, 0.0, c2.x, t_new.x * fc, //
        0.0, fc, c2.y, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    );
    let q = Matrix4::new(
        1.0, 0.0, 0.0, -c1.x, //
        0.0, 1.0, 0.0, -c1.y, //
        0.0, 0.0, 0.0, fc, //
        0.0, 0.0, -1.0 / t_new.x, (c1.x - c2.x) / t_new.x,
    );

    Ok(RectificationResult { r1, r2, p1, p2, q })
}
