//! Equidistant fisheye projection model.
//!
//! A point `Y` in the camera frame is mapped to pixels by
//!
//! ```text
//! x      = (Y.x / Y.z, Y.y / Y.z),   r = |x|,   theta = atan(r)
//! theta_d = theta * (1 + k1 theta^2 + k2 theta^4 + k3 theta^6 + k4 theta^8)
//! x_d    = x * theta_d / r
//! u      = fx * (x_d.x + alpha * x_d.y) + cx
//! v      = fy * x_d.y + cy
//! ```
//!
//! where `alpha` is the skew coefficient. The model provides analytic
//! derivatives of the pixel with respect to the intrinsics, the distortion
//! coefficients, the camera-frame point and the target pose. The inverse
//! mapping solves `theta_d(theta)` with a bounded Newton iteration.

use nalgebra::{DVector, Matrix2, Matrix2x3, Matrix2x6, Matrix3, Matrix3xX, Matrix2xX, SMatrix, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use yaml_rust::YamlLoader;

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use crate::geometry::{rodrigues_with_jacobian, ViewPose};

/// Partial derivatives of a pixel with respect to
/// `[fx, fy, cx, cy, alpha, k1, k2, k3, k4]`.
pub type IntrinsicJacobian = SMatrix<f64, 2, 9>;

/// Number of intrinsic parameters, in canonical order
/// `[fx, fy, cx, cy, alpha, k1, k2, k3, k4]`.
pub const INTRINSIC_COUNT: usize = 9;

/// Maximum number of Newton steps when inverting the distortion.
pub const UNDISTORT_MAX_ITERATIONS: usize = 10;

/// Newton correction below which the inverse distortion is converged.
const UNDISTORT_EPS: f64 = 1e-8;

/// Normalized radius below which the distortion is treated as the identity.
const SMALL_RADIUS: f64 = 1e-8;

/// Projection of a camera-frame point with its derivatives.
#[derive(Debug, Clone)]
pub struct PointJacobian {
    pub pixel: Vector2<f64>,
    pub d_intrinsics: IntrinsicJacobian,
    /// Derivative with respect to the camera-frame point.
    pub d_point: Matrix2x3<f64>,
}

/// Projection of a target point observed under a [`ViewPose`], with its derivatives.
#[derive(Debug, Clone)]
pub struct ViewJacobian {
    pub pixel: Vector2<f64>,
    pub d_intrinsics: IntrinsicJacobian,
    /// Derivative with respect to `[rotation(3), translation(3)]`.
    pub d_pose: Matrix2x6<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FisheyeModel {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// Skew coefficient `alpha`.
    pub skew: f64,
    /// Distortion coefficients `[k1, k2, k3, k4]`.
    pub distortions: [f64; 4],
}

impl FisheyeModel {
    /// Creates a model from a parameter vector in canonical order
    /// `[fx, fy, cx, cy, alpha, k1, k2, k3, k4]`.
    ///
    /// # Errors
    ///
    /// Returns [`CameraModelError::InvalidParams`] if the vector does not
    /// hold exactly nine entries, or a validation error if the values are
    /// not usable.
    pub fn new(parameters: &DVector<f64>, resolution: Resolution) -> Result<Self, CameraModelError> {
        if parameters.len() != INTRINSIC_COUNT {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected {INTRINSIC_COUNT} fisheye parameters, got {}",
                parameters.len()
            )));
        }
        let model = Self::from_slice(parameters.as_slice(), resolution);
        model.validate_params()?;
        Ok(model)
    }

    /// Builds a model from the first nine entries of `parameters` without validation.
    pub(crate) fn from_slice(parameters: &[f64], resolution: Resolution) -> Self {
        FisheyeModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution,
            skew: parameters[4],
            distortions: [parameters[5], parameters[6], parameters[7], parameters[8]],
        }
    }

    /// Starting point when nothing is known about the lens: an equidistant
    /// camera whose focal length maps the longer image side to `pi` radians,
    /// centred on the image, without skew or distortion.
    pub fn initial_guess(resolution: Resolution) -> Self {
        let width = f64::from(resolution.width);
        let height = f64::from(resolution.height);
        let focal = width.max(height) / std::f64::consts::PI;
        FisheyeModel {
            intrinsics: Intrinsics {
                fx: focal,
                fy: focal,
                cx: width / 2.0 - 0.5,
                cy: height / 2.0 - 0.5,
            },
            resolution,
            skew: 0.0,
            distortions: [0.0; 4],
        }
    }

    /// Parameters in canonical order `[fx, fy, cx, cy, alpha, k1, k2, k3, k4]`.
    pub fn parameters(&self) -> [f64; INTRINSIC_COUNT] {
        let [k1, k2, k3, k4] = self.distortions;
        [
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.skew,
            k1,
            k2,
            k3,
            k4,
        ]
    }

    /// The 3x3 camera matrix `[fx, fx*alpha, cx; 0, fy, cy; 0, 0, 1]`.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        let i = &self.intrinsics;
        Matrix3::new(i.fx, i.fx * self.skew, i.cx, 0.0, i.fy, i.cy, 0.0, 0.0, 1.0)
    }

    /// Distortion factor `theta_d / r` of an undistorted normalized point.
    fn distortion_scale(&self, x: &Vector2<f64>) -> f64 {
        let [k1, k2, k3, k4] = self.distortions;
        let r = x.norm();
        let theta = r.atan();
        let theta2 = theta * theta;
        let theta4 = theta2 * theta2;
        let theta6 = theta4 * theta2;
        let theta8 = theta4 * theta4;
        let theta_d = theta * (1.0 + k1 * theta2 + k2 * theta4 + k3 * theta6 + k4 * theta8);
        if r > SMALL_RADIUS {
            theta_d / r
        } else {
            1.0
        }
    }

    /// Applies the affine part of the model to distorted normalized coordinates.
    fn normalized_to_pixel(&self, xd: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.intrinsics.fx * (xd.x + self.skew * xd.y) + self.intrinsics.cx,
            self.intrinsics.fy * xd.y + self.intrinsics.cy,
        )
    }

    /// Removes the affine part of the model, including skew.
    pub(crate) fn pixel_to_normalized(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let y = (pixel.y - self.intrinsics.cy) / self.intrinsics.fy;
        let x = (pixel.x - self.intrinsics.cx) / self.intrinsics.fx - self.skew * y;
        Vector2::new(x, y)
    }

    /// Maps an undistorted normalized point (`Y.xy / Y.z`) to pixels.
    pub fn distort_normalized(&self, x: &Vector2<f64>) -> Vector2<f64> {
        self.normalized_to_pixel(&(x * self.distortion_scale(x)))
    }

    /// Inverts the radial distortion of a distorted normalized point
    /// (pixel with the affine part removed).
    ///
    /// Returns `None` when the Newton solve does not converge within
    /// [`UNDISTORT_MAX_ITERATIONS`] steps or converges to an angle of the
    /// wrong sign.
    pub fn undistort_normalized(&self, xd: &Vector2<f64>) -> Option<Vector2<f64>> {
        let [k1, k2, k3, k4] = self.distortions;
        let theta_d = xd
            .norm()
            .clamp(-std::f64::consts::FRAC_PI_2, std::f64::consts::FRAC_PI_2);

        if theta_d <= SMALL_RADIUS {
            return Some(*xd);
        }

        let mut theta = theta_d;
        let mut converged = false;
        for _ in 0..UNDISTORT_MAX_ITERATIONS {
            let theta2 = theta * theta;
            let theta4 = theta2 * theta2;
            let theta6 = theta4 * theta2;
            let theta8 = theta6 * theta2;
            let theta_fix = (theta
                * (1.0 + k1 * theta2 + k2 * theta4 + k3 * theta6 + k4 * theta8)
                - theta_d)
                / (1.0 + 3.0 * k1 * theta2 + 5.0 * k2 * theta4 + 7.0 * k3 * theta6 + 9.0 * k4 * theta8);
            theta -= theta_fix;
            if theta_fix.abs() < UNDISTORT_EPS {
                converged = true;
                break;
            }
        }

        let flipped = (theta_d < 0.0 && theta > 0.0) || (theta_d > 0.0 && theta < 0.0);
        if !converged || flipped || !theta.is_finite() {
            return None;
        }

        Some(xd * (theta.tan() / theta_d))
    }

    /// Maps a distorted pixel back to undistorted coordinates.
    ///
    /// # Arguments
    ///
    /// * `pixel` - Observed (distorted) pixel.
    /// * `rectification` - Optional rotation applied to the undistorted ray.
    /// * `new_camera` - Optional pinhole camera matrix for the output. Without
    ///   it the result is in normalized coordinates.
    pub fn undistort_point(
        &self,
        pixel: &Vector2<f64>,
        rectification: Option<&Matrix3<f64>>,
        new_camera: Option<&Matrix3<f64>>,
    ) -> Option<Vector2<f64>> {
        let undistorted = self.undistort_normalized(&self.pixel_to_normalized(pixel))?;
        let rotation = rectification.copied().unwrap_or_else(Matrix3::identity);
        let camera = new_camera.copied().unwrap_or_else(Matrix3::identity);

        let ray = camera * rotation * undistorted.push(1.0);
        if ray.z.abs() < f64::MIN_POSITIVE {
            return None;
        }
        Some(Vector2::new(ray.x / ray.z, ray.y / ray.z))
    }

    /// Projects a target point observed under `pose`.
    pub fn project_point(&self, object: &Vector3<f64>, pose: &ViewPose) -> Vector2<f64> {
        self.project_camera_point(&pose.transform_point(object))
    }

    /// Projects every target point of a view.
    pub fn project_points(&self, objects: &Matrix3xX<f64>, pose: &ViewPose) -> Matrix2xX<f64> {
        let rotation = pose.rotation_matrix();
        let mut pixels = Matrix2xX::zeros(objects.ncols());
        for (i, object) in objects.column_iter().enumerate() {
            let camera_point = rotation * object + pose.translation;
            pixels.set_column(i, &self.project_camera_point(&camera_point));
        }
        pixels
    }

    /// Projects a point given in the camera frame.
    pub fn project_camera_point(&self, point: &Vector3<f64>) -> Vector2<f64> {
        let z = if point.z.abs() < f64::MIN_POSITIVE {
            1.0
        } else {
            point.z
        };
        let x = Vector2::new(point.x / z, point.y / z);
        self.distort_normalized(&x)
    }

    /// Projects a camera-frame point and differentiates the pixel with
    /// respect to the intrinsics and the point itself.
    pub fn project_camera_point_with_jacobian(&self, point: &Vector3<f64>) -> PointJacobian {
        let [k1, k2, k3, k4] = self.distortions;
        let f = Vector2::new(self.intrinsics.fx, self.intrinsics.fy);
        let alpha = self.skew;

        let z = if point.z.abs() < f64::MIN_POSITIVE {
            1.0
        } else {
            point.z
        };
        let x = Vector2::new(point.x / z, point.y / z);
        let dx_dpoint = Matrix2x3::new(
            1.0 / z,
            0.0,
            -x.x / z,
            0.0,
            1.0 / z,
            -x.y / z,
        );

        let r2 = x.norm_squared();
        let r = r2.sqrt();
        let theta = r.atan();
        let theta2 = theta * theta;
        let theta3 = theta2 * theta;
        let theta4 = theta2 * theta2;
        let theta5 = theta4 * theta;
        let theta6 = theta4 * theta2;
        let theta7 = theta6 * theta;
        let theta8 = theta4 * theta4;
        let theta9 = theta8 * theta;

        let theta_d = theta * (1.0 + k1 * theta2 + k2 * theta4 + k3 * theta6 + k4 * theta8);
        let (inv_r, cdist) = if r > SMALL_RADIUS {
            (1.0 / r, theta_d / r)
        } else {
            (1.0, 1.0)
        };

        let xd1 = x * cdist;
        let xd3 = Vector2::new(xd1.x + alpha * xd1.y, xd1.y);
        let pixel = Vector2::new(
            xd3.x * f.x + self.intrinsics.cx,
            xd3.y * f.y + self.intrinsics.cy,
        );

        // d(xd1) / dx
        let dr_dx = if r > SMALL_RADIUS { x * inv_r } else { Vector2::zeros() };
        let dtheta_dr = 1.0 / (1.0 + r2);
        let dtheta_d_dtheta =
            1.0 + 3.0 * k1 * theta2 + 5.0 * k2 * theta4 + 7.0 * k3 * theta6 + 9.0 * k4 * theta8;
        let dcdist_dr = if r > SMALL_RADIUS {
            (dtheta_d_dtheta * dtheta_dr * r - theta_d) / r2
        } else {
            0.0
        };
        let dxd1_dx = x * (dr_dx.transpose() * dcdist_dr) + Matrix2::identity() * cdist;

        // d(xd1) / dk
        let dtheta_d_dk = [theta3, theta5, theta7, theta9];

        let skew_matrix = Matrix2::new(1.0, alpha, 0.0, 1.0);
        let focal = Matrix2::from_diagonal(&f);
        let dpixel_dx = focal * skew_matrix * dxd1_dx;

        let mut d_intrinsics = IntrinsicJacobian::zeros();
        d_intrinsics[(0, 0)] = xd3.x;
        d_intrinsics[(1, 1)] = xd3.y;
        d_intrinsics[(0, 2)] = 1.0;
        d_intrinsics[(1, 3)] = 1.0;
        d_intrinsics[(0, 4)] = f.x * xd1.y;
        for (j, dtheta_d) in dtheta_d_dk.iter().enumerate() {
            let dxd1_dk = x * (dtheta_d * inv_r);
            d_intrinsics[(0, 5 + j)] = f.x * (dxd1_dk.x + alpha * dxd1_dk.y);
            d_intrinsics[(1, 5 + j)] = f.y * dxd1_dk.y;
        }

        PointJacobian {
            pixel,
            d_intrinsics,
            d_point: dpixel_dx * dx_dpoint,
        }
    }

    /// Projects a target point observed under `pose` and differentiates the
    /// pixel with respect to the intrinsics and the pose.
    pub fn project_point_with_jacobian(&self, object: &Vector3<f64>, pose: &ViewPose) -> ViewJacobian {
        let (rotation, d_rotation) = rodrigues_with_jacobian(&pose.rotation);
        let camera_point = rotation * object + pose.translation;
        let projection = self.project_camera_point_with_jacobian(&camera_point);

        let mut d_pose = Matrix2x6::zeros();
        for (i, derivative) in d_rotation.iter().enumerate() {
            d_pose
                .column_mut(i)
                .copy_from(&(projection.d_point * (derivative * object)));
        }
        d_pose
            .fixed_view_mut::<2, 3>(0, 3)
            .copy_from(&projection.d_point);

        ViewJacobian {
            pixel: projection.pixel,
            d_intrinsics: projection.d_intrinsics,
            d_pose,
        }
    }
}

impl CameraModel for FisheyeModel {
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        Ok(self.project_camera_point(point_3d))
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let undistorted = self
            .undistort_point(point_2d, None, None)
            .ok_or(CameraModelError::PointIsOutSideImage)?;
        Ok(undistorted.push(1.0).normalize())
    }

    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;

        let doc = docs
            .first()
            .ok_or_else(|| CameraModelError::InvalidParams("Empty YAML document".to_string()))?;
        let cam = &doc["cam0"];

        let read_list = |key: &str, expected: usize| -> Result<Vec<f64>, CameraModelError> {
            let values = cam[key]
                .as_vec()
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {key}")))?;
            if values.len() != expected {
                return Err(CameraModelError::InvalidParams(format!(
                    "Expected {expected} values for {key}, got {}",
                    values.len()
                )));
            }
            values
                .iter()
                .map(|v| {
                    v.as_f64()
                        .or_else(|| v.as_i64().map(|i| i as f64))
                        .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {key} entry")))
                })
                .collect()
        };

        let intrinsics = read_list("intrinsics", 4)?;
        let distortions = read_list("distortion", 4)?;
        let resolution = read_list("resolution", 2)?;
        let pixels = |value: f64| -> Result<u32, CameraModelError> {
            if value.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&value) {
                Ok(value as u32)
            } else {
                Err(CameraModelError::InvalidParams(format!(
                    "Resolution must be a non-negative integer, got {value}"
                )))
            }
        };
        let skew = match cam["skew"].as_f64() {
            Some(value) => value,
            None => cam["skew"].as_i64().map(|i| i as f64).unwrap_or(0.0),
        };

        let model = FisheyeModel {
            intrinsics: Intrinsics {
                fx: intrinsics[0],
                fy: intrinsics[1],
                cx: intrinsics[2],
                cy: intrinsics[3],
            },
            resolution: Resolution {
                width: pixels(resolution[0])?,
                height: pixels(resolution[1])?,
            },
            skew,
            distortions: [distortions[0], distortions[1], distortions[2], distortions[3]],
        };

        model.validate_params()?;
        Ok(model)
    }

    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let key = |name: &str| serde_yaml::Value::String(name.to_string());
        let cam0 = serde_yaml::Mapping::from_iter([
            (key("camera_model"), key("fisheye")),
            (
                key("intrinsics"),
                serde_yaml::to_value(vec![
                    self.intrinsics.fx,
                    self.intrinsics.fy,
                    self.intrinsics.cx,
                    self.intrinsics.cy,
                ])?,
            ),
            (
                key("distortion"),
                serde_yaml::to_value(self.distortions.to_vec())?,
            ),
            (key("skew"), serde_yaml::to_value(self.skew)?),
            (
                key("resolution"),
                serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])?,
            ),
        ]);
        let yaml = serde_yaml::Mapping::from_iter([(key("cam0"), serde_yaml::Value::Mapping(cam0))]);

        let yaml_string = serde_yaml::to_string(&yaml)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_resolution(&self.resolution)?;

        if !self.skew.is_finite() {
            return Err(CameraModelError::InvalidParams(
                "skew must be finite".to_string(),
            ));
        }
        if self.distortions.iter().any(|k| !k.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}
