//! Fisheye Calibration Library
//!
//! Calibration of fisheye cameras from views of a planar target:
//! - the equidistant fisheye projection model with skew and four radial
//!   distortion coefficients, including analytic Jacobians
//! - single-camera calibration with a damped Gauss-Newton solver,
//!   selective parameter fixing and per-parameter uncertainties
//! - joint calibration of a stereo pair with a shared relative pose
//! - stereo rectification and new-camera-matrix estimation

pub mod camera;
pub mod geometry;
pub mod optimization;
pub mod rectify;
pub mod util;

// Re-export commonly used types
pub use camera::{CameraModel, CameraModelError, FisheyeModel, Intrinsics, Resolution};

pub use geometry::ViewPose;

pub use optimization::{
    calibrate, stereo_calibrate, CalibrationError, CalibrationFlags, CalibrationResult,
    CalibrationView, FisheyeOptimizationCost, Optimizer, StereoCalibrationResult, StereoView,
    TermCriteria, TerminationStatus, Uncertainty,
};

pub use rectify::{estimate_new_camera_matrix, stereo_rectify, RectificationResult, RectifyOptions};
