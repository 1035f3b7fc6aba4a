//! Flat parameter storage shared by the calibration solvers.
//!
//! All unknowns of a problem live in one contiguous vector:
//!
//! ```text
//! mono:   [camera(9)] [view 0: om(3) T(3)] [view 1: om(3) T(3)] ...
//! stereo: [left(9)] [right(9)] [relative om(3) T(3)] [view 0: om(3) T(3)] ...
//! ```
//!
//! Camera blocks use the order `[fx, fy, cx, cy, alpha, k1, k2, k3, k4]`.
//! Parameters that are held fixed stay in the vector but get no column in
//! the Jacobian; [`ParameterLayout`] owns that mapping.

use nalgebra::{DVector, Vector3};

use crate::camera::fisheye::INTRINSIC_COUNT;
use crate::camera::{FisheyeModel, Resolution};
use crate::geometry::ViewPose;
use crate::optimization::CalibrationFlags;

/// Entries per pose block: rotation vector then translation.
pub const POSE_COUNT: usize = 6;

/// Which intrinsic groups of one camera are estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimateMask {
    pub focal_length: bool,
    pub principal_point: bool,
    pub skew: bool,
    pub distortion: [bool; 4],
}

impl EstimateMask {
    pub fn none() -> Self {
        EstimateMask {
            focal_length: false,
            principal_point: false,
            skew: false,
            distortion: [false; 4],
        }
    }

    pub fn from_flags(flags: &CalibrationFlags) -> Self {
        if flags.fix_intrinsic {
            return Self::none();
        }
        EstimateMask {
            focal_length: !flags.fix_focal_length,
            principal_point: !flags.fix_principal_point,
            skew: !flags.fix_skew,
            distortion: flags.fix_k.map(|fixed| !fixed),
        }
    }

    /// Expands the groups to one flag per entry of a camera block.
    pub fn expand(&self) -> [bool; INTRINSIC_COUNT] {
        let [k1, k2, k3, k4] = self.distortion;
        [
            self.focal_length,
            self.focal_length,
            self.principal_point,
            self.principal_point,
            self.skew,
            k1,
            k2,
            k3,
            k4,
        ]
    }

    pub fn estimated_count(&self) -> usize {
        self.expand().iter().filter(|e| **e).count()
    }
}

/// Offsets into the flat parameter vector and the free-column map.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterLayout {
    cameras: usize,
    has_relative: bool,
    views: usize,
    /// Jacobian column of every entry, `None` for fixed entries.
    columns: Vec<Option<usize>>,
    free_count: usize,
}

impl ParameterLayout {
    pub fn mono(mask: &EstimateMask, views: usize) -> Self {
        Self::build(&[*mask], false, views)
    }

    pub fn stereo(left: &EstimateMask, right: &EstimateMask, views: usize) -> Self {
        Self::build(&[*left, *right], true, views)
    }

    fn build(masks: &[EstimateMask], has_relative: bool, views: usize) -> Self {
        let mut estimated: Vec<bool> = masks.iter().flat_map(|mask| mask.expand()).collect();
        if has_relative {
            estimated.extend([true; POSE_COUNT]);
        }
        estimated.resize(estimated.len() + views * POSE_COUNT, true);

        let mut free_count = 0;
        let columns: Vec<Option<usize>> = estimated
            .iter()
            .map(|&free| {
                free.then(|| {
                    free_count += 1;
                    free_count - 1
                })
            })
            .collect();

        ParameterLayout {
            cameras: masks.len(),
            has_relative,
            views,
            columns,
            free_count,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn camera_count(&self) -> usize {
        self.cameras
    }

    pub fn view_count(&self) -> usize {
        self.views
    }

    /// Number of estimated entries, i.e. Jacobian columns.
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn intrinsics_offset(&self, camera: usize) -> usize {
        camera * INTRINSIC_COUNT
    }

    /// Start of the relative pose block, stereo layouts only.
    pub fn relative_offset(&self) -> Option<usize> {
        self.has_relative.then_some(self.cameras * INTRINSIC_COUNT)
    }

    pub fn view_offset(&self, view: usize) -> usize {
        let relative = if self.has_relative { POSE_COUNT } else { 0 };
        self.cameras * INTRINSIC_COUNT + relative + view * POSE_COUNT
    }

    /// Jacobian column of the entry at `index`, if it is estimated.
    pub fn column(&self, index: usize) -> Option<usize> {
        self.columns.get(index).copied().flatten()
    }

    pub fn is_free(&self, index: usize) -> bool {
        self.column(index).is_some()
    }

    /// `(index, column)` of every estimated entry.
    pub fn free_entries(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(index, column)| column.map(|c| (index, c)))
    }
}

/// The contiguous parameter vector of one calibration problem.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBlock {
    layout: ParameterLayout,
    values: DVector<f64>,
}

impl ParameterBlock {
    pub fn new(layout: ParameterLayout) -> Self {
        let values = DVector::zeros(layout.len());
        ParameterBlock { layout, values }
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn intrinsics(&self, camera: usize) -> &[f64] {
        let start = self.layout.intrinsics_offset(camera);
        &self.values.as_slice()[start..start + INTRINSIC_COUNT]
    }

    pub fn set_intrinsics(&mut self, camera: usize, parameters: &[f64; INTRINSIC_COUNT]) {
        let start = self.layout.intrinsics_offset(camera);
        self.values
            .rows_mut(start, INTRINSIC_COUNT)
            .copy_from_slice(parameters);
    }

    /// The camera model currently described by the block.
    pub fn camera(&self, camera: usize, resolution: Resolution) -> FisheyeModel {
        FisheyeModel::from_slice(self.intrinsics(camera), resolution)
    }

    pub fn set_camera(&mut self, camera: usize, model: &FisheyeModel) {
        self.set_intrinsics(camera, &model.parameters());
    }

    fn pose_at(&self, start: usize) -> ViewPose {
        let v = &self.values;
        ViewPose::new(
            Vector3::new(v[start], v[start + 1], v[start + 2]),
            Vector3::new(v[start + 3], v[start + 4], v[start + 5]),
        )
    }

    fn set_pose_at(&mut self, start: usize, pose: &ViewPose) {
        self.values.rows_mut(start, 3).copy_from(&pose.rotation);
        self.values.rows_mut(start + 3, 3).copy_from(&pose.translation);
    }

    pub fn pose(&self, view: usize) -> ViewPose {
        self.pose_at(self.layout.view_offset(view))
    }

    pub fn set_pose(&mut self, view: usize, pose: &ViewPose) {
        self.set_pose_at(self.layout.view_offset(view), pose);
    }

    pub fn poses(&self) -> Vec<ViewPose> {
        (0..self.layout.view_count()).map(|v| self.pose(v)).collect()
    }

    pub fn relative_pose(&self) -> Option<ViewPose> {
        self.layout.relative_offset().map(|start| self.pose_at(start))
    }

    pub fn set_relative_pose(&mut self, pose: &ViewPose) {
        if let Some(start) = self.layout.relative_offset() {
            self.set_pose_at(start, pose);
        }
    }

    /// Adds `scale` times a solver step (one entry per free column) to the
    /// block. Pose entries, the relative pose included, are only touched
    /// when `update_poses` is set.
    pub fn apply_step(&mut self, step: &DVector<f64>, scale: f64, update_poses: bool) {
        let intrinsic_end = self.layout.camera_count() * INTRINSIC_COUNT;
        for (index, column) in self.layout.free_entries() {
            if index < intrinsic_end || update_poses {
                self.values[index] += scale * step[column];
            }
        }
    }

    /// All camera blocks, concatenated.
    pub fn intrinsic_values(&self) -> DVector<f64> {
        self.values
            .rows(0, self.layout.camera_count() * INTRINSIC_COUNT)
            .into_owned()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}
