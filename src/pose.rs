//! Pose computation for the phone tracker.
//!
//! Conventions: right-handed, Y up, yaw about Y. Quaternions are applied to
//! column vectors, so `a * b` rotates by `b` first.

use crate::calibration::CalibrationState;
use crate::types::{HeadsetPose, Offsets, Pose};
use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Rotation about X compensating for how the phone is worn.
pub const MOUNT_CORRECTION_ANGLE: f32 = -std::f32::consts::FRAC_PI_2;

/// Height added to the global offset by forward calibration, in meters.
pub const CALIBRATION_LIFT: f32 = 0.2;

/// Rotation matrix built from a possibly non-normalized quaternion.
#[derive(Debug, Clone, Copy)]
pub struct Basis {
    rows: Matrix3<f32>,
}

impl Basis {
    pub fn from_quaternion(q: &Quaternion<f32>) -> Self {
        let len_sq = q.norm_squared();
        if len_sq == 0.0 {
            return Self {
                rows: Matrix3::identity(),
            };
        }

        let s = 2.0 / len_sq;
        let (xs, ys, zs) = (q.i * s, q.j * s, q.k * s);
        let (wx, wy, wz) = (q.w * xs, q.w * ys, q.w * zs);
        let (xx, xy, xz) = (q.i * xs, q.i * ys, q.i * zs);
        let (yy, yz, zz) = (q.j * ys, q.j * zs, q.k * zs);

        Self {
            rows: Matrix3::new(
                1.0 - (yy + zz), xy - wz, xz + wy,
                xy + wz, 1.0 - (xx + zz), yz - wx,
                xz - wy, yz + wx, 1.0 - (xx + yy),
            ),
        }
    }

    /// Rotate a vector into the basis.
    pub fn xform(&self, v: &Vector3<f32>) -> Vector3<f32> {
        self.rows * v
    }
}

/// Quaternion rotating by `angle` radians about `axis`.
pub fn axis_angle(axis: &Vector3<f32>, angle: f32) -> Quaternion<f32> {
    UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(*axis), angle).into_inner()
}

/// Pure yaw rotation.
pub fn yaw_rotation(yaw: f32) -> Quaternion<f32> {
    axis_angle(&Vector3::y(), yaw)
}

/// Unsigned angle between two vectors.
pub fn angle_to(v: &Vector3<f32>, u: &Vector3<f32>) -> f32 {
    v.cross(u).norm().atan2(v.dot(u))
}

fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Signed yaw of an orientation.
///
/// Transforms `forward` (the phone's up axis when `None`) by `q`, flattens it
/// onto the XZ plane and measures the angle to world +Z. The sign follows the
/// flattened X component and is zero when that component is exactly zero.
/// A vector with no horizontal extent has zero yaw.
pub fn yaw(q: &Quaternion<f32>, forward: Option<Vector3<f32>>) -> f32 {
    let front = Basis::from_quaternion(q).xform(&forward.unwrap_or_else(Vector3::y));
    let flat = Vector3::new(front.x, 0.0, front.z);

    let len = flat.norm();
    if len <= f32::EPSILON {
        return 0.0;
    }
    let flat = flat / len;

    -angle_to(&flat, &Vector3::z()) * sign(flat.x)
}

fn inverse(q: &Quaternion<f32>) -> Quaternion<f32> {
    q.try_inverse().unwrap_or_else(Quaternion::identity)
}

/// Device orientation with the mounting offset removed.
pub fn corrected_orientation(device: &Quaternion<f32>) -> Quaternion<f32> {
    axis_angle(&Vector3::x(), MOUNT_CORRECTION_ANGLE) * device
}

/// Compute the tracker pose.
///
/// While forward calibration is asserted, `global_rotation` is re-derived from
/// the current sample and the offsets are replaced by the headset's horizontal
/// backward direction lifted by [`CALIBRATION_LIFT`]. While down calibration is
/// asserted, `local_rotation` is snapshotted so the tracker matches the
/// headset's yaw-only orientation.
pub fn calculate_pose(
    device_orientation: &Quaternion<f32>,
    headset: &HeadsetPose,
    offsets: Offsets,
    calibration: &mut CalibrationState,
) -> Pose {
    let headset_basis = Basis::from_quaternion(&headset.orientation);
    let backward = Vector3::new(0.0, 0.0, -1.0);
    let mut offsets = offsets;

    let mut remote = corrected_orientation(device_orientation);

    if calibration.calibrating_forward {
        let delta = yaw(&remote, None) - yaw(&headset.orientation, Some(backward));
        calibration.global_rotation = yaw_rotation(delta);

        let flat = headset_basis.xform(&backward).component_mul(&Vector3::new(1.0, 0.0, 1.0));
        offsets.global = flat.try_normalize(f32::EPSILON).unwrap_or_else(Vector3::zeros)
            + Vector3::new(0.0, CALIBRATION_LIFT, 0.0);
        offsets.device = Vector3::zeros();
        offsets.tracker = Vector3::zeros();
    }

    remote = calibration.global_rotation * remote;

    if calibration.calibrating_down {
        calibration.local_rotation = inverse(&remote) * yaw_rotation(-headset.yaw);
    }

    remote *= calibration.local_rotation;

    let tracker_basis = Basis::from_quaternion(&remote);
    let position = headset.position
        + offsets.global
        + headset_basis.xform(&offsets.device)
        + tracker_basis.xform(&offsets.tracker);

    Pose {
        position,
        orientation: remote,
    }
}
