//! C FFI layer for owotrack.
//!
//! Provides an opaque handle-based API for host plugins.
//! The generated C header is written to `include/owotrack.h` by cbindgen.
//!
//! Every call on a handle takes its lock, so hosts may call from more than one
//! thread, but updates and pose requests are serialized.

use crate::calibration::{CalibrationKind, CalibrationPhase};
use crate::error::LastError;
use crate::handler::TrackingHandler;
use crate::settings::{HandlerConfig, MemoryStore};
use crate::types::{ConnectionStatus, HeadsetPose, Pose, StatusChange};
use crate::OwoError;
use crossbeam_channel::Receiver;
use nalgebra::{Quaternion, Vector3};
use std::ffi::{c_char, c_int};
use std::sync::{Mutex, MutexGuard};

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Opaque tracker handle for C consumers.
pub struct OwoHandler {
    handler: Mutex<TrackingHandler>,
    events: Receiver<StatusChange>,
}

impl OwoHandler {
    fn boxed(handler: TrackingHandler) -> *mut OwoHandler {
        let events = handler.status_events();
        Box::into_raw(Box::new(OwoHandler {
            handler: Mutex::new(handler),
            events,
        }))
    }
}

/// 3D vector in C-compatible layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OwoVector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Quaternion in C-compatible layout, scalar last.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OwoQuaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

/// Tracker pose in C-compatible layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OwoPose {
    /// Position in meters.
    pub position: OwoVector,
    pub orientation: OwoQuaternion,
}

/// One status transition, as raw status codes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwoStatusChange {
    pub previous: i32,
    pub current: i32,
}

/// Headset pose supplied by the host every frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OwoHeadsetPose {
    pub position: OwoVector,
    pub orientation: OwoQuaternion,
    /// Yaw in radians.
    pub yaw: f32,
}

impl From<Vector3<f32>> for OwoVector {
    fn from(v: Vector3<f32>) -> Self {
        Self {
            x: v.x,
            y: v.y,
            z: v.z,
        }
    }
}

impl From<OwoVector> for Vector3<f32> {
    fn from(v: OwoVector) -> Self {
        Vector3::new(v.x, v.y, v.z)
    }
}

impl From<Quaternion<f32>> for OwoQuaternion {
    fn from(q: Quaternion<f32>) -> Self {
        Self {
            x: q.i,
            y: q.j,
            z: q.k,
            w: q.w,
        }
    }
}

impl From<OwoQuaternion> for Quaternion<f32> {
    fn from(q: OwoQuaternion) -> Self {
        Quaternion::new(q.w, q.x, q.y, q.z)
    }
}

impl From<Pose> for OwoPose {
    fn from(p: Pose) -> Self {
        Self {
            position: p.position.into(),
            orientation: p.orientation.into(),
        }
    }
}

impl From<OwoHeadsetPose> for HeadsetPose {
    fn from(h: OwoHeadsetPose) -> Self {
        Self {
            position: h.position.into(),
            orientation: h.orientation.into(),
            yaw: h.yaw,
        }
    }
}

/// Lock a handle. A poisoned lock is recovered; the handler holds no invariants
/// that a panic mid-call could break.
///
/// # Safety
/// `handler` must be a valid handle, or null.
unsafe fn lock<'a>(handler: *const OwoHandler) -> Option<MutexGuard<'a, TrackingHandler>> {
    if handler.is_null() {
        return None;
    }
    let handler = &*handler;
    Some(handler.handler.lock().unwrap_or_else(|e| e.into_inner()))
}

/// Create a handler. `data_port` 0 selects the configured default
/// (`OWO_DATA_PORT` or 6969).
#[no_mangle]
pub extern "C" fn owo_handler_new(data_port: u16) -> *mut OwoHandler {
    let mut config = HandlerConfig::from_env();
    if data_port != 0 {
        config.data_port = data_port;
    }
    let handler = TrackingHandler::new(config, Box::<MemoryStore>::default());
    OwoHandler::boxed(handler)
}

/// Shut a handler down and free it.
///
/// # Safety
/// `handler` must be a pointer returned by `owo_handler_new`, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_handler_free(handler: *mut OwoHandler) {
    if !handler.is_null() {
        let handler = Box::from_raw(handler);
        handler
            .handler
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown();
    }
}

/// Bind sockets and start discovery. Returns a status code; 0 on success.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_initialize(handler: *mut OwoHandler) -> i32 {
    let Some(mut handler) = lock(handler) else {
        return ConnectionStatus::NotStarted.code();
    };
    let status = handler.initialize();
    if status == ConnectionStatus::PortsTaken {
        LAST_ERROR.set(&OwoError::PortUnavailable(handler.port()));
    }
    status.code()
}

/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_shutdown(handler: *mut OwoHandler) {
    if let Some(mut handler) = lock(handler) {
        handler.shutdown();
    }
}

/// Drain packets and refresh the status. Call every tick.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_update(handler: *mut OwoHandler) {
    if let Some(mut handler) = lock(handler) {
        handler.update();
    }
}

/// Current status code.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_status(handler: *const OwoHandler) -> i32 {
    match lock(handler) {
        Some(handler) => handler.status().code(),
        None => ConnectionStatus::NotStarted.code(),
    }
}

/// Buzz the phone.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_signal(handler: *mut OwoHandler) {
    if let Some(mut handler) = lock(handler) {
        handler.signal();
    }
}

/// Configured data port, or 0 for a null handle.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_port(handler: *const OwoHandler) -> u16 {
    lock(handler).map(|h| h.port()).unwrap_or(0)
}

/// Compute the tracker pose for this frame.
/// Writes an identity pose when the link is not ready. Returns 0 on success,
/// -1 on null arguments.
///
/// # Safety
/// `handler`, `headset` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_calculate_pose(
    handler: *mut OwoHandler,
    headset: *const OwoHeadsetPose,
    out: *mut OwoPose,
) -> c_int {
    if headset.is_null() || out.is_null() {
        return -1;
    }
    let Some(mut handler) = lock(handler) else {
        return -1;
    };
    let pose = handler.calculate_pose(&HeadsetPose::from(*headset));
    out.write(pose.into());
    0
}

/// Start a timed calibration. `kind`: 0 = forward, 1 = down.
/// Returns 0 on success, -1 on error (check owo_last_error()).
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_begin_calibration(handler: *mut OwoHandler, kind: c_int) -> c_int {
    let Some(mut handler) = lock(handler) else {
        return -1;
    };
    let kind = match kind {
        1 => CalibrationKind::Down,
        _ => CalibrationKind::Forward,
    };
    match handler.begin_calibration(kind) {
        Ok(()) => 0,
        Err(e) => {
            LAST_ERROR.set(&e);
            -1
        }
    }
}

/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_set_calibrating_forward(handler: *mut OwoHandler, value: bool) {
    if let Some(mut handler) = lock(handler) {
        handler.set_calibrating_forward(value);
    }
}

/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_set_calibrating_down(handler: *mut OwoHandler, value: bool) {
    if let Some(mut handler) = lock(handler) {
        handler.set_calibrating_down(value);
    }
}

/// Hip height in centimeters; out-of-range values fall back to 75.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_set_tracker_height_offset(handler: *mut OwoHandler, height_cm: u32) {
    if let Some(mut handler) = lock(handler) {
        handler.set_tracker_height_offset(height_cm);
    }
}

/// Yaw alignment from the last forward calibration.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_global_rotation(handler: *const OwoHandler) -> OwoQuaternion {
    lock(handler)
        .map(|h| h.global_rotation())
        .unwrap_or_else(Quaternion::identity)
        .into()
}

/// Neutral alignment from the last down calibration.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_local_rotation(handler: *const OwoHandler) -> OwoQuaternion {
    lock(handler)
        .map(|h| h.local_rotation())
        .unwrap_or_else(Quaternion::identity)
        .into()
}

/// Calibration being snapshotted: 0 = none, 1 = forward, 2 = down.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_calibration_phase(handler: *const OwoHandler) -> c_int {
    match lock(handler).map(|h| h.calibration_phase()) {
        Some(CalibrationPhase::CalibratingForward) => 1,
        Some(CalibrationPhase::CalibratingDown) => 2,
        Some(CalibrationPhase::Idle) | None => 0,
    }
}

/// Restore a yaw alignment, e.g. from host settings at startup.
/// A zero quaternion is treated as identity.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_set_global_rotation(handler: *mut OwoHandler, rotation: OwoQuaternion) {
    if let Some(mut handler) = lock(handler) {
        handler.set_global_rotation(rotation.into());
    }
}

/// Restore a neutral alignment. A zero quaternion is treated as identity.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_set_local_rotation(handler: *mut OwoHandler, rotation: OwoQuaternion) {
    if let Some(mut handler) = lock(handler) {
        handler.set_local_rotation(rotation.into());
    }
}

/// Number of local IPv4 addresses, for display.
///
/// # Safety
/// `handler` must be a valid handle, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_address_count(handler: *const OwoHandler) -> c_int {
    lock(handler)
        .map(|h| h.addresses().len() as c_int)
        .unwrap_or(0)
}

/// Copy address `index` into `out` as a null-terminated string, truncating
/// to `len - 1` bytes. Returns the full length of the address, or -1 on a
/// bad index or null argument.
///
/// # Safety
/// `handler` must be a valid handle, or null. `out` must point to at least
/// `len` writable bytes, or be null.
#[no_mangle]
pub unsafe extern "C" fn owo_address(
    handler: *const OwoHandler,
    index: c_int,
    out: *mut c_char,
    len: usize,
) -> c_int {
    if out.is_null() || len == 0 || index < 0 {
        return -1;
    }
    let Some(handler) = lock(handler) else {
        return -1;
    };
    let Some(address) = handler.addresses().get(index as usize) else {
        return -1;
    };

    let bytes = address.as_bytes();
    let copied = bytes.len().min(len - 1);
    for (i, &b) in bytes[..copied].iter().enumerate() {
        out.add(i).write(b as c_char);
    }
    out.add(copied).write(0);
    bytes.len() as c_int
}

/// Pop the oldest pending status change into `out`.
/// Returns true if one was written. Changes are queued in order; a host that
/// never polls loses the newest ones once the queue is full.
///
/// # Safety
/// `handler` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn owo_poll_status_change(
    handler: *const OwoHandler,
    out: *mut OwoStatusChange,
) -> bool {
    if handler.is_null() || out.is_null() {
        return false;
    }
    match (*handler).events.try_recv() {
        Ok(change) => {
            out.write(OwoStatusChange {
                previous: change.previous.code(),
                current: change.current.code(),
            });
            true
        }
        Err(_) => false,
    }
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next owotrack API call.
#[no_mangle]
pub extern "C" fn owo_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}
