use nalgebra::{Quaternion, Vector3};
use std::time::Instant;

/// Position and orientation in tracking space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Position in meters.
    pub position: Vector3<f32>,
    pub orientation: Quaternion<f32>,
}

impl Pose {
    /// Zero position, identity orientation.
    pub fn identity() -> Self {
        Self {
            position: Vector3::zeros(),
            orientation: Quaternion::identity(),
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Headset pose as reported by the host application on every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadsetPose {
    pub position: Vector3<f32>,
    pub orientation: Quaternion<f32>,
    /// Headset yaw in radians, as computed by the host.
    pub yaw: f32,
}

impl Default for HeadsetPose {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            orientation: Quaternion::identity(),
            yaw: 0.0,
        }
    }
}

/// Positional offsets applied on top of the headset position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Offsets {
    /// Added in world space.
    pub global: Vector3<f32>,
    /// Rotated by the headset orientation.
    pub device: Vector3<f32>,
    /// Rotated by the final tracker orientation.
    pub tracker: Vector3<f32>,
}

impl Default for Offsets {
    fn default() -> Self {
        Self {
            global: Vector3::zeros(),
            device: Vector3::zeros(),
            tracker: Vector3::zeros(),
        }
    }
}

/// Coarse connection status exposed to the host.
///
/// Discriminants match the status codes the host plugin contract expects.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ok = 0,
    ConnectionDead = 0x0001_0001,
    NoData = 0x0001_0002,
    InitFailed = 0x0001_0003,
    PortsTaken = 0x0001_0004,
    NotStarted = 0x0001_0005,
}

impl ConnectionStatus {
    /// Raw status code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// `InitFailed` and `PortsTaken` need a fresh handler to recover.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::InitFailed | ConnectionStatus::PortsTaken)
    }
}

/// Emitted once per genuine status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: ConnectionStatus,
    pub current: ConnectionStatus,
}

impl StatusChange {
    pub fn message(&self) -> &'static str {
        match self.current {
            ConnectionStatus::Ok => "STATUS OK",
            _ => "STATUS ERROR",
        }
    }
}

/// Latest motion data received from the device plus link bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSample {
    /// Raw device orientation [x, y, z, w] as sent by the phone.
    pub orientation: Quaternion<f32>,
    /// Gyroscope reading in rad/s.
    pub angular_velocity: Vector3<f32>,
    /// Accelerometer reading in m/s².
    pub acceleration: Vector3<f32>,
    pub last_sequence_id: u64,
    pub last_packet_time: Option<Instant>,
    pub connection_alive: bool,
    pub new_data: bool,
}

impl Default for DeviceSample {
    fn default() -> Self {
        Self {
            orientation: Quaternion::identity(),
            angular_velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            last_sequence_id: 0,
            last_packet_time: None,
            connection_alive: false,
            new_data: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ConnectionStatus::Ok.code(), 0);
        assert_eq!(ConnectionStatus::ConnectionDead.code(), 0x00010001);
        assert_eq!(ConnectionStatus::NotStarted.code(), 0x00010005);
        assert!(ConnectionStatus::PortsTaken.is_terminal());
        assert!(!ConnectionStatus::NoData.is_terminal());
    }

    #[test]
    fn test_status_change_message() {
        let change = StatusChange {
            previous: ConnectionStatus::ConnectionDead,
            current: ConnectionStatus::Ok,
        };
        assert_eq!(change.message(), "STATUS OK");

        let change = StatusChange {
            previous: ConnectionStatus::Ok,
            current: ConnectionStatus::ConnectionDead,
        };
        assert_eq!(change.message(), "STATUS ERROR");
    }
}
