use crate::protocol::{DEFAULT_DATA_PORT, INFO_PORT};
use crate::Result;
use nalgebra::{Quaternion, Vector3};

/// Default hip height offset in centimeters.
pub const DEFAULT_HEIGHT_OFFSET: u32 = 75;

/// Accepted hip height offsets in centimeters.
pub const HEIGHT_OFFSET_RANGE: std::ops::RangeInclusive<u32> = 60..=90;

/// Runtime configuration of a tracking handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandlerConfig {
    pub data_port: u16,
    pub info_port: u16,
    /// Ports tried by `initialize_with_fallback`, starting at `data_port`.
    pub port_attempts: u16,
    /// Phone position relative to the headset, in headset space.
    pub device_offset: Vector3<f32>,
    pub global_offset: Vector3<f32>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            data_port: DEFAULT_DATA_PORT,
            info_port: INFO_PORT,
            port_attempts: 10,
            device_offset: Vector3::new(0.0, -0.045, 0.09),
            global_offset: Vector3::zeros(),
        }
    }
}

impl HandlerConfig {
    /// Defaults overlaid with `OWO_DATA_PORT`, `OWO_INFO_PORT` and `OWO_PORT_ATTEMPTS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_port: read_env_u16("OWO_DATA_PORT", defaults.data_port),
            info_port: read_env_u16("OWO_INFO_PORT", defaults.info_port),
            port_attempts: read_env_u16("OWO_PORT_ATTEMPTS", defaults.port_attempts).max(1),
            ..defaults
        }
    }
}

fn read_env_u16(name: &str, default: u16) -> u16 {
    parse_u16(std::env::var(name).ok().as_deref(), default)
}

fn parse_u16(value: Option<&str>, default: u16) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

/// Calibration values persisted between sessions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredCalibration {
    /// Hip height below the headset, in centimeters.
    pub tracker_height_offset: u32,
    pub global_rotation: Quaternion<f32>,
    pub local_rotation: Quaternion<f32>,
}

impl Default for StoredCalibration {
    fn default() -> Self {
        Self {
            tracker_height_offset: DEFAULT_HEIGHT_OFFSET,
            global_rotation: Quaternion::identity(),
            local_rotation: Quaternion::identity(),
        }
    }
}

impl StoredCalibration {
    /// Repair values that could not have come from a real calibration.
    pub fn sanitized(mut self) -> Self {
        if !HEIGHT_OFFSET_RANGE.contains(&self.tracker_height_offset) {
            self.tracker_height_offset = DEFAULT_HEIGHT_OFFSET;
        }
        if self.global_rotation.norm_squared() == 0.0 {
            self.global_rotation = Quaternion::identity();
        }
        if self.local_rotation.norm_squared() == 0.0 {
            self.local_rotation = Quaternion::identity();
        }
        self
    }

    /// Offset from the device down to the hip.
    pub fn tracker_offset(&self) -> Vector3<f32> {
        Vector3::new(0.0, self.tracker_height_offset as f32 / -100.0, 0.0)
    }
}

/// Persistence for calibration values, provided by the host.
pub trait SettingsStore: Send {
    /// Load stored values; `None` when nothing was saved yet.
    fn load(&mut self) -> Result<Option<StoredCalibration>>;

    fn save(&mut self, calibration: &StoredCalibration) -> Result<()>;
}

/// Store that keeps values for the lifetime of the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    saved: Option<StoredCalibration>,
    saves: usize,
}

impl MemoryStore {
    pub fn with(calibration: StoredCalibration) -> Self {
        Self {
            saved: Some(calibration),
            saves: 0,
        }
    }

    pub fn saved(&self) -> Option<StoredCalibration> {
        self.saved
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl SettingsStore for MemoryStore {
    fn load(&mut self) -> Result<Option<StoredCalibration>> {
        Ok(self.saved)
    }

    fn save(&mut self, calibration: &StoredCalibration) -> Result<()> {
        self.saved = Some(*calibration);
        self.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u16() {
        assert_eq!(parse_u16(Some(" 7000 "), 1), 7000);
        assert_eq!(parse_u16(Some("70000"), 1), 1);
        assert_eq!(parse_u16(Some("abc"), 1), 1);
        assert_eq!(parse_u16(None, 6969), 6969);
    }

    #[test]
    fn test_sanitize_height() {
        for (stored, expected) in [(59, 75), (60, 60), (90, 90), (91, 75), (0, 75)] {
            let s = StoredCalibration {
                tracker_height_offset: stored,
                ..StoredCalibration::default()
            }
            .sanitized();
            assert_eq!(s.tracker_height_offset, expected);
        }
    }

    #[test]
    fn test_sanitize_zero_quaternions() {
        let s = StoredCalibration {
            tracker_height_offset: 80,
            global_rotation: Quaternion::new(0.0, 0.0, 0.0, 0.0),
            local_rotation: Quaternion::new(0.0, 0.0, 1.0, 0.0),
        }
        .sanitized();
        assert_eq!(s.global_rotation, Quaternion::identity());
        assert_eq!(s.local_rotation, Quaternion::new(0.0, 0.0, 1.0, 0.0));
    }

    #[test]
    fn test_tracker_offset() {
        let s = StoredCalibration::default();
        assert!((s.tracker_offset().y + 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::default();
        assert!(store.load().unwrap().is_none());
        store.save(&StoredCalibration::default()).unwrap();
        assert_eq!(store.load().unwrap(), Some(StoredCalibration::default()));
        assert_eq!(store.save_count(), 1);
    }
}
