//! # owotrack - Rust driver for owoTrack phone trackers
//!
//! Turns a phone running the owoTrack app into a hip tracker. Provides:
//! - A UDP discovery responder the app finds the host with
//! - A non-blocking data server decoding the app's sensor stream
//! - Connection supervision with status-change notifications
//! - A pose engine with forward and down calibration
//! - C FFI for integration with host plugins
//!
//! ## Quick Start
//! ```no_run
//! use owotrack::{ConnectionStatus, HeadsetPose, TrackingHandler};
//! use std::time::Duration;
//!
//! let mut handler = TrackingHandler::from_env();
//! assert_eq!(handler.initialize(), ConnectionStatus::Ok);
//!
//! loop {
//!     handler.update();
//!     let pose = handler.calculate_pose(&HeadsetPose::default());
//!     println!("pos: {:?}", pose.position);
//!     std::thread::sleep(Duration::from_millis(25));
//! }
//! ```

pub mod error;
pub mod types;
pub mod protocol;
pub mod discovery;
pub mod server;
pub mod supervisor;
pub mod pose;
pub mod calibration;
pub mod settings;
pub mod handler;
pub mod ffi;

pub use error::OwoError;
pub use types::*;
pub use calibration::{CalibrationKind, CalibrationState};
pub use discovery::DiscoveryResponder;
pub use handler::TrackingHandler;
pub use server::DeviceServer;
pub use settings::{HandlerConfig, MemoryStore, SettingsStore, StoredCalibration};
pub use supervisor::ConnectionSupervisor;

/// Result type alias for owotrack operations.
pub type Result<T> = std::result::Result<T, OwoError>;
