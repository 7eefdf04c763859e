//! Top-level device handle.
//!
//! A [`TrackingHandler`] owns one data server, its discovery responder and the
//! calibration state for a single phone. The host drives it from one thread:
//! `update` on every tick, `calculate_pose` on every frame.

use crate::calibration::{
    CalibrationKind, CalibrationPhase, CalibrationSequence, CalibrationState, SequenceStage,
};
use crate::discovery::{DiscoveryConfig, DiscoveryResponder};
use crate::server::DeviceServer;
use crate::settings::{HandlerConfig, MemoryStore, SettingsStore, StoredCalibration};
use crate::supervisor::ConnectionSupervisor;
use crate::types::{ConnectionStatus, HeadsetPose, Offsets, Pose, StatusChange};
use crate::{pose, OwoError, Result};
use crossbeam_channel::Receiver;
use nalgebra::Quaternion;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

/// Haptic pattern sent by [`TrackingHandler::signal`].
pub const SIGNAL_DURATION_S: f32 = 0.7;
pub const SIGNAL_FREQUENCY: f32 = 100.0;
pub const SIGNAL_AMPLITUDE: f32 = 0.5;

/// Minimum time between attempts to revive a dead discovery responder.
pub const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// One phone tracker: server, discovery, supervision and calibration.
pub struct TrackingHandler {
    config: HandlerConfig,
    server: DeviceServer,
    discovery: DiscoveryResponder,
    supervisor: ConnectionSupervisor,
    calibration: CalibrationState,
    sequence: CalibrationSequence,
    store: Box<dyn SettingsStore>,
    tracker_height_offset: u32,
    addresses: Vec<String>,
    initialized: bool,
    last_discovery_attempt: Option<Instant>,
}

impl TrackingHandler {
    /// Create a handler, restoring calibration from `store`.
    ///
    /// Nothing is bound until [`initialize`](Self::initialize).
    pub fn new(config: HandlerConfig, mut store: Box<dyn SettingsStore>) -> Self {
        let stored = match store.load() {
            Ok(Some(stored)) => stored.sanitized(),
            Ok(None) => StoredCalibration::default(),
            Err(e) => {
                log::warn!("Failed to load calibration, using defaults: {}", e);
                StoredCalibration::default()
            }
        };

        let calibration = CalibrationState {
            global_rotation: stored.global_rotation,
            local_rotation: stored.local_rotation,
            ..CalibrationState::default()
        };

        Self {
            config,
            server: DeviceServer::new(config.data_port),
            discovery: DiscoveryResponder::new(DiscoveryConfig {
                info_port: config.info_port,
                data_port: config.data_port,
            }),
            supervisor: ConnectionSupervisor::new(),
            calibration,
            sequence: CalibrationSequence::new(),
            store,
            tracker_height_offset: stored.tracker_height_offset,
            addresses: local_ipv4_addresses(),
            initialized: false,
            last_discovery_attempt: None,
        }
    }

    /// Handler configured from the environment with an in-memory store.
    pub fn from_env() -> Self {
        Self::new(HandlerConfig::from_env(), Box::<MemoryStore>::default())
    }

    /// A fresh handler on the next data port, keeping the settings store.
    pub fn next(self) -> Self {
        let config = HandlerConfig {
            data_port: self.config.data_port.saturating_add(1),
            ..self.config
        };
        let Self { store, .. } = self;
        Self::new(config, store)
    }

    /// Bind the data port and start discovery.
    ///
    /// Sockets are only opened while the status is `NotStarted`; a port
    /// conflict or bind failure is terminal for this handler. On success the
    /// handler is marked initialized and `Ok` is returned even though the link
    /// stays `ConnectionDead` until the phone sends data.
    pub fn initialize(&mut self) -> ConnectionStatus {
        if self.supervisor.status() == ConnectionStatus::NotStarted {
            if let Err(e) = self.server.start_listening() {
                let status = match e {
                    OwoError::PortUnavailable(_) => ConnectionStatus::PortsTaken,
                    _ => ConnectionStatus::InitFailed,
                };
                log::error!("Failed to start the data listener: {}", e);
                self.supervisor.transition(status);
                return status;
            }

            let data_port = self.server.local_port().unwrap_or(self.config.data_port);
            if let Err(e) = self.discovery.restart(data_port) {
                log::error!("Failed to start discovery: {}", e);
            }
            self.last_discovery_attempt = Some(Instant::now());
            self.supervisor.transition(ConnectionStatus::ConnectionDead);
        }

        let status = self.supervisor.status();
        if status.is_terminal() {
            return status;
        }

        self.initialized = true;
        self.calibration.clear_flags();
        ConnectionStatus::Ok
    }

    /// Initialize, moving to the next port while the data port is taken.
    ///
    /// Tries at most `port_attempts` ports and returns the handler that was
    /// tried last along with its status.
    pub fn initialize_with_fallback(self) -> (Self, ConnectionStatus) {
        let mut remaining = self.config.port_attempts.max(1);
        let mut handler = self;

        loop {
            let status = handler.initialize();
            remaining -= 1;
            let exhausted = remaining == 0 || handler.port() == u16::MAX;
            if status != ConnectionStatus::PortsTaken || exhausted {
                return (handler, status);
            }

            let taken = handler.port();
            handler = handler.next();
            log::warn!("Port {} taken, trying {}", taken, handler.port());
        }
    }

    /// Close the data socket and stop discovery.
    ///
    /// A later `initialize` binds again unless the handler failed terminally.
    pub fn shutdown(&mut self) {
        self.initialized = false;
        self.sequence.abort(&mut self.calibration);
        self.discovery.stop();
        self.server.stop();
        self.supervisor.reset_retries();

        if !self.supervisor.status().is_terminal() {
            self.supervisor.transition(ConnectionStatus::NotStarted);
        }
        log::info!("Handler on port {} shut down", self.config.data_port);
    }

    /// Periodic tick: drain packets, update the status and drive calibration.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    pub(crate) fn update_at(&mut self, now: Instant) {
        if self.initialized {
            self.supervisor.update(&mut self.server);
            self.check_discovery(now);
        }
        self.poll_calibration(now);
    }

    fn check_discovery(&mut self, now: Instant) {
        if self.discovery.is_running() {
            return;
        }
        let due = self
            .last_discovery_attempt
            .map(|t| now.duration_since(t) >= DISCOVERY_RETRY_INTERVAL)
            .unwrap_or(true);
        if !due {
            return;
        }

        self.last_discovery_attempt = Some(now);
        log::warn!("Discovery responder is down, restarting");
        let data_port = self.server.local_port().unwrap_or(self.config.data_port);
        if let Err(e) = self.discovery.restart(data_port) {
            log::error!("Failed to restart discovery: {}", e);
        }
    }

    fn poll_calibration(&mut self, now: Instant) {
        let Some(outcome) = self.sequence.poll(now, self.initialized, &mut self.calibration) else {
            return;
        };
        log::debug!("Saving {:?} calibration", outcome.kind);
        self.save_settings();
    }

    fn save_settings(&mut self) {
        let stored = StoredCalibration {
            tracker_height_offset: self.tracker_height_offset,
            global_rotation: self.calibration.global_rotation,
            local_rotation: self.calibration.local_rotation,
        };
        if let Err(e) = self.store.save(&stored) {
            log::error!("Failed to save calibration: {}", e);
        }
    }

    /// Buzz the phone. Only sent while the link is `Ok`.
    pub fn signal(&mut self) {
        if self.initialized && self.status() == ConnectionStatus::Ok {
            self.server
                .signal(SIGNAL_DURATION_S, SIGNAL_FREQUENCY, SIGNAL_AMPLITUDE);
        }
    }

    /// Tracker pose for the current frame using the configured offsets.
    pub fn calculate_pose(&mut self, headset: &HeadsetPose) -> Pose {
        let offsets = self.offsets();
        self.calculate_pose_with(headset, offsets)
    }

    /// Tracker pose with caller-supplied offsets.
    ///
    /// Identity unless initialized, listening and `Ok`.
    pub fn calculate_pose_with(&mut self, headset: &HeadsetPose, offsets: Offsets) -> Pose {
        if !self.initialized
            || self.status() != ConnectionStatus::Ok
            || !self.server.is_listening()
        {
            return Pose::identity();
        }
        pose::calculate_pose(
            &self.server.orientation(),
            headset,
            offsets,
            &mut self.calibration,
        )
    }

    /// Offsets from the configuration and the stored hip height.
    pub fn offsets(&self) -> Offsets {
        Offsets {
            global: self.config.global_offset,
            device: self.config.device_offset,
            tracker: self.stored().tracker_offset(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.supervisor.status()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Configured data port.
    pub fn port(&self) -> u16 {
        self.config.data_port
    }

    /// Port actually bound, once listening.
    pub fn bound_port(&self) -> Option<u16> {
        self.server.local_port()
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Local IPv4 addresses for display.
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Whether the discovery responder is serving. A dead responder is
    /// restarted from `update` every [`DISCOVERY_RETRY_INTERVAL`].
    pub fn discovery_running(&self) -> bool {
        self.discovery.is_running()
    }

    pub fn server(&self) -> &DeviceServer {
        &self.server
    }

    /// Status changes, in order.
    pub fn status_events(&self) -> Receiver<StatusChange> {
        self.supervisor.subscribe()
    }

    /// Start a timed calibration sequence.
    pub fn begin_calibration(&mut self, kind: CalibrationKind) -> Result<()> {
        self.begin_calibration_at(kind, Instant::now())
    }

    pub(crate) fn begin_calibration_at(&mut self, kind: CalibrationKind, now: Instant) -> Result<()> {
        if !self.initialized {
            return Err(OwoError::NotInitialized);
        }
        self.sequence.begin(kind, now)
    }

    pub fn abort_calibration(&mut self) {
        self.sequence.abort(&mut self.calibration);
    }

    pub fn calibration_stage(&self) -> SequenceStage {
        self.sequence.stage()
    }

    /// Which calibration poses are currently snapshotting, if any.
    pub fn calibration_phase(&self) -> CalibrationPhase {
        self.calibration.phase()
    }

    pub fn calibration(&self) -> &CalibrationState {
        &self.calibration
    }

    pub fn calibrating_forward(&self) -> bool {
        self.calibration.calibrating_forward
    }

    pub fn set_calibrating_forward(&mut self, value: bool) {
        self.calibration.calibrating_forward = value;
    }

    pub fn calibrating_down(&self) -> bool {
        self.calibration.calibrating_down
    }

    pub fn set_calibrating_down(&mut self, value: bool) {
        self.calibration.calibrating_down = value;
    }

    pub fn global_rotation(&self) -> Quaternion<f32> {
        self.calibration.global_rotation
    }

    /// Restore a yaw alignment. A zero quaternion becomes identity.
    pub fn set_global_rotation(&mut self, rotation: Quaternion<f32>) {
        self.calibration.global_rotation = non_zero(rotation);
    }

    pub fn local_rotation(&self) -> Quaternion<f32> {
        self.calibration.local_rotation
    }

    /// Restore a neutral alignment. A zero quaternion becomes identity.
    pub fn set_local_rotation(&mut self, rotation: Quaternion<f32>) {
        self.calibration.local_rotation = non_zero(rotation);
    }

    /// Hip height below the headset, in centimeters.
    pub fn tracker_height_offset(&self) -> u32 {
        self.tracker_height_offset
    }

    /// Change the hip height and persist it. Out-of-range values fall back to the default.
    pub fn set_tracker_height_offset(&mut self, height_cm: u32) {
        self.tracker_height_offset = StoredCalibration {
            tracker_height_offset: height_cm,
            ..StoredCalibration::default()
        }
        .sanitized()
        .tracker_height_offset;
        self.save_settings();
    }

    fn stored(&self) -> StoredCalibration {
        StoredCalibration {
            tracker_height_offset: self.tracker_height_offset,
            global_rotation: self.calibration.global_rotation,
            local_rotation: self.calibration.local_rotation,
        }
    }
}

fn non_zero(q: Quaternion<f32>) -> Quaternion<f32> {
    if q.norm_squared() == 0.0 {
        Quaternion::identity()
    } else {
        q
    }
}

/// IPv4 address of the default route, or loopback.
///
/// Connecting a UDP socket sends nothing; it only selects the outbound interface.
pub fn local_ipv4_addresses() -> Vec<String> {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => vec![ip.to_string()],
        _ => vec![Ipv4Addr::LOCALHOST.to_string()],
    }
}
