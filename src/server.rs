use crate::protocol::{self, MessageType, Payload, MAX_PACKET_SIZE};
use crate::supervisor::DataLink;
use crate::types::DeviceSample;
use crate::{OwoError, Result};
use nalgebra::{Quaternion, Vector3};
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

/// Ticks between heartbeats (about 5 s at a 25 ms tick).
pub const HEARTBEAT_TICKS: u32 = 200;

/// Maximum datagrams handled per tick.
pub const MAX_PACKETS_PER_TICK: usize = 50;

/// Maximum datagrams discarded by one buffer flush.
pub const MAX_FLUSH_PACKETS: usize = 100;

/// Silence after which the link is considered dead.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Sequence ids below this are always accepted, tolerating reordering while
/// the phone handshakes.
pub const SEQUENCE_BOOTSTRAP: u64 = 5;

/// What happened to one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Payload decoded and stored.
    Applied(MessageType),
    /// Liveness refreshed, payload discarded as stale or duplicate.
    Stale(MessageType),
    /// Heartbeat, handshake or unknown tag; liveness refreshed.
    Control,
    /// Undersized or malformed; nothing updated beyond liveness (if the tag was readable).
    Malformed,
}

/// Owns the data-plane UDP socket and the latest device sample.
pub struct DeviceServer {
    port: u16,
    socket: Option<UdpSocket>,
    client: Option<SocketAddr>,
    sample: DeviceSample,
    heartbeat_accum: u32,
}

impl DeviceServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            socket: None,
            client: None,
            sample: DeviceSample::default(),
            heartbeat_accum: 0,
        }
    }

    /// Configured data port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Port actually bound, once listening.
    pub fn local_port(&self) -> Option<u16> {
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    pub fn is_listening(&self) -> bool {
        self.socket.is_some()
    }

    /// Bind the data port in non-blocking mode and discard anything queued.
    pub fn start_listening(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .map_err(|e| OwoError::from_bind(e, self.port))?;
        socket.set_nonblocking(true)?;

        log::info!("Listening for device data on {}", socket.local_addr()?);
        self.socket = Some(socket);
        self.flush_buffer();
        Ok(())
    }

    /// Close the socket and forget the client and everything it sent.
    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            log::info!("Stopped listening on port {}", self.port);
        }
        self.client = None;
        self.sample = DeviceSample::default();
        self.heartbeat_accum = 0;
    }

    pub fn sample(&self) -> &DeviceSample {
        &self.sample
    }

    pub fn orientation(&self) -> Quaternion<f32> {
        self.sample.orientation
    }

    pub fn angular_velocity(&self) -> Vector3<f32> {
        self.sample.angular_velocity
    }

    pub fn acceleration(&self) -> Vector3<f32> {
        self.sample.acceleration
    }

    /// Return and clear the "new data since last check" flag.
    pub fn take_new_data(&mut self) -> bool {
        std::mem::replace(&mut self.sample.new_data, false)
    }

    /// Periodic work: heartbeat accounting, then drain pending datagrams.
    ///
    /// Returns how many datagrams were handled.
    pub fn tick(&mut self) -> usize {
        self.send_heartbeat();

        let mut processed = 0;
        while processed < MAX_PACKETS_PER_TICK && self.read_packet() {
            processed += 1;
        }

        if processed >= MAX_PACKETS_PER_TICK {
            log::warn!(
                "Handled {} packets in one tick, the phone may be sending too fast",
                MAX_PACKETS_PER_TICK
            );
        }
        processed
    }

    /// Whether packets have arrived recently enough.
    pub fn is_connection_alive(&mut self) -> bool {
        self.check_liveness(Instant::now())
    }

    /// Liveness as of `now`. Flushes the socket once when the link lapses.
    pub(crate) fn check_liveness(&mut self, now: Instant) -> bool {
        let last = self.sample.last_packet_time;
        let last = match last {
            Some(t) if self.socket.is_some() && self.sample.connection_alive => t,
            _ => {
                self.sample.connection_alive = false;
                return false;
            }
        };

        if now.saturating_duration_since(last) >= LIVENESS_TIMEOUT {
            self.sample.connection_alive = false;
            log::warn!("Connection timed out");
            self.flush_buffer();
        }
        self.sample.connection_alive
    }

    /// Send a haptic buzz to the phone. Best effort: a failure marks the link dead.
    pub fn signal(&mut self, duration_s: f32, frequency: f32, amplitude: f32) {
        let frame = protocol::build_signal(duration_s, frequency, amplitude);
        let _ = self.send_frame(&frame);
    }

    fn send_heartbeat(&mut self) {
        self.heartbeat_accum += 1;
        if self.heartbeat_accum <= HEARTBEAT_TICKS {
            return;
        }
        self.heartbeat_accum = 0;

        if !self.is_connection_alive() {
            return;
        }
        let _ = self.send_frame(&protocol::build_heartbeat());
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let (socket, client) = match (self.socket.as_ref(), self.client) {
            (Some(s), Some(c)) => (s, c),
            _ => {
                log::trace!("No device to send {} bytes to", frame.len());
                return Err(OwoError::NotInitialized);
            }
        };

        if let Err(e) = socket.send_to(frame, client) {
            log::warn!("Send to {} failed: {}", client, e);
            self.sample.connection_alive = false;
            return Err(e.into());
        }
        Ok(())
    }

    /// Drain and discard queued datagrams.
    fn flush_buffer(&mut self) -> usize {
        let Some(socket) = self.socket.as_ref() else {
            return 0;
        };

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut flushed = 0;
        while flushed < MAX_FLUSH_PACKETS {
            match socket.recv_from(&mut buf) {
                Ok(_) => flushed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("Error flushing buffer: {}", e);
                    break;
                }
            }
        }

        if flushed > 0 {
            log::info!("Flushed {} old packets from buffer", flushed);
        }
        flushed
    }

    /// Receive and handle one datagram. Returns false when nothing was read.
    fn read_packet(&mut self) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            return false;
        };

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
            Err(e) => {
                log::warn!("Socket error while receiving: {}", e);
                self.sample.connection_alive = false;
                return false;
            }
        };

        self.handle_packet(&buf[..len], from, Instant::now());
        true
    }

    /// Apply one datagram received from `from` at `now`.
    pub(crate) fn handle_packet(&mut self, data: &[u8], from: SocketAddr, now: Instant) -> PacketOutcome {
        let tag = match protocol::read_tag(data) {
            Ok(tag) => tag,
            Err(e) => {
                log::debug!("Dropping packet from {}: {}", from, e);
                return PacketOutcome::Malformed;
            }
        };

        self.client = Some(from);
        self.sample.connection_alive = true;
        self.sample.last_packet_time = Some(now);

        let kind = match MessageType::from_tag(tag) {
            Some(kind) => kind,
            None => {
                log::trace!("Unknown message type {} from {}", tag, from);
                return PacketOutcome::Control;
            }
        };

        match kind {
            MessageType::Heartbeat => PacketOutcome::Control,
            MessageType::Handshake => {
                log::info!("Handshake from {}", from);
                let _ = self.send_frame(&protocol::build_handshake_reply());
                PacketOutcome::Control
            }
            MessageType::Rotation | MessageType::Gyro | MessageType::Accelerometer => {
                let packet = match protocol::parse_sensor_packet(data, kind) {
                    Ok(p) => p,
                    Err(e) => {
                        log::debug!("Dropping packet from {}: {}", from, e);
                        return PacketOutcome::Malformed;
                    }
                };

                if !self.accept_sequence(packet.sequence_id) {
                    log::trace!("Stale {} packet #{}", kind.name(), packet.sequence_id);
                    return PacketOutcome::Stale(kind);
                }

                match packet.payload {
                    Payload::Rotation(q) => self.sample.orientation = q,
                    Payload::Gyro(v) => self.sample.angular_velocity = v,
                    Payload::Accelerometer(v) => self.sample.acceleration = v,
                }
                self.sample.new_data = true;
                PacketOutcome::Applied(kind)
            }
        }
    }

    /// Sequence gating. Ids below the bootstrap window always pass.
    fn accept_sequence(&mut self, id: u64) -> bool {
        if id <= self.sample.last_sequence_id && id >= SEQUENCE_BOOTSTRAP {
            return false;
        }
        self.sample.last_sequence_id = id;
        true
    }
}

impl DataLink for DeviceServer {
    fn tick(&mut self) -> usize {
        DeviceServer::tick(self)
    }

    fn take_new_data(&mut self) -> bool {
        DeviceServer::take_new_data(self)
    }

    fn is_connection_alive(&mut self) -> bool {
        DeviceServer::is_connection_alive(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SensorPacket;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn rotation(id: u64, x: f32) -> Vec<u8> {
        protocol::encode_sensor_packet(&SensorPacket {
            sequence_id: id,
            payload: Payload::Rotation(Quaternion::new(1.0, x, 0.0, 0.0)),
        })
    }

    /// Server listening on an ephemeral loopback port plus a phone-side socket.
    fn connected_pair() -> (DeviceServer, UdpSocket, SocketAddr) {
        let mut server = DeviceServer::new(0);
        server.start_listening().unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], server.local_port().unwrap()));

        let phone = UdpSocket::bind("127.0.0.1:0").unwrap();
        phone
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        (server, phone, target)
    }

    fn settle() {
        std::thread::sleep(Duration::from_millis(20));
    }

    #[test]
    fn test_newer_sequence_applies_payload() {
        let mut server = DeviceServer::new(0);
        let now = Instant::now();

        let outcome = server.handle_packet(&rotation(10, 0.5), peer(), now);
        assert_eq!(outcome, PacketOutcome::Applied(MessageType::Rotation));
        assert_eq!(server.orientation().i, 0.5);
        assert_eq!(server.sample().last_sequence_id, 10);
        assert!(server.take_new_data());
        assert!(!server.take_new_data());

        let gyro = protocol::encode_sensor_packet(&SensorPacket {
            sequence_id: 11,
            payload: Payload::Gyro(Vector3::new(0.1, 0.2, 0.3)),
        });
        server.handle_packet(&gyro, peer(), now);
        assert_eq!(server.angular_velocity(), Vector3::new(0.1, 0.2, 0.3));

        let accel = protocol::encode_sensor_packet(&SensorPacket {
            sequence_id: 12,
            payload: Payload::Accelerometer(Vector3::new(0.0, 9.8, 0.0)),
        });
        server.handle_packet(&accel, peer(), now);
        assert_eq!(server.acceleration(), Vector3::new(0.0, 9.8, 0.0));
        assert!(server.take_new_data());
    }

    #[test]
    fn test_stale_sequence_refreshes_liveness_only() {
        let mut server = DeviceServer::new(0);
        let t0 = Instant::now();
        server.handle_packet(&rotation(20, 0.5), peer(), t0);
        server.take_new_data();

        let t1 = t0 + Duration::from_secs(1);
        for id in [20, 19, 5] {
            let outcome = server.handle_packet(&rotation(id, -0.9), peer(), t1);
            assert_eq!(outcome, PacketOutcome::Stale(MessageType::Rotation));
        }
        assert_eq!(server.orientation().i, 0.5);
        assert_eq!(server.sample().last_sequence_id, 20);
        assert_eq!(server.sample().last_packet_time, Some(t1));
        assert!(!server.take_new_data());
    }

    #[test]
    fn test_bootstrap_ids_always_accepted() {
        let mut server = DeviceServer::new(0);
        let now = Instant::now();
        server.handle_packet(&rotation(4, 0.1), peer(), now);
        server.handle_packet(&rotation(2, 0.2), peer(), now);
        assert_eq!(server.orientation().i, 0.2);
        assert_eq!(server.sample().last_sequence_id, 2);

        server.handle_packet(&rotation(2, 0.3), peer(), now);
        assert_eq!(server.orientation().i, 0.3);
    }

    #[test]
    fn test_stop_forgets_previous_session() {
        let (mut server, _phone, _) = connected_pair();
        server.handle_packet(&rotation(1000, 0.5), peer(), Instant::now());
        for _ in 0..10 {
            server.tick();
        }

        server.stop();
        assert_eq!(server.sample().last_sequence_id, 0);
        assert_eq!(server.orientation(), Quaternion::identity());
        assert!(server.sample().last_packet_time.is_none());
        assert!(!server.take_new_data());
        assert_eq!(server.heartbeat_accum, 0);

        server.start_listening().unwrap();
        let outcome = server.handle_packet(&rotation(10, 0.2), peer(), Instant::now());
        assert_eq!(outcome, PacketOutcome::Applied(MessageType::Rotation));
        assert_eq!(server.orientation().i, 0.2);
    }

    #[test]
    fn test_malformed_packets_do_not_touch_state() {
        let mut server = DeviceServer::new(0);
        let now = Instant::now();

        assert_eq!(server.handle_packet(&[0, 0], peer(), now), PacketOutcome::Malformed);
        assert!(server.sample().last_packet_time.is_none());

        let mut short = rotation(9, 0.7);
        short.truncate(short.len() - 2);
        assert_eq!(server.handle_packet(&short, peer(), now), PacketOutcome::Malformed);
        assert_eq!(server.sample().last_sequence_id, 0);
        assert_eq!(server.orientation(), Quaternion::identity());
        assert!(!server.take_new_data());
        // The tag was readable, so something did arrive.
        assert_eq!(server.sample().last_packet_time, Some(now));
    }

    #[test]
    fn test_liveness_without_socket_is_false() {
        let mut server = DeviceServer::new(0);
        server.handle_packet(&rotation(6, 0.1), peer(), Instant::now());
        assert!(!server.is_connection_alive());
    }

    #[test]
    fn test_liveness_boundary_flushes_once() {
        let (mut server, phone, target) = connected_pair();

        phone.send_to(&rotation(6, 0.1), target).unwrap();
        settle();
        assert_eq!(server.tick(), 1);
        let last = server.sample().last_packet_time.unwrap();

        assert!(server.check_liveness(last + LIVENESS_TIMEOUT - Duration::from_millis(1)));

        // Queue a packet that the lapse must discard.
        phone.send_to(&rotation(7, 0.2), target).unwrap();
        settle();
        assert!(!server.check_liveness(last + LIVENESS_TIMEOUT));
        assert_eq!(server.tick(), 0);

        // Already dead: no second flush, so this packet survives.
        phone.send_to(&rotation(8, 0.3), target).unwrap();
        settle();
        assert!(!server.check_liveness(last + LIVENESS_TIMEOUT * 2));
        assert_eq!(server.tick(), 1);
        assert_eq!(server.orientation().i, 0.3);
    }

    #[test]
    fn test_start_listening_reports_port_conflict() {
        let holder = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let mut server = DeviceServer::new(port);
        assert!(matches!(
            server.start_listening(),
            Err(OwoError::PortUnavailable(p)) if p == port
        ));
        assert!(!server.is_listening());
    }

    #[test]
    fn test_handshake_is_acknowledged() {
        let (mut server, phone, target) = connected_pair();

        phone
            .send_to(&protocol::encode_header(MessageType::Handshake), target)
            .unwrap();
        settle();
        assert_eq!(server.tick(), 1);

        let mut buf = [0u8; 64];
        let (len, _) = phone.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], protocol::build_handshake_reply().as_slice());
        assert!(server.is_connection_alive());
    }

    #[test]
    fn test_signal_reaches_phone() {
        let (mut server, phone, target) = connected_pair();
        phone
            .send_to(&protocol::encode_header(MessageType::Heartbeat), target)
            .unwrap();
        settle();
        server.tick();

        server.signal(0.7, 100.0, 0.5);
        let mut buf = [0u8; 64];
        let (len, _) = phone.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &protocol::build_signal(0.7, 100.0, 0.5));
    }

    #[test]
    fn test_signal_without_client_is_silent() {
        let mut server = DeviceServer::new(0);
        server.signal(0.7, 100.0, 0.5);
        assert!(!server.sample().connection_alive);
    }

    #[test]
    fn test_heartbeat_sent_only_when_alive() {
        let (mut server, phone, target) = connected_pair();
        phone
            .send_to(&protocol::encode_header(MessageType::Heartbeat), target)
            .unwrap();
        settle();

        for _ in 0..HEARTBEAT_TICKS {
            server.tick();
        }
        let mut buf = [0u8; 64];
        phone
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        assert!(phone.recv_from(&mut buf).is_err());

        server.tick();
        let (len, _) = phone.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &protocol::build_heartbeat());
    }

    #[test]
    fn test_drain_is_capped_per_tick() {
        let (mut server, phone, target) = connected_pair();
        for id in 0..(MAX_PACKETS_PER_TICK as u64 + 10) {
            phone.send_to(&rotation(id + 10, 0.0), target).unwrap();
        }
        settle();

        assert_eq!(server.tick(), MAX_PACKETS_PER_TICK);
        assert_eq!(server.tick(), 10);
    }
}
