//! Wire formats spoken with the owoTrack phone app.
//!
//! Inbound datagrams (phone to host) are big-endian:
//! - `[0..4]`: u32 message type tag
//! - `[4..12]`: u64 sequence id (rotation, gyro, accelerometer only)
//! - `[12..]`: 3 or 4 f32 payload values
//!
//! Outbound frames (host to phone) use the host's native byte order, which
//! is what the app has always received. The two directions are kept apart
//! on purpose.

use crate::{OwoError, Result};
use nalgebra::{Quaternion, Vector3};

// -- Ports --
pub const INFO_PORT: u16 = 35903;
pub const DEFAULT_DATA_PORT: u16 = 6969;

// -- Packet geometry --
pub const HEADER_SIZE: usize = 4;
pub const SEQUENCE_SIZE: usize = 8;
pub const FLOAT_SIZE: usize = 4;
pub const MAX_PACKET_SIZE: usize = 512;

/// Payload of the handshake acknowledgment; byte 0 is replaced by the tag.
pub const HANDSHAKE_REPLY: &[u8] = b" Hey OVR =D 5";

// -- Outbound tags --
pub const OUT_HEARTBEAT: i32 = 1;
pub const OUT_SIGNAL: i32 = 2;

// -- Discovery --
pub const DISCOVERY_REQUEST: &str = "DISCOVERY";

/// Inbound message type tags. Values are fixed by the phone firmware.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Heartbeat = 0,
    Rotation = 1,
    Gyro = 2,
    Handshake = 3,
    Accelerometer = 4,
}

impl MessageType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(MessageType::Heartbeat),
            1 => Some(MessageType::Rotation),
            2 => Some(MessageType::Gyro),
            3 => Some(MessageType::Handshake),
            4 => Some(MessageType::Accelerometer),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::Rotation => "rotation",
            MessageType::Gyro => "gyro",
            MessageType::Handshake => "handshake",
            MessageType::Accelerometer => "accelerometer",
        }
    }

    /// Number of f32 values following the sequence id.
    pub fn payload_floats(self) -> usize {
        match self {
            MessageType::Rotation => 4,
            MessageType::Gyro | MessageType::Accelerometer => 3,
            MessageType::Heartbeat | MessageType::Handshake => 0,
        }
    }

    /// Smallest datagram that can carry this message.
    pub fn min_size(self) -> usize {
        match self {
            MessageType::Heartbeat | MessageType::Handshake => HEADER_SIZE,
            _ => HEADER_SIZE + SEQUENCE_SIZE + self.payload_floats() * FLOAT_SIZE,
        }
    }
}

/// Decoded sensor reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Rotation(Quaternion<f32>),
    Gyro(Vector3<f32>),
    Accelerometer(Vector3<f32>),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Rotation(_) => MessageType::Rotation,
            Payload::Gyro(_) => MessageType::Gyro,
            Payload::Accelerometer(_) => MessageType::Accelerometer,
        }
    }
}

/// A sequenced sensor packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorPacket {
    pub sequence_id: u64,
    pub payload: Payload,
}

/// Read the raw type tag of an inbound datagram.
pub fn read_tag(data: &[u8]) -> Result<u32> {
    if data.len() < HEADER_SIZE {
        return Err(OwoError::Protocol {
            kind: "unknown",
            reason: format!("{} bytes is shorter than the type tag", data.len()),
        });
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

fn read_f32_be(data: &[u8], offset: usize) -> f32 {
    f32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Parse a rotation, gyro or accelerometer datagram.
///
/// The buffer must start with the type tag; `kind` is the already-read type.
pub fn parse_sensor_packet(data: &[u8], kind: MessageType) -> Result<SensorPacket> {
    if kind.payload_floats() == 0 {
        return Err(OwoError::Protocol {
            kind: kind.name(),
            reason: "message carries no sensor payload".into(),
        });
    }
    if data.len() < kind.min_size() {
        return Err(OwoError::Protocol {
            kind: kind.name(),
            reason: format!("{} bytes, need at least {}", data.len(), kind.min_size()),
        });
    }

    let mut id = [0u8; SEQUENCE_SIZE];
    id.copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + SEQUENCE_SIZE]);
    let sequence_id = u64::from_be_bytes(id);

    let base = HEADER_SIZE + SEQUENCE_SIZE;
    let x = read_f32_be(data, base);
    let y = read_f32_be(data, base + FLOAT_SIZE);
    let z = read_f32_be(data, base + 2 * FLOAT_SIZE);

    let payload = match kind {
        MessageType::Rotation => {
            let w = read_f32_be(data, base + 3 * FLOAT_SIZE);
            // Wire order is [x, y, z, w]; nalgebra takes w first.
            Payload::Rotation(Quaternion::new(w, x, y, z))
        }
        MessageType::Gyro => Payload::Gyro(Vector3::new(x, y, z)),
        _ => Payload::Accelerometer(Vector3::new(x, y, z)),
    };

    Ok(SensorPacket {
        sequence_id,
        payload,
    })
}

/// Encode a sensor packet the way the phone sends it.
pub fn encode_sensor_packet(packet: &SensorPacket) -> Vec<u8> {
    let kind = packet.payload.message_type();
    let mut buf = Vec::with_capacity(kind.min_size());
    buf.extend_from_slice(&(kind as u32).to_be_bytes());
    buf.extend_from_slice(&packet.sequence_id.to_be_bytes());

    let values: Vec<f32> = match packet.payload {
        Payload::Rotation(q) => vec![q.i, q.j, q.k, q.w],
        Payload::Gyro(v) | Payload::Accelerometer(v) => vec![v.x, v.y, v.z],
    };
    for v in values {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    buf
}

/// Encode a bare header-only message (heartbeat or handshake) as the phone sends it.
pub fn encode_header(kind: MessageType) -> [u8; HEADER_SIZE] {
    (kind as u32).to_be_bytes()
}

/// Handshake acknowledgment: the fixed literal with byte 0 set to 3.
pub fn build_handshake_reply() -> Vec<u8> {
    let mut buf = HANDSHAKE_REPLY.to_vec();
    buf[0] = MessageType::Handshake as u8;
    buf
}

/// Host heartbeat frame: `i32 tag=1, i32 reserved=0`, native byte order.
pub fn build_heartbeat() -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&OUT_HEARTBEAT.to_ne_bytes());
    buf[4..8].copy_from_slice(&0i32.to_ne_bytes());
    buf
}

/// Haptic signal frame: `i32 tag=2, f32 duration, f32 frequency, f32 amplitude`,
/// native byte order.
pub fn build_signal(duration_s: f32, frequency: f32, amplitude: f32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&OUT_SIGNAL.to_ne_bytes());
    buf[4..8].copy_from_slice(&duration_s.to_ne_bytes());
    buf[8..12].copy_from_slice(&frequency.to_ne_bytes());
    buf[12..16].copy_from_slice(&amplitude.to_ne_bytes());
    buf
}

/// Whether a datagram is a discovery probe.
///
/// Trailing NUL, CR and LF are ignored; the match is exact and case-sensitive.
pub fn is_discovery_request(data: &[u8]) -> bool {
    match std::str::from_utf8(data) {
        Ok(text) => text.trim_end_matches(['\0', '\r', '\n']) == DISCOVERY_REQUEST,
        Err(_) => false,
    }
}

/// Discovery answer announcing the data port.
pub fn build_discovery_response(data_port: u16) -> String {
    format!("{}:Default\n", data_port)
}
