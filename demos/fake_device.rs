//! Emulate a phone: handshake, then stream a slowly turning rotation.
//!
//! Usage: cargo run --example fake_device [host[:port]]

use owotrack::pose::axis_angle;
use owotrack::protocol::{
    encode_header, encode_sensor_packet, MessageType, Payload, SensorPacket, DEFAULT_DATA_PORT,
    MAX_PACKET_SIZE, OUT_HEARTBEAT, OUT_SIGNAL,
};
use nalgebra::Vector3;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_DATA_PORT));

    let socket = match UdpSocket::bind("0.0.0.0:0").and_then(|s| {
        s.set_nonblocking(true)?;
        Ok(s)
    }) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to bind: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = socket.send_to(&encode_header(MessageType::Handshake), target.as_str()) {
        eprintln!("Failed to reach {}: {}", target, e);
        std::process::exit(1);
    }
    println!("Streaming to {} (Ctrl+C to stop)...", target);

    let start = Instant::now();
    let mut sequence_id: u64 = 0;
    let mut buf = [0u8; MAX_PACKET_SIZE];

    loop {
        sequence_id += 1;
        let angle = start.elapsed().as_secs_f32() * 0.5;
        let packet = SensorPacket {
            sequence_id,
            payload: Payload::Rotation(axis_angle(&Vector3::y(), angle)),
        };
        if let Err(e) = socket.send_to(&encode_sensor_packet(&packet), target.as_str()) {
            eprintln!("Send failed: {}", e);
            break;
        }

        // Report what the host sends back.
        while let Ok((len, _)) = socket.recv_from(&mut buf) {
            let data = &buf[..len];
            if len < 4 {
                continue;
            }
            match i32::from_ne_bytes([data[0], data[1], data[2], data[3]]) {
                OUT_HEARTBEAT if len == 8 => println!("<- heartbeat"),
                OUT_SIGNAL if len == 16 => println!("<- signal"),
                _ if data[0] == 3 => println!("<- handshake ack"),
                tag => println!("<- unknown frame tag {}", tag),
            }
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}
