//! Broadcast a discovery probe the way the phone app does and print replies.
//!
//! Usage: cargo run --example discover [host]

use owotrack::protocol::{DISCOVERY_REQUEST, INFO_PORT};
use std::net::UdpSocket;
use std::time::Duration;

fn main() {
    env_logger::init();

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "255.255.255.255".to_string());

    let socket = match UdpSocket::bind("0.0.0.0:0") {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to bind: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = socket
        .set_broadcast(true)
        .and_then(|_| socket.set_read_timeout(Some(Duration::from_secs(2))))
    {
        eprintln!("Failed to configure socket: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = socket.send_to(DISCOVERY_REQUEST.as_bytes(), (host.as_str(), INFO_PORT)) {
        eprintln!("Failed to send probe to {}: {}", host, e);
        std::process::exit(1);
    }
    println!("Probe sent to {}:{}", host, INFO_PORT);

    let mut buf = [0u8; 256];
    let mut replies = 0;
    while let Ok((len, from)) = socket.recv_from(&mut buf) {
        replies += 1;
        println!("{} -> {}", from, String::from_utf8_lossy(&buf[..len]).trim_end());
    }

    if replies == 0 {
        eprintln!("No replies");
        std::process::exit(1);
    }
}
