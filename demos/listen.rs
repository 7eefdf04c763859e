//! Run a tracking handler and print the tracker pose.
//!
//! Usage: cargo run --example listen
//! Start the owoTrack app on a phone in the same network. Press Ctrl+C to stop.

use owotrack::{ConnectionStatus, HeadsetPose, TrackingHandler};
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    let (mut handler, status) = TrackingHandler::from_env().initialize_with_fallback();
    if status != ConnectionStatus::Ok {
        eprintln!("Failed to initialize: {:?}", status);
        std::process::exit(1);
    }

    println!("Port:      {}", handler.port());
    println!("Addresses: {}", handler.addresses().join(", "));
    println!();

    let events = handler.status_events();
    let mut last_report = Instant::now();

    loop {
        handler.update();

        for change in events.try_iter() {
            println!("{} ({:?} -> {:?})", change.message(), change.previous, change.current);
            if change.current == ConnectionStatus::Ok {
                handler.signal();
            }
        }

        let now = Instant::now();
        if now.duration_since(last_report) >= Duration::from_millis(500) {
            let pose = handler.calculate_pose(&HeadsetPose::default());
            let q = pose.orientation;
            println!(
                "status={:<16?} pos=[{:+.3}, {:+.3}, {:+.3}]  quat=[{:+.3}, {:+.3}, {:+.3}, {:+.3}]",
                handler.status(),
                pose.position.x, pose.position.y, pose.position.z,
                q.i, q.j, q.k, q.w,
            );
            last_report = now;
        }

        std::thread::sleep(Duration::from_millis(25));
    }
}
