//! Scan for a serial device and exchange heartbeat frames with the peer.
//!
//! Run with a device attached:
//! ```sh
//! cargo run --example heartbeat
//! ```

use std::thread;
use std::time::Duration;

use serilink_core::{CommHandle, DEFAULT_BAUD_RATE, DEFAULT_SOF};

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Heartbeat {
    uptime_ms: u32,
}

const CMD_PEER_HEARTBEAT: u16 = 0x0001;
const CMD_HOST_HEARTBEAT: u16 = 0x0002;

fn main() {
    let comm = match CommHandle::open_any(DEFAULT_BAUD_RATE, DEFAULT_SOF) {
        Ok(comm) => comm,
        Err(e) => {
            eprintln!("[WARN] heartbeat: {e}");
            return;
        }
    };

    comm.subscribe::<Heartbeat, _>(CMD_PEER_HEARTBEAT, |hb| {
        println!("peer uptime: {} ms", hb.uptime_ms);
    });
    comm.set_reconnect(true);
    comm.start_receiving_async();

    let beat = comm.advertise::<Heartbeat>(CMD_HOST_HEARTBEAT);
    let start = std::time::Instant::now();
    loop {
        let uptime_ms = start.elapsed().as_millis() as u32;
        match beat.publish(&Heartbeat { uptime_ms }) {
            Ok(true) => {}
            Ok(false) => eprintln!("[WARN] heartbeat: frame not fully sent"),
            Err(e) => {
                eprintln!("[WARN] heartbeat: {e}");
                break;
            }
        }
        thread::sleep(Duration::from_secs(1));
    }
}
