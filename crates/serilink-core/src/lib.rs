//! # serilink core library
//!
//! Typed command messaging with an embedded peer over a byte-oriented serial
//! link.
//!
//! This library provides:
//! - The framed, CRC-checked binary wire protocol (build and validate)
//! - A resynchronising byte-stream receiver for lossy links
//! - A publish/subscribe comm handle with a background receive loop and
//!   automatic reconnection
//! - Serial device access with baud-rate normalisation and `/dev` scanning
//!
//! ## Example
//!
//! ```rust,ignore
//! use serilink_core::{CommHandle, DEFAULT_SOF};
//!
//! #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
//! #[repr(C)]
//! struct Velocity { linear: f32, angular: f32 }
//!
//! let comm = CommHandle::open("/dev/ttyUSB0", 115200, DEFAULT_SOF)?;
//! comm.subscribe::<Velocity, _>(0x0021, |v| println!("feedback: {}", v.linear));
//!
//! let cmd = comm.advertise::<Velocity>(0x0020);
//! comm.start_receiving_async();
//! cmd.publish(&Velocity { linear: 0.5, angular: 0.0 })?;
//! ```

pub mod crc;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod handle;
pub mod serial;

pub use decoder::{DecodedFrame, DecoderStats, FrameDecoder, MAX_DATA_LEN};
pub use error::CommError;
pub use frame::{decode_frame, frame_len, CommandFrame, FrameCodec, DEFAULT_SOF, FRAME_OVERHEAD};
pub use handle::{CommHandle, Publisher};
pub use serial::{scan_ports, SerialAttrs, SerialDevice, TtyPort, DEFAULT_BAUD_RATE};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
