//! Command frame encoding and decoding
//!
//! Wire format (all multi-byte fields little-endian):
//!
//! | Field | Offset   | Length | Description                                |
//! |-------|----------|--------|--------------------------------------------|
//! | SOF   | 0        | 1      | Start of frame, default `0x05`             |
//! | DLEN  | 1        | 2      | Length of DATA in bytes                    |
//! | SEQ   | 3        | 1      | Sequence number, wraps at 256              |
//! | CRC8  | 4        | 1      | CRC-8 over bytes 0..3                      |
//! | CMD   | 5        | 2      | Command identifier                         |
//! | DATA  | 7        | DLEN   | Opaque payload                             |
//! | CRC16 | 7 + DLEN | 2      | CRC-16 over bytes 0..(7 + DLEN - 1)        |

use std::sync::atomic::{AtomicU8, Ordering};

use byteorder::{ByteOrder, LittleEndian};

use crate::crc::{FRAME_CRC16, FRAME_CRC8};

/// Default start-of-frame marker.
pub const DEFAULT_SOF: u8 = 0x05;

/// Bytes a frame occupies beyond its payload (header + both checksums).
pub const FRAME_OVERHEAD: usize = 9;

/// Total wire size of a frame carrying `data_len` payload bytes.
pub const fn frame_len(data_len: usize) -> usize {
    data_len + FRAME_OVERHEAD
}

/// A decoded command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub command: u16,
    pub sequence: u8,
    pub payload: Vec<u8>,
}

/// Builds and validates command frames for one link.
///
/// Owns the start-of-frame byte and the outbound sequence counter; every
/// encoded frame consumes one sequence value. The counter is atomic so
/// publishers on different threads can share a codec.
#[derive(Debug)]
pub struct FrameCodec {
    sof: u8,
    sequence: AtomicU8,
}

impl FrameCodec {
    pub fn new(sof: u8) -> Self {
        Self {
            sof,
            sequence: AtomicU8::new(0),
        }
    }

    pub fn sof(&self) -> u8 {
        self.sof
    }

    /// Build the on-wire byte sequence for one command and payload.
    ///
    /// Payloads are written verbatim; their internal layout is the caller's
    /// contract with the peer and must be stable across both ends.
    pub fn encode(&self, command: u16, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= u16::MAX as usize, "payload exceeds DLEN range");

        let mut bytes = Vec::with_capacity(frame_len(payload.len()));
        let mut field = [0u8; 2];

        bytes.push(self.sof);
        LittleEndian::write_u16(&mut field, payload.len() as u16);
        bytes.extend_from_slice(&field);
        bytes.push(self.sequence.fetch_add(1, Ordering::Relaxed));
        bytes.push(FRAME_CRC8.compute(&bytes) as u8);

        LittleEndian::write_u16(&mut field, command);
        bytes.extend_from_slice(&field);
        bytes.extend_from_slice(payload);

        LittleEndian::write_u16(&mut field, FRAME_CRC16.compute(&bytes) as u16);
        bytes.extend_from_slice(&field);

        bytes
    }

    /// Validate a complete frame and extract it. See [`decode_frame`].
    pub fn decode(&self, bytes: &[u8]) -> Option<CommandFrame> {
        decode_frame(bytes, self.sof)
    }
}

/// Validate a complete frame against `sof` and both checksums.
///
/// Returns `None` unless the slice is exactly one frame: the length matches
/// DLEN, the first byte matches `sof`, and both CRCs verify.
pub fn decode_frame(bytes: &[u8], sof: u8) -> Option<CommandFrame> {
    if bytes.len() < FRAME_OVERHEAD || bytes[0] != sof {
        return None;
    }

    let data_len = LittleEndian::read_u16(&bytes[1..3]) as usize;
    if bytes.len() != frame_len(data_len) {
        return None;
    }

    if FRAME_CRC8.compute(&bytes[..4]) as u8 != bytes[4] {
        return None;
    }

    let body_end = 7 + data_len;
    let crc16 = LittleEndian::read_u16(&bytes[body_end..body_end + 2]);
    if FRAME_CRC16.compute(&bytes[..body_end]) as u16 != crc16 {
        return None;
    }

    Some(CommandFrame {
        command: LittleEndian::read_u16(&bytes[5..7]),
        sequence: bytes[3],
        payload: bytes[7..body_end].to_vec(),
    })
}
