//! Streaming frame receiver
//!
//! Consumes an arbitrary byte stream from a lossy serial device one byte at a
//! time and yields validated frames. Anything that fails a check is dropped
//! and the parser hunts for the next start-of-frame marker; a malformed frame
//! never leaves residual state behind.

use serde::Serialize;

use crate::crc::{CrcIterator, FRAME_CRC16, FRAME_CRC8};

/// Largest payload the receiver will buffer. Frames advertising more are
/// treated as line noise.
pub const MAX_DATA_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Sof,
    Len,
    Seq,
    Crc8,
    Cmd,
    Data,
    Crc16,
}

/// Diagnostic counters, cumulative over the decoder's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    /// Frames that passed every check.
    pub frames: u64,
    /// Header checksum mismatches.
    pub crc8_mismatches: u64,
    /// Full-frame checksum mismatches.
    pub crc16_mismatches: u64,
    /// Frames advertising a payload larger than [`MAX_DATA_LEN`].
    pub oversize: u64,
    /// Frames suppressed as duplicates of the previous sequence number.
    pub duplicates: u64,
}

/// A validated frame borrowed from the decoder.
///
/// The payload view is valid until the next byte is pushed.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    pub command: u16,
    pub sequence: u8,
    pub payload: &'a [u8],
}

/// Resynchronising byte-stream parser for command frames.
///
/// The CRC-8 accumulator covers frame offsets 0..3 (SOF, DLEN, SEQ); the
/// CRC-16 accumulator covers offsets 0..(6 + DLEN), which includes the CRC8
/// field byte itself. Neither checksum field feeds its own accumulator.
pub struct FrameDecoder {
    sof: u8,
    suppress_duplicates: bool,
    state: DecodeState,
    offset: usize,
    data_len: u16,
    sequence: u8,
    last_sequence: Option<u8>,
    command: u16,
    crc16_field: u16,
    abandon: bool,
    crc8: CrcIterator,
    crc16: CrcIterator,
    payload: Vec<u8>,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new(sof: u8) -> Self {
        Self {
            sof,
            suppress_duplicates: false,
            state: DecodeState::Sof,
            offset: 0,
            data_len: 0,
            sequence: 0,
            last_sequence: None,
            command: 0,
            crc16_field: 0,
            abandon: false,
            crc8: FRAME_CRC8.iter(),
            crc16: FRAME_CRC16.iter(),
            payload: Vec::new(),
            stats: DecoderStats::default(),
        }
    }

    /// Drop frames whose sequence number repeats the previous frame's.
    /// Off by default.
    pub fn with_duplicate_suppression(mut self, enabled: bool) -> Self {
        self.suppress_duplicates = enabled;
        self
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Consume one byte. Returns a frame when this byte completes one that
    /// passed every check.
    pub fn push_byte(&mut self, byte: u8) -> Option<DecodedFrame<'_>> {
        match self.state {
            DecodeState::Sof => {
                self.try_sof(byte);
                None
            }

            DecodeState::Len => {
                self.crc8.feed(byte);
                self.crc16.feed(byte);
                self.data_len |= u16::from(byte) << (8 * self.offset);
                self.offset += 1;
                if self.offset == 2 {
                    self.offset = 0;
                    if self.data_len as usize > MAX_DATA_LEN {
                        self.stats.oversize += 1;
                        self.try_sof(byte);
                    } else {
                        self.state = DecodeState::Seq;
                    }
                }
                None
            }

            DecodeState::Seq => {
                self.sequence = byte;
                if self.suppress_duplicates {
                    if self.last_sequence == Some(byte) {
                        self.abandon = true;
                        self.stats.duplicates += 1;
                    } else {
                        self.last_sequence = Some(byte);
                    }
                }
                self.crc8.feed(byte);
                self.crc16.feed(byte);
                self.state = DecodeState::Crc8;
                None
            }

            DecodeState::Crc8 => {
                if self.crc8.value() as u8 == byte {
                    // The CRC8 field byte is inside the CRC-16's covered
                    // range, so it still feeds that accumulator.
                    self.crc16.feed(byte);
                    self.state = DecodeState::Cmd;
                } else {
                    self.stats.crc8_mismatches += 1;
                    self.try_sof(byte);
                }
                None
            }

            DecodeState::Cmd => {
                self.crc16.feed(byte);
                self.command |= u16::from(byte) << (8 * self.offset);
                self.offset += 1;
                if self.offset == 2 {
                    self.offset = 0;
                    self.state = if self.data_len == 0 {
                        DecodeState::Crc16
                    } else {
                        DecodeState::Data
                    };
                }
                None
            }

            DecodeState::Data => {
                self.payload.push(byte);
                self.crc16.feed(byte);
                if self.payload.len() == self.data_len as usize {
                    self.state = DecodeState::Crc16;
                }
                None
            }

            DecodeState::Crc16 => {
                self.crc16_field |= u16::from(byte) << (8 * self.offset);
                self.offset += 1;
                if self.offset < 2 {
                    return None;
                }
                self.offset = 0;
                self.state = DecodeState::Sof;

                if self.crc16.value() as u16 == self.crc16_field {
                    if self.abandon {
                        self.abandon = false;
                        return None;
                    }
                    self.stats.frames += 1;
                    return Some(DecodedFrame {
                        command: self.command,
                        sequence: self.sequence,
                        payload: &self.payload,
                    });
                }

                self.stats.crc16_mismatches += 1;
                self.try_sof(byte);
                None
            }
        }
    }

    /// Examine `byte` as a candidate start-of-frame. Called from the SOF
    /// state and from every failure path, so a marker that arrives where a
    /// dead frame expected its next field still begins a fresh frame.
    fn try_sof(&mut self, byte: u8) {
        if byte == self.sof {
            self.offset = 0;
            self.data_len = 0;
            self.command = 0;
            self.crc16_field = 0;
            self.abandon = false;
            self.payload.clear();
            self.crc8 = FRAME_CRC8.iter();
            self.crc16 = FRAME_CRC16.iter();
            self.crc8.feed(byte);
            self.crc16.feed(byte);
            self.state = DecodeState::Len;
        } else {
            self.state = DecodeState::Sof;
        }
    }
}
