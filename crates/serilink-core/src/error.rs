//! Communication errors

use thiserror::Error;

/// Errors that can occur while talking to the serial peer
#[derive(Error, Debug)]
pub enum CommError {
    /// The serial file handle is no longer valid at the moment of a send or
    /// receive. Publishers surface this when automatic reconnection is off.
    #[error("serial device closed")]
    DeviceClosed,

    #[error("unsupported baud rate: {0}")]
    UnsupportedBaud(u32),

    #[error("serial port error: {0}")]
    SerialError(String),
}
