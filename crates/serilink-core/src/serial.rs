//! Serial device access
//!
//! A thin capability over the host serial API: open, close, read, write, and
//! "the device went away". The rest of the crate consumes the
//! [`SerialDevice`] trait so tests can stand in an in-memory device.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::error::CommError;

/// Default baud rate for the link.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Read timeout used for the polling receive; expiry means "no data yet".
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Terminal mode bits recognised in [`SerialAttrs`] (Linux numeric values).
pub mod flags {
    /// Character size mask.
    pub const CSIZE: u32 = 0o000060;
    pub const CS5: u32 = 0o000000;
    pub const CS6: u32 = 0o000020;
    pub const CS7: u32 = 0o000040;
    /// 8 data bits.
    pub const CS8: u32 = 0o000060;
    /// Two stop bits.
    pub const CSTOPB: u32 = 0o000100;
    /// Enable receiver.
    pub const CREAD: u32 = 0o000200;
    /// Parity enable.
    pub const PARENB: u32 = 0o000400;
    /// Odd parity.
    pub const PARODD: u32 = 0o001000;
    /// Ignore modem control lines (local connection).
    pub const CLOCAL: u32 = 0o004000;
    /// RTS/CTS hardware flow control.
    pub const CRTSCTS: u32 = 0o20000000000;
    /// XON/XOFF software flow control on output.
    pub const IXON: u32 = 0o002000;
    /// XON/XOFF software flow control on input.
    pub const IXOFF: u32 = 0o010000;
}

/// Platform baud-rate constants (Linux numeric values) and the table mapping
/// them to plain integer rates.
pub mod baud {
    pub const B0: u32 = 0o000000;
    pub const B50: u32 = 0o000001;
    pub const B75: u32 = 0o000002;
    pub const B110: u32 = 0o000003;
    pub const B134: u32 = 0o000004;
    pub const B150: u32 = 0o000005;
    pub const B200: u32 = 0o000006;
    pub const B300: u32 = 0o000007;
    pub const B600: u32 = 0o000010;
    pub const B1200: u32 = 0o000011;
    pub const B1800: u32 = 0o000012;
    pub const B2400: u32 = 0o000013;
    pub const B4800: u32 = 0o000014;
    pub const B9600: u32 = 0o000015;
    pub const B19200: u32 = 0o000016;
    pub const B38400: u32 = 0o000017;
    pub const B57600: u32 = 0o010001;
    pub const B115200: u32 = 0o010002;
    pub const B230400: u32 = 0o010003;
    pub const B460800: u32 = 0o010004;
    pub const B500000: u32 = 0o010005;
    pub const B576000: u32 = 0o010006;
    pub const B921600: u32 = 0o010007;
    pub const B1000000: u32 = 0o010010;
    pub const B1152000: u32 = 0o010011;
    pub const B1500000: u32 = 0o010012;
    pub const B2000000: u32 = 0o010013;
    pub const B2500000: u32 = 0o010014;
    pub const B3000000: u32 = 0o010015;
    pub const B3500000: u32 = 0o010016;
    pub const B4000000: u32 = 0o010017;

    /// (numeric rate, platform flag) pairs, every rate the link accepts.
    const TABLE: [(u32, u32); 31] = [
        (0, B0),
        (50, B50),
        (75, B75),
        (110, B110),
        (134, B134),
        (150, B150),
        (200, B200),
        (300, B300),
        (600, B600),
        (1_200, B1200),
        (1_800, B1800),
        (2_400, B2400),
        (4_800, B4800),
        (9_600, B9600),
        (19_200, B19200),
        (38_400, B38400),
        (57_600, B57600),
        (115_200, B115200),
        (230_400, B230400),
        (460_800, B460800),
        (500_000, B500000),
        (576_000, B576000),
        (921_600, B921600),
        (1_000_000, B1000000),
        (1_152_000, B1152000),
        (1_500_000, B1500000),
        (2_000_000, B2000000),
        (2_500_000, B2500000),
        (3_000_000, B3000000),
        (3_500_000, B3500000),
        (4_000_000, B4000000),
    ];

    /// Normalise a rate to its numeric value.
    ///
    /// Accepts either a plain integer from the table (e.g. `115200`) or a
    /// platform flag within the recognised constant ranges (e.g.
    /// [`B115200`]). Anything else is rejected and must be treated as an
    /// open failure.
    pub fn normalize(rate: u32) -> Option<u32> {
        TABLE
            .iter()
            .find(|&&(numeric, flag)| rate == numeric || rate == flag)
            .map(|&(numeric, _)| numeric)
    }
}

/// Terminal attribute bundle applied when a port opens.
///
/// The four fields mirror the POSIX control/input/output/local mode masks;
/// bits the backing serial API cannot express are recorded but have no
/// effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialAttrs {
    pub c_flag: u32,
    pub i_flag: u32,
    pub o_flag: u32,
    pub l_flag: u32,
}

impl Default for SerialAttrs {
    /// 8 data bits, local connection, receiver enabled.
    fn default() -> Self {
        Self {
            c_flag: flags::CS8 | flags::CLOCAL | flags::CREAD,
            i_flag: 0,
            o_flag: 0,
            l_flag: 0,
        }
    }
}

/// Byte-level serial capability consumed by the comm handle.
///
/// `receive` returning `Ok(0)` means "no data yet, retry"; a dead file
/// handle surfaces as [`CommError::DeviceClosed`] from either direction.
pub trait SerialDevice: Send {
    fn is_open(&self) -> bool;

    fn close(&mut self);

    /// Write bytes, returning how many were accepted (0 on a transient
    /// write failure). Fails with `DeviceClosed` if the device is not open
    /// at call time.
    fn send(&mut self, data: &[u8]) -> Result<usize, CommError>;

    /// Read available bytes into `buf` without blocking indefinitely.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, CommError>;

    /// Second handle onto the same underlying device, so reads and writes
    /// can be guarded by separate locks.
    fn try_clone(&self) -> Result<Box<dyn SerialDevice>, CommError>;
}

/// A TTY serial port.
pub struct TtyPort {
    port: Option<Box<dyn SerialPort>>,
    path: Option<String>,
    baud: u32,
    attrs: SerialAttrs,
}

impl TtyPort {
    pub fn new() -> Self {
        Self {
            port: None,
            path: None,
            baud: DEFAULT_BAUD_RATE,
            attrs: SerialAttrs::default(),
        }
    }

    /// Attempt to open `path` at the given rate. Returns `false` on an
    /// unsupported rate or any open/configure failure; failures are logged,
    /// not raised, so callers can retry on a cadence.
    pub fn open(&mut self, path: &str, rate: u32, attrs: &SerialAttrs) -> bool {
        let Some(numeric) = baud::normalize(rate) else {
            eprintln!("[WARN] open: unsupported baud rate {rate} for {path}");
            return false;
        };

        self.close();

        match serialport::new(path, numeric).timeout(READ_TIMEOUT).open() {
            Ok(mut port) => {
                if let Err(e) = apply_attrs(port.as_mut(), attrs) {
                    eprintln!("[DEBUG] open: failed to configure {path}: {e}");
                    return false;
                }
                self.port = Some(port);
                self.path = Some(path.to_string());
                self.baud = numeric;
                self.attrs = *attrs;
                true
            }
            Err(e) => {
                eprintln!("[DEBUG] open: {path}: {e}");
                false
            }
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Change the baud rate on the open port. Accepts numeric rates or
    /// platform flags, like [`open`](Self::open).
    pub fn set_baud(&mut self, rate: u32) -> Result<(), CommError> {
        let numeric = baud::normalize(rate).ok_or(CommError::UnsupportedBaud(rate))?;
        if let Some(port) = self.port.as_mut() {
            port.set_baud_rate(numeric)
                .map_err(|e| CommError::SerialError(e.to_string()))?;
        }
        self.baud = numeric;
        Ok(())
    }

    /// Set control-mode bits and re-apply the attribute bundle.
    pub fn add_flag(&mut self, flag: u32) -> Result<(), CommError> {
        self.attrs.c_flag |= flag;
        self.reapply()
    }

    /// Clear control-mode bits and re-apply the attribute bundle.
    pub fn remove_flag(&mut self, flag: u32) -> Result<(), CommError> {
        self.attrs.c_flag &= !flag;
        self.reapply()
    }

    fn reapply(&mut self) -> Result<(), CommError> {
        let attrs = self.attrs;
        match self.port.as_mut() {
            Some(port) => apply_attrs(port.as_mut(), &attrs),
            None => Ok(()),
        }
    }

    /// Clone sharing the same file handle.
    pub fn try_clone_port(&self) -> Result<TtyPort, CommError> {
        let port = self.port.as_ref().ok_or(CommError::DeviceClosed)?;
        let clone = port
            .try_clone()
            .map_err(|e| CommError::SerialError(e.to_string()))?;
        Ok(TtyPort {
            port: Some(clone),
            path: self.path.clone(),
            baud: self.baud,
            attrs: self.attrs,
        })
    }
}

impl Default for TtyPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialDevice for TtyPort {
    fn is_open(&self) -> bool {
        // Probes the handle rather than trusting `Some`: the device may
        // have disappeared underneath us.
        match &self.port {
            Some(port) => port.bytes_to_write().is_ok(),
            None => false,
        }
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, CommError> {
        if !self.is_open() {
            self.port = None;
            return Err(CommError::DeviceClosed);
        }
        let port = self.port.as_mut().ok_or(CommError::DeviceClosed)?;
        match port.write(data) {
            Ok(n) => Ok(n),
            Err(e) if is_transient(e.kind()) => Ok(0),
            Err(_) => {
                self.port = None;
                Err(CommError::DeviceClosed)
            }
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, CommError> {
        let port = self.port.as_mut().ok_or(CommError::DeviceClosed)?;
        match port.read(buf) {
            // EOF from a serial handle means the device went away.
            Ok(0) => {
                self.port = None;
                Err(CommError::DeviceClosed)
            }
            Ok(n) => Ok(n),
            Err(e) if is_transient(e.kind()) => Ok(0),
            Err(_) => {
                self.port = None;
                Err(CommError::DeviceClosed)
            }
        }
    }

    fn try_clone(&self) -> Result<Box<dyn SerialDevice>, CommError> {
        Ok(Box::new(self.try_clone_port()?))
    }
}

fn is_transient(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
    )
}

/// Map the attribute bundle onto the port settings the serial API exposes.
fn apply_attrs(port: &mut dyn SerialPort, attrs: &SerialAttrs) -> Result<(), CommError> {
    let data_bits = match attrs.c_flag & flags::CSIZE {
        flags::CS8 => DataBits::Eight,
        flags::CS7 => DataBits::Seven,
        flags::CS6 => DataBits::Six,
        _ => DataBits::Five,
    };
    let parity = if attrs.c_flag & flags::PARENB != 0 {
        if attrs.c_flag & flags::PARODD != 0 {
            Parity::Odd
        } else {
            Parity::Even
        }
    } else {
        Parity::None
    };
    let stop_bits = if attrs.c_flag & flags::CSTOPB != 0 {
        StopBits::Two
    } else {
        StopBits::One
    };
    let flow_control = if attrs.c_flag & flags::CRTSCTS != 0 {
        FlowControl::Hardware
    } else if attrs.i_flag & (flags::IXON | flags::IXOFF) != 0 {
        FlowControl::Software
    } else {
        FlowControl::None
    };

    port.set_data_bits(data_bits)
        .map_err(|e| CommError::SerialError(e.to_string()))?;
    port.set_parity(parity)
        .map_err(|e| CommError::SerialError(e.to_string()))?;
    port.set_stop_bits(stop_bits)
        .map_err(|e| CommError::SerialError(e.to_string()))?;
    port.set_flow_control(flow_control)
        .map_err(|e| CommError::SerialError(e.to_string()))?;
    Ok(())
}

/// Candidate serial devices under `dev_dir`: entries named `ttyUSB<n>` or
/// `ttyACM<n>`, returned as full paths in lexicographic order.
pub fn scan_ports(dev_dir: &Path) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Ok(entries) = fs::read_dir(dev_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_tty_candidate(name) {
                candidates.push(entry.path().to_string_lossy().into_owned());
            }
        }
    }
    candidates.sort();
    candidates
}

fn is_tty_candidate(name: &str) -> bool {
    let digits = name
        .strip_prefix("ttyUSB")
        .or_else(|| name.strip_prefix("ttyACM"));
    matches!(digits, Some(d) if !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn normalize_accepts_table_rates() {
        assert_eq!(baud::normalize(115_200), Some(115_200));
        assert_eq!(baud::normalize(9_600), Some(9_600));
        assert_eq!(baud::normalize(4_000_000), Some(4_000_000));
        assert_eq!(baud::normalize(0), Some(0));
    }

    #[test]
    fn normalize_accepts_platform_flags() {
        assert_eq!(baud::normalize(baud::B115200), Some(115_200));
        assert_eq!(baud::normalize(baud::B38400), Some(38_400));
        assert_eq!(baud::normalize(baud::B4000000), Some(4_000_000));
    }

    #[test]
    fn normalize_rejects_unknown_rates() {
        assert_eq!(baud::normalize(12_345), None);
        assert_eq!(baud::normalize(115_201), None);
        assert_eq!(baud::normalize(u32::MAX), None);
    }

    #[test]
    fn default_attrs_enable_eight_bit_local_receive() {
        let attrs = SerialAttrs::default();
        assert_eq!(attrs.c_flag & flags::CSIZE, flags::CS8);
        assert_ne!(attrs.c_flag & flags::CLOCAL, 0);
        assert_ne!(attrs.c_flag & flags::CREAD, 0);
        assert_eq!(attrs.i_flag, 0);
        assert_eq!(attrs.o_flag, 0);
        assert_eq!(attrs.l_flag, 0);
    }

    #[test]
    fn tty_candidate_names() {
        assert!(is_tty_candidate("ttyUSB0"));
        assert!(is_tty_candidate("ttyACM12"));
        assert!(!is_tty_candidate("ttyS0"));
        assert!(!is_tty_candidate("ttyUSB"));
        assert!(!is_tty_candidate("ttyUSBx"));
        assert!(!is_tty_candidate("ttyACM1a"));
        assert!(!is_tty_candidate("usbtty0"));
    }

    #[test]
    fn scan_finds_candidates_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB1", "ttyACM0", "ttyUSB0", "ttyS0", "random"] {
            File::create(dir.path().join(name)).unwrap();
        }

        let found = scan_ports(dir.path());
        let names: Vec<_> = found
            .iter()
            .map(|p| p.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["ttyACM0", "ttyUSB0", "ttyUSB1"]);
    }

    #[test]
    fn scan_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dir");
        assert!(scan_ports(&missing).is_empty());
    }

    #[test]
    fn closed_port_reports_device_closed() {
        let mut port = TtyPort::new();
        assert!(!port.is_open());
        assert!(matches!(port.send(&[0x01]), Err(CommError::DeviceClosed)));
        let mut buf = [0u8; 8];
        assert!(matches!(
            port.receive(&mut buf),
            Err(CommError::DeviceClosed)
        ));
        assert!(matches!(
            SerialDevice::try_clone(&port),
            Err(CommError::DeviceClosed)
        ));
    }

    #[test]
    fn open_rejects_unsupported_baud() {
        let mut port = TtyPort::new();
        assert!(!port.open("/dev/null", 123, &SerialAttrs::default()));
        assert!(!port.is_open());
    }

    #[test]
    fn attribute_mutators_work_while_closed() {
        let mut port = TtyPort::new();
        port.add_flag(flags::CSTOPB).unwrap();
        port.remove_flag(flags::CREAD).unwrap();
        assert!(port.set_baud(9_600).is_ok());
        assert_eq!(port.baud(), 9_600);
        assert!(matches!(
            port.set_baud(123),
            Err(CommError::UnsupportedBaud(123))
        ));
    }
}
