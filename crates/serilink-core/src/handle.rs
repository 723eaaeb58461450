//! Comm handle: publishers, subscribers, and the receive loop
//!
//! A [`CommHandle`] owns one serial device, the subscriber registry, and the
//! background receive loop. Writes go through a send lock, reads through a
//! receive lock (two handles onto the same device), so publishers on any
//! thread never interleave frame bytes and the receive thread never races a
//! reconnect.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytemuck::Pod;

use crate::decoder::FrameDecoder;
use crate::error::CommError;
use crate::frame::FrameCodec;
use crate::serial::{baud, scan_ports, SerialAttrs, SerialDevice, TtyPort, DEFAULT_BAUD_RATE};

const RETRY_DELAY: Duration = Duration::from_secs(1);
const RECV_BUFFER_SIZE: usize = 1024;
const DEV_DIR: &str = "/dev";

type RawCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Type-erased registry entry: the expected payload length and the callback
/// taking exactly that many bytes.
struct Subscriber {
    data_len: usize,
    callback: RawCallback,
}

#[derive(Clone)]
struct LinkConfig {
    /// Remembered device path; `None` for handles that scan for a device.
    device: Option<String>,
    rate: u32,
    attrs: SerialAttrs,
}

struct Shared {
    // Lock order: tx before rx, always.
    tx: Mutex<Box<dyn SerialDevice>>,
    rx: Mutex<Box<dyn SerialDevice>>,
    subscribers: RwLock<HashMap<u16, Subscriber>>,
    codec: FrameCodec,
    link: Mutex<LinkConfig>,
    receiving: AtomicBool,
    reconnect: AtomicBool,
}

impl Shared {
    fn lock_tx(&self) -> MutexGuard<'_, Box<dyn SerialDevice>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_rx(&self) -> MutexGuard<'_, Box<dyn SerialDevice>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link(&self) -> LinkConfig {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reconnection controller. Takes both port locks (send first), then
    /// reopens the remembered device path or rescans for candidates,
    /// retrying every second. Publishers queue on the send lock and the
    /// receive thread on the receive lock for the duration.
    ///
    /// With `force` the current device is closed and reopened even if it
    /// still looks healthy. With `respect_stop` the retry loop gives up once
    /// receiving is switched off, so a stopped handle can be dropped while
    /// the device is gone.
    fn reopen_blocking(&self, force: bool, respect_stop: bool) -> bool {
        let mut tx = self.lock_tx();
        let mut rx = self.lock_rx();

        if force {
            tx.close();
            rx.close();
        } else if tx.is_open() && rx.is_open() {
            // Another thread already brought the link back.
            return true;
        }

        let link = self.link();
        loop {
            if respect_stop && !self.receiving.load(Ordering::Acquire) {
                return false;
            }

            let opened = match &link.device {
                Some(path) => open_device(path, link.rate, &link.attrs),
                None => open_any_device(link.rate, &link.attrs),
            };

            match opened {
                Some((new_tx, new_rx)) => {
                    *tx = new_tx;
                    *rx = new_rx;
                    eprintln!("[INFO] reconnect: serial link restored");
                    return true;
                }
                None => {
                    match &link.device {
                        Some(path) => eprintln!(
                            "[INFO] reconnect: cannot open serial port {path}, retrying in 1s"
                        ),
                        None => eprintln!(
                            "[INFO] reconnect: no serial device available, rescanning in 1s"
                        ),
                    }
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
    }
}

/// Open a device path and split it into a (writer, reader) pair sharing the
/// file handle.
fn open_device(
    path: &str,
    rate: u32,
    attrs: &SerialAttrs,
) -> Option<(Box<dyn SerialDevice>, Box<dyn SerialDevice>)> {
    let mut port = TtyPort::new();
    if !port.open(path, rate, attrs) {
        return None;
    }
    match port.try_clone_port() {
        Ok(reader) => Some((Box::new(port), Box::new(reader))),
        Err(e) => {
            eprintln!("[DEBUG] open_device: cannot clone handle for {path}: {e}");
            None
        }
    }
}

fn open_any_device(
    rate: u32,
    attrs: &SerialAttrs,
) -> Option<(Box<dyn SerialDevice>, Box<dyn SerialDevice>)> {
    for path in scan_ports(Path::new(DEV_DIR)) {
        if let Some(pair) = open_device(&path, rate, attrs) {
            eprintln!("[INFO] auto_connect: using serial port {path}");
            return Some(pair);
        }
    }
    None
}

/// Handle to one serial link carrying typed command frames.
///
/// Subscribers should be registered before receiving starts; callbacks run
/// on the receive thread and must not call back into the registry.
pub struct CommHandle {
    shared: Arc<Shared>,
    daemon: Mutex<Option<JoinHandle<()>>>,
}

impl CommHandle {
    /// Adopt an already-open device.
    pub fn from_device(device: Box<dyn SerialDevice>, sof: u8) -> Result<Self, CommError> {
        let reader = device.try_clone()?;
        let link = LinkConfig {
            device: None,
            rate: DEFAULT_BAUD_RATE,
            attrs: SerialAttrs::default(),
        };
        Ok(Self::assemble(device, reader, sof, link))
    }

    /// Open a specific device, retrying every second until it opens.
    pub fn open(path: &str, rate: u32, sof: u8) -> Result<Self, CommError> {
        baud::normalize(rate).ok_or(CommError::UnsupportedBaud(rate))?;
        let attrs = SerialAttrs::default();
        let (tx, rx) = loop {
            if let Some(pair) = open_device(path, rate, &attrs) {
                break pair;
            }
            eprintln!("[INFO] open: cannot open serial port {path}, retrying in 1s");
            thread::sleep(RETRY_DELAY);
        };
        let link = LinkConfig {
            device: Some(path.to_string()),
            rate,
            attrs,
        };
        Ok(Self::assemble(tx, rx, sof, link))
    }

    /// Scan for candidate devices and open the first that succeeds,
    /// rescanning every second until one does.
    pub fn open_any(rate: u32, sof: u8) -> Result<Self, CommError> {
        baud::normalize(rate).ok_or(CommError::UnsupportedBaud(rate))?;
        let attrs = SerialAttrs::default();
        let (tx, rx) = loop {
            if let Some(pair) = open_any_device(rate, &attrs) {
                break pair;
            }
            eprintln!("[INFO] open_any: no serial device available, rescanning in 1s");
            thread::sleep(RETRY_DELAY);
        };
        let link = LinkConfig {
            device: None,
            rate,
            attrs,
        };
        Ok(Self::assemble(tx, rx, sof, link))
    }

    fn assemble(
        tx: Box<dyn SerialDevice>,
        rx: Box<dyn SerialDevice>,
        sof: u8,
        link: LinkConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tx: Mutex::new(tx),
                rx: Mutex::new(rx),
                subscribers: RwLock::new(HashMap::new()),
                codec: FrameCodec::new(sof),
                link: Mutex::new(link),
                receiving: AtomicBool::new(false),
                reconnect: AtomicBool::new(false),
            }),
            daemon: Mutex::new(None),
        }
    }

    /// Reopen on a specific device, blocking until it opens.
    pub fn connect(&self, path: &str, rate: u32) -> Result<(), CommError> {
        baud::normalize(rate).ok_or(CommError::UnsupportedBaud(rate))?;
        {
            let mut link = self
                .shared
                .link
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            link.device = Some(path.to_string());
            link.rate = rate;
        }
        self.shared.reopen_blocking(true, false);
        Ok(())
    }

    /// Rescan for candidate devices and reopen, blocking until one opens.
    pub fn auto_connect(&self, rate: u32) -> Result<(), CommError> {
        baud::normalize(rate).ok_or(CommError::UnsupportedBaud(rate))?;
        {
            let mut link = self
                .shared
                .link
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            link.device = None;
            link.rate = rate;
        }
        self.shared.reopen_blocking(true, false);
        Ok(())
    }

    /// Typed publisher for one command id. The publisher shares this
    /// handle's link and sequence counter.
    pub fn advertise<T: Pod>(&self, command: u16) -> Publisher<T> {
        Publisher {
            shared: Arc::clone(&self.shared),
            command,
            _payload: PhantomData,
        }
    }

    /// Register (or replace) the subscriber for one command id.
    ///
    /// The callback receives payloads of exactly `size_of::<T>()` bytes,
    /// decoded into `T`; frames for this command with any other payload
    /// length are dropped with a warning.
    pub fn subscribe<T, F>(&self, command: u16, callback: F)
    where
        T: Pod,
        F: Fn(T) + Send + Sync + 'static,
    {
        let subscriber = Subscriber {
            data_len: mem::size_of::<T>(),
            callback: Box::new(move |bytes| callback(bytemuck::pod_read_unaligned(bytes))),
        };
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command, subscriber);
    }

    /// Run the receive loop on the calling thread until
    /// [`stop_receiving`](Self::stop_receiving) is called from elsewhere.
    /// Returns `false` if the handle was already receiving.
    pub fn start_receiving(&self) -> bool {
        if self.shared.receiving.swap(true, Ordering::AcqRel) {
            return false;
        }
        receive_loop(&self.shared);
        true
    }

    /// Run the receive loop on a background thread. Returns `false` if the
    /// handle was already receiving or the thread could not be spawned.
    pub fn start_receiving_async(&self) -> bool {
        if self.shared.receiving.swap(true, Ordering::AcqRel) {
            return false;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("serilink-recv".into())
            .spawn(move || receive_loop(&shared));
        match spawned {
            Ok(handle) => {
                *self.daemon.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                true
            }
            Err(e) => {
                self.shared.receiving.store(false, Ordering::Release);
                eprintln!("[WARN] start_receiving_async: cannot spawn receive thread: {e}");
                false
            }
        }
    }

    /// Ask the receive loop to exit after its current read, and join the
    /// background thread if one is running. The partial frame in flight, if
    /// any, is discarded.
    pub fn stop_receiving(&self) {
        self.shared.receiving.store(false, Ordering::Release);
        let daemon = self
            .daemon
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = daemon {
            let _ = handle.join();
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.shared.receiving.load(Ordering::Acquire)
    }

    /// Enable automatic reconnection when the device closes underneath a
    /// send or receive.
    pub fn set_reconnect(&self, enabled: bool) {
        self.shared.reconnect.store(enabled, Ordering::Release);
    }

    pub fn sof(&self) -> u8 {
        self.shared.codec.sof()
    }
}

impl Drop for CommHandle {
    fn drop(&mut self) {
        self.stop_receiving();
    }
}

/// Typed frame publisher for one command id.
///
/// Obtained from [`CommHandle::advertise`]; holds the link shared with its
/// handle, so it stays valid for the handle's lifetime and may be moved to
/// any thread.
pub struct Publisher<T> {
    shared: Arc<Shared>,
    command: u16,
    _payload: PhantomData<T>,
}

impl<T: Pod> Publisher<T> {
    pub fn command(&self) -> u16 {
        self.command
    }

    /// Build a frame around `data` and write it to the link.
    ///
    /// Returns `Ok(true)` when the whole frame was accepted by the device.
    /// On a closed device this reconnects and reports `Ok(false)` when
    /// automatic reconnection is on, and fails with
    /// [`CommError::DeviceClosed`] otherwise.
    pub fn publish(&self, data: &T) -> Result<bool, CommError> {
        let frame = self.shared.codec.encode(self.command, bytemuck::bytes_of(data));
        let sent = {
            let mut tx = self.shared.lock_tx();
            tx.send(&frame)
        };
        match sent {
            Ok(n) => Ok(n == frame.len()),
            Err(CommError::DeviceClosed) => {
                if self.shared.reconnect.load(Ordering::Acquire) {
                    eprintln!("[WARN] publish: serial device closed, reconnecting");
                    self.shared.reopen_blocking(false, false);
                    Ok(false)
                } else {
                    Err(CommError::DeviceClosed)
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            command: self.command,
            _payload: PhantomData,
        }
    }
}

fn receive_loop(shared: &Shared) {
    let mut decoder = FrameDecoder::new(shared.codec.sof());
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    while shared.receiving.load(Ordering::Acquire) {
        let read = {
            let mut rx = shared.lock_rx();
            rx.receive(&mut buf)
        };
        match read {
            Ok(0) => continue,
            Ok(n) => {
                for &byte in &buf[..n] {
                    if let Some(frame) = decoder.push_byte(byte) {
                        dispatch(shared, frame.command, frame.payload);
                    }
                }
            }
            Err(CommError::DeviceClosed) => {
                if shared.reconnect.load(Ordering::Acquire) {
                    eprintln!("[WARN] receive_loop: serial device closed, reconnecting");
                    if !shared.reopen_blocking(false, true) {
                        break;
                    }
                } else {
                    eprintln!("[WARN] receive_loop: serial device closed, stopping");
                    shared.receiving.store(false, Ordering::Release);
                }
            }
            Err(e) => {
                eprintln!("[WARN] receive_loop: receive failed: {e}");
            }
        }
    }
}

fn dispatch(shared: &Shared, command: u16, payload: &[u8]) {
    let subscribers = shared
        .subscribers
        .read()
        .unwrap_or_else(PoisonError::into_inner);
    match subscribers.get(&command) {
        Some(subscriber) if subscriber.data_len == payload.len() => {
            (subscriber.callback)(payload);
        }
        Some(subscriber) => {
            eprintln!(
                "[WARN] receive_loop: command {command:#06x} carried {} bytes, subscriber expects {}",
                payload.len(),
                subscriber.data_len
            );
        }
        None => {
            eprintln!("[WARN] receive_loop: no subscriber for command {command:#06x}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DEFAULT_SOF;

    struct NullDevice;

    impl SerialDevice for NullDevice {
        fn is_open(&self) -> bool {
            false
        }
        fn close(&mut self) {}
        fn send(&mut self, _data: &[u8]) -> Result<usize, CommError> {
            Err(CommError::DeviceClosed)
        }
        fn receive(&mut self, _buf: &mut [u8]) -> Result<usize, CommError> {
            Err(CommError::DeviceClosed)
        }
        fn try_clone(&self) -> Result<Box<dyn SerialDevice>, CommError> {
            Ok(Box::new(NullDevice))
        }
    }

    #[test]
    fn unsupported_baud_is_rejected_before_any_retry_loop() {
        assert!(matches!(
            CommHandle::open("/dev/ttyUSB0", 123, DEFAULT_SOF),
            Err(CommError::UnsupportedBaud(123))
        ));
        assert!(matches!(
            CommHandle::open_any(99_999, DEFAULT_SOF),
            Err(CommError::UnsupportedBaud(99_999))
        ));
    }

    #[test]
    fn connect_validates_the_rate_before_blocking() {
        let comm = CommHandle::from_device(Box::new(NullDevice), DEFAULT_SOF).unwrap();
        assert!(matches!(
            comm.connect("/dev/ttyUSB0", 123),
            Err(CommError::UnsupportedBaud(123))
        ));
        assert!(matches!(
            comm.auto_connect(77),
            Err(CommError::UnsupportedBaud(77))
        ));
    }

    #[test]
    fn handle_state_accessors() {
        let comm = CommHandle::from_device(Box::new(NullDevice), 0x7E).unwrap();
        assert_eq!(comm.sof(), 0x7E);
        assert!(!comm.is_receiving());
        comm.set_reconnect(true);
        comm.set_reconnect(false);

        let publisher = comm.advertise::<u32>(0x0001);
        assert_eq!(publisher.command(), 0x0001);
    }
}
