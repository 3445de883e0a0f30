//! Serial (UART / USB CDC ACM) transport with SLIP framing.
//!
//! A reader thread feeds incoming bytes through the SLIP decoder and
//! hands complete frames over a channel; request/response timeouts are
//! receive timeouts on that channel. The transport can also kick an
//! application-mode device into its bootloader first by sending a
//! `DFU_DETACH` control request and waiting for the bootloader's serial
//! port to enumerate.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use nusb::transfer::{ControlOut, ControlType, Recipient};
use serialport::{SerialPort, SerialPortType};

use super::slip;
use super::{op_frame, parse_response, DfuTransport, OpCode};
use crate::error::{Error, Result};

/// VID/PID pairs the bootloader's serial port enumerates with.
const BOOTLOADER_IDS: [(u16, u16); 3] = [(0x1915, 0x521F), (0x1366, 0x0105), (0x1366, 0x1015)];

/// DFU 1.1 DETACH request.
const DFU_DETACH: u8 = 0x00;
const DETACH_TIMEOUT_MS: u16 = 1000;

/// Re-enumeration poll: 10 rounds of 500 ms.
const ENUM_POLL_INTERVAL: Duration = Duration::from_millis(500);
const ENUM_POLL_ROUNDS: u32 = 10;

const PING_TIMEOUT: Duration = Duration::from_millis(500);

/// Handshake budget when the caller does not set one.
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Frames buffered between the reader thread and `recv_op`.
const FRAME_QUEUE: usize = 16;

/// SLIP can double every byte and adds a terminator, so only
/// `(mtu - 1) / 2` unencoded bytes fit a frame; one more goes to the
/// write opcode.
fn fragment_size(mtu: u16) -> usize {
    let mtu = mtu as usize;
    if mtu <= 3 {
        return 0;
    }
    (mtu - 1) / 2 - 1
}

/// Ping rounds that fit the handshake budget, one per `PING_TIMEOUT`.
fn ping_attempts(open_timeout: Duration) -> u32 {
    (open_timeout.as_millis() / PING_TIMEOUT.as_millis()).max(1) as u32
}

struct OpenPort {
    writer: Box<dyn SerialPort>,
    frames: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    mtu: u16,
}

impl Drop for OpenPort {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// SLIP-framed serial transport.
pub struct SerialTransport {
    port_name: Option<String>,
    baud_rate: u32,
    /// Application-mode VID/PID to detach into the bootloader first.
    trigger: Option<(u16, u16)>,
    /// Total time the open handshake keeps pinging a silent target.
    open_timeout: Duration,
    ping_id: u8,
    state: Option<OpenPort>,
}

impl SerialTransport {
    /// `port` pins a specific device; otherwise the first port with a
    /// known bootloader VID/PID is used.
    pub fn new(port: Option<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port,
            baud_rate,
            trigger: None,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            ping_id: 0,
            state: None,
        }
    }

    /// Total handshake budget: keep pinging a freshly rebooted target
    /// until it answers or `timeout` elapses.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Detach the application at `vid:pid` before looking for the
    /// bootloader port.
    pub fn with_trigger(mut self, vid: u16, pid: u16) -> Self {
        self.trigger = Some((vid, pid));
        self
    }

    /// First serial port enumerating with a known bootloader VID/PID.
    fn find_bootloader_port() -> Option<String> {
        let ports = serialport::available_ports().ok()?;
        for port in ports {
            if let SerialPortType::UsbPort(usb) = &port.port_type {
                if BOOTLOADER_IDS.contains(&(usb.vid, usb.pid)) {
                    return Some(port.port_name);
                }
            }
        }
        None
    }

    /// Send `DFU_DETACH` to the application-mode device so it reboots
    /// into the bootloader.
    fn detach(vid: u16, pid: u16) -> Result<()> {
        let info = nusb::list_devices()
            .map_err(|e| Error::Usb(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or_else(|| Error::DeviceNotFound(format!("usb device {vid:04x}:{pid:04x}")))?;
        let device = info.open().map_err(|e| Error::Usb(e.to_string()))?;
        let interface = device
            .claim_interface(0)
            .map_err(|e| Error::Usb(e.to_string()))?;

        info!("sending DFU_DETACH to {vid:04x}:{pid:04x}");
        let transfer = interface.control_out(ControlOut {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: DFU_DETACH,
            value: DETACH_TIMEOUT_MS,
            index: 0,
            data: &[],
        });
        // The device may drop off the bus mid-transfer; that still
        // counts as a successful detach.
        let _ = futures::executor::block_on(transfer).into_result();
        Ok(())
    }

    fn resolve_port(&self) -> Result<String> {
        if let Some(name) = &self.port_name {
            return Ok(name.clone());
        }
        if let Some((vid, pid)) = self.trigger {
            if Self::find_bootloader_port().is_none() {
                Self::detach(vid, pid)?;
            }
            for _ in 0..ENUM_POLL_ROUNDS {
                if let Some(name) = Self::find_bootloader_port() {
                    return Ok(name);
                }
                thread::sleep(ENUM_POLL_INTERVAL);
            }
        } else if let Some(name) = Self::find_bootloader_port() {
            return Ok(name);
        }
        Err(Error::DeviceNotFound(
            "no serial port with a known bootloader VID/PID".into(),
        ))
    }

    fn spawn_reader(mut port: Box<dyn SerialPort>, tx: SyncSender<Vec<u8>>, stop: Arc<AtomicBool>) {
        thread::spawn(move || {
            let mut decoder = slip::Decoder::new();
            let mut buf = [0u8; 256];
            loop {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                match port.read(&mut buf) {
                    Ok(0) => return,
                    Ok(n) => {
                        for &b in &buf[..n] {
                            if let Some(frame) = decoder.feed(b) {
                                debug!("frame in: {frame:02X?}");
                                if tx.send(frame).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(_) => return,
                }
            }
        });
    }

    fn open_state(&mut self) -> Result<&mut OpenPort> {
        self.state
            .as_mut()
            .ok_or_else(|| Error::Operation("serial transport not open".into()))
    }

    /// A raw request during setup, before the protocol core takes over.
    fn setup_request(&mut self, op: OpCode, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.send_op(&op_frame(op, payload))?;
        let frame = self.recv_op(timeout)?;
        parse_response(&frame, op)
    }

    /// Liveness probe: a ping with a fresh id must come back echoing
    /// it. The bootloader may still be settling right after the
    /// trigger, so a few attempts are allowed.
    fn handshake(&mut self) -> Result<()> {
        let mut last = Error::OperationTimeout;
        for _ in 0..ping_attempts(self.open_timeout) {
            self.ping_id = self.ping_id.wrapping_add(1);
            let id = self.ping_id;
            match self.setup_request(OpCode::Ping, &[id], PING_TIMEOUT) {
                Ok(payload) if payload.first() == Some(&id) => return Ok(()),
                Ok(payload) => {
                    last = Error::Operation(format!("ping echoed {payload:02X?}, sent {id:02X}"))
                }
                Err(e @ Error::OperationTimeout) => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    fn read_mtu(&mut self) -> Result<u16> {
        let payload = self.setup_request(OpCode::MtuGet, &[], PING_TIMEOUT)?;
        if payload.len() < 2 {
            return Err(Error::Operation("short MTU payload".into()));
        }
        Ok(LittleEndian::read_u16(&payload[..2]))
    }
}

impl DfuTransport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }

        let name = self.resolve_port()?;
        info!("opening {name} at {} baud", self.baud_rate);
        let writer = serialport::new(&name, self.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;
        let reader = writer.try_clone()?;

        let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE);
        let stop = Arc::new(AtomicBool::new(false));
        Self::spawn_reader(reader, tx, Arc::clone(&stop));

        self.state = Some(OpenPort {
            writer,
            frames: rx,
            stop,
            mtu: 0,
        });

        self.handshake()?;
        let mtu = self.read_mtu()?;
        debug!("serial MTU {mtu}");
        if let Some(state) = self.state.as_mut() {
            state.mtu = mtu;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.state = None;
    }

    fn packet_size(&self) -> usize {
        match &self.state {
            Some(state) => fragment_size(state.mtu),
            None => 0,
        }
    }

    fn send_op(&mut self, frame: &[u8]) -> Result<()> {
        let encoded = slip::encode(frame);
        let state = self.open_state()?;
        state.writer.write_all(&encoded)?;
        state.writer.flush()?;
        Ok(())
    }

    fn recv_op(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let state = self.open_state()?;
        match state.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(Error::OperationTimeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Operation("serial reader terminated".into()))
            }
        }
    }

    fn stream_data(&mut self, fragment: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(1 + fragment.len());
        frame.push(OpCode::ObjectWrite as u8);
        frame.extend_from_slice(fragment);
        self.send_op(&frame)
    }
}
