//! DFU object protocol: the request/response state machine spoken to a
//! target in bootloader mode.
//!
//! Firmware travels as a sequence of *objects*. The init packet is a
//! single command object; the firmware binary is split into data
//! objects of the target-reported maximum size. Each object is created,
//! streamed in transport-sized fragments, CRC-checked, and executed.
//! The select operation reports how much of the current object the
//! target already holds, which is what makes interrupted transfers
//! resumable.
//!
//! Transports only move frames. Everything protocol-shaped lives in
//! [`DfuTarget`], behind the [`DfuTransport`] seam.

pub mod ble;
pub mod serial;
pub mod slip;

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use crate::crc::{crc32, Crc32Digest};
use crate::error::{Error, Result};
use crate::package::PackageImage;

/// Protocol operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    ProtocolVersion = 0x00,
    ObjectCreate = 0x01,
    PrnSet = 0x02,
    CrcGet = 0x03,
    ObjectExecute = 0x04,
    ObjectSelect = 0x06,
    MtuGet = 0x07,
    ObjectWrite = 0x08,
    Ping = 0x09,
    HwVersion = 0x0A,
    FwVersion = 0x0B,
    Abort = 0x0C,
}

/// First byte of every response frame.
pub const RESPONSE_MARK: u8 = 0x60;

/// Result codes carried in the third byte of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtError = 0x0B,
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => ResultCode::Success,
            0x02 => ResultCode::OpCodeNotSupported,
            0x03 => ResultCode::InvalidParameter,
            0x04 => ResultCode::InsufficientResources,
            0x05 => ResultCode::InvalidObject,
            0x07 => ResultCode::UnsupportedType,
            0x08 => ResultCode::OperationNotPermitted,
            0x0A => ResultCode::OperationFailed,
            0x0B => ResultCode::ExtError,
            _ => ResultCode::Invalid,
        }
    }
}

/// Detail byte following a [`ResultCode::ExtError`] result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtError {
    NoError = 0x00,
    InvalidErrorCode = 0x01,
    WrongCommandFormat = 0x02,
    UnknownCommand = 0x03,
    InitCommandInvalid = 0x04,
    FwVersionFailure = 0x05,
    HwVersionFailure = 0x06,
    SdVersionFailure = 0x07,
    SignatureMissing = 0x08,
    WrongHashType = 0x09,
    HashFailed = 0x0A,
    WrongSignatureType = 0x0B,
    VerificationFailed = 0x0C,
    InsufficientSpace = 0x0D,
    FwAlreadyPresent = 0x0E,
}

impl From<u8> for ExtError {
    fn from(value: u8) -> Self {
        match value {
            0x01 => ExtError::InvalidErrorCode,
            0x02 => ExtError::WrongCommandFormat,
            0x03 => ExtError::UnknownCommand,
            0x04 => ExtError::InitCommandInvalid,
            0x05 => ExtError::FwVersionFailure,
            0x06 => ExtError::HwVersionFailure,
            0x07 => ExtError::SdVersionFailure,
            0x08 => ExtError::SignatureMissing,
            0x09 => ExtError::WrongHashType,
            0x0A => ExtError::HashFailed,
            0x0B => ExtError::WrongSignatureType,
            0x0C => ExtError::VerificationFailed,
            0x0D => ExtError::InsufficientSpace,
            0x0E => ExtError::FwAlreadyPresent,
            _ => ExtError::NoError,
        }
    }
}

/// Object class for select and create operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectClass {
    Command = 0x01,
    Data = 0x02,
}

/// Reply to an object select: the target's object-size limit and how
/// much of the current object it already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub max_size: u32,
    pub offset: u32,
    pub crc: u32,
}

/// Reply to a CRC request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    pub offset: u32,
    pub crc: u32,
}

/// Target hardware description from the HW VERSION read-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareVersion {
    /// Part number, e.g. 0x52840.
    pub part: u32,
    pub variant: u32,
    pub rom_size: u32,
    pub ram_size: u32,
    pub rom_page_size: u32,
}

/// Firmware slot kinds reported by the FW VERSION read-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareType {
    SoftDevice,
    Application,
    Bootloader,
    Unknown(u8),
}

impl From<u8> for FirmwareType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => FirmwareType::SoftDevice,
            0x01 => FirmwareType::Application,
            0x02 => FirmwareType::Bootloader,
            other => FirmwareType::Unknown(other),
        }
    }
}

/// One firmware slot from the FW VERSION read-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub fw_type: FirmwareType,
    pub version: u32,
    pub addr: u32,
    pub len: u32,
}

/// Build a request frame: opcode byte followed by the payload.
pub(crate) fn op_frame(op: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(op as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Validate a response frame against the opcode it answers and return
/// the payload.
pub(crate) fn parse_response(frame: &[u8], op: OpCode) -> Result<Vec<u8>> {
    if frame.len() < 3 || frame[0] != RESPONSE_MARK {
        return Err(Error::Operation(format!(
            "not a response frame: {frame:02X?}"
        )));
    }
    if frame[1] != op as u8 {
        return Err(Error::Operation(format!(
            "response for opcode 0x{:02X}, expected 0x{:02X}",
            frame[1], op as u8
        )));
    }
    match ResultCode::from(frame[2]) {
        ResultCode::Success => Ok(frame[3..].to_vec()),
        ResultCode::ExtError => Err(Error::Response {
            result: ResultCode::ExtError,
            ext: Some(ExtError::from(*frame.get(3).unwrap_or(&0))),
        }),
        result => Err(Error::Response { result, ext: None }),
    }
}

fn read_u32_pair(payload: &[u8]) -> Result<(u32, u32)> {
    if payload.len() < 8 {
        return Err(Error::Operation(format!(
            "short payload: {} bytes",
            payload.len()
        )));
    }
    Ok((
        LittleEndian::read_u32(&payload[0..4]),
        LittleEndian::read_u32(&payload[4..8]),
    ))
}

/// Transport seam between the protocol core and the physical links.
///
/// `send_op`/`recv_op` carry request and response frames; `stream_data`
/// carries firmware fragments, which get no per-fragment reply. The
/// fragment size a transport can carry is fixed once it is open.
pub trait DfuTransport {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);

    /// Largest `stream_data` fragment, in bytes.
    fn packet_size(&self) -> usize;

    fn send_op(&mut self, frame: &[u8]) -> Result<()>;
    fn recv_op(&mut self, timeout: Duration) -> Result<Vec<u8>>;
    fn stream_data(&mut self, fragment: &[u8]) -> Result<()>;
}

/// Observer hooks for a transfer in progress. Dispatch is synchronous,
/// on the caller's thread.
#[derive(Default)]
pub struct DfuEvents {
    progress: Option<Box<dyn FnMut(u32, u32) + Send>>,
    timeout: Option<Box<dyn FnMut() + Send>>,
    error: Option<Box<dyn FnMut(&Error) + Send>>,
}

/// Delay between images of a multi-image update, giving the target time
/// to settle after the post-execute reset.
const REBOOT_DELAY: Duration = Duration::from_secs(4);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Explicit CRC checkpoint interval, in fragments. The target-side
/// notification feature is disabled and the host requests a checksum
/// itself every `prn` fragments, so checkpoint cadence does not depend
/// on the transport delivering unsolicited frames.
const DEFAULT_PRN: u16 = 16;

/// Attempts per data object before the transfer is abandoned.
const OBJECT_RETRIES: u32 = 3;

/// A DFU target behind some transport, driven through the object
/// protocol.
pub struct DfuTarget<T: DfuTransport> {
    transport: T,
    prn: u16,
    timeout: Duration,
    events: DfuEvents,
}

impl<T: DfuTransport> DfuTarget<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            prn: DEFAULT_PRN,
            timeout: DEFAULT_TIMEOUT,
            events: DfuEvents::default(),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Checkpoint interval in fragments; 0 disables mid-object
    /// checkpoints.
    pub fn set_prn_interval(&mut self, prn: u16) {
        self.prn = prn;
    }

    pub fn on_progress(&mut self, f: impl FnMut(u32, u32) + Send + 'static) {
        self.events.progress = Some(Box::new(f));
    }

    pub fn on_timeout(&mut self, f: impl FnMut() + Send + 'static) {
        self.events.timeout = Some(Box::new(f));
    }

    pub fn on_error(&mut self, f: impl FnMut(&Error) + Send + 'static) {
        self.events.error = Some(Box::new(f));
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn request(&mut self, op: OpCode, payload: &[u8]) -> Result<Vec<u8>> {
        self.transport.send_op(&op_frame(op, payload))?;
        match self.transport.recv_op(self.timeout) {
            Ok(frame) => parse_response(&frame, op),
            Err(e @ Error::OperationTimeout) => {
                if let Some(f) = &mut self.events.timeout {
                    f();
                }
                self.transport.close();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Tell the target not to send unsolicited CRC notifications; the
    /// host checkpoints explicitly instead.
    pub fn disable_receipt_notifications(&mut self) -> Result<()> {
        let mut payload = [0u8; 2];
        LittleEndian::write_u16(&mut payload, 0);
        self.request(OpCode::PrnSet, &payload)?;
        Ok(())
    }

    pub fn ping(&mut self, id: u8) -> Result<bool> {
        let payload = self.request(OpCode::Ping, &[id])?;
        Ok(payload.first() == Some(&id))
    }

    pub fn abort(&mut self) -> Result<()> {
        self.transport.send_op(&op_frame(OpCode::Abort, &[]))
    }

    pub fn select(&mut self, class: ObjectClass) -> Result<ObjectInfo> {
        let payload = self.request(OpCode::ObjectSelect, &[class as u8])?;
        if payload.len() < 12 {
            return Err(Error::Operation(format!(
                "short select payload: {} bytes",
                payload.len()
            )));
        }
        let info = ObjectInfo {
            max_size: LittleEndian::read_u32(&payload[0..4]),
            offset: LittleEndian::read_u32(&payload[4..8]),
            crc: LittleEndian::read_u32(&payload[8..12]),
        };
        debug!("select {class:?}: {info:?}");
        Ok(info)
    }

    pub fn create(&mut self, class: ObjectClass, size: u32) -> Result<()> {
        let mut payload = [0u8; 5];
        payload[0] = class as u8;
        LittleEndian::write_u32(&mut payload[1..], size);
        self.request(OpCode::ObjectCreate, &payload)?;
        Ok(())
    }

    pub fn checksum(&mut self) -> Result<Checksum> {
        let payload = self.request(OpCode::CrcGet, &[])?;
        let (offset, crc) = read_u32_pair(&payload)?;
        Ok(Checksum { offset, crc })
    }

    pub fn execute(&mut self) -> Result<()> {
        self.request(OpCode::ObjectExecute, &[])?;
        Ok(())
    }

    /// Read the target's hardware description.
    pub fn hw_version(&mut self) -> Result<HardwareVersion> {
        let payload = self.request(OpCode::HwVersion, &[])?;
        if payload.len() < 20 {
            return Err(Error::Operation(format!(
                "short hardware version payload: {} bytes",
                payload.len()
            )));
        }
        Ok(HardwareVersion {
            part: LittleEndian::read_u32(&payload[0..4]),
            variant: LittleEndian::read_u32(&payload[4..8]),
            rom_size: LittleEndian::read_u32(&payload[8..12]),
            ram_size: LittleEndian::read_u32(&payload[12..16]),
            rom_page_size: LittleEndian::read_u32(&payload[16..20]),
        })
    }

    /// Read firmware slot `image`. Slots count up from 0; the target
    /// answers `FirmwareType::Unknown(0xFF)` past the last one.
    pub fn fw_version(&mut self, image: u8) -> Result<FirmwareVersion> {
        let payload = self.request(OpCode::FwVersion, &[image])?;
        if payload.len() < 13 {
            return Err(Error::Operation(format!(
                "short firmware version payload: {} bytes",
                payload.len()
            )));
        }
        Ok(FirmwareVersion {
            fw_type: FirmwareType::from(payload[0]),
            version: LittleEndian::read_u32(&payload[1..5]),
            addr: LittleEndian::read_u32(&payload[5..9]),
            len: LittleEndian::read_u32(&payload[9..13]),
        })
    }

    /// Send the signed init packet as the command object. A checkpoint
    /// mismatch gets one clean retry; anything else propagates.
    pub fn send_init_packet(&mut self, init: &[u8]) -> Result<()> {
        let info = self.select(ObjectClass::Command)?;
        let len = init.len() as u32;
        if init.len() > info.max_size as usize {
            return Err(Error::InitTooLong {
                len: init.len(),
                max: info.max_size as usize,
            });
        }

        // The target may hold a prefix (or all) of this exact packet
        // from an interrupted attempt. Finish it instead of recreating.
        if info.offset > 0
            && info.offset <= len
            && info.crc == crc32(&init[..info.offset as usize])
        {
            debug!("resuming init packet at offset {}", info.offset);
            if info.offset < len {
                self.stream_object(init, info.offset, len, len)?;
            }
            match self.verify_and_execute(len, crc32(init)) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => self.notify_error(&e),
                Err(e) => return Err(e),
            }
        }

        let mut attempt = 0;
        loop {
            self.create(ObjectClass::Command, len)?;
            self.stream_object(init, 0, len, len)?;
            match self.verify_and_execute(len, crc32(init)) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() && attempt == 0 => {
                    self.notify_error(&e);
                    attempt += 1;
                }
                Err(e) if e.is_recoverable() => return Err(Error::TransferFailed),
                Err(e) => return Err(e),
            }
        }
    }

    /// Send the firmware binary as a sequence of data objects, resuming
    /// past whatever validated prefix the target already holds.
    pub fn send_firmware(&mut self, image: &[u8]) -> Result<()> {
        let total = image.len() as u32;
        let info = self.select(ObjectClass::Data)?;
        let max = info.max_size;
        if max == 0 {
            return Err(Error::Operation("target reports zero object size".into()));
        }

        let mut offset = info.offset.min(total);
        if offset > 0 {
            let tail = offset % max;
            if info.offset > total || info.crc != crc32(&image[..offset as usize]) {
                // Stored data diverges from what we are sending. Drop
                // back to the start of the object it ends in.
                offset -= if tail != 0 { tail } else { max };
                info!("stored prefix mismatch, restarting at offset {offset}");
            } else if tail != 0 {
                // Valid partial object: stream the remainder. The
                // object cannot be recreated piecemeal, so a failure
                // here retreats to its start.
                let end = (offset - tail + max).min(total);
                match self.finish_object(image, offset, end, total) {
                    Ok(()) => offset = end,
                    Err(e) if e.is_recoverable() => {
                        self.notify_error(&e);
                        offset -= tail;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                // The stored prefix ends exactly on an object boundary,
                // but the interruption may have fallen between that
                // object's last write and its execute. A create would
                // discard the un-executed data, so execute it now;
                // re-executing an already committed object succeeds.
                self.execute()?;
            }
            if offset > 0 {
                info!("resuming firmware at offset {offset} of {total}");
            }
        }

        while offset < total {
            let end = (offset + max).min(total);
            let mut attempts = 0;
            loop {
                self.create(ObjectClass::Data, end - offset)?;
                match self.finish_object(image, offset, end, total) {
                    Ok(()) => break,
                    Err(e) if e.is_recoverable() && attempts + 1 < OBJECT_RETRIES => {
                        self.notify_error(&e);
                        attempts += 1;
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!("object at {offset} failed {OBJECT_RETRIES} times");
                        return Err(Error::TransferFailed);
                    }
                    Err(e) => return Err(e),
                }
            }
            offset = end;
        }
        Ok(())
    }

    /// Drive a full package transfer in install order, reopening the
    /// transport for each image so the target can reset in between.
    pub fn perform(&mut self, images: &[PackageImage]) -> Result<()> {
        for (i, image) in images.iter().enumerate() {
            if i > 0 {
                std::thread::sleep(REBOOT_DELAY);
            }
            self.transport.open()?;
            info!(
                "updating {:?} ({} bytes)",
                image.fw_type,
                image.firmware.len()
            );
            self.disable_receipt_notifications()?;
            self.send_init_packet(&image.init_packet)?;
            self.send_firmware(&image.firmware)?;
            self.transport.close();
        }
        Ok(())
    }

    /// Stream `image[start..end]` and execute, verifying the target's
    /// checksum first.
    fn finish_object(&mut self, image: &[u8], start: u32, end: u32, total: u32) -> Result<()> {
        self.stream_object(image, start, end, total)?;
        self.verify_and_execute(end, crc32(&image[..end as usize]))
    }

    /// Stream `image[start..end]` in transport-sized fragments with a
    /// CRC checkpoint every `prn` fragments. Checkpoint CRCs cover the
    /// whole image from zero, matching the target's running checksum.
    fn stream_object(&mut self, image: &[u8], start: u32, end: u32, total: u32) -> Result<()> {
        let fragment_size = self.transport.packet_size();
        if fragment_size == 0 {
            return Err(Error::Operation("transport reports zero packet size".into()));
        }

        let mut digest = Crc32Digest::new();
        digest.update(&image[..start as usize]);

        let mut sent = start;
        let mut since_checkpoint = 0u16;
        for fragment in image[start as usize..end as usize].chunks(fragment_size) {
            self.transport.stream_data(fragment)?;
            digest.update(fragment);
            sent += fragment.len() as u32;
            since_checkpoint += 1;

            if self.prn != 0 && since_checkpoint >= self.prn && sent < end {
                let sum = self.checksum()?;
                if sum.offset != sent || sum.crc != digest.value() {
                    return Err(Error::Validation {
                        offset: Some(sum.offset),
                        crc: Some(sum.crc),
                    });
                }
                since_checkpoint = 0;
            }
            if let Some(f) = &mut self.events.progress {
                f(sent, total);
            }
        }
        Ok(())
    }

    fn verify_and_execute(&mut self, offset: u32, crc: u32) -> Result<()> {
        let sum = self.checksum()?;
        if sum.offset != offset || sum.crc != crc {
            return Err(Error::Validation {
                offset: Some(sum.offset),
                crc: Some(sum.crc),
            });
        }
        self.execute()
    }

    fn notify_error(&mut self, error: &Error) {
        warn!("recoverable transfer error: {error}");
        if let Some(f) = &mut self.events.error {
            f(error);
        }
    }
}
