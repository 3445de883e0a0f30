//! In-memory DFU target used by the protocol tests.
//!
//! Models the bootloader's object state machine: a command object
//! holding the init packet and a data object accumulating firmware,
//! both with running CRCs and resumable offsets. Fault hooks let tests
//! drop fragments, corrupt stored bytes, swallow responses, or fail
//! operations to exercise the retry paths.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};

use nrfdfu::dfu::{DfuTransport, OpCode};
use nrfdfu::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

const RESP: u8 = 0x60;
const SUCCESS: u8 = 0x01;

#[derive(Default)]
pub struct Faults {
    /// Global stream-fragment indexes to silently drop.
    pub drop_fragments: Vec<usize>,
    /// Corrupt this stored data byte after it arrives (applied once).
    pub corrupt_data_at: Option<usize>,
    /// Swallow the next N responses (recv_op times out instead).
    pub swallow_responses: usize,
    /// Fail the next data-object execute with OperationFailed.
    pub fail_execute_once: bool,
    /// Answer every command-object execute with this extended error.
    pub init_ext_error: Option<u8>,
}

/// One resumable object stream: everything received so far plus the
/// size of the currently created object.
#[derive(Default)]
struct ObjectState {
    received: Vec<u8>,
    committed: usize,
    /// Stream offset where the current object begins.
    object_base: usize,
    created_size: u32,
}

pub struct MockTarget {
    pub max_command_size: u32,
    pub max_data_size: u32,
    pub mtu_packet_size: usize,
    pub faults: Faults,

    command: ObjectState,
    data: ObjectState,
    /// Class byte of the last created object; writes land there.
    current: Option<u8>,
    responses: VecDeque<Vec<u8>>,
    fragment_count: usize,

    /// Init packets accepted by a command-object execute.
    pub executed_inits: Vec<Vec<u8>>,
    /// Ops seen, for cadence assertions.
    pub ops: Vec<u8>,
    pub open_calls: usize,
    pub close_calls: usize,
}

impl MockTarget {
    pub fn new() -> Self {
        Self {
            max_command_size: 256,
            max_data_size: 4096,
            mtu_packet_size: 64,
            faults: Faults::default(),
            command: ObjectState::default(),
            data: ObjectState::default(),
            current: None,
            responses: VecDeque::new(),
            fragment_count: 0,
            executed_inits: Vec::new(),
            ops: Vec::new(),
            open_calls: 0,
            close_calls: 0,
        }
    }

    /// Preload firmware state, as if a previous transfer got this far.
    /// `committed` bytes were executed; the rest sit in a part-filled
    /// object of `created_size`.
    pub fn preload_data(&mut self, received: Vec<u8>, committed: usize, created_size: u32) {
        self.data.received = received;
        self.data.committed = committed;
        self.data.object_base = committed;
        self.data.created_size = created_size;
    }

    /// Preload the command object with a full or partial init packet.
    pub fn preload_command(&mut self, received: Vec<u8>, created_size: u32) {
        self.command.received = received;
        self.command.object_base = 0;
        self.command.created_size = created_size;
    }

    /// Firmware bytes a reset would boot into.
    pub fn committed_firmware(&self) -> &[u8] {
        &self.data.received[..self.data.committed]
    }

    pub fn count_ops(&self, op: OpCode) -> usize {
        self.ops.iter().filter(|&&b| b == op as u8).count()
    }

    fn object(&mut self, class: u8) -> &mut ObjectState {
        if class == 0x01 {
            &mut self.command
        } else {
            &mut self.data
        }
    }

    fn respond(&mut self, op: u8, result: u8, payload: &[u8]) {
        let mut frame = vec![RESP, op, result];
        frame.extend_from_slice(payload);
        if self.faults.swallow_responses > 0 {
            self.faults.swallow_responses -= 1;
            return;
        }
        self.responses.push_back(frame);
    }

    fn handle(&mut self, frame: &[u8]) {
        let op = frame[0];
        self.ops.push(op);
        match op {
            // PRN SET
            0x02 => self.respond(op, SUCCESS, &[]),
            // OBJECT SELECT
            0x06 => {
                let class = frame[1];
                self.current = Some(class);
                let max = if class == 0x01 {
                    self.max_command_size
                } else {
                    self.max_data_size
                };
                let state = self.object(class);
                let mut payload = [0u8; 12];
                LittleEndian::write_u32(&mut payload[0..4], max);
                LittleEndian::write_u32(&mut payload[4..8], state.received.len() as u32);
                LittleEndian::write_u32(&mut payload[8..12], crc32(&state.received));
                self.respond(op, SUCCESS, &payload);
            }
            // OBJECT CREATE
            0x01 => {
                let class = frame[1];
                let size = LittleEndian::read_u32(&frame[2..6]);
                let max = if class == 0x01 {
                    self.max_command_size
                } else {
                    self.max_data_size
                };
                if size > max {
                    self.respond(op, 0x04, &[]);
                    return;
                }
                self.current = Some(class);
                let state = self.object(class);
                if class == 0x01 {
                    // A new command object always starts clean.
                    state.received.clear();
                } else {
                    // Discard the uncommitted tail of the data stream.
                    let committed = state.committed;
                    state.received.truncate(committed);
                }
                state.object_base = state.received.len();
                state.created_size = size;
                self.respond(op, SUCCESS, &[]);
            }
            // CRC GET
            0x03 => {
                let Some(class) = self.current else {
                    self.respond(op, 0x08, &[]);
                    return;
                };
                let corrupt = self.faults.corrupt_data_at.take();
                let state = self.object(class);
                if let Some(at) = corrupt {
                    if at < state.received.len() {
                        state.received[at] ^= 0xFF;
                    }
                }
                let mut payload = [0u8; 8];
                LittleEndian::write_u32(&mut payload[0..4], state.received.len() as u32);
                LittleEndian::write_u32(&mut payload[4..8], crc32(&state.received));
                self.respond(op, SUCCESS, &payload);
            }
            // OBJECT EXECUTE
            0x04 => {
                let Some(class) = self.current else {
                    self.respond(op, 0x08, &[]);
                    return;
                };
                if class == 0x01 {
                    if let Some(ext) = self.faults.init_ext_error {
                        self.respond(op, 0x0B, &[ext]);
                        return;
                    }
                    let packet = self.command.received.clone();
                    self.executed_inits.push(packet);
                    self.respond(op, SUCCESS, &[]);
                } else {
                    if self.faults.fail_execute_once {
                        self.faults.fail_execute_once = false;
                        self.respond(op, 0x0A, &[]);
                        return;
                    }
                    self.data.committed = self.data.received.len();
                    self.respond(op, SUCCESS, &[]);
                }
            }
            // PING
            0x09 => {
                let id = frame.get(1).copied().unwrap_or(0);
                self.respond(op, SUCCESS, &[id]);
            }
            // MTU GET
            0x07 => {
                let mut payload = [0u8; 2];
                LittleEndian::write_u16(&mut payload, 263);
                self.respond(op, SUCCESS, &payload);
            }
            // HW VERSION
            0x0A => {
                let mut payload = [0u8; 20];
                LittleEndian::write_u32(&mut payload[0..4], 0x52840);
                LittleEndian::write_u32(&mut payload[4..8], 0xAAAA);
                LittleEndian::write_u32(&mut payload[8..12], 1024 * 1024);
                LittleEndian::write_u32(&mut payload[12..16], 256 * 1024);
                LittleEndian::write_u32(&mut payload[16..20], 4096);
                self.respond(op, SUCCESS, &payload);
            }
            // FW VERSION
            0x0B => {
                let image = frame.get(1).copied().unwrap_or(0);
                let mut payload = [0u8; 13];
                if image == 0 {
                    payload[0] = 0x01;
                    LittleEndian::write_u32(&mut payload[1..5], 3);
                    LittleEndian::write_u32(&mut payload[5..9], 0x0000_1000);
                    LittleEndian::write_u32(&mut payload[9..13], 0x2000);
                } else {
                    payload[0] = 0xFF;
                }
                self.respond(op, SUCCESS, &payload);
            }
            other => self.respond(other, 0x02, &[]),
        }
    }
}

impl DfuTransport for MockTarget {
    fn open(&mut self) -> Result<()> {
        self.open_calls += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.close_calls += 1;
    }

    fn packet_size(&self) -> usize {
        self.mtu_packet_size
    }

    fn send_op(&mut self, frame: &[u8]) -> Result<()> {
        self.handle(frame);
        Ok(())
    }

    fn recv_op(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        self.responses.pop_front().ok_or(Error::OperationTimeout)
    }

    fn stream_data(&mut self, fragment: &[u8]) -> Result<()> {
        let index = self.fragment_count;
        self.fragment_count += 1;
        if self.faults.drop_fragments.contains(&index) {
            return Ok(());
        }
        let Some(class) = self.current else {
            return Ok(());
        };
        let state = self.object(class);
        let limit = state.object_base + state.created_size as usize;
        let room = limit.saturating_sub(state.received.len());
        let take = fragment.len().min(room);
        state.received.extend_from_slice(&fragment[..take]);
        Ok(())
    }
}
