//! Init packet ("init command") model and wire encoding.
//!
//! The init packet is the signed metadata blob that precedes firmware
//! data during DFU. Its wire format is the bootloader's `dfu-cc`
//! protobuf schema; the encoding here is a fixed contract and must
//! produce byte-for-byte what shipped bootloaders expect. Fields are
//! written in tag order, so encoding the same values twice always
//! yields identical bytes.

use crate::crc::sha256;
use crate::error::Result;
use crate::signing::KeyPair;

use self::pb::{Message, MessageWriter, Value, WireType};

/// Minimal protobuf writer. Only the two wire types the dfu-cc schema
/// uses.
mod pb {
    pub enum WireType {
        Varint = 0,
        LengthDelimited = 2,
    }

    pub trait Value {
        const TYPE: WireType;
        fn write(&self, writer: &mut MessageWriter);
    }

    pub trait Message {
        fn write(&self, writer: &mut MessageWriter);
    }

    impl Value for bool {
        const TYPE: WireType = WireType::Varint;

        fn write(&self, writer: &mut MessageWriter) {
            writer.write_varint(*self as _);
        }
    }

    impl Value for u32 {
        const TYPE: WireType = WireType::Varint;

        fn write(&self, writer: &mut MessageWriter) {
            writer.write_varint(*self as _);
        }
    }

    impl Value for [u8] {
        const TYPE: WireType = WireType::LengthDelimited;

        fn write(&self, writer: &mut MessageWriter) {
            writer.write_varint(self.len() as _);
            writer.buf.extend(self.iter().copied());
        }
    }

    #[derive(Default)]
    pub struct MessageWriter {
        buf: Vec<u8>,
    }

    impl MessageWriter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn write_field<V: Value + ?Sized>(&mut self, field_number: u32, value: &V) {
            let key = (u64::from(field_number) << 3) | V::TYPE as u64;
            self.write_varint(key);
            value.write(self);
        }

        /// Nested messages are length-prefixed: encode to a scratch
        /// buffer first.
        pub fn write_message_field<M: Message>(&mut self, field_number: u32, message: &M) {
            let key = (u64::from(field_number) << 3) | WireType::LengthDelimited as u64;
            self.write_varint(key);
            let prev = core::mem::take(&mut self.buf);
            message.write(self);
            let body = core::mem::replace(&mut self.buf, prev);
            self.write_varint(body.len() as u64);
            self.buf.extend(body);
        }

        /// Packed repeated varints: one length-delimited field holding
        /// every element.
        pub fn write_packed_field(&mut self, field_number: u32, values: &[u32]) {
            if values.is_empty() {
                return;
            }
            let mut body = MessageWriter::new();
            for v in values {
                body.write_varint(*v as u64);
            }
            self.write_field::<[u8]>(field_number, &body.buf);
        }

        pub fn write_varint(&mut self, varint: u64) {
            leb128::write::unsigned(&mut self.buf, varint)
                .expect("vec write is infallible");
        }
    }

    pub fn encode_message<M: Message>(message: &M) -> Vec<u8> {
        let mut w = MessageWriter::new();
        message.write(&mut w);
        w.buf
    }
}

/// Update kind, as carried in the init command's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FwType {
    Application = 0,
    Softdevice = 1,
    Bootloader = 2,
    SoftdeviceBootloader = 3,
}

impl Value for FwType {
    const TYPE: WireType = WireType::Varint;

    fn write(&self, writer: &mut MessageWriter) {
        writer.write_varint(*self as _);
    }
}

/// Only `Sha256` is accepted by shipped bootloaders; the other values
/// exist so decoded metadata can be displayed faithfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    NoHash = 0,
    Crc = 1,
    Sha128 = 2,
    Sha256 = 3,
    Sha512 = 4,
}

impl Value for HashType {
    const TYPE: WireType = WireType::Varint;

    fn write(&self, writer: &mut MessageWriter) {
        writer.write_varint(*self as _);
    }
}

/// Post-install boot validation performed by the bootloader on each
/// boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationType {
    #[default]
    NoValidation = 0,
    ValidateGeneratedCrc = 1,
    ValidateGeneratedSha256 = 2,
    ValidateEcdsaP256Sha256 = 3,
}

impl Value for ValidationType {
    const TYPE: WireType = WireType::Varint;

    fn write(&self, writer: &mut MessageWriter) {
        writer.write_varint(*self as _);
    }
}

#[derive(Debug, Clone)]
pub struct Hash {
    pub hash_type: HashType,
    /// Digest bytes in the byte-reversed (little-endian) order the
    /// bootloader stores them.
    pub hash: Vec<u8>,
}

impl Message for Hash {
    fn write(&self, writer: &mut MessageWriter) {
        writer.write_field(1, &self.hash_type);
        writer.write_field(2, self.hash.as_slice());
    }
}

#[derive(Debug, Clone)]
pub struct BootValidation {
    pub validation_type: ValidationType,
    pub bytes: Vec<u8>,
}

impl Message for BootValidation {
    fn write(&self, writer: &mut MessageWriter) {
        writer.write_field(1, &self.validation_type);
        writer.write_field(2, self.bytes.as_slice());
    }
}

/// The init command proper: everything the bootloader validates before
/// accepting firmware data.
#[derive(Debug, Clone)]
pub struct InitCommand {
    pub fw_version: u32,
    pub hw_version: u32,
    /// Acceptable currently-installed SoftDevice FWIDs; empty means
    /// unrestricted. Deduplicated, insertion order preserved.
    pub sd_req: Vec<u32>,
    pub fw_type: FwType,
    pub sd_size: u32,
    pub bl_size: u32,
    pub app_size: u32,
    pub hash: Hash,
    pub is_debug: bool,
    pub boot_validation: Vec<BootValidation>,
}

impl InitCommand {
    /// Build an init command for a normalized firmware binary.
    pub fn for_firmware(
        fw_type: FwType,
        fw_version: u32,
        hw_version: u32,
        sd_req: &[u32],
        sd_size: u32,
        bl_size: u32,
        app_size: u32,
        firmware: &[u8],
        is_debug: bool,
    ) -> Self {
        let mut digest = sha256(firmware);
        // The bootloader stores and compares the digest little-endian.
        digest.reverse();

        let mut deduped = Vec::with_capacity(sd_req.len());
        for req in sd_req {
            if !deduped.contains(req) {
                deduped.push(*req);
            }
        }

        Self {
            fw_version,
            hw_version,
            sd_req: deduped,
            fw_type,
            sd_size,
            bl_size,
            app_size,
            hash: Hash {
                hash_type: HashType::Sha256,
                hash: digest.to_vec(),
            },
            is_debug,
            boot_validation: Vec::new(),
        }
    }
}

impl Message for InitCommand {
    fn write(&self, writer: &mut MessageWriter) {
        writer.write_field(1, &self.fw_version);
        writer.write_field(2, &self.hw_version);
        writer.write_packed_field(3, &self.sd_req);
        writer.write_field(4, &self.fw_type);
        writer.write_field(5, &self.sd_size);
        writer.write_field(6, &self.bl_size);
        writer.write_field(7, &self.app_size);
        writer.write_message_field(8, &self.hash);
        writer.write_field(9, &self.is_debug);
        for v in &self.boot_validation {
            writer.write_message_field(10, v);
        }
    }
}

const OP_CODE_INIT: u32 = 1;

struct Command<'a> {
    init: &'a InitCommand,
}

impl Message for Command<'_> {
    fn write(&self, writer: &mut MessageWriter) {
        writer.write_field(1, &OP_CODE_INIT);
        writer.write_message_field(2, self.init);
    }
}

/// `SignatureType` in the dfu-cc schema. Only ECDSA P-256 is produced.
const SIGNATURE_TYPE_ECDSA_P256_SHA256: u32 = 0;

struct SignedCommand<'a> {
    command: &'a Command<'a>,
    signature: [u8; 64],
}

impl Message for SignedCommand<'_> {
    fn write(&self, writer: &mut MessageWriter) {
        writer.write_message_field(1, self.command);
        writer.write_field(2, &SIGNATURE_TYPE_ECDSA_P256_SHA256);
        writer.write_field(3, self.signature.as_slice());
    }
}

enum Packet<'a> {
    Command(Command<'a>),
    SignedCommand(SignedCommand<'a>),
}

impl Message for Packet<'_> {
    fn write(&self, writer: &mut MessageWriter) {
        match self {
            Packet::Command(cmd) => writer.write_message_field(1, cmd),
            Packet::SignedCommand(cmd) => writer.write_message_field(2, cmd),
        }
    }
}

impl InitCommand {
    /// Encode an unsigned init packet.
    pub fn encode(&self) -> Vec<u8> {
        pb::encode_message(&Packet::Command(Command { init: self }))
    }

    /// Encode a signed init packet. The signature covers the serialized
    /// `Command` message, in its historical `R || S` byte-reversed
    /// order.
    pub fn encode_signed(&self, key: &KeyPair) -> Result<Vec<u8>> {
        let command = Command { init: self };
        let command_bytes = pb::encode_message(&command);
        let signature = key.sign(&command_bytes)?;
        Ok(pb::encode_message(&Packet::SignedCommand(SignedCommand {
            command: &command,
            signature,
        })))
    }
}
