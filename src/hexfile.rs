//! Sparse firmware image built from Intel-HEX or raw binary input.
//!
//! An [`Image`] is an address → byte mapping. HEX input is normalized
//! after load: the UICR region and the MBR region are stripped so that
//! only flashable firmware bytes remain, and the image can then be
//! emitted as a contiguous binary for packaging.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Start of the UICR region. Everything at or above this address is
/// configuration, not firmware, and is stripped from HEX input.
pub const UICR_START: u32 = 0x1000_0000;

/// Magic word of the SoftDevice info struct, used to infer where the
/// MBR ends.
const SD_INFO_MAGIC: u32 = 0x51B1_E5DB;

/// MBR end for s1x0-class SoftDevices.
const MBR_END_DEFAULT: u32 = 0x1000;
/// MBR end for s132-class SoftDevices.
const MBR_END_S132: u32 = 0x3000;

/// Input format for [`Image::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Hex,
    Bin,
    /// Pick by file extension, defaulting to binary.
    Auto,
}

/// Sparse firmware image.
#[derive(Debug, Default, Clone)]
pub struct Image {
    bytes: BTreeMap<u32, u8>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a firmware file. HEX input is normalized (UICR and MBR
    /// removed); binary input is placed at address zero as-is.
    pub fn load(path: &Path, format: Format) -> Result<Self> {
        let format = match format {
            Format::Auto => match path.extension().and_then(|e| e.to_str()) {
                Some("hex") | Some("ihex") => Format::Hex,
                _ => Format::Bin,
            },
            f => f,
        };

        let mut image = Self::new();
        match format {
            Format::Hex => {
                let text = fs::read_to_string(path)?;
                image.put_hex(&text)?;
                image.remove_uicr();
                image.remove_mbr();
            }
            Format::Bin | Format::Auto => {
                let data = fs::read(path)?;
                image.put(0, &data);
            }
        }

        if image.bytes.is_empty() {
            return Err(Error::InvalidImage(format!(
                "{} contains no firmware bytes",
                path.display()
            )));
        }
        Ok(image)
    }

    /// Insert `data` starting at `addr`, overwriting existing bytes.
    pub fn put(&mut self, addr: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u32, *b);
        }
    }

    fn put_hex(&mut self, text: &str) -> Result<()> {
        let mut base: u32 = 0;
        for record in ihex::Reader::new(text) {
            let record =
                record.map_err(|e| Error::InvalidImage(format!("bad hex record: {e}")))?;
            match record {
                ihex::Record::Data { offset, value } => {
                    self.put(base + offset as u32, &value);
                }
                ihex::Record::ExtendedLinearAddress(hi) => {
                    base = (hi as u32) << 16;
                }
                ihex::Record::ExtendedSegmentAddress(seg) => {
                    base = (seg as u32) << 4;
                }
                ihex::Record::EndOfFile => break,
                // Start-address records carry no data.
                _ => {}
            }
        }
        Ok(())
    }

    /// Lowest mapped address.
    pub fn min_addr(&self) -> Option<u32> {
        self.bytes.keys().next().copied()
    }

    /// Highest mapped address.
    pub fn max_addr(&self) -> Option<u32> {
        self.bytes.keys().next_back().copied()
    }

    /// Bytes in `[lo, hi)`, gaps filled with 0xFF (erased flash).
    pub fn slice(&self, lo: u32, hi: u32) -> Vec<u8> {
        let mut out = vec![0xFF; (hi - lo) as usize];
        for (addr, b) in self.bytes.range(lo..hi) {
            out[(addr - lo) as usize] = *b;
        }
        out
    }

    /// Read a little-endian word, if all four bytes are mapped.
    pub fn word(&self, addr: u32) -> Option<u32> {
        let mut w = [0u8; 4];
        for (i, byte) in w.iter_mut().enumerate() {
            *byte = *self.bytes.get(&(addr + i as u32))?;
        }
        Some(u32::from_le_bytes(w))
    }

    /// Drop everything in `[lo, hi)`.
    pub fn remove_range(&mut self, lo: u32, hi: u32) {
        let doomed: Vec<u32> = self.bytes.range(lo..hi).map(|(a, _)| *a).collect();
        for addr in doomed {
            self.bytes.remove(&addr);
        }
    }

    fn remove_uicr(&mut self) {
        self.remove_range(UICR_START, u32::MAX);
    }

    /// Strip the MBR. The end address is inferred by probing for the
    /// SoftDevice info-struct magic: s132-style images carry it just
    /// past 0x3000, s1x0 images just past 0x1000.
    fn remove_mbr(&mut self) {
        let end = if self.word(MBR_END_S132 + 0x04) == Some(SD_INFO_MAGIC) {
            MBR_END_S132
        } else {
            MBR_END_DEFAULT
        };
        self.remove_range(0, end);
    }

    /// Emit the image as one contiguous binary from `min_addr` to
    /// `max_addr`, gaps filled with 0xFF.
    pub fn to_vec(&self) -> Vec<u8> {
        match (self.min_addr(), self.max_addr()) {
            (Some(lo), Some(hi)) => self.slice(lo, hi + 1),
            _ => Vec::new(),
        }
    }

    /// Write the contiguous binary form to `out`.
    pub fn to_bin(&self, out: &Path) -> Result<()> {
        fs::write(out, self.to_vec())?;
        Ok(())
    }

    /// Write the image as Intel-HEX.
    pub fn to_hex(&self, out: &Path) -> Result<()> {
        let mut records = Vec::new();
        let mut upper: Option<u16> = None;

        // Emit rows of up to 16 bytes; rows never span a 64 KiB page.
        let mut row: Vec<u8> = Vec::with_capacity(16);
        let mut row_start: u32 = 0;
        let mut prev: Option<u32> = None;

        let flush =
            |records: &mut Vec<ihex::Record>, upper: &mut Option<u16>, start: u32, row: &mut Vec<u8>| {
                if row.is_empty() {
                    return;
                }
                let hi = (start >> 16) as u16;
                if *upper != Some(hi) {
                    records.push(ihex::Record::ExtendedLinearAddress(hi));
                    *upper = Some(hi);
                }
                records.push(ihex::Record::Data {
                    offset: (start & 0xFFFF) as u16,
                    value: std::mem::take(row),
                });
            };

        for (&addr, &b) in &self.bytes {
            let contiguous = prev == Some(addr.wrapping_sub(1));
            let row_full = row.len() >= 16;
            let page_cross = !row.is_empty() && (addr >> 16) != (row_start >> 16);
            if !contiguous || row_full || page_cross {
                flush(&mut records, &mut upper, row_start, &mut row);
                row_start = addr;
            }
            if row.is_empty() {
                row_start = addr;
            }
            row.push(b);
            prev = Some(addr);
        }
        flush(&mut records, &mut upper, row_start, &mut row);
        records.push(ihex::Record::EndOfFile);

        let text = ihex::create_object_file_representation(&records)
            .map_err(|e| Error::InvalidImage(format!("hex write: {e}")))?;
        fs::write(out, text)?;
        Ok(())
    }
}

/// Concatenate SoftDevice and bootloader binaries into the combined
/// SD+BL image, in that order. Returns the image plus each segment's
/// size so the package builder can record them in the init command.
pub fn merge_sd_bl(softdevice: &[u8], bootloader: &[u8]) -> (Vec<u8>, u32, u32) {
    let mut combined = Vec::with_capacity(softdevice.len() + bootloader.len());
    combined.extend_from_slice(softdevice);
    combined.extend_from_slice(bootloader);
    (combined, softdevice.len() as u32, bootloader.len() as u32)
}
