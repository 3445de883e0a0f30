//! Package manifest: the JSON index naming the firmware and init-packet
//! files inside a DFU archive.
//!
//! Absent kinds are omitted on write; unknown keys are ignored on read
//! so packages from newer tooling still unpack.

use serde::{Deserialize, Serialize};

use crate::init_packet::FwType;

/// Init-packet metadata mirrored into the manifest for display
/// purposes. The authoritative copy is the `.dat` blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitPacketData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sd_req: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_debug: Option<bool>,
}

/// One firmware entry: the `.bin`/`.dat` pair inside the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareEntry {
    pub bin_file: String,
    pub dat_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_packet_data: Option<InitPacketData>,
}

/// The combined SoftDevice+bootloader entry also records the size of
/// each sub-image so the target can split the concatenation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdBlEntry {
    pub bin_file: String,
    pub dat_file: String,
    pub sd_size: u32,
    pub bl_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_packet_data: Option<InitPacketData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<FirmwareEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<FirmwareEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub softdevice: Option<FirmwareEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub softdevice_bootloader: Option<SdBlEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dfu_version: Option<f32>,
}

/// Top-level document: `{ "manifest": { ... } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestFile {
    pub manifest: Manifest,
}

impl Manifest {
    /// Entries in install order: the combined image (or SoftDevice,
    /// then bootloader) always precedes the application.
    pub fn entries(&self) -> Vec<(FwType, &str, &str)> {
        let mut out = Vec::new();
        if let Some(e) = &self.softdevice_bootloader {
            out.push((FwType::SoftdeviceBootloader, e.bin_file.as_str(), e.dat_file.as_str()));
        }
        if let Some(e) = &self.softdevice {
            out.push((FwType::Softdevice, e.bin_file.as_str(), e.dat_file.as_str()));
        }
        if let Some(e) = &self.bootloader {
            out.push((FwType::Bootloader, e.bin_file.as_str(), e.dat_file.as_str()));
        }
        if let Some(e) = &self.application {
            out.push((FwType::Application, e.bin_file.as_str(), e.dat_file.as_str()));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
