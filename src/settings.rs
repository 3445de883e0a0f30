//! Bootloader settings page generation and probing.
//!
//! The settings page is a CRC-protected structure at the top of flash
//! that tells the bootloader which application is installed, its
//! version, and how to validate it on boot. This module lays the page
//! out, stamps its CRC, emits it as HEX for out-of-band flashing, and
//! can probe an existing image to recover the fields.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::crc::{crc32, sha256};
use crate::error::{Error, Result};
use crate::hexfile::Image;
use crate::init_packet::ValidationType;
use crate::signing::KeyPair;

/// Supported device families with their flash geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Nrf51,
    Nrf52,
    Nrf52QFab,
    Nrf52810,
    Nrf52840,
}

impl Family {
    pub fn page_size(self) -> u32 {
        match self {
            Family::Nrf51 => 0x400,
            _ => 0x1000,
        }
    }

    /// Default settings page address for the family.
    pub fn settings_address(self) -> u32 {
        match self {
            Family::Nrf51 => 0x0003_FC00,
            Family::Nrf52 => 0x0007_F000,
            Family::Nrf52QFab => 0x0003_F000,
            Family::Nrf52810 => 0x0002_F000,
            Family::Nrf52840 => 0x000F_F000,
        }
    }

    pub const ALL: [Family; 5] = [
        Family::Nrf51,
        Family::Nrf52,
        Family::Nrf52QFab,
        Family::Nrf52810,
        Family::Nrf52840,
    ];
}

/// Field offsets within the settings structure, from the page start.
const OFFS_CRC: usize = 0x00;
const OFFS_SETTINGS_VERSION: usize = 0x04;
const OFFS_APP_VERSION: usize = 0x08;
const OFFS_BL_VERSION: usize = 0x0C;
const OFFS_BANK_LAYOUT: usize = 0x10;
const OFFS_BANK_CURRENT: usize = 0x14;
const OFFS_BANK0_IMG_SIZE: usize = 0x18;
const OFFS_BANK0_IMG_CRC: usize = 0x1C;
const OFFS_BANK0_BANK_CODE: usize = 0x20;
const OFFS_SD_SIZE: usize = 0x34;
const SETTINGS_V1_SIZE: usize = 0x5C; // 92 bytes
const OFFS_BOOT_VALIDATION_CRC: usize = 0x5C;
const OFFS_SD_VALIDATION: usize = 0x60;
const OFFS_APP_VALIDATION: usize = 0xA4;
const SETTINGS_V2_SIZE: usize = 0xE8; // 232 bytes
const VALIDATION_SLOT_SIZE: usize = 4 + 64;

/// Bank code for a valid application in bank 0.
const BANK_VALID_APP: u32 = 0x01;

/// A decoded boot-validation slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootValidationSlot {
    pub kind: ValidationType,
    pub bytes: Vec<u8>,
}

impl BootValidationSlot {
    fn none() -> Self {
        Self {
            kind: ValidationType::NoValidation,
            bytes: Vec::new(),
        }
    }

    /// Compute the validation blob for `image` bytes.
    fn generate(kind: ValidationType, image: &[u8], key: Option<&KeyPair>) -> Result<Self> {
        let bytes = match kind {
            ValidationType::NoValidation => Vec::new(),
            ValidationType::ValidateGeneratedCrc => crc32(image).to_le_bytes().to_vec(),
            ValidationType::ValidateGeneratedSha256 => {
                let mut digest = sha256(image);
                digest.reverse();
                digest.to_vec()
            }
            ValidationType::ValidateEcdsaP256Sha256 => {
                let key = key.ok_or_else(|| {
                    Error::KeyLoad("ECDSA boot validation requires a signing key".into())
                })?;
                key.sign(image)?.to_vec()
            }
        };
        Ok(Self { kind, bytes })
    }

    fn store(&self, page: &mut [u8], offset: usize) {
        LittleEndian::write_u32(&mut page[offset..], self.kind as u32);
        page[offset + 4..offset + 4 + self.bytes.len()].copy_from_slice(&self.bytes);
    }

    fn load(page: &[u8], offset: usize) -> Self {
        let kind = match LittleEndian::read_u32(&page[offset..]) {
            1 => ValidationType::ValidateGeneratedCrc,
            2 => ValidationType::ValidateGeneratedSha256,
            3 => ValidationType::ValidateEcdsaP256Sha256,
            _ => ValidationType::NoValidation,
        };
        let len = match kind {
            ValidationType::NoValidation => 0,
            ValidationType::ValidateGeneratedCrc => 4,
            ValidationType::ValidateGeneratedSha256 => 32,
            ValidationType::ValidateEcdsaP256Sha256 => 64,
        };
        Self {
            kind,
            bytes: page[offset + 4..offset + 4 + len].to_vec(),
        }
    }
}

/// Inputs for settings generation.
pub struct SettingsArgs<'a> {
    pub family: Family,
    /// Application image the page describes; bank-0 fields stay zero
    /// without one.
    pub application: Option<&'a Image>,
    pub app_version: u32,
    pub bl_version: u32,
    /// Settings format: 1 or 2.
    pub settings_version: u32,
    /// Override the family's default settings address.
    pub custom_address: Option<u32>,
    /// Mirror the page below the settings page.
    pub backup: bool,
    pub backup_address: Option<u32>,
    /// v2 only: boot validation for the application image.
    pub app_boot_validation: ValidationType,
    /// v2 only: boot validation for the installed SoftDevice.
    pub sd_boot_validation: ValidationType,
    /// SoftDevice image for v2 SD validation, if any.
    pub softdevice: Option<&'a Image>,
    /// Signing key for ECDSA validation kinds.
    pub key: Option<&'a KeyPair>,
}

/// A generated or probed settings page.
#[derive(Debug, Clone)]
pub struct Settings {
    pub family: Family,
    pub address: u32,
    pub settings_version: u32,
    pub app_version: u32,
    pub bl_version: u32,
    pub app_size: u32,
    pub app_crc: u32,
    pub bank0_bank_code: u32,
    pub sd_size: u32,
    pub app_boot_validation: BootValidationSlot,
    pub sd_boot_validation: BootValidationSlot,
}

impl Settings {
    /// Build the settings page and return it together with the HEX
    /// image ready for flashing (backup copy included when requested).
    pub fn generate(args: &SettingsArgs) -> Result<(Settings, Image)> {
        if args.settings_version != 1 && args.settings_version != 2 {
            return Err(Error::InvalidImage(format!(
                "unsupported settings version {}",
                args.settings_version
            )));
        }
        if args.settings_version == 1
            && (args.app_boot_validation != ValidationType::NoValidation
                || args.sd_boot_validation != ValidationType::NoValidation)
        {
            return Err(Error::InvalidImage(
                "boot validation requires settings version 2".into(),
            ));
        }

        let address = args.custom_address.unwrap_or(args.family.settings_address());
        let size = if args.settings_version == 2 {
            SETTINGS_V2_SIZE
        } else {
            SETTINGS_V1_SIZE
        };
        let mut page = vec![0u8; size];

        LittleEndian::write_u32(&mut page[OFFS_SETTINGS_VERSION..], args.settings_version);
        LittleEndian::write_u32(&mut page[OFFS_APP_VERSION..], args.app_version);
        LittleEndian::write_u32(&mut page[OFFS_BL_VERSION..], args.bl_version);
        LittleEndian::write_u32(&mut page[OFFS_BANK_LAYOUT..], 0);
        LittleEndian::write_u32(&mut page[OFFS_BANK_CURRENT..], 0);

        let (app_size, app_crc, bank_code, app_bytes);
        match args.application {
            Some(image) => {
                let bytes = image.to_vec();
                app_size = bytes.len() as u32;
                app_crc = crc32(&bytes);
                bank_code = BANK_VALID_APP;
                app_bytes = Some(bytes);
            }
            None => {
                app_size = 0;
                app_crc = 0;
                bank_code = 0;
                app_bytes = None;
            }
        }
        LittleEndian::write_u32(&mut page[OFFS_BANK0_IMG_SIZE..], app_size);
        LittleEndian::write_u32(&mut page[OFFS_BANK0_IMG_CRC..], app_crc);
        LittleEndian::write_u32(&mut page[OFFS_BANK0_BANK_CODE..], bank_code);

        let sd_bytes = args.softdevice.map(|i| i.to_vec());
        let sd_size = sd_bytes.as_ref().map(|b| b.len() as u32).unwrap_or(0);
        LittleEndian::write_u32(&mut page[OFFS_SD_SIZE..], sd_size);

        let mut app_validation = BootValidationSlot::none();
        let mut sd_validation = BootValidationSlot::none();
        if args.settings_version == 2 {
            if let Some(bytes) = &app_bytes {
                app_validation =
                    BootValidationSlot::generate(args.app_boot_validation, bytes, args.key)?;
            }
            if let Some(bytes) = &sd_bytes {
                sd_validation =
                    BootValidationSlot::generate(args.sd_boot_validation, bytes, args.key)?;
            }
            sd_validation.store(&mut page, OFFS_SD_VALIDATION);
            app_validation.store(&mut page, OFFS_APP_VALIDATION);

            // The two validation slots get their own CRC, stored just
            // before them.
            let validation_crc =
                crc32(&page[OFFS_SD_VALIDATION..OFFS_SD_VALIDATION + 2 * VALIDATION_SLOT_SIZE]);
            LittleEndian::write_u32(&mut page[OFFS_BOOT_VALIDATION_CRC..], validation_crc);
        }

        // Outer CRC covers everything after the first word.
        let page_crc = crc32(&page[4..]);
        LittleEndian::write_u32(&mut page[OFFS_CRC..], page_crc);
        debug!(
            "settings v{} at 0x{address:08X}, crc 0x{page_crc:08X}",
            args.settings_version
        );

        let mut image = Image::new();
        image.put(address, &page);
        if args.backup {
            let backup_address = args
                .backup_address
                .unwrap_or_else(|| address - 0x1000);
            image.put(backup_address, &page);
        }

        Ok((
            Settings {
                family: args.family,
                address,
                settings_version: args.settings_version,
                app_version: args.app_version,
                bl_version: args.bl_version,
                app_size,
                app_crc,
                bank0_bank_code: bank_code,
                sd_size,
                app_boot_validation: app_validation,
                sd_boot_validation: sd_validation,
            },
            image,
        ))
    }

    /// Scan the known candidate addresses for a settings page whose CRC
    /// validates, trying the v2 layout before v1. The matching address
    /// identifies the family.
    pub fn probe(image: &Image) -> Result<Settings> {
        for family in Family::ALL {
            let address = family.settings_address();
            for size in [SETTINGS_V2_SIZE, SETTINGS_V1_SIZE] {
                let page = image.slice(address, address + size as u32);
                if let Some(settings) = Self::decode(family, address, &page) {
                    return Ok(settings);
                }
            }
        }
        Err(Error::InvalidImage(
            "no valid settings page at any known address".into(),
        ))
    }

    fn decode(family: Family, address: u32, page: &[u8]) -> Option<Settings> {
        let stored = LittleEndian::read_u32(&page[OFFS_CRC..]);
        if stored == 0 || stored == 0xFFFF_FFFF || stored != crc32(&page[4..]) {
            return None;
        }
        let settings_version = LittleEndian::read_u32(&page[OFFS_SETTINGS_VERSION..]);
        let expected = if page.len() == SETTINGS_V2_SIZE { 2 } else { 1 };
        if settings_version != expected {
            return None;
        }

        let (app_validation, sd_validation) = if settings_version == 2 {
            (
                BootValidationSlot::load(page, OFFS_APP_VALIDATION),
                BootValidationSlot::load(page, OFFS_SD_VALIDATION),
            )
        } else {
            (BootValidationSlot::none(), BootValidationSlot::none())
        };

        Some(Settings {
            family,
            address,
            settings_version,
            app_version: LittleEndian::read_u32(&page[OFFS_APP_VERSION..]),
            bl_version: LittleEndian::read_u32(&page[OFFS_BL_VERSION..]),
            app_size: LittleEndian::read_u32(&page[OFFS_BANK0_IMG_SIZE..]),
            app_crc: LittleEndian::read_u32(&page[OFFS_BANK0_IMG_CRC..]),
            bank0_bank_code: LittleEndian::read_u32(&page[OFFS_BANK0_BANK_CODE..]),
            sd_size: LittleEndian::read_u32(&page[OFFS_SD_SIZE..]),
            app_boot_validation: app_validation,
            sd_boot_validation: sd_validation,
        })
    }
}
