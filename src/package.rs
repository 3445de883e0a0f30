//! DFU package assembly and extraction.
//!
//! A package is a flat ZIP: `manifest.json` plus one `.bin`/`.dat` pair
//! per firmware image. Assembly happens in a scoped workspace directory
//! that is removed on every exit path unless the caller asks to keep it.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::crc::{crc32, sha256};
use crate::error::{Error, Result};
use crate::hexfile::{merge_sd_bl, Format, Image};
use crate::init_packet::{BootValidation, FwType, InitCommand, ValidationType};
use crate::manifest::{FirmwareEntry, InitPacketData, Manifest, ManifestFile, SdBlEntry};
use crate::signing::KeyPair;

pub const MANIFEST_NAME: &str = "manifest.json";

/// One firmware input to the builder.
struct FirmwareInput {
    path: PathBuf,
    version: u32,
}

/// Builder for signed DFU packages.
pub struct PackageBuilder {
    hw_version: u32,
    sd_req: Vec<u32>,
    is_debug: bool,
    application: Option<FirmwareInput>,
    bootloader: Option<FirmwareInput>,
    softdevice: Option<FirmwareInput>,
    app_boot_validation: ValidationType,
    sd_boot_validation: ValidationType,
    keep_workspace: bool,
}

impl PackageBuilder {
    pub fn new(hw_version: u32, sd_req: Vec<u32>) -> Self {
        Self {
            hw_version,
            sd_req,
            is_debug: false,
            application: None,
            bootloader: None,
            softdevice: None,
            app_boot_validation: ValidationType::NoValidation,
            sd_boot_validation: ValidationType::NoValidation,
            keep_workspace: false,
        }
    }

    pub fn application(mut self, path: &Path, version: u32) -> Self {
        self.application = Some(FirmwareInput {
            path: path.to_owned(),
            version,
        });
        self
    }

    pub fn bootloader(mut self, path: &Path, version: u32) -> Self {
        self.bootloader = Some(FirmwareInput {
            path: path.to_owned(),
            version,
        });
        self
    }

    pub fn softdevice(mut self, path: &Path, version: u32) -> Self {
        self.softdevice = Some(FirmwareInput {
            path: path.to_owned(),
            version,
        });
        self
    }

    pub fn debug(mut self, is_debug: bool) -> Self {
        self.is_debug = is_debug;
        self
    }

    pub fn app_boot_validation(mut self, kind: ValidationType) -> Self {
        self.app_boot_validation = kind;
        self
    }

    pub fn sd_boot_validation(mut self, kind: ValidationType) -> Self {
        self.sd_boot_validation = kind;
        self
    }

    /// Keep the workspace directory around for inspection.
    pub fn keep_workspace(mut self, keep: bool) -> Self {
        self.keep_workspace = keep;
        self
    }

    /// Assemble, sign, and write the package archive.
    pub fn write(self, key: &KeyPair, out: &Path) -> Result<()> {
        if self.application.is_none() && self.bootloader.is_none() && self.softdevice.is_none()
        {
            return Err(Error::InvalidImage("no firmware given".into()));
        }

        let workspace = tempfile::tempdir()?;
        let result = self.write_in(key, workspace.path(), out);
        if self.keep_workspace {
            let kept = workspace.keep();
            info!("workspace kept at {}", kept.display());
        }
        // TempDir drop removes the workspace on both paths otherwise.
        result
    }

    fn write_in(&self, key: &KeyPair, workspace: &Path, out: &Path) -> Result<()> {
        let mut manifest = Manifest::default();
        let mut files: Vec<(String, String)> = Vec::new();

        let app = self.normalized(self.application.as_ref())?;
        let bl = self.normalized(self.bootloader.as_ref())?;
        let sd = self.normalized(self.softdevice.as_ref())?;

        if let (Some((bl_bytes, bl_ver)), Some((sd_bytes, _))) = (&bl, &sd) {
            // Both present: ship the combined image instead.
            let (combined, sd_size, bl_size) = merge_sd_bl(sd_bytes, bl_bytes);
            let mut init = InitCommand::for_firmware(
                FwType::SoftdeviceBootloader,
                *bl_ver,
                self.hw_version,
                &self.sd_req,
                sd_size,
                bl_size,
                0,
                &combined,
                self.is_debug,
            );
            if self.sd_boot_validation != ValidationType::NoValidation {
                init.boot_validation.push(self.validation(
                    self.sd_boot_validation,
                    &combined[..sd_size as usize],
                    key,
                )?);
            }
            let (bin, dat) = self.emit(workspace, "sd_bl", &combined, &init, key)?;
            manifest.softdevice_bootloader = Some(SdBlEntry {
                bin_file: bin.clone(),
                dat_file: dat.clone(),
                sd_size,
                bl_size,
                init_packet_data: Some(init_packet_data(&init)),
            });
            files.push((bin, dat));
        } else {
            if let Some((sd_bytes, sd_ver)) = &sd {
                let mut init = InitCommand::for_firmware(
                    FwType::Softdevice,
                    *sd_ver,
                    self.hw_version,
                    &self.sd_req,
                    sd_bytes.len() as u32,
                    0,
                    0,
                    sd_bytes,
                    self.is_debug,
                );
                if self.sd_boot_validation != ValidationType::NoValidation {
                    init.boot_validation.push(self.validation(
                        self.sd_boot_validation,
                        sd_bytes,
                        key,
                    )?);
                }
                let (bin, dat) = self.emit(workspace, "softdevice", sd_bytes, &init, key)?;
                manifest.softdevice = Some(FirmwareEntry {
                    bin_file: bin.clone(),
                    dat_file: dat.clone(),
                    init_packet_data: Some(init_packet_data(&init)),
                });
                files.push((bin, dat));
            }
            if let Some((bl_bytes, bl_ver)) = &bl {
                let init = InitCommand::for_firmware(
                    FwType::Bootloader,
                    *bl_ver,
                    self.hw_version,
                    &self.sd_req,
                    0,
                    bl_bytes.len() as u32,
                    0,
                    bl_bytes,
                    self.is_debug,
                );
                let (bin, dat) = self.emit(workspace, "bootloader", bl_bytes, &init, key)?;
                manifest.bootloader = Some(FirmwareEntry {
                    bin_file: bin.clone(),
                    dat_file: dat.clone(),
                    init_packet_data: Some(init_packet_data(&init)),
                });
                files.push((bin, dat));
            }
        }

        if let Some((app_bytes, app_ver)) = &app {
            let mut init = InitCommand::for_firmware(
                FwType::Application,
                *app_ver,
                self.hw_version,
                &self.sd_req,
                0,
                0,
                app_bytes.len() as u32,
                app_bytes,
                self.is_debug,
            );
            if self.app_boot_validation != ValidationType::NoValidation {
                init.boot_validation.push(self.validation(
                    self.app_boot_validation,
                    app_bytes,
                    key,
                )?);
            }
            let (bin, dat) = self.emit(workspace, "application", app_bytes, &init, key)?;
            manifest.application = Some(FirmwareEntry {
                bin_file: bin.clone(),
                dat_file: dat.clone(),
                init_packet_data: Some(init_packet_data(&init)),
            });
            files.push((bin, dat));
        }

        let manifest_path = workspace.join(MANIFEST_NAME);
        let doc = ManifestFile { manifest };
        fs::write(&manifest_path, serde_json::to_string_pretty(&doc)?.as_bytes())?;

        // Flat archive: manifest first, then each pair.
        let file = File::create(out)?;
        let mut writer = ZipWriter::new(file);
        let options: FileOptions = FileOptions::default()
            .compression_method(CompressionMethod::Deflated);

        let mut names = vec![MANIFEST_NAME.to_string()];
        for (bin, dat) in &files {
            names.push(bin.clone());
            names.push(dat.clone());
        }
        for name in names {
            writer.start_file(&name, options)?;
            let data = fs::read(workspace.join(&name))?;
            writer.write_all(&data)?;
        }
        writer.finish()?;
        info!("wrote package {}", out.display());
        Ok(())
    }

    /// Load and normalize one firmware input to its binary form.
    fn normalized(&self, input: Option<&FirmwareInput>) -> Result<Option<(Vec<u8>, u32)>> {
        let Some(input) = input else { return Ok(None) };
        let image = Image::load(&input.path, Format::Auto)?;
        let bytes = image.to_vec();
        if bytes.is_empty() {
            return Err(Error::InvalidImage(format!(
                "{}: empty after normalization",
                input.path.display()
            )));
        }
        if bytes.len() % 4 != 0 {
            return Err(Error::InvalidImage(format!(
                "{}: size {} is not word-aligned",
                input.path.display(),
                bytes.len()
            )));
        }
        debug!(
            "normalized {} -> {} bytes",
            input.path.display(),
            bytes.len()
        );
        Ok(Some((bytes, input.version)))
    }

    fn validation(
        &self,
        kind: ValidationType,
        firmware: &[u8],
        key: &KeyPair,
    ) -> Result<BootValidation> {
        let bytes = match kind {
            ValidationType::NoValidation => Vec::new(),
            ValidationType::ValidateGeneratedCrc => crc32(firmware).to_le_bytes().to_vec(),
            ValidationType::ValidateGeneratedSha256 => {
                let mut digest = sha256(firmware);
                digest.reverse();
                digest.to_vec()
            }
            ValidationType::ValidateEcdsaP256Sha256 => key.sign(firmware)?.to_vec(),
        };
        Ok(BootValidation {
            validation_type: kind,
            bytes,
        })
    }

    /// Write the `.bin`/`.dat` pair for one image into the workspace.
    fn emit(
        &self,
        workspace: &Path,
        name: &str,
        firmware: &[u8],
        init: &InitCommand,
        key: &KeyPair,
    ) -> Result<(String, String)> {
        let bin_name = format!("{name}.bin");
        let dat_name = format!("{name}.dat");
        fs::write(workspace.join(&bin_name), firmware)?;
        fs::write(workspace.join(&dat_name), init.encode_signed(key)?)?;
        Ok((bin_name, dat_name))
    }
}

fn init_packet_data(init: &InitCommand) -> InitPacketData {
    use std::fmt::Write as _;
    let mut hash_hex = String::with_capacity(64);
    for b in &init.hash.hash {
        write!(hash_hex, "{b:02x}").expect("string write");
    }
    InitPacketData {
        fw_version: Some(init.fw_version),
        hw_version: Some(init.hw_version),
        sd_req: init.sd_req.clone(),
        firmware_hash: Some(hash_hex),
        is_debug: Some(init.is_debug),
    }
}

/// A package loaded into memory, ready to stream to a target.
#[derive(Debug)]
pub struct Package {
    pub manifest: Manifest,
    pub images: Vec<PackageImage>,
}

/// One image from the package, in install order.
#[derive(Debug)]
pub struct PackageImage {
    pub fw_type: FwType,
    pub name: String,
    pub init_packet: Vec<u8>,
    pub firmware: Vec<u8>,
}

impl Package {
    /// Extract `archive` into `target`, which must not exist yet.
    /// Returns the parsed manifest after validating that every
    /// referenced file exists and is non-empty.
    pub fn unpack(archive: &Path, target: &Path) -> Result<Manifest> {
        if target.exists() {
            return Err(Error::TargetExists(target.to_owned()));
        }
        fs::create_dir_all(target)?;

        let file = File::open(archive)?;
        let mut zip = ZipArchive::new(file)
            .map_err(|e| Error::InvalidArchive(format!("not a zip: {e}")))?;
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| Error::InvalidArchive(e.to_string()))?;
            let Some(name) = entry.enclosed_name().map(|p| p.to_owned()) else {
                return Err(Error::InvalidArchive(format!(
                    "unsafe entry name: {}",
                    entry.name()
                )));
            };
            if name.components().count() != 1 {
                return Err(Error::InvalidArchive(format!(
                    "nested entry: {}",
                    name.display()
                )));
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            fs::write(target.join(name), data)?;
        }

        let manifest_path = target.join(MANIFEST_NAME);
        let text = fs::read_to_string(&manifest_path)
            .map_err(|_| Error::InvalidArchive("missing manifest.json".into()))?;
        let doc: ManifestFile = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidArchive(format!("bad manifest: {e}")))?;

        for (_, bin, dat) in doc.manifest.entries() {
            for name in [bin, dat] {
                let path = target.join(name);
                let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                if len == 0 {
                    return Err(Error::InvalidArchive(format!(
                        "manifest references missing or empty file {name}"
                    )));
                }
            }
        }
        Ok(doc.manifest)
    }

    /// Open an archive and load every image into memory. The extraction
    /// directory is transient and removed before returning.
    pub fn open(archive: &Path) -> Result<Self> {
        let scratch = tempfile::tempdir()?;
        let target = scratch.path().join("pkg");
        let manifest = Self::unpack(archive, &target)?;

        let mut images = Vec::new();
        for (fw_type, bin, dat) in manifest.entries() {
            images.push(PackageImage {
                fw_type,
                name: bin.trim_end_matches(".bin").to_string(),
                init_packet: fs::read(target.join(dat))?,
                firmware: fs::read(target.join(bin))?,
            });
        }
        Ok(Self { manifest, images })
    }
}
