//! Package assembly and extraction tests: archive layout, manifest
//! contents, image normalization, and an end-to-end transfer of a
//! freshly built package.

mod mockdfu;

use std::fs;
use std::path::Path;

use mockdfu::MockTarget;
use nrfdfu::dfu::DfuTarget;
use nrfdfu::error::Error;
use nrfdfu::hexfile::Image;
use nrfdfu::init_packet::{FwType, InitCommand, ValidationType};
use nrfdfu::package::{Package, PackageBuilder, MANIFEST_NAME};
use nrfdfu::signing::KeyPair;

fn write_bin(dir: &Path, name: &str, len: usize) -> std::path::PathBuf {
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    path
}

#[test]
fn application_package_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_bin(dir.path(), "app.bin", 0x1000);
    let archive = dir.path().join("pkg.zip");
    let key = KeyPair::generate();

    PackageBuilder::new(52, vec![0x00B7, 0x00B8])
        .application(&app, 7)
        .write(&key, &archive)
        .unwrap();

    let target = dir.path().join("unpacked");
    let manifest = Package::unpack(&archive, &target).unwrap();
    let entry = manifest.application.as_ref().unwrap();
    assert_eq!(entry.bin_file, "application.bin");
    assert_eq!(entry.dat_file, "application.dat");
    assert!(target.join(MANIFEST_NAME).exists());
    assert_eq!(
        fs::read(target.join("application.bin")).unwrap(),
        fs::read(&app).unwrap()
    );

    let data = entry.init_packet_data.as_ref().unwrap();
    assert_eq!(data.fw_version, Some(7));
    assert_eq!(data.hw_version, Some(52));
    assert_eq!(data.sd_req, vec![0xB7, 0xB8]);

    // Deterministic signing: rebuilding the same init command yields
    // the identical signed packet.
    let firmware = fs::read(&app).unwrap();
    let expected = InitCommand::for_firmware(
        FwType::Application,
        7,
        52,
        &[0xB7, 0xB8],
        0,
        0,
        firmware.len() as u32,
        &firmware,
        false,
    )
    .encode_signed(&key)
    .unwrap();
    assert_eq!(fs::read(target.join("application.dat")).unwrap(), expected);
}

#[test]
fn combined_sd_bl_package_records_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let sd = write_bin(dir.path(), "sd.bin", 0x2000);
    let bl = write_bin(dir.path(), "bl.bin", 0x800);
    let archive = dir.path().join("pkg.zip");
    let key = KeyPair::generate();

    PackageBuilder::new(52, vec![0xFFFE])
        .softdevice(&sd, 1)
        .bootloader(&bl, 3)
        .write(&key, &archive)
        .unwrap();

    let package = Package::open(&archive).unwrap();
    let entry = package.manifest.softdevice_bootloader.as_ref().unwrap();
    assert_eq!(entry.sd_size, 0x2000);
    assert_eq!(entry.bl_size, 0x800);
    assert!(package.manifest.softdevice.is_none());
    assert!(package.manifest.bootloader.is_none());

    assert_eq!(package.images.len(), 1);
    let image = &package.images[0];
    assert_eq!(image.fw_type, FwType::SoftdeviceBootloader);
    // SoftDevice first, bootloader appended.
    assert_eq!(image.firmware.len(), 0x2800);
    assert_eq!(&image.firmware[..0x2000], fs::read(&sd).unwrap().as_slice());
    assert_eq!(&image.firmware[0x2000..], fs::read(&bl).unwrap().as_slice());
}

#[test]
fn images_come_out_in_install_order() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_bin(dir.path(), "app.bin", 0x400);
    let sd = write_bin(dir.path(), "sd.bin", 0x800);
    let archive = dir.path().join("pkg.zip");
    let key = KeyPair::generate();

    PackageBuilder::new(52, vec![0xFFFE])
        .application(&app, 1)
        .softdevice(&sd, 1)
        .write(&key, &archive)
        .unwrap();

    let package = Package::open(&archive).unwrap();
    let kinds: Vec<FwType> = package.images.iter().map(|i| i.fw_type).collect();
    assert_eq!(kinds, vec![FwType::Softdevice, FwType::Application]);
}

#[test]
fn hex_input_is_normalized() {
    let dir = tempfile::tempdir().unwrap();

    // Application at 0x1000 with MBR-region and UICR bytes that must
    // not end up in the package.
    let mut image = Image::new();
    image.put(0x0000, &[0x11; 0x1000]);
    image.put(0x1000, &[0x22; 0x400]);
    image.put(0x1000_0014, &[0x33; 4]);
    let hex = dir.path().join("app.hex");
    image.to_hex(&hex).unwrap();

    let archive = dir.path().join("pkg.zip");
    PackageBuilder::new(52, vec![0xFFFE])
        .application(&hex, 1)
        .write(&KeyPair::generate(), &archive)
        .unwrap();

    let package = Package::open(&archive).unwrap();
    assert_eq!(package.images[0].firmware, vec![0x22; 0x400]);
}

#[test]
fn unaligned_firmware_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_bin(dir.path(), "app.bin", 1001);
    let archive = dir.path().join("pkg.zip");

    let err = PackageBuilder::new(52, vec![0xFFFE])
        .application(&app, 1)
        .write(&KeyPair::generate(), &archive)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidImage(_)));
}

#[test]
fn empty_builder_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = PackageBuilder::new(52, vec![0xFFFE])
        .write(&KeyPair::generate(), &dir.path().join("pkg.zip"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidImage(_)));
}

#[test]
fn unpack_refuses_existing_target() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_bin(dir.path(), "app.bin", 0x100);
    let archive = dir.path().join("pkg.zip");
    PackageBuilder::new(52, vec![0xFFFE])
        .application(&app, 1)
        .write(&KeyPair::generate(), &archive)
        .unwrap();

    let target = dir.path().join("out");
    fs::create_dir(&target).unwrap();
    let err = Package::unpack(&archive, &target).unwrap_err();
    assert!(matches!(err, Error::TargetExists(_)));
}

#[test]
fn garbage_archive_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bogus = dir.path().join("bogus.zip");
    fs::write(&bogus, b"not a zip at all").unwrap();
    let err = Package::open(&bogus).unwrap_err();
    assert!(matches!(err, Error::InvalidArchive(_)));
}

#[test]
fn built_package_transfers_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let app = write_bin(dir.path(), "app.bin", 0x2800);
    let archive = dir.path().join("pkg.zip");
    let key = KeyPair::generate();

    PackageBuilder::new(52, vec![0x00B7])
        .application(&app, 2)
        .app_boot_validation(ValidationType::ValidateGeneratedCrc)
        .write(&key, &archive)
        .unwrap();

    let package = Package::open(&archive).unwrap();
    let mut target = DfuTarget::new(MockTarget::new());
    target.perform(&package.images).unwrap();

    let mock = target.transport_mut();
    assert_eq!(mock.open_calls, 1);
    assert_eq!(mock.close_calls, 1);
    assert_eq!(mock.committed_firmware(), fs::read(&app).unwrap().as_slice());
    assert_eq!(mock.executed_inits.len(), 1);
    assert_eq!(mock.executed_inits[0], package.images[0].init_packet);
}
