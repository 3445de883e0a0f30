//! `nrfdfu` command-line tool.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;

use nrfdfu::dfu::ble::{BleTarget, BleTransport};
use nrfdfu::dfu::serial::{SerialTransport, DEFAULT_BAUD_RATE};
use nrfdfu::dfu::{DfuTarget, DfuTransport, FirmwareType};
use nrfdfu::hexfile::{Format, Image};
use nrfdfu::init_packet::ValidationType;
use nrfdfu::package::{Package, PackageBuilder};
use nrfdfu::settings::{Family, Settings, SettingsArgs};
use nrfdfu::signing::{KeyPair, PubKeyFormat};
use nrfdfu::thread_dfu::{ThreadDfuConfig, ThreadDfuServer};

#[derive(Parser)]
#[command(name = "nrfdfu", version, about = "DFU host tool for nRF5-class devices")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and inspect update packages.
    Pkg {
        #[command(subcommand)]
        command: PkgCommand,
    },
    /// Generate and display signing keys.
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
    /// Send an update package to a device.
    Dfu {
        #[command(subcommand)]
        command: DfuCommand,
    },
    /// Generate and display bootloader settings pages.
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Print version information.
    Version,
}

/// Hex (`0x..`) or decimal integer.
fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s}: {e}"))
}

fn parse_u16_hex(s: &str) -> Result<u16, String> {
    parse_u32(s).and_then(|v| u16::try_from(v).map_err(|e| format!("{s}: {e}")))
}

/// Comma-separated list of FWIDs, e.g. `0xB7,0xB8`.
#[derive(Debug, Clone)]
struct SdReqList(Vec<u32>);

fn parse_sd_req(s: &str) -> Result<SdReqList, String> {
    s.split(',')
        .map(|part| parse_u32(part.trim()))
        .collect::<Result<Vec<u32>, String>>()
        .map(SdReqList)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ValidationKind {
    None,
    Crc,
    Sha256,
    Ecdsa,
}

impl From<ValidationKind> for ValidationType {
    fn from(kind: ValidationKind) -> Self {
        match kind {
            ValidationKind::None => ValidationType::NoValidation,
            ValidationKind::Crc => ValidationType::ValidateGeneratedCrc,
            ValidationKind::Sha256 => ValidationType::ValidateGeneratedSha256,
            ValidationKind::Ecdsa => ValidationType::ValidateEcdsaP256Sha256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FamilyArg {
    Nrf51,
    Nrf52,
    Nrf52qfab,
    Nrf52810,
    Nrf52840,
}

impl From<FamilyArg> for Family {
    fn from(f: FamilyArg) -> Self {
        match f {
            FamilyArg::Nrf51 => Family::Nrf51,
            FamilyArg::Nrf52 => Family::Nrf52,
            FamilyArg::Nrf52qfab => Family::Nrf52QFab,
            FamilyArg::Nrf52810 => Family::Nrf52810,
            FamilyArg::Nrf52840 => Family::Nrf52840,
        }
    }
}

#[derive(Subcommand)]
enum PkgCommand {
    /// Build a signed update package.
    Generate {
        /// Output archive path.
        output: PathBuf,

        /// Private key PEM used to sign the init packets.
        #[arg(long)]
        key_file: PathBuf,

        /// Hardware version stamped into the init packets.
        #[arg(long, value_parser = parse_u32, default_value = "52")]
        hw_version: u32,

        /// SoftDevice FWIDs the update is compatible with.
        #[arg(long, value_parser = parse_sd_req, default_value = "0xFFFE")]
        sd_req: SdReqList,

        /// Application firmware (HEX or BIN).
        #[arg(long)]
        application: Option<PathBuf>,
        #[arg(long, value_parser = parse_u32, default_value = "1")]
        application_version: u32,

        /// Bootloader firmware (HEX or BIN).
        #[arg(long)]
        bootloader: Option<PathBuf>,
        #[arg(long, value_parser = parse_u32, default_value = "1")]
        bootloader_version: u32,

        /// SoftDevice firmware (HEX or BIN).
        #[arg(long)]
        softdevice: Option<PathBuf>,
        #[arg(long, value_parser = parse_u32, default_value = "1")]
        softdevice_version: u32,

        /// Mark the package debug: targets skip version checks.
        #[arg(long)]
        debug_mode: bool,

        /// Post-install boot validation for the application.
        #[arg(long, value_enum, default_value_t = ValidationKind::Crc)]
        app_boot_validation: ValidationKind,

        /// Post-install boot validation for the SoftDevice.
        #[arg(long, value_enum, default_value_t = ValidationKind::None)]
        sd_boot_validation: ValidationKind,

        /// Keep the assembly workspace for inspection.
        #[arg(long)]
        keep_workspace: bool,
    },
    /// Show the contents of an update package.
    Display { package: PathBuf },
}

#[derive(Subcommand)]
enum KeysCommand {
    /// Generate a new private key PEM.
    Generate { output: PathBuf },
    /// Display a key in the requested format.
    Display {
        key_file: PathBuf,
        /// Output format for the public key.
        #[arg(long, value_enum, default_value_t = KeyFormatArg::Hex)]
        format: KeyFormatArg,
        /// Print the private key PEM instead of the public key.
        #[arg(long)]
        private: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KeyFormatArg {
    Hex,
    Pem,
    Code,
}

#[derive(Args)]
struct TransferArgs {
    /// Update package to send.
    #[arg(long)]
    package: Option<PathBuf>,

    /// CRC checkpoint interval in packets (0 disables).
    #[arg(long, value_parser = parse_u32)]
    prn: Option<u32>,

    /// Per-operation response timeout in seconds.
    #[arg(long, default_value = "5")]
    timeout: u64,
}

#[derive(Subcommand)]
enum DfuCommand {
    /// Update over a serial port already in bootloader mode.
    Serial {
        #[command(flatten)]
        transfer: TransferArgs,
        /// Serial port; auto-detected by bootloader VID/PID if omitted.
        #[arg(long)]
        port: Option<String>,
        #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
        baud_rate: u32,
        /// Read the target's hardware and firmware versions instead of
        /// sending a package.
        #[arg(long, conflicts_with = "package")]
        query: bool,
    },
    /// Trigger a USB device into its bootloader, then update over CDC.
    UsbSerial {
        #[command(flatten)]
        transfer: TransferArgs,
        #[arg(long)]
        port: Option<String>,
        #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
        baud_rate: u32,
        /// Application-mode USB vendor id.
        #[arg(long, value_parser = parse_u16_hex, default_value = "0x1915")]
        vid: u16,
        /// Application-mode USB product id.
        #[arg(long, value_parser = parse_u16_hex, default_value = "0x520F")]
        pid: u16,
    },
    /// Update over BLE.
    Ble {
        #[command(flatten)]
        transfer: TransferArgs,
        /// Advertised device name.
        #[arg(long, conflicts_with = "address")]
        name: Option<String>,
        /// Device address `AA:BB:CC:DD:EE:FF`.
        #[arg(long)]
        address: Option<String>,
        /// Negotiated ATT MTU.
        #[arg(long)]
        att_mtu: Option<u16>,
    },
    /// Serve an update to Thread devices over CoAP.
    Thread {
        /// Update package to serve.
        #[arg(long)]
        package: PathBuf,
        /// Local bind address.
        #[arg(long, default_value = "[::]:5683")]
        bind: std::net::SocketAddr,
        /// Push blocks to the multicast group instead of waiting for
        /// unicast requests.
        #[arg(long)]
        multicast: bool,
        /// Multicast push rate, blocks per second.
        #[arg(long, default_value = "1.0")]
        rate: f64,
        /// Block size exponent (2 = 64-byte blocks).
        #[arg(long, default_value = "2")]
        block_szx: u8,
        /// Tell clients to reset this many milliseconds after a
        /// completed multicast upload.
        #[arg(long, value_parser = parse_u32)]
        reset_delay: Option<u32>,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Generate a settings page HEX for out-of-band flashing.
    Generate {
        /// Output HEX path.
        output: PathBuf,

        #[arg(long, value_enum, default_value_t = FamilyArg::Nrf52)]
        family: FamilyArg,

        /// Application firmware the page describes.
        #[arg(long)]
        application: Option<PathBuf>,
        #[arg(long, value_parser = parse_u32, default_value = "1")]
        application_version: u32,
        #[arg(long, value_parser = parse_u32, default_value = "1")]
        bootloader_version: u32,

        /// Settings format version (1 or 2).
        #[arg(long, value_parser = parse_u32, default_value = "2")]
        bl_settings_version: u32,

        /// Override the family's settings page address.
        #[arg(long, value_parser = parse_u32)]
        start_address: Option<u32>,

        /// Skip the backup copy one page below.
        #[arg(long)]
        no_backup: bool,
        #[arg(long, value_parser = parse_u32)]
        backup_address: Option<u32>,

        #[arg(long, value_enum, default_value_t = ValidationKind::Crc)]
        app_boot_validation: ValidationKind,
        #[arg(long, value_enum, default_value_t = ValidationKind::None)]
        sd_boot_validation: ValidationKind,

        /// SoftDevice firmware, for SoftDevice boot validation.
        #[arg(long)]
        softdevice: Option<PathBuf>,

        /// Private key PEM, for ECDSA boot validation.
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
    /// Probe a HEX image for a settings page and show its fields.
    Display { hex_file: PathBuf },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> "),
    );
    bar
}

fn run_transfer<T: DfuTransport>(transport: T, transfer: &TransferArgs) -> anyhow::Result<()> {
    let Some(path) = &transfer.package else {
        bail!("--package is required");
    };
    let package = Package::open(path).with_context(|| format!("opening {}", path.display()))?;
    if package.images.is_empty() {
        bail!("{} contains no firmware images", path.display());
    }

    let mut target = DfuTarget::new(transport);
    target.set_timeout(Duration::from_secs(transfer.timeout));
    if let Some(prn) = transfer.prn {
        target.set_prn_interval(prn.min(u32::from(u16::MAX)) as u16);
    }

    let bar = progress_bar();
    let progress = bar.clone();
    target.on_progress(move |sent, total| {
        if progress.length() != Some(u64::from(total)) {
            progress.set_length(u64::from(total));
        }
        progress.set_position(u64::from(sent));
    });
    let errors = bar.clone();
    target.on_error(move |e| errors.println(format!("retrying: {e}")));
    let timeouts = bar.clone();
    target.on_timeout(move || timeouts.println("target stopped responding"));

    target.perform(&package.images)?;
    bar.finish();
    println!("device updated");
    Ok(())
}

/// Read and print the target's hardware description and firmware slots.
fn run_query<T: DfuTransport>(transport: T, timeout: u64) -> anyhow::Result<()> {
    let mut target = DfuTarget::new(transport);
    target.set_timeout(Duration::from_secs(timeout));
    target.transport_mut().open()?;

    let hw = target.hw_version()?;
    println!("hardware: part 0x{:X}, variant 0x{:X}", hw.part, hw.variant);
    println!(
        "  rom {} KiB ({}-byte pages), ram {} KiB",
        hw.rom_size / 1024,
        hw.rom_page_size,
        hw.ram_size / 1024
    );
    for slot in 0u8..8 {
        let fw = target.fw_version(slot)?;
        if matches!(fw.fw_type, FirmwareType::Unknown(_)) {
            break;
        }
        println!(
            "  slot {slot}: {:?} version {} at 0x{:08X} ({} bytes)",
            fw.fw_type, fw.version, fw.addr, fw.len
        );
    }

    target.transport_mut().close();
    Ok(())
}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").expect("string write");
    }
    s
}

fn pkg_display(path: &Path) -> anyhow::Result<()> {
    let package = Package::open(path)?;
    println!("{}:", path.display());
    if let Some(version) = package.manifest.dfu_version {
        println!("  dfu version: {version}");
    }
    for image in &package.images {
        println!(
            "  {:?}: {} ({} bytes firmware, {} bytes init packet)",
            image.fw_type,
            image.name,
            image.firmware.len(),
            image.init_packet.len()
        );
    }
    let entries = [
        ("application", package.manifest.application.as_ref()),
        ("bootloader", package.manifest.bootloader.as_ref()),
        ("softdevice", package.manifest.softdevice.as_ref()),
    ];
    for (kind, entry) in entries {
        let Some(data) = entry.and_then(|e| e.init_packet_data.as_ref()) else {
            continue;
        };
        println!("  {kind} metadata:");
        if let Some(v) = data.fw_version {
            println!("    fw version: {v}");
        }
        if let Some(v) = data.hw_version {
            println!("    hw version: {v}");
        }
        if !data.sd_req.is_empty() {
            let list: Vec<String> = data.sd_req.iter().map(|v| format!("0x{v:02X}")).collect();
            println!("    sd_req: {}", list.join(", "));
        }
        if let Some(hash) = &data.firmware_hash {
            println!("    firmware hash: {hash}");
        }
    }
    Ok(())
}

fn settings_display(settings: &Settings) {
    println!("settings page at 0x{:08X} ({:?}):", settings.address, settings.family);
    println!("  format version: {}", settings.settings_version);
    println!("  app version: {}", settings.app_version);
    println!("  bootloader version: {}", settings.bl_version);
    println!(
        "  bank 0: {} bytes, crc 0x{:08X}, code 0x{:02X}",
        settings.app_size, settings.app_crc, settings.bank0_bank_code
    );
    if settings.settings_version >= 2 {
        println!("  sd size: {}", settings.sd_size);
        println!(
            "  app boot validation: {:?} {}",
            settings.app_boot_validation.kind,
            hex_string(&settings.app_boot_validation.bytes)
        );
        println!(
            "  sd boot validation: {:?} {}",
            settings.sd_boot_validation.kind,
            hex_string(&settings.sd_boot_validation.bytes)
        );
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Pkg { command } => match command {
            PkgCommand::Generate {
                output,
                key_file,
                hw_version,
                sd_req,
                application,
                application_version,
                bootloader,
                bootloader_version,
                softdevice,
                softdevice_version,
                debug_mode,
                app_boot_validation,
                sd_boot_validation,
                keep_workspace,
            } => {
                let key = KeyPair::from_pem_file(&key_file)?;
                let mut builder = PackageBuilder::new(hw_version, sd_req.0)
                    .debug(debug_mode)
                    .app_boot_validation(app_boot_validation.into())
                    .sd_boot_validation(sd_boot_validation.into())
                    .keep_workspace(keep_workspace);
                if let Some(path) = &application {
                    builder = builder.application(path, application_version);
                }
                if let Some(path) = &bootloader {
                    builder = builder.bootloader(path, bootloader_version);
                }
                if let Some(path) = &softdevice {
                    builder = builder.softdevice(path, softdevice_version);
                }
                builder.write(&key, &output)?;
                println!("wrote {}", output.display());
            }
            PkgCommand::Display { package } => pkg_display(&package)?,
        },
        Command::Keys { command } => match command {
            KeysCommand::Generate { output } => {
                let key = KeyPair::generate();
                fs::write(&output, key.to_pem()?)?;
                println!("wrote {}", output.display());
            }
            KeysCommand::Display {
                key_file,
                format,
                private,
            } => {
                let key = KeyPair::from_pem_file(&key_file)?;
                if private {
                    print!("{}", key.to_pem()?);
                } else {
                    let format = match format {
                        KeyFormatArg::Hex => PubKeyFormat::Hex,
                        KeyFormatArg::Pem => PubKeyFormat::Pem,
                        KeyFormatArg::Code => PubKeyFormat::Code,
                    };
                    println!("{}", key.export_public_key(format)?);
                }
            }
        },
        Command::Dfu { command } => match command {
            DfuCommand::Serial {
                transfer,
                port,
                baud_rate,
                query,
            } => {
                let transport = SerialTransport::new(port, baud_rate)
                    .with_timeout(Duration::from_secs(transfer.timeout));
                if query {
                    run_query(transport, transfer.timeout)?;
                } else {
                    run_transfer(transport, &transfer)?;
                }
            }
            DfuCommand::UsbSerial {
                transfer,
                port,
                baud_rate,
                vid,
                pid,
            } => {
                let transport = SerialTransport::new(port, baud_rate)
                    .with_timeout(Duration::from_secs(transfer.timeout))
                    .with_trigger(vid, pid);
                run_transfer(transport, &transfer)?;
            }
            DfuCommand::Ble {
                transfer,
                name,
                address,
                att_mtu,
            } => {
                let target = match (name, address) {
                    (Some(name), _) => BleTarget::Name(name),
                    (None, Some(address)) => BleTarget::Address(address),
                    (None, None) => bail!("either --name or --address is required"),
                };
                let mut transport = BleTransport::new(target)?;
                if let Some(mtu) = att_mtu {
                    transport.set_att_mtu(mtu);
                }
                run_transfer(transport, &transfer)?;
            }
            DfuCommand::Thread {
                package,
                bind,
                multicast,
                rate,
                block_szx,
                reset_delay,
            } => {
                let package = Package::open(&package)?;
                let Some(image) = package.images.into_iter().next() else {
                    bail!("package contains no firmware images");
                };
                println!(
                    "serving {:?} ({} bytes) over CoAP",
                    image.fw_type,
                    image.firmware.len()
                );
                let config = ThreadDfuConfig {
                    bind,
                    rate,
                    block_szx,
                    multicast,
                    reset_delay_ms: reset_delay,
                    ..Default::default()
                };
                ThreadDfuServer::new(image.init_packet, image.firmware, config).run()?;
                println!("upload complete");
            }
        },
        Command::Settings { command } => match command {
            SettingsCommand::Generate {
                output,
                family,
                application,
                application_version,
                bootloader_version,
                bl_settings_version,
                start_address,
                no_backup,
                backup_address,
                app_boot_validation,
                sd_boot_validation,
                softdevice,
                key_file,
            } => {
                let app = application
                    .as_deref()
                    .map(|p| Image::load(p, Format::Auto))
                    .transpose()?;
                let sd = softdevice
                    .as_deref()
                    .map(|p| Image::load(p, Format::Auto))
                    .transpose()?;
                let key = key_file
                    .as_deref()
                    .map(KeyPair::from_pem_file)
                    .transpose()?;

                let (settings, image) = Settings::generate(&SettingsArgs {
                    family: family.into(),
                    application: app.as_ref(),
                    app_version: application_version,
                    bl_version: bootloader_version,
                    settings_version: bl_settings_version,
                    custom_address: start_address,
                    backup: !no_backup,
                    backup_address,
                    app_boot_validation: app_boot_validation.into(),
                    sd_boot_validation: sd_boot_validation.into(),
                    softdevice: sd.as_ref(),
                    key: key.as_ref(),
                })?;
                image.to_hex(&output)?;
                settings_display(&settings);
                println!("wrote {}", output.display());
            }
            SettingsCommand::Display { hex_file } => {
                let image = Image::load(&hex_file, Format::Hex)?;
                let settings = Settings::probe(&image)?;
                settings_display(&settings);
            }
        },
        Command::Version => {
            println!("nrfdfu {}", env!("CARGO_PKG_VERSION"));
            println!("DFU object protocol version 1");
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
