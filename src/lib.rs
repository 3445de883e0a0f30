//!
//! Host-side device firmware upgrade tooling for nRF5 targets.
//!
//! ## About
//!
//! A device running the secure bootloader accepts new firmware over
//! the DFU object protocol: a signed *init packet* describing the
//! firmware, then the firmware itself, both streamed as CRC-checked
//! objects. This crate covers the whole host side of that flow:
//!
//! * building and inspecting signed update packages (zip archives
//!   holding firmware binaries, protobuf init packets, and a JSON
//!   manifest), from Intel-HEX or raw binary input;
//! * ECDSA P-256 key generation, signing, and public-key export;
//! * driving the DFU object protocol over serial/SLIP (with USB
//!   bootloader trigger), BLE, or a Thread/CoAP multicast server;
//! * generating and probing bootloader settings pages.
//!
//! The protocol core is transport-agnostic: anything implementing
//! [`dfu::DfuTransport`] can carry an update.
//!
//! ## Example
//!
//! Build a signed application package:
//!
//! ```no_run
//! use std::path::Path;
//! use nrfdfu::package::PackageBuilder;
//! use nrfdfu::signing::KeyPair;
//!
//! # fn main() -> nrfdfu::Result<()> {
//! let key = KeyPair::from_pem_file(Path::new("private.pem"))?;
//! PackageBuilder::new(52, vec![0x00B7])
//!     .application(Path::new("app.hex"), 1)
//!     .write(&key, Path::new("app_dfu_package.zip"))?;
//! # Ok(())
//! # }
//! ```

pub mod crc;
pub mod dfu;
pub mod error;
pub mod hexfile;
pub mod init_packet;
pub mod manifest;
pub mod package;
pub mod settings;
pub mod signing;
pub mod thread_dfu;

pub use error::{Error, Result};
