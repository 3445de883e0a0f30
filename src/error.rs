//! Error taxonomy shared by the package tooling and the DFU protocol.

use std::path::PathBuf;

use crate::dfu::{ExtError, ResultCode};

/// Errors produced by package assembly, key handling, and firmware
/// transfer.
///
/// [`Error::Validation`] is recoverable: the protocol core catches it at
/// CRC checkpoints and retries the current object within its retry
/// budget. Every other variant propagates to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A firmware image failed normalization: empty, not word-aligned,
    /// or not parseable in the declared format.
    #[error("invalid firmware image: {0}")]
    InvalidImage(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A package archive is structurally broken: bad zip, missing or
    /// empty files, manifest referencing entries that do not exist.
    #[error("invalid package archive: {0}")]
    InvalidArchive(String),

    /// Unpack target directory already exists.
    #[error("target directory already exists: {0}")]
    TargetExists(PathBuf),

    #[error("cannot load signing key: {0}")]
    KeyLoad(String),

    #[error("signing failed: {0}")]
    Sign(String),

    #[error("signature verification failed")]
    Verify,

    /// `recv_op` did not produce a frame within the per-operation
    /// timeout. Triggers the timeout event and closes the transport.
    #[error("timed out waiting for target response")]
    OperationTimeout,

    /// The target produced a frame that is not a well-formed response.
    #[error("malformed response: {0}")]
    Operation(String),

    /// The target answered with a result code other than `Success`.
    /// `ext` carries the detail byte after an `ExtError` result.
    #[error("target responded {result:?} (ext {ext:?})")]
    Response {
        result: ResultCode,
        ext: Option<ExtError>,
    },

    /// CRC or offset mismatch at a checkpoint. Caught inside the
    /// protocol core; never escapes a successful transfer.
    #[error("checkpoint mismatch (offset {offset:?}, crc {crc:?})")]
    Validation {
        offset: Option<u32>,
        crc: Option<u32>,
    },

    /// The per-object retry budget is exhausted.
    #[error("firmware transfer failed after retries")]
    TransferFailed,

    /// The init command does not fit the target's command object.
    #[error("init packet too long: {len} > max {max}")]
    InitTooLong { len: usize, max: usize },

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("usb error: {0}")]
    Usb(String),

    #[error("ble error: {0}")]
    Ble(String),

    #[error("coap error: {0}")]
    Coap(String),

    /// No device matching the requested port, name, or address.
    #[error("device not found: {0}")]
    DeviceNotFound(String),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// True for errors the protocol core may retry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }
}
