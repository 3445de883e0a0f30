//! CRC and digest helpers used across the package tooling and the wire
//! protocol.
//!
//! The DFU object protocol checkpoints transfers with CRC-32 (IEEE,
//! reflected), the same polynomial the bootloader runs over its settings
//! page. The CRC-16 variant is the one the legacy serial (HCI) framing
//! used; it survives here because the bootloader-trigger handshake still
//! speaks it.

use crc::{Crc, CRC_32_ISO_HDLC};
use sha2::{Digest, Sha256};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 (IEEE 802.3) over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Incremental CRC-32 matching [`crc32`]. Used by the protocol core to
/// track the running checksum of streamed object data.
pub struct Crc32Digest {
    digest: crc::Digest<'static, u32>,
}

impl Crc32Digest {
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// Checksum of everything fed so far. Does not consume the digest.
    pub fn value(&self) -> u32 {
        self.digest.clone().finalize()
    }
}

impl Default for Crc32Digest {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-16 as computed by the Nordic serial bootloaders (CCITT polynomial,
/// byte-swapped update order).
pub fn crc16_ccitt(data: &[u8], init: u16) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc = (crc >> 8) | (crc << 8);
        crc ^= byte as u16;
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}

/// SHA-256 of `data`, big-endian digest order as produced by the hash.
///
/// Note that init packets and settings pages store the digest
/// byte-reversed; callers reverse where the wire demands it.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vector() {
        // "123456789" is the standard check input for CRC-32/ISO-HDLC.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_digest_matches_oneshot() {
        let data: Vec<u8> = (0u8..=255).collect();
        let mut digest = Crc32Digest::new();
        digest.update(&data[..100]);
        assert_eq!(digest.value(), crc32(&data[..100]));
        digest.update(&data[100..]);
        assert_eq!(digest.value(), crc32(&data));
    }

    #[test]
    fn crc32_prefix_coherence() {
        // Every prefix checksum must equal a fresh run over that prefix.
        let data: Vec<u8> = (0..1024u32).map(|i| (i * 7 + 3) as u8).collect();
        let mut digest = Crc32Digest::new();
        for (i, b) in data.iter().enumerate() {
            digest.update(core::slice::from_ref(b));
            if i % 97 == 0 {
                assert_eq!(digest.value(), crc32(&data[..=i]));
            }
        }
    }

    #[test]
    fn crc16_stable() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let a = crc16_ccitt(&data, 0xFFFF);
        let b = crc16_ccitt(&data, 0xFFFF);
        assert_eq!(a, b);
        assert_ne!(a, 0);
        // Incremental application over split input matches one pass.
        let first = crc16_ccitt(&data[..2], 0xFFFF);
        assert_eq!(crc16_ccitt(&data[2..], first), a);
    }

    #[test]
    fn sha256_known_vector() {
        let digest = sha256(b"abc");
        assert_eq!(
            digest[..4],
            [0xba, 0x78, 0x16, 0xbf],
            "leading bytes of SHA-256(\"abc\")"
        );
    }
}
