//! ECDSA P-256 key handling for package signing and settings boot
//! validation.
//!
//! Signatures go on the wire as `R || S`, 32 bytes each, with every
//! half byte-reversed. This is the historical order the bootloaders
//! verify against; it must not be normalized.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{EncodePublicKey, LineEnding};
use p256::SecretKey;
use rand_core::OsRng;

use crate::error::{Error, Result};

/// Public key export formats for `keys display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubKeyFormat {
    /// Raw 64 bytes (X || Y, little-endian halves) as hex.
    Hex,
    /// SubjectPublicKeyInfo PEM.
    Pem,
    /// C source fragment for embedding in a bootloader build.
    Code,
}

/// An ECDSA P-256 keypair. Private material is loaded once and never
/// written back except through [`KeyPair::to_pem`].
pub struct KeyPair {
    secret: SecretKey,
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let signing = SigningKey::from(&secret);
        Self { secret, signing }
    }

    /// Load a private key from SEC1 PEM (`BEGIN EC PRIVATE KEY`), the
    /// format the existing tooling emits.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let secret =
            SecretKey::from_sec1_pem(pem).map_err(|e| Error::KeyLoad(e.to_string()))?;
        let signing = SigningKey::from(&secret);
        Ok(Self { secret, signing })
    }

    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = fs::read_to_string(path)?;
        Self::from_pem(&pem)
    }

    /// Serialize the private key as SEC1 PEM.
    pub fn to_pem(&self) -> Result<String> {
        let pem = self
            .secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|e| Error::Sign(e.to_string()))?;
        Ok(pem.to_string())
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing.verifying_key()
    }

    /// Sign `message` (SHA-256 + ECDSA) and return the wire-order
    /// signature: `R || S` with each half byte-reversed.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64]> {
        let signature: Signature = self.signing.sign(message);
        let bytes = signature.to_bytes();

        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&bytes[..32]);
        out[32..].copy_from_slice(&bytes[32..]);
        out[..32].reverse();
        out[32..].reverse();
        Ok(out)
    }

    /// Verify a wire-order signature produced by [`KeyPair::sign`].
    pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8; 64]) -> Result<()> {
        let mut canonical = [0u8; 64];
        canonical[..32].copy_from_slice(&signature[..32]);
        canonical[32..].copy_from_slice(&signature[32..]);
        canonical[..32].reverse();
        canonical[32..].reverse();

        let signature = Signature::from_slice(&canonical).map_err(|_| Error::Verify)?;
        key.verify(message, &signature).map_err(|_| Error::Verify)
    }

    /// Public key as the 64 raw bytes the bootloader embeds: X then Y,
    /// each coordinate byte-reversed.
    pub fn public_key_raw(&self) -> [u8; 64] {
        let point = self.verifying_key().to_encoded_point(false);
        let bytes = point.as_bytes(); // 0x04 || X || Y

        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&bytes[1..33]);
        out[32..].copy_from_slice(&bytes[33..65]);
        out[..32].reverse();
        out[32..].reverse();
        out
    }

    /// Export the public key in the requested format.
    pub fn export_public_key(&self, format: PubKeyFormat) -> Result<String> {
        match format {
            PubKeyFormat::Hex => {
                let raw = self.public_key_raw();
                let mut s = String::with_capacity(128);
                for b in raw {
                    write!(s, "{b:02x}").expect("string write");
                }
                Ok(s)
            }
            PubKeyFormat::Pem => self
                .verifying_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| Error::Sign(e.to_string())),
            PubKeyFormat::Code => {
                let raw = self.public_key_raw();
                let mut s = String::new();
                s.push_str("/** @brief Public key used to verify DFU images */\n");
                s.push_str("__ALIGN(4) const uint8_t pk[64] =\n{\n");
                for row in raw.chunks(8) {
                    s.push_str("    ");
                    for b in row {
                        write!(s, "0x{b:02x}, ").expect("string write");
                    }
                    s.pop();
                    s.push('\n');
                }
                s.push_str("};\n");
                Ok(s)
            }
        }
    }
}
