//! Private key representations and keypairs.
//!
//! Keys used to be told apart by the length of their private buffer alone.
//! [`PrivateKey`] makes the backend explicit; [`PrivateKey::classify`] still
//! understands the length convention so existing key files keep working:
//!
//! | Buffer length | Backend                       |
//! |---------------|-------------------------------|
//! | `> 65`        | Secure Enclave key handle     |
//! | `== 65`       | TPM marker (no key material)  |
//! | otherwise     | raw software scalar (32)      |

use std::fmt;
use zeroize::Zeroizing;

/// Length of a legacy TPM marker; equal to an uncompressed P-256 point.
pub const MODULE_MARKER_LEN: usize = 65;

/// Shared secret produced by a DH computation. Zeroized on drop.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// Execution environment that holds a private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// In-process P-256 arithmetic.
    Software,
    /// Apple Secure Enclave through `libSEP256`.
    Enclave,
    /// Discrete TPM 2.0.
    Module,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Software => "software",
            Self::Enclave => "secure-enclave",
            Self::Module => "tpm",
        };
        f.write_str(name)
    }
}

/// Private key, tagged with the backend that can use it.
#[derive(Clone, PartialEq, Eq)]
pub enum PrivateKey {
    /// Big-endian P-256 scalar.
    Software(Zeroizing<Vec<u8>>),
    /// Opaque enclave key blob. Not raw scalar material.
    Enclave(Vec<u8>),
    /// The TPM primary key, re-derived on every use.
    Module,
}

impl PrivateKey {
    /// Interpret a legacy private key buffer by its length.
    ///
    /// A 65-byte buffer is always taken to be a TPM marker, even if it
    /// happens to hold something else.
    pub fn classify(bytes: &[u8]) -> Self {
        match bytes.len() {
            n if n > MODULE_MARKER_LEN => Self::Enclave(bytes.to_vec()),
            MODULE_MARKER_LEN => Self::Module,
            _ => Self::Software(Zeroizing::new(bytes.to_vec())),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Self::Software(_) => Backend::Software,
            Self::Enclave(_) => Backend::Enclave,
            Self::Module => Backend::Module,
        }
    }

    /// Bytes handed to the backend. Empty for the TPM marker.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Software(scalar) => scalar,
            Self::Enclave(handle) => handle,
            Self::Module => &[],
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Software(scalar) => write!(f, "Software(<{} bytes redacted>)", scalar.len()),
            Self::Enclave(handle) => write!(f, "Enclave(<{} byte handle>)", handle.len()),
            Self::Module => f.write_str("Module"),
        }
    }
}

/// Private key plus its uncompressed public point (`0x04 || X || Y`).
#[derive(Debug, Clone)]
pub struct Keypair {
    private: PrivateKey,
    public: Vec<u8>,
}

impl Keypair {
    pub fn new(private: PrivateKey, public: Vec<u8>) -> Self {
        Self { private, public }
    }

    pub fn private(&self) -> &PrivateKey {
        &self.private
    }

    pub fn public(&self) -> &[u8] {
        &self.public
    }

    pub fn backend(&self) -> Backend {
        self.private.backend()
    }

    /// Private key in the length-tagged legacy format.
    ///
    /// TPM keys are written as their 65-byte public point, which both marks
    /// the key as module-resident and records which key was derived.
    pub fn legacy_private_bytes(&self) -> Zeroizing<Vec<u8>> {
        match &self.private {
            PrivateKey::Module => Zeroizing::new(self.public.clone()),
            other => Zeroizing::new(other.as_bytes().to_vec()),
        }
    }

    pub fn into_parts(self) -> (PrivateKey, Vec<u8>) {
        (self.private, self.public)
    }
}
