//! Backend dispatch and the Noise DH function interface.
//!
//! [`NistDh`] is what the protocol layer sees. It owns one backend per
//! [`Backend`] kind and routes every request by the private key:
//!
//! ```text
//!                     ┌─► SoftwareEngine   (PrivateKey::Software, len <  65)
//! DH(priv, pub) ──────┼─► TpmBridge        (PrivateKey::Module,   len == 65)
//!   classify(priv)    └─► EnclaveBridge    (PrivateKey::Enclave,  len >  65)
//! ```
//!
//! The shared secret comes back from the backend unchanged.

use crate::curve::Curve;
use crate::enclave::EnclaveBridge;
use crate::error::{DhError, Result};
use crate::key::{Backend, Keypair, PrivateKey, SharedSecret};
use crate::software::SoftwareEngine;
use crate::tpm::TpmBridge;
use hwdh_common::config::DhConfig;
use rand::rngs::OsRng;
use rand_core::CryptoRngCore;

/// One execution environment for P-256 key agreement.
pub trait DhBackend: Send + Sync {
    /// Which key variant this backend serves.
    fn backend(&self) -> Backend;

    /// Create (or, for the TPM, re-derive) a keypair.
    fn generate_keypair(&self, rng: &mut dyn CryptoRngCore) -> Result<Keypair>;

    /// Shared secret of `private` with the encoded peer point.
    fn dh(&self, private: &PrivateKey, peer_public: &[u8]) -> Result<SharedSecret>;
}

/// DH function as defined by the Noise Protocol Framework.
pub trait DhFunction: Send + Sync {
    /// New keypair. `None` uses the operating system's CSPRNG.
    fn generate_keypair(&self, rng: Option<&mut dyn CryptoRngCore>) -> Result<Keypair>;

    /// Shared secret of a private key (legacy byte form) with a public key.
    fn dh(&self, private_key: &[u8], public_key: &[u8]) -> Result<SharedSecret>;

    /// Encoded **public key** length.
    fn dh_len(&self) -> usize;

    /// Curve name used in protocol names, e.g. `"P256"`.
    fn dh_name(&self) -> &'static str;
}

/// P-256 DH function with software, Secure Enclave and TPM backends.
pub struct NistDh {
    curve: Curve,
    software: Box<dyn DhBackend>,
    enclave: Option<Box<dyn DhBackend>>,
    module: Option<Box<dyn DhBackend>>,
}

impl Default for NistDh {
    fn default() -> Self {
        Self::p256()
    }
}

impl NistDh {
    /// Software backend plus this platform's enclave; no TPM.
    pub fn p256() -> Self {
        Self::software_only().with_enclave(EnclaveBridge::platform())
    }

    /// Only the software backend. Hardware keys fail with
    /// [`DhError::HardwareUnavailable`].
    pub fn software_only() -> Self {
        Self {
            curve: Curve::P256,
            software: Box::new(SoftwareEngine::new()),
            enclave: None,
            module: None,
        }
    }

    /// Backends enabled by `config`.
    pub fn from_config(config: &DhConfig) -> Self {
        let mut dh = Self::software_only();
        if config.enclave {
            dh = dh.with_enclave(EnclaveBridge::platform());
        }
        if let Some(tpm) = &config.tpm {
            dh = dh.with_module(TpmBridge::from_config(tpm));
        }
        tracing::debug!(
            enclave = dh.enclave.is_some(),
            tpm = dh.module.is_some(),
            "configured {} DH backends",
            dh.curve.name()
        );
        dh
    }

    pub fn with_software(mut self, backend: impl DhBackend + 'static) -> Self {
        self.software = Box::new(backend);
        self
    }

    pub fn with_enclave(mut self, backend: impl DhBackend + 'static) -> Self {
        self.enclave = Some(Box::new(backend));
        self
    }

    pub fn with_module(mut self, backend: impl DhBackend + 'static) -> Self {
        self.module = Some(Box::new(backend));
        self
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// Length of the software DH output (the x-coordinate).
    pub fn shared_secret_len(&self) -> usize {
        self.curve.dh_len()
    }

    /// Backend serving `kind`, if configured.
    pub fn backend(&self, kind: Backend) -> Result<&dyn DhBackend> {
        let backend = match kind {
            Backend::Software => Some(&self.software),
            Backend::Enclave => self.enclave.as_ref(),
            Backend::Module => self.module.as_ref(),
        };
        backend
            .map(|b| b.as_ref())
            .ok_or_else(|| DhError::HardwareUnavailable(format!("{kind} backend is not configured")))
    }

    /// Shared secret of a typed private key with a peer point.
    pub fn agree(&self, private: &PrivateKey, peer_public: &[u8]) -> Result<SharedSecret> {
        let kind = private.backend();
        tracing::debug!(backend = %kind, key_len = private.as_bytes().len(), "routing DH");
        self.backend(kind)?.dh(private, peer_public)
    }

    /// Keypair held by a specific backend.
    pub fn generate_keypair_in(
        &self,
        kind: Backend,
        rng: Option<&mut dyn CryptoRngCore>,
    ) -> Result<Keypair> {
        let backend = self.backend(kind)?;
        match rng {
            Some(rng) => backend.generate_keypair(rng),
            None => backend.generate_keypair(&mut OsRng),
        }
    }
}

impl DhFunction for NistDh {
    /// Generates a software keypair; use
    /// [`generate_keypair_in`](NistDh::generate_keypair_in) for hardware keys.
    fn generate_keypair(&self, rng: Option<&mut dyn CryptoRngCore>) -> Result<Keypair> {
        self.generate_keypair_in(Backend::Software, rng)
    }

    fn dh(&self, private_key: &[u8], public_key: &[u8]) -> Result<SharedSecret> {
        self.agree(&PrivateKey::classify(private_key), public_key)
    }

    // NOTE: Noise uses DHLEN both for the public key size and for the size of
    // DH() output. For NIST ECDH those differ (65 vs 32). The protocol layer
    // only reads this value as the public key size, so that is what is
    // returned. DH() output length is unaffected. Do not "fix" this without
    // updating the protocol layer: handshake messages would be mis-framed.
    fn dh_len(&self) -> usize {
        self.curve.pub_len()
    }

    fn dh_name(&self) -> &'static str {
        self.curve.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEnclave, MockTpm};
    use hwdh_common::config::{AuthValue, TpmConfig};

    #[test]
    fn test_metadata() {
        let dh = NistDh::software_only();
        assert_eq!(dh.dh_len(), 65);
        assert_eq!(dh.dh_name(), "P256");
        assert_eq!(dh.shared_secret_len(), 32);
    }

    #[test]
    fn test_generate_defaults_to_software() {
        let dh = NistDh::software_only();
        let keypair = dh.generate_keypair(None).unwrap();
        assert_eq!(keypair.backend(), Backend::Software);
        assert_eq!(keypair.public().len(), dh.dh_len());
    }

    #[test]
    fn test_unconfigured_hardware_is_unavailable() {
        let dh = NistDh::software_only();
        let peer = dh.generate_keypair(None).unwrap();

        assert!(matches!(
            dh.dh(&[0u8; 65], peer.public()),
            Err(DhError::HardwareUnavailable(_))
        ));
        assert!(matches!(
            dh.dh(&[0u8; 100], peer.public()),
            Err(DhError::HardwareUnavailable(_))
        ));
        assert!(dh.generate_keypair_in(Backend::Module, None).is_err());
    }

    #[test]
    fn test_from_config_without_tpm() {
        let config = DhConfig {
            tpm: None,
            enclave: false,
        };
        let dh = NistDh::from_config(&config);
        assert!(dh.backend(Backend::Software).is_ok());
        assert!(dh.backend(Backend::Enclave).is_err());
        assert!(dh.backend(Backend::Module).is_err());
    }

    #[test]
    fn test_from_config_registers_tpm() {
        let config = DhConfig {
            tpm: Some(TpmConfig::new(AuthValue::from_hex("01020304").unwrap())),
            enclave: true,
        };
        let dh = NistDh::from_config(&config);
        assert_eq!(dh.backend(Backend::Module).unwrap().backend(), Backend::Module);
        assert_eq!(dh.backend(Backend::Enclave).unwrap().backend(), Backend::Enclave);
    }

    #[test]
    fn test_legacy_bytes_route_to_hardware() {
        let auth = AuthValue::from_hex("01020304").unwrap();
        let dh = NistDh::software_only()
            .with_enclave(EnclaveBridge::new(MockEnclave::new()))
            .with_module(TpmBridge::new(MockTpm::new(), auth));

        let peer = dh.generate_keypair(None).unwrap();
        let tpm_key = dh.generate_keypair_in(Backend::Module, None).unwrap();
        let enclave_key = dh.generate_keypair_in(Backend::Enclave, None).unwrap();

        for keypair in [&tpm_key, &enclave_key] {
            let via_bytes = dh.dh(&keypair.legacy_private_bytes(), peer.public()).unwrap();
            let via_type = dh.agree(keypair.private(), peer.public()).unwrap();
            let from_peer = dh.agree(peer.private(), keypair.public()).unwrap();
            assert_eq!(*via_bytes, *via_type);
            assert_eq!(*via_bytes, *from_peer);
        }
    }
}
