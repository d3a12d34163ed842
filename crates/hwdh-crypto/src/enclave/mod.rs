//! Secure Enclave key agreement.
//!
//! The enclave owns the private key; this side only ever sees an opaque
//! handle (the key's `dataRepresentation`) and the public point. Both buffers
//! are passed across the boundary unchanged and the enclave does the scalar
//! multiplication.
//!
//! The store is a trait so the bridge can run against the real enclave
//! ([`sep::SecureEnclave`], macOS with the `secure-enclave` feature), the
//! [`UnsupportedEnclave`] fallback, or a test double.

#[cfg(all(feature = "secure-enclave", target_os = "macos"))]
#[allow(unsafe_code)]
pub mod sep;

use crate::dispatch::DhBackend;
use crate::error::{DhError, Result};
use crate::key::{Backend, Keypair, PrivateKey, SharedSecret};
use hwdh_common::helpers::fingerprint;
use rand_core::CryptoRngCore;

/// Narrow view of the enclave's foreign interface.
pub trait EnclaveKeyStore: Send + Sync {
    /// Create a new key and return its opaque handle.
    fn create_key(&self) -> Result<Vec<u8>>;

    /// Uncompressed public point for a handle.
    fn public_key(&self, handle: &[u8]) -> Result<Vec<u8>>;

    /// ECDH inside the enclave.
    fn key_agreement(&self, handle: &[u8], peer_public: &[u8]) -> Result<SharedSecret>;
}

/// Store for hosts without a Secure Enclave. Every call fails with
/// [`DhError::HardwareUnavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedEnclave;

impl UnsupportedEnclave {
    fn unavailable<T>() -> Result<T> {
        Err(DhError::HardwareUnavailable(
            "Secure Enclave is not available on this platform".into(),
        ))
    }
}

impl EnclaveKeyStore for UnsupportedEnclave {
    fn create_key(&self) -> Result<Vec<u8>> {
        Self::unavailable()
    }

    fn public_key(&self, _handle: &[u8]) -> Result<Vec<u8>> {
        Self::unavailable()
    }

    fn key_agreement(&self, _handle: &[u8], _peer_public: &[u8]) -> Result<SharedSecret> {
        Self::unavailable()
    }
}

/// Backend that forwards key generation and agreement to an enclave store.
pub struct EnclaveBridge {
    store: Box<dyn EnclaveKeyStore>,
}

impl EnclaveBridge {
    pub fn new(store: impl EnclaveKeyStore + 'static) -> Self {
        Self {
            store: Box::new(store),
        }
    }

    /// Bridge to this platform's enclave, or to [`UnsupportedEnclave`].
    pub fn platform() -> Self {
        #[cfg(all(feature = "secure-enclave", target_os = "macos"))]
        {
            Self::new(sep::SecureEnclave)
        }
        #[cfg(not(all(feature = "secure-enclave", target_os = "macos")))]
        {
            Self::new(UnsupportedEnclave)
        }
    }

    /// Bridge that refuses every request.
    pub fn unsupported() -> Self {
        Self::new(UnsupportedEnclave)
    }

    /// Create a key inside the enclave and export its public point.
    pub fn generate(&self) -> Result<Keypair> {
        let handle = self.store.create_key().inspect_err(|e| {
            tracing::warn!("enclave key creation failed: {}", e);
        })?;
        let public = self.store.public_key(&handle).inspect_err(|e| {
            tracing::warn!("enclave public key export failed: {}", e);
        })?;

        tracing::info!(
            public = %fingerprint(&public),
            handle_len = handle.len(),
            "created Secure Enclave key"
        );
        Ok(Keypair::new(PrivateKey::Enclave(handle), public))
    }

    /// Shared secret of an enclave key with a peer point.
    pub fn agree(&self, handle: &[u8], peer_public: &[u8]) -> Result<SharedSecret> {
        self.store
            .key_agreement(handle, peer_public)
            .inspect_err(|e| tracing::warn!("enclave key agreement failed: {}", e))
    }
}

impl DhBackend for EnclaveBridge {
    fn backend(&self) -> Backend {
        Backend::Enclave
    }

    /// The enclave draws its own randomness; `rng` is not used.
    fn generate_keypair(&self, _rng: &mut dyn CryptoRngCore) -> Result<Keypair> {
        self.generate()
    }

    fn dh(&self, private: &PrivateKey, peer_public: &[u8]) -> Result<SharedSecret> {
        match private {
            PrivateKey::Enclave(handle) => self.agree(handle, peer_public),
            other => Err(DhError::InvalidPrivateKey(format!(
                "{} key routed to the Secure Enclave",
                other.backend()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEnclave;
    use crate::software::SoftwareEngine;
    use rand::rngs::OsRng;

    #[test]
    fn test_unsupported_reports_hardware_unavailable() {
        let bridge = EnclaveBridge::unsupported();
        assert!(matches!(
            bridge.generate(),
            Err(DhError::HardwareUnavailable(_))
        ));
        assert!(matches!(
            bridge.agree(&[1u8; 100], &[0x04; 65]),
            Err(DhError::HardwareUnavailable(_))
        ));
    }

    #[test]
    fn test_generate_returns_handle_and_point() {
        let bridge = EnclaveBridge::new(MockEnclave::new());
        let keypair = bridge.generate().unwrap();

        assert_eq!(keypair.backend(), Backend::Enclave);
        assert!(keypair.private().as_bytes().len() > 65);
        assert_eq!(keypair.public().len(), 65);
        assert_eq!(keypair.public()[0], 0x04);
    }

    #[test]
    fn test_agrees_with_software_peer() {
        let bridge = EnclaveBridge::new(MockEnclave::new());
        let software = SoftwareEngine::new();

        let enclave_key = bridge.generate().unwrap();
        let peer = software.generate(&mut OsRng).unwrap();

        let from_enclave = bridge
            .agree(enclave_key.private().as_bytes(), peer.public())
            .unwrap();
        let from_peer = software
            .agree(peer.private().as_bytes(), enclave_key.public())
            .unwrap();

        assert_eq!(*from_enclave, *from_peer);
    }

    #[test]
    fn test_buffers_pass_through_unchanged() {
        let enclave = MockEnclave::new();
        let bridge = EnclaveBridge::new(enclave.clone());
        let keypair = bridge.generate().unwrap();
        let peer = SoftwareEngine::new().generate(&mut OsRng).unwrap();

        bridge
            .agree(keypair.private().as_bytes(), peer.public())
            .unwrap();

        let (handle, public) = enclave.last_agreement().unwrap();
        assert_eq!(handle, keypair.private().as_bytes());
        assert_eq!(public, peer.public());
    }

    #[test]
    fn test_unknown_handle_fails_without_panic() {
        let bridge = EnclaveBridge::new(MockEnclave::new());
        let peer = SoftwareEngine::new().generate(&mut OsRng).unwrap();
        assert!(matches!(
            bridge.agree(&[0xee; 97], peer.public()),
            Err(DhError::HardwareUnavailable(_))
        ));
    }
}
