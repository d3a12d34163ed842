//! Mock hardware for testing.
//!
//! Both mocks do real P-256 arithmetic with the `p256` crate, so keys they
//! hold agree with software keys exactly as the hardware would.

use crate::curve::Curve;
use crate::enclave::EnclaveKeyStore;
use crate::error::{DhError, Result};
use crate::key::SharedSecret;
use crate::tpm::{EccPoint, Hierarchy, KeyContext, PrimaryTemplate, TpmModule, TpmSession};
use hwdh_common::config::AuthValue;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

/// Length of mock enclave handles; longer than a marker like real blobs.
pub const MOCK_HANDLE_LEN: usize = 97;

/// In-memory stand-in for the Secure Enclave.
///
/// Clones share the same key store.
#[derive(Clone, Default)]
pub struct MockEnclave {
    keys: Arc<Mutex<HashMap<Vec<u8>, SecretKey>>>,
    last_agreement: Arc<Mutex<Option<(Vec<u8>, Vec<u8>)>>>,
}

impl MockEnclave {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle and peer key seen by the most recent agreement.
    pub fn last_agreement(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.last_agreement.lock().ok()?.clone()
    }

    pub fn key_count(&self) -> usize {
        self.keys.lock().map(|keys| keys.len()).unwrap_or(0)
    }

    fn lookup(&self, handle: &[u8]) -> Result<SecretKey> {
        let keys = self
            .keys
            .lock()
            .map_err(|_| DhError::HardwareUnavailable("mock enclave poisoned".into()))?;
        keys.get(handle)
            .cloned()
            .ok_or_else(|| DhError::HardwareUnavailable("no support for Secure Enclave".into()))
    }
}

impl EnclaveKeyStore for MockEnclave {
    fn create_key(&self) -> Result<Vec<u8>> {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let mut handle = vec![0u8; MOCK_HANDLE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut handle);

        self.keys
            .lock()
            .map_err(|_| DhError::HardwareUnavailable("mock enclave poisoned".into()))?
            .insert(handle.clone(), secret);
        Ok(handle)
    }

    fn public_key(&self, handle: &[u8]) -> Result<Vec<u8>> {
        let secret = self.lookup(handle)?;
        Ok(secret.public_key().to_encoded_point(false).as_bytes().to_vec())
    }

    fn key_agreement(&self, handle: &[u8], peer_public: &[u8]) -> Result<SharedSecret> {
        if let Ok(mut last) = self.last_agreement.lock() {
            *last = Some((handle.to_vec(), peer_public.to_vec()));
        }

        let secret = self.lookup(handle)?;
        // CryptoKit rejects bad points inside the enclave; same answer here.
        let peer = Curve::P256
            .decode_point(peer_public)
            .map_err(|_| DhError::HardwareUnavailable("no support for Secure Enclave".into()))?;
        let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }
}

/// Where a [`MockTpm`] should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmFault {
    Open,
    CreatePrimary,
    /// The key loads, but its public area cannot be read back.
    PrimaryPublic,
    EcdhZGen,
    Close,
}

/// Resource accounting for a [`MockTpm`].
#[derive(Debug, Default)]
pub struct TpmCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    derives: AtomicUsize,
    flushes: AtomicUsize,
    agreements: AtomicUsize,
    double_releases: AtomicUsize,
}

impl TpmCounters {
    /// Sessions successfully opened.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Close calls, including failed ones.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Primary keys successfully derived.
    pub fn derives(&self) -> usize {
        self.derives.load(Ordering::SeqCst)
    }

    /// Key contexts flushed.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// ECDH-ZGen calls that produced a point.
    pub fn agreements(&self) -> usize {
        self.agreements.load(Ordering::SeqCst)
    }

    /// Flushes of an unloaded handle plus closes of a closed session.
    pub fn double_releases(&self) -> usize {
        self.double_releases.load(Ordering::SeqCst)
    }

    /// Sessions and key contexts still held. Negative means released more
    /// often than acquired.
    pub fn outstanding(&self) -> (isize, isize) {
        (
            self.opens() as isize - self.closes() as isize,
            self.derives() as isize - self.flushes() as isize,
        )
    }
}

/// Deterministic software TPM.
///
/// The primary key is a hash of the seed and template, so it is the same
/// every time it is derived, like a real primary seed.
#[derive(Clone)]
pub struct MockTpm {
    seed: [u8; 32],
    fault: Option<TpmFault>,
    counters: Arc<TpmCounters>,
    next_handle: Arc<AtomicU32>,
}

impl Default for MockTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTpm {
    /// First handle value; real TPMs hand out transient handles from 0x80000000.
    const TRANSIENT_BASE: u32 = 0x8000_0000;

    pub fn new() -> Self {
        Self::with_seed([0x5e; 32])
    }

    /// A different seed models a different TPM.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            seed,
            fault: None,
            counters: Arc::new(TpmCounters::default()),
            next_handle: Arc::new(AtomicU32::new(Self::TRANSIENT_BASE)),
        }
    }

    pub fn with_fault(mut self, fault: TpmFault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn counters(&self) -> Arc<TpmCounters> {
        Arc::clone(&self.counters)
    }
}

impl TpmModule for MockTpm {
    fn open(&self) -> Result<Box<dyn TpmSession>> {
        if self.fault == Some(TpmFault::Open) {
            return Err(DhError::ModuleSession(
                "unable to open TPM: mock device missing".into(),
            ));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTpmSession {
            tpm: self.clone(),
            loaded: HashMap::new(),
            closed: false,
        }))
    }
}

struct MockTpmSession {
    tpm: MockTpm,
    loaded: HashMap<u32, SecretKey>,
    closed: bool,
}

impl MockTpmSession {
    fn derive_secret(&self, template: &PrimaryTemplate) -> Result<SecretKey> {
        let attrs = &template.attributes;
        let mut hasher = Sha256::new();
        hasher.update(self.tpm.seed);
        hasher.update(template.curve.name().as_bytes());
        hasher.update([match template.hierarchy {
            Hierarchy::Owner => 1u8,
            Hierarchy::Endorsement => 2u8,
        }]);
        hasher.update([
            attrs.decrypt as u8,
            attrs.sensitive_data_origin as u8,
            attrs.user_with_auth as u8,
            attrs.fixed_tpm as u8,
            attrs.fixed_parent as u8,
        ]);
        let digest = hasher.finalize();
        SecretKey::from_slice(&digest)
            .map_err(|_| DhError::ModuleKeyDerivation("mock seed produced no key".into()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DhError::ModuleSession("session already closed".into()));
        }
        Ok(())
    }
}

impl TpmSession for MockTpmSession {
    fn create_primary(
        &mut self,
        template: &PrimaryTemplate,
        _auth: &AuthValue,
    ) -> Result<KeyContext> {
        self.ensure_open()?;
        if self.tpm.fault == Some(TpmFault::CreatePrimary) {
            return Err(DhError::ModuleKeyDerivation("template rejected by policy".into()));
        }

        let secret = self.derive_secret(template)?;
        let handle = self.tpm.next_handle.fetch_add(1, Ordering::SeqCst);
        self.loaded.insert(handle, secret);
        self.tpm.counters.derives.fetch_add(1, Ordering::SeqCst);
        Ok(KeyContext(handle))
    }

    fn primary_public(&mut self, key: KeyContext) -> Result<EccPoint> {
        self.ensure_open()?;
        if self.tpm.fault == Some(TpmFault::PrimaryPublic) {
            return Err(DhError::ModuleKeyDerivation(
                "primary key is not an ECC key".into(),
            ));
        }

        let secret = self.loaded.get(&key.0).ok_or_else(|| {
            DhError::ModuleKeyDerivation(format!("handle {:#x} not loaded", key.0))
        })?;
        let encoded = secret.public_key().to_encoded_point(false);
        let (x, y) = encoded.as_bytes()[1..].split_at(Curve::P256.dh_len());
        Ok(EccPoint {
            x: x.to_vec(),
            y: y.to_vec(),
        })
    }

    fn ecdh_z_gen(
        &mut self,
        key: KeyContext,
        _auth: &AuthValue,
        peer: &EccPoint,
    ) -> Result<EccPoint> {
        self.ensure_open()?;
        if self.tpm.fault == Some(TpmFault::EcdhZGen) {
            return Err(DhError::ModuleAgreement("TPM_RC_ECC_POINT".into()));
        }

        let secret = self
            .loaded
            .get(&key.0)
            .ok_or_else(|| DhError::ModuleAgreement(format!("handle {:#x} not loaded", key.0)))?;
        let encoded = Curve::P256
            .encode_coordinates(&peer.x, &peer.y)
            .map_err(|e| DhError::ModuleAgreement(e.to_string()))?;
        let peer = Curve::P256
            .decode_point(&encoded)
            .map_err(|e| DhError::ModuleAgreement(e.to_string()))?;

        let z = (peer.to_projective() * *secret.to_nonzero_scalar())
            .to_affine()
            .to_encoded_point(false);
        let (x, y) = z.as_bytes()[1..].split_at(Curve::P256.dh_len());

        self.tpm.counters.agreements.fetch_add(1, Ordering::SeqCst);
        Ok(EccPoint {
            x: x.to_vec(),
            y: y.to_vec(),
        })
    }

    fn flush_context(&mut self, key: KeyContext) -> Result<()> {
        if self.loaded.remove(&key.0).is_none() {
            self.tpm.counters.double_releases.fetch_add(1, Ordering::SeqCst);
            return Err(DhError::ModuleSession(format!("handle {:#x} not loaded", key.0)));
        }
        self.tpm.counters.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            self.tpm.counters.double_releases.fetch_add(1, Ordering::SeqCst);
        }
        self.tpm.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.closed = true;
        if self.tpm.fault == Some(TpmFault::Close) {
            return Err(DhError::ModuleSession("mock close failure".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_catch_double_release() {
        let tpm = MockTpm::new();
        let counters = tpm.counters();
        let mut session = tpm.open().unwrap();
        let auth = AuthValue::from_hex("01020304").unwrap();

        let key = session
            .create_primary(&PrimaryTemplate::p256_ecdh(), &auth)
            .unwrap();
        session.flush_context(key).unwrap();
        assert!(session.flush_context(key).is_err());
        session.close().unwrap();
        session.close().unwrap();

        assert_eq!(counters.double_releases(), 2);
        assert_eq!(counters.outstanding(), (-1, 0));
    }

    #[test]
    fn test_primary_public_is_fixed_width() {
        let tpm = MockTpm::new();
        let mut session = tpm.open().unwrap();
        let auth = AuthValue::from_hex("01020304").unwrap();

        let key = session
            .create_primary(&PrimaryTemplate::p256_ecdh(), &auth)
            .unwrap();
        let public = session.primary_public(key).unwrap();
        assert_eq!(public.x.len(), 32);
        assert_eq!(public.y.len(), 32);
        session.flush_context(key).unwrap();
        session.close().unwrap();
    }
}
