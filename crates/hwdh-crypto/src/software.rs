//! In-process NIST P-256 ECDH.
//!
//! Uses the RustCrypto `p256` crate. Public keys are uncompressed SEC1
//! points (`0x04 || x || y`, 65 bytes); private keys are 32-byte big-endian
//! scalars; shared secrets are the 32-byte x-coordinate of `d * Q`.

use crate::curve::Curve;
use crate::dispatch::DhBackend;
use crate::error::{DhError, Result};
use crate::key::{Backend, Keypair, PrivateKey, SharedSecret};
use hwdh_common::helpers::fingerprint;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use rand_core::CryptoRngCore;
use zeroize::Zeroizing;

/// Scalar draws allowed before giving up on the randomness source.
const MAX_SCALAR_DRAWS: u32 = 16;

/// Software P-256 engine.
#[derive(Debug, Clone, Copy)]
pub struct SoftwareEngine {
    curve: Curve,
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareEngine {
    pub fn new() -> Self {
        Self {
            curve: Curve::P256,
        }
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// Draw a scalar in `[1, n)` by rejection sampling.
    ///
    /// Unlike `SecretKey::random` this reports a failing source instead of
    /// panicking.
    fn random_secret(&self, rng: &mut dyn CryptoRngCore) -> Result<SecretKey> {
        let mut candidate = Zeroizing::new(vec![0u8; self.curve.dh_len()]);
        for _ in 0..MAX_SCALAR_DRAWS {
            rng.try_fill_bytes(&mut candidate)
                .map_err(|e| DhError::RandomSource(e.to_string()))?;
            // Zero and values >= n are rejected here.
            if let Ok(secret) = SecretKey::from_slice(&candidate) {
                return Ok(secret);
            }
        }
        Err(DhError::RandomSource(format!(
            "no valid scalar after {MAX_SCALAR_DRAWS} draws"
        )))
    }

    /// Generate a keypair from the given randomness source.
    pub fn generate(&self, rng: &mut dyn CryptoRngCore) -> Result<Keypair> {
        let secret = self.random_secret(rng)?;
        let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        let scalar = Zeroizing::new(secret.to_bytes().to_vec());

        tracing::debug!(public = %fingerprint(&public), "generated software keypair");
        Ok(Keypair::new(PrivateKey::Software(scalar), public))
    }

    /// Public point for an existing scalar.
    pub fn public_key(&self, scalar: &[u8]) -> Result<Vec<u8>> {
        let secret = self.parse_scalar(scalar)?;
        Ok(secret.public_key().to_encoded_point(false).as_bytes().to_vec())
    }

    /// ECDH of a raw scalar with an encoded peer point.
    ///
    /// Returns exactly `dh_len` bytes. Malformed or off-curve peer keys fail
    /// with [`DhError::PointDecode`].
    pub fn agree(&self, scalar: &[u8], peer_public: &[u8]) -> Result<SharedSecret> {
        let peer = self.curve.decode_point(peer_public)?;
        let secret = self.parse_scalar(scalar)?;

        let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = Zeroizing::new(vec![0u8; self.curve.dh_len()]);
        out.copy_from_slice(&shared.raw_secret_bytes()[..]);
        Ok(out)
    }

    fn parse_scalar(&self, scalar: &[u8]) -> Result<SecretKey> {
        if scalar.len() > self.curve.dh_len() {
            return Err(DhError::InvalidPrivateKey(format!(
                "{} scalar must be at most {} bytes, got {}",
                self.curve.name(),
                self.curve.dh_len(),
                scalar.len()
            )));
        }
        SecretKey::from_slice(scalar).map_err(|_| {
            DhError::InvalidPrivateKey(format!("not a valid {} scalar", self.curve.name()))
        })
    }
}

impl DhBackend for SoftwareEngine {
    fn backend(&self) -> Backend {
        Backend::Software
    }

    fn generate_keypair(&self, rng: &mut dyn CryptoRngCore) -> Result<Keypair> {
        self.generate(rng)
    }

    fn dh(&self, private: &PrivateKey, peer_public: &[u8]) -> Result<SharedSecret> {
        match private {
            PrivateKey::Software(scalar) => self.agree(scalar, peer_public),
            other => Err(DhError::InvalidPrivateKey(format!(
                "{} key routed to the software engine",
                other.backend()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scalar(keypair: &Keypair) -> &[u8] {
        keypair.private().as_bytes()
    }

    #[test]
    fn test_key_exchange_commutativity() {
        let engine = SoftwareEngine::new();
        let alice = engine.generate(&mut OsRng).unwrap();
        let bob = engine.generate(&mut OsRng).unwrap();

        let alice_shared = engine.agree(scalar(&alice), bob.public()).unwrap();
        let bob_shared = engine.agree(scalar(&bob), alice.public()).unwrap();

        assert_eq!(*alice_shared, *bob_shared);
    }

    #[test]
    fn test_generate_shapes() {
        let keypair = SoftwareEngine::new().generate(&mut OsRng).unwrap();
        assert_eq!(keypair.backend(), Backend::Software);
        assert_eq!(scalar(&keypair).len(), 32);
        assert_eq!(keypair.public().len(), 65);
        assert_eq!(keypair.public()[0], 0x04);
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let engine = SoftwareEngine::new();
        let a = engine.generate(&mut StdRng::seed_from_u64(7)).unwrap();
        let b = engine.generate(&mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a.public(), b.public());
    }

    #[test]
    fn test_shared_secret_is_32_bytes_and_deterministic() {
        let engine = SoftwareEngine::new();
        let alice = engine.generate(&mut OsRng).unwrap();
        let bob = engine.generate(&mut OsRng).unwrap();

        let first = engine.agree(scalar(&alice), bob.public()).unwrap();
        let second = engine.agree(scalar(&alice), bob.public()).unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(*first, *second);
    }

    #[test]
    fn test_public_key_matches_generated() {
        let engine = SoftwareEngine::new();
        let keypair = engine.generate(&mut OsRng).unwrap();
        assert_eq!(engine.public_key(scalar(&keypair)).unwrap(), keypair.public());
    }

    #[test]
    fn test_rejects_zero_scalar() {
        let engine = SoftwareEngine::new();
        let peer = engine.generate(&mut OsRng).unwrap();
        let err = engine.agree(&[0u8; 32], peer.public()).unwrap_err();
        assert!(matches!(err, DhError::InvalidPrivateKey(_)));
    }

    #[test]
    fn test_rejects_scalar_above_order() {
        let engine = SoftwareEngine::new();
        let peer = engine.generate(&mut OsRng).unwrap();
        let err = engine.agree(&[0xff; 32], peer.public()).unwrap_err();
        assert!(matches!(err, DhError::InvalidPrivateKey(_)));
    }

    #[test]
    fn test_rejects_off_curve_peer() {
        let engine = SoftwareEngine::new();
        let alice = engine.generate(&mut OsRng).unwrap();
        let mut bad = engine.generate(&mut OsRng).unwrap().public().to_vec();
        bad[10] ^= 0x55;

        let err = engine.agree(scalar(&alice), &bad).unwrap_err();
        assert!(matches!(err, DhError::PointDecode(_)));
    }

    #[test]
    fn test_rejects_truncated_peer() {
        let engine = SoftwareEngine::new();
        let alice = engine.generate(&mut OsRng).unwrap();
        let bob = engine.generate(&mut OsRng).unwrap();

        for len in [0, 1, 33, 64] {
            let err = engine.agree(scalar(&alice), &bob.public()[..len]).unwrap_err();
            assert!(matches!(err, DhError::PointDecode(_)), "len {len}");
        }
    }

    #[test]
    fn test_failing_rng_is_reported() {
        struct BrokenRng;

        impl rand_core::RngCore for BrokenRng {
            fn next_u32(&mut self) -> u32 {
                0
            }
            fn next_u64(&mut self) -> u64 {
                0
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(0);
            }
            fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> std::result::Result<(), rand_core::Error> {
                Err(rand_core::Error::new("entropy source offline"))
            }
        }
        impl rand_core::CryptoRng for BrokenRng {}

        let err = SoftwareEngine::new().generate(&mut BrokenRng).unwrap_err();
        assert!(matches!(err, DhError::RandomSource(_)));
    }

    #[test]
    fn test_degenerate_rng_exhausts_draws() {
        // Always yields zero, which is never a valid scalar.
        struct ZeroRng;

        impl rand_core::RngCore for ZeroRng {
            fn next_u32(&mut self) -> u32 {
                0
            }
            fn next_u64(&mut self) -> u64 {
                0
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(0);
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand_core::Error> {
                dest.fill(0);
                Ok(())
            }
        }
        impl rand_core::CryptoRng for ZeroRng {}

        let err = SoftwareEngine::new().generate(&mut ZeroRng).unwrap_err();
        assert!(matches!(err, DhError::RandomSource(_)));
    }

    #[test]
    fn test_rejects_foreign_key_variant() {
        let engine = SoftwareEngine::new();
        let peer = engine.generate(&mut OsRng).unwrap();
        let err = DhBackend::dh(&engine, &PrivateKey::Module, peer.public()).unwrap_err();
        assert!(matches!(err, DhError::InvalidPrivateKey(_)));
    }
}
