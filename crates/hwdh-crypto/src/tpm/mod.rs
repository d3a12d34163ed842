//! TPM 2.0 key agreement.
//!
//! The TPM key is never stored. Every operation opens a session, re-derives
//! the owner-hierarchy primary key from a fixed template and authorization
//! value, uses it, then flushes the key context and closes the session.
//! Primary key derivation is deterministic: the same template and auth value
//! on the same TPM always give the same key, which is how later calls find
//! "the" TPM key.
//!
//! # Agreement flow
//!
//! ```text
//! open session ─► create primary ─► decode peer ─► ECDH-ZGen ─► Z.x
//!       │                │                │             │
//!       └────────────────┴─── on any exit: flush key, close session
//! ```
//!
//! Release is tied to [`ScopedSession`]'s `Drop`, so it runs exactly once
//! whether the call succeeds or fails part-way.

#[cfg(feature = "tpm")]
pub mod esapi;

use crate::curve::Curve;
use crate::dispatch::DhBackend;
use crate::error::{DhError, Result};
use crate::key::{Backend, Keypair, PrivateKey, SharedSecret};
use hwdh_common::config::{AuthValue, TpmConfig};
use hwdh_common::helpers::fingerprint;
use rand_core::CryptoRngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Hierarchy a primary key is derived under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
    Owner,
    Endorsement,
}

/// Object attributes of the primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyAttributes {
    pub decrypt: bool,
    pub sensitive_data_origin: bool,
    pub user_with_auth: bool,
    pub fixed_tpm: bool,
    pub fixed_parent: bool,
}

/// Public template of the primary key.
///
/// Changing any field derives a different key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryTemplate {
    pub hierarchy: Hierarchy,
    pub curve: Curve,
    pub attributes: KeyAttributes,
}

impl PrimaryTemplate {
    /// Unrestricted P-256 decryption key usable for ECDH-ZGen, name
    /// algorithm SHA-256, no scheme, no KDF, empty PCR policy.
    pub const fn p256_ecdh() -> Self {
        Self {
            hierarchy: Hierarchy::Owner,
            curve: Curve::P256,
            attributes: KeyAttributes {
                decrypt: true,
                sensitive_data_origin: true,
                user_with_auth: true,
                fixed_tpm: false,
                fixed_parent: false,
            },
        }
    }
}

impl Default for PrimaryTemplate {
    fn default() -> Self {
        Self::p256_ecdh()
    }
}

/// Loaded-object handle inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyContext(pub u32);

/// Affine point as exchanged with the TPM (raw big-endian coordinates).
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EccPoint {
    pub x: Vec<u8>,
    pub y: Vec<u8>,
}

impl std::fmt::Debug for EccPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EccPoint(x: {} bytes, y: {} bytes)", self.x.len(), self.y.len())
    }
}

/// Loaded primary key and its public point.
#[derive(Debug, Clone)]
pub struct PrimaryKey {
    pub context: KeyContext,
    pub public: EccPoint,
}

/// Connection to a TPM.
pub trait TpmModule: Send + Sync {
    /// Open a new session. Fails with [`DhError::ModuleSession`].
    fn open(&self) -> Result<Box<dyn TpmSession>>;
}

/// One open TPM session.
pub trait TpmSession {
    /// Load the primary key. Fails with [`DhError::ModuleKeyDerivation`].
    ///
    /// Once this returns `Ok` the key context is loaded and must be flushed,
    /// even if reading its public point fails.
    fn create_primary(&mut self, template: &PrimaryTemplate, auth: &AuthValue)
        -> Result<KeyContext>;

    /// Public point of a loaded primary key. Fails with
    /// [`DhError::ModuleKeyDerivation`].
    fn primary_public(&mut self, key: KeyContext) -> Result<EccPoint>;

    /// Fails with [`DhError::ModuleAgreement`].
    fn ecdh_z_gen(&mut self, key: KeyContext, auth: &AuthValue, peer: &EccPoint)
        -> Result<EccPoint>;

    fn flush_context(&mut self, key: KeyContext) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Module for builds without TPM support.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedModule;

impl TpmModule for UnsupportedModule {
    fn open(&self) -> Result<Box<dyn TpmSession>> {
        Err(DhError::ModuleSession(
            "unable to open TPM: support is not compiled into this build".into(),
        ))
    }
}

/// Session plus at most one derived key, released on drop.
pub struct ScopedSession {
    session: Box<dyn TpmSession>,
    key: Option<KeyContext>,
}

impl ScopedSession {
    pub fn open(module: &dyn TpmModule) -> Result<Self> {
        let session = module.open()?;
        Ok(Self { session, key: None })
    }

    /// Derive the primary key. The key context is flushed when the scope ends.
    pub fn derive_primary(
        &mut self,
        template: &PrimaryTemplate,
        auth: &AuthValue,
    ) -> Result<PrimaryKey> {
        self.release_key();
        let context = self.session.create_primary(template, auth)?;
        self.key = Some(context);
        let public = self.session.primary_public(context)?;
        Ok(PrimaryKey { context, public })
    }

    pub fn ecdh_z_gen(
        &mut self,
        key: KeyContext,
        auth: &AuthValue,
        peer: &EccPoint,
    ) -> Result<EccPoint> {
        self.session.ecdh_z_gen(key, auth, peer)
    }

    fn release_key(&mut self) {
        if let Some(key) = self.key.take() {
            if let Err(e) = self.session.flush_context(key) {
                tracing::warn!("failed to flush TPM key context {:#x}: {}", key.0, e);
            }
        }
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        self.release_key();
        if let Err(e) = self.session.close() {
            tracing::warn!("failed to close TPM session: {}", e);
        }
    }
}

/// Backend that performs ECDH with the TPM primary key.
pub struct TpmBridge {
    module: Box<dyn TpmModule>,
    auth: AuthValue,
    template: PrimaryTemplate,
}

impl TpmBridge {
    pub fn new(module: impl TpmModule + 'static, auth: AuthValue) -> Self {
        Self {
            module: Box::new(module),
            auth,
            template: PrimaryTemplate::p256_ecdh(),
        }
    }

    /// Bridge for the configured TCTI. Without the `tpm` feature the bridge
    /// reports every call as a session failure.
    pub fn from_config(config: &TpmConfig) -> Self {
        #[cfg(feature = "tpm")]
        {
            Self::new(esapi::EsapiModule::new(&config.tcti), config.auth.clone())
        }
        #[cfg(not(feature = "tpm"))]
        {
            Self::new(UnsupportedModule, config.auth.clone())
        }
    }

    pub fn with_template(mut self, template: PrimaryTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn template(&self) -> &PrimaryTemplate {
        &self.template
    }

    fn curve(&self) -> Curve {
        self.template.curve
    }

    /// Re-derive the primary key and export its public point.
    ///
    /// Nothing random happens: repeated calls return the same point.
    pub fn generate(&self) -> Result<Keypair> {
        let mut scope = ScopedSession::open(self.module.as_ref())?;
        let primary = scope.derive_primary(&self.template, &self.auth)?;
        let public = self
            .curve()
            .encode_coordinates(&primary.public.x, &primary.public.y)
            .map_err(|e| DhError::ModuleKeyDerivation(format!("TPM returned a bad point: {e}")))?;

        tracing::info!(public = %fingerprint(&public), "derived TPM primary key");
        Ok(Keypair::new(PrivateKey::Module, public))
    }

    /// ECDH of the TPM primary key with a peer point; returns Z's x-coordinate.
    pub fn agree(&self, peer_public: &[u8]) -> Result<SharedSecret> {
        let mut scope = ScopedSession::open(self.module.as_ref())
            .inspect_err(|e| tracing::warn!("{}", e))?;
        let primary = scope
            .derive_primary(&self.template, &self.auth)
            .inspect_err(|e| tracing::warn!("{}", e))?;

        let (x, y) = self.curve().point_coordinates(peer_public)?;
        let peer = EccPoint { x, y };

        let z = scope
            .ecdh_z_gen(primary.context, &self.auth, &peer)
            .inspect_err(|e| tracing::warn!("{}", e))?;
        if z.x.is_empty() {
            return Err(DhError::ModuleAgreement("TPM returned an empty Z point".into()));
        }

        Ok(Zeroizing::new(z.x.clone()))
    }
}

impl DhBackend for TpmBridge {
    fn backend(&self) -> Backend {
        Backend::Module
    }

    /// The key comes from the TPM's primary seed; `rng` is not used.
    fn generate_keypair(&self, _rng: &mut dyn CryptoRngCore) -> Result<Keypair> {
        self.generate()
    }

    fn dh(&self, private: &PrivateKey, peer_public: &[u8]) -> Result<SharedSecret> {
        match private {
            PrivateKey::Module => self.agree(peer_public),
            other => Err(DhError::InvalidPrivateKey(format!(
                "{} key routed to the TPM",
                other.backend()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTpm, TpmFault};
    use crate::software::SoftwareEngine;
    use rand::rngs::OsRng;

    fn auth() -> AuthValue {
        AuthValue::from_hex("a1b2c3d4").unwrap()
    }

    #[test]
    fn test_generate_is_deterministic() {
        let bridge = TpmBridge::new(MockTpm::new(), auth());
        let first = bridge.generate().unwrap();
        let second = bridge.generate().unwrap();

        assert_eq!(first.backend(), Backend::Module);
        assert_eq!(first.public(), second.public());
        assert_eq!(first.public().len(), 65);
    }

    #[test]
    fn test_template_changes_key() {
        let tpm = MockTpm::new();
        let default = TpmBridge::new(tpm.clone(), auth()).generate().unwrap();

        let mut template = PrimaryTemplate::p256_ecdh();
        template.attributes.fixed_tpm = true;
        let other = TpmBridge::new(tpm, auth())
            .with_template(template)
            .generate()
            .unwrap();

        assert_ne!(default.public(), other.public());
    }

    #[test]
    fn test_agrees_with_software_peer() {
        let bridge = TpmBridge::new(MockTpm::new(), auth());
        let software = SoftwareEngine::new();

        let tpm_key = bridge.generate().unwrap();
        let peer = software.generate(&mut OsRng).unwrap();

        let from_tpm = bridge.agree(peer.public()).unwrap();
        let from_peer = software
            .agree(peer.private().as_bytes(), tpm_key.public())
            .unwrap();

        assert_eq!(from_tpm.len(), 32);
        assert_eq!(*from_tpm, *from_peer);
    }

    #[test]
    fn test_error_kinds_per_step() {
        let peer = SoftwareEngine::new().generate(&mut OsRng).unwrap();

        let open = TpmBridge::new(MockTpm::new().with_fault(TpmFault::Open), auth());
        assert!(matches!(open.agree(peer.public()), Err(DhError::ModuleSession(_))));

        let derive = TpmBridge::new(MockTpm::new().with_fault(TpmFault::CreatePrimary), auth());
        assert!(matches!(
            derive.agree(peer.public()),
            Err(DhError::ModuleKeyDerivation(_))
        ));

        let ecdh = TpmBridge::new(MockTpm::new().with_fault(TpmFault::EcdhZGen), auth());
        assert!(matches!(
            ecdh.agree(peer.public()),
            Err(DhError::ModuleAgreement(_))
        ));

        let bridge = TpmBridge::new(MockTpm::new(), auth());
        assert!(matches!(
            bridge.agree(&peer.public()[..40]),
            Err(DhError::PointDecode(_))
        ));
    }

    #[test]
    fn test_close_failure_does_not_mask_result() {
        let peer = SoftwareEngine::new().generate(&mut OsRng).unwrap();
        let tpm = MockTpm::new().with_fault(TpmFault::Close);
        let bridge = TpmBridge::new(tpm.clone(), auth());

        assert!(bridge.agree(peer.public()).is_ok());
        assert_eq!(tpm.counters().flushes(), 1);
    }

    #[test]
    fn test_key_loaded_before_public_read_is_flushed() {
        let peer = SoftwareEngine::new().generate(&mut OsRng).unwrap();
        let tpm = MockTpm::new().with_fault(TpmFault::PrimaryPublic);
        let counters = tpm.counters();
        let bridge = TpmBridge::new(tpm, auth());

        assert!(matches!(bridge.generate(), Err(DhError::ModuleKeyDerivation(_))));
        assert!(matches!(
            bridge.agree(peer.public()),
            Err(DhError::ModuleKeyDerivation(_))
        ));

        assert_eq!(counters.derives(), 2);
        assert_eq!(counters.flushes(), 2);
        assert_eq!(counters.closes(), 2);
        assert_eq!(counters.agreements(), 0);
        assert_eq!(counters.double_releases(), 0);
    }

    #[test]
    fn test_open_failure_message() {
        let bridge = TpmBridge::new(MockTpm::new().with_fault(TpmFault::Open), auth());
        let err = bridge.generate().unwrap_err();
        assert!(err.to_string().contains("unable to open TPM"), "{err}");
    }

    #[test]
    fn test_unsupported_module() {
        let bridge = TpmBridge::new(UnsupportedModule, auth());
        assert!(matches!(bridge.generate(), Err(DhError::ModuleSession(_))));
    }

    #[test]
    fn test_rejects_foreign_key_variant() {
        let bridge = TpmBridge::new(MockTpm::new(), auth());
        let err = DhBackend::dh(&bridge, &PrivateKey::Enclave(vec![0; 80]), &[0x04; 65]).unwrap_err();
        assert!(matches!(err, DhError::InvalidPrivateKey(_)));
    }
}
