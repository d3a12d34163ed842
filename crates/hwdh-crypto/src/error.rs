//! Key agreement errors.

use thiserror::Error;

/// Result type alias for key agreement operations.
pub type Result<T> = std::result::Result<T, DhError>;

/// Failure of a keypair generation or DH computation.
///
/// Every variant is a recoverable runtime condition. Missing hardware in
/// particular is expected on most hosts and must be handled by the caller.
#[derive(Debug, Error)]
pub enum DhError {
    /// The randomness source failed or kept producing unusable scalars.
    #[error("random source failure: {0}")]
    RandomSource(String),

    /// Peer public key is truncated, compressed, or not on the curve.
    #[error("unable to decode public key: {0}")]
    PointDecode(String),

    /// Private key material rejected by the backend it was routed to.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Secure Enclave (or another hardware backend) is absent or disabled.
    #[error("no hardware support: {0}")]
    HardwareUnavailable(String),

    /// TPM session could not be opened, or a flush or close failed.
    #[error("TPM session failure: {0}")]
    ModuleSession(String),

    /// TPM primary key could not be re-derived from its template.
    #[error("unable to recreate TPM key: {0}")]
    ModuleKeyDerivation(String),

    /// TPM rejected the peer point or failed during ECDH-ZGen.
    #[error("unable to perform key exchange: {0}")]
    ModuleAgreement(String),
}

impl DhError {
    /// True if the error means "this host cannot serve the key", as opposed
    /// to bad input.
    pub fn is_hardware_failure(&self) -> bool {
        matches!(
            self,
            Self::HardwareUnavailable(_)
                | Self::ModuleSession(_)
                | Self::ModuleKeyDerivation(_)
                | Self::ModuleAgreement(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_classification() {
        assert!(DhError::HardwareUnavailable("x".into()).is_hardware_failure());
        assert!(DhError::ModuleSession("x".into()).is_hardware_failure());
        assert!(!DhError::PointDecode("x".into()).is_hardware_failure());
        assert!(!DhError::RandomSource("x".into()).is_hardware_failure());
    }

    #[test]
    fn test_messages_name_the_failure() {
        let msg = DhError::ModuleKeyDerivation("policy mismatch".into()).to_string();
        assert_eq!(msg, "unable to recreate TPM key: policy mismatch");
    }

    #[test]
    fn test_session_message_fits_release_failures() {
        let msg = DhError::ModuleSession("flush of handle 0x80000000 failed".into()).to_string();
        assert_eq!(msg, "TPM session failure: flush of handle 0x80000000 failed");
    }
}
