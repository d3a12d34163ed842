//! NIST P-256 Diffie-Hellman for Noise, backed by software, the Secure
//! Enclave or a TPM.
//!
//! This crate provides:
//! - A Noise DH function ([`DhFunction`]) for P-256
//! - An in-process P-256 engine
//! - A bridge to Secure Enclave keys through `libSEP256`
//! - A bridge to a TPM 2.0 primary key through `tss-esapi`
//! - Dispatch of each request to the backend holding the private key
//!
//! # Design
//!
//! Private keys are tagged with their backend ([`PrivateKey`]). Keys stored
//! in the older length-tagged byte format are classified on the way in:
//! more than 65 bytes is an enclave handle, exactly 65 bytes is the TPM
//! marker, anything else is a software scalar.
//!
//! Hardware that is missing is an ordinary error, never a panic. TPM
//! sessions and key contexts are released on every exit path.
//!
//! # Example
//!
//! ```
//! use hwdh_crypto::{DhFunction, NistDh};
//!
//! let dh = NistDh::software_only();
//! let alice = dh.generate_keypair(None).unwrap();
//! let bob = dh.generate_keypair(None).unwrap();
//!
//! let a = dh.agree(alice.private(), bob.public()).unwrap();
//! let b = dh.agree(bob.private(), alice.public()).unwrap();
//! assert_eq!(*a, *b);
//! assert_eq!(dh.dh_len(), 65);
//! ```

#![deny(unsafe_code)]

pub mod curve;
pub mod dispatch;
pub mod enclave;
pub mod error;
pub mod key;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod software;
pub mod tpm;

pub use curve::Curve;
pub use dispatch::{DhBackend, DhFunction, NistDh};
pub use enclave::{EnclaveBridge, EnclaveKeyStore};
pub use error::{DhError, Result};
pub use key::{Backend, Keypair, PrivateKey, SharedSecret};
pub use software::SoftwareEngine;
pub use tpm::{TpmBridge, TpmModule};
