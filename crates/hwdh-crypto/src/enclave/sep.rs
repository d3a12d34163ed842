//! `libSEP256` bindings: CryptoKit Secure Enclave P-256 keys exported with
//! C linkage.
//!
//! All buffers are caller-allocated. Lengths are in/out: on entry the
//! capacity, on success the number of bytes written. A `false` return means
//! the enclave refused or is absent.

use super::EnclaveKeyStore;
use crate::error::{DhError, Result};
use crate::key::SharedSecret;
use libc::{c_char, c_int};
use zeroize::Zeroizing;

/// Capacity offered for a key's `dataRepresentation`.
pub const HANDLE_CAPACITY: usize = 300;

/// Capacity offered for an exported public point.
pub const PUBLIC_CAPACITY: usize = 65;

/// Capacity offered for a shared secret.
pub const SECRET_CAPACITY: usize = 64;

extern "C" {
    fn CreateSEP256Key(buffer: *mut c_char, length: *mut c_int) -> bool;

    fn GetSEP256PublicKey(
        private_key: *mut c_char,
        private_key_length: c_int,
        buffer: *mut c_char,
        length: *mut c_int,
    ) -> bool;

    fn SEP256KeyAgreement(
        private_key: *mut c_char,
        private_key_length: c_int,
        public_key: *mut c_char,
        public_key_length: c_int,
        buffer: *mut c_char,
        length: *mut c_int,
    ) -> bool;
}

/// The Secure Enclave of this Mac.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecureEnclave;

fn no_support(call: &str) -> DhError {
    DhError::HardwareUnavailable(format!("no support for Secure Enclave ({call} failed)"))
}

fn c_len(len: usize) -> Option<c_int> {
    c_int::try_from(len).ok()
}

/// Trim an output buffer to the length the enclave reported.
fn written(mut buffer: Vec<u8>, reported: c_int, call: &str) -> Result<Vec<u8>> {
    match usize::try_from(reported) {
        Ok(len) if len <= buffer.len() => {
            buffer.truncate(len);
            Ok(buffer)
        }
        _ => Err(DhError::HardwareUnavailable(format!(
            "{call} reported invalid length {reported}"
        ))),
    }
}

impl EnclaveKeyStore for SecureEnclave {
    fn create_key(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; HANDLE_CAPACITY];
        let mut length = HANDLE_CAPACITY as c_int;

        // SAFETY: buffer is valid for HANDLE_CAPACITY bytes and length holds
        // that capacity; the callee writes at most `length` bytes.
        let ok = unsafe { CreateSEP256Key(buffer.as_mut_ptr() as *mut c_char, &mut length) };
        if !ok {
            return Err(no_support("CreateSEP256Key"));
        }
        written(buffer, length, "CreateSEP256Key")
    }

    fn public_key(&self, handle: &[u8]) -> Result<Vec<u8>> {
        let handle_len = c_len(handle.len())
            .ok_or_else(|| DhError::InvalidPrivateKey("enclave handle too large".into()))?;
        let mut private = handle.to_vec();
        let mut buffer = vec![0u8; PUBLIC_CAPACITY];
        let mut length = PUBLIC_CAPACITY as c_int;

        // SAFETY: `private` is an owned copy valid for handle_len bytes;
        // buffer is valid for PUBLIC_CAPACITY bytes as advertised in length.
        let ok = unsafe {
            GetSEP256PublicKey(
                private.as_mut_ptr() as *mut c_char,
                handle_len,
                buffer.as_mut_ptr() as *mut c_char,
                &mut length,
            )
        };
        if !ok {
            return Err(no_support("GetSEP256PublicKey"));
        }
        written(buffer, length, "GetSEP256PublicKey")
    }

    fn key_agreement(&self, handle: &[u8], peer_public: &[u8]) -> Result<SharedSecret> {
        let handle_len = c_len(handle.len())
            .ok_or_else(|| DhError::InvalidPrivateKey("enclave handle too large".into()))?;
        let public_len = c_len(peer_public.len())
            .ok_or_else(|| DhError::PointDecode("public key too large".into()))?;

        let mut private = handle.to_vec();
        let mut public = peer_public.to_vec();
        let mut buffer = Zeroizing::new(vec![0u8; SECRET_CAPACITY]);
        let mut length = SECRET_CAPACITY as c_int;

        // SAFETY: both inputs are owned copies valid for their advertised
        // lengths; buffer is valid for SECRET_CAPACITY bytes.
        let ok = unsafe {
            SEP256KeyAgreement(
                private.as_mut_ptr() as *mut c_char,
                handle_len,
                public.as_mut_ptr() as *mut c_char,
                public_len,
                buffer.as_mut_ptr() as *mut c_char,
                &mut length,
            )
        };
        if !ok {
            return Err(no_support("SEP256KeyAgreement"));
        }

        let secret = written(std::mem::take(&mut *buffer), length, "SEP256KeyAgreement")?;
        Ok(Zeroizing::new(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_truncates_to_reported() {
        let out = written(vec![1, 2, 3, 4], 2, "test").unwrap();
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn test_written_rejects_bad_lengths() {
        assert!(written(vec![0; 4], 5, "test").is_err());
        assert!(written(vec![0; 4], -1, "test").is_err());
    }
}
