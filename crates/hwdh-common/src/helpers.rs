//! Common helper functions for hwdh.

use sha2::{Digest, Sha256};

/// Number of digest bytes shown in a key fingerprint.
const FINGERPRINT_LEN: usize = 8;

/// Short, log-safe fingerprint of a public key.
///
/// Hex encoding of the first 8 bytes of SHA-256 over the encoded key.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..FINGERPRINT_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_length() {
        assert_eq!(fingerprint(&[0x04; 65]).len(), 16);
        assert_eq!(fingerprint(&[]).len(), 16);
    }

    #[test]
    fn test_fingerprint_stable() {
        let key = [0x04u8, 0x01, 0x02, 0x03];
        assert_eq!(fingerprint(&key), fingerprint(&key));
        assert_ne!(fingerprint(&key), fingerprint(&[0x04u8, 0x01, 0x02, 0x04]));
    }

    #[test]
    fn test_fingerprint_known_value() {
        // SHA-256("") = e3b0c44298fc1c14...
        assert_eq!(fingerprint(&[]), "e3b0c44298fc1c14");
    }
}
