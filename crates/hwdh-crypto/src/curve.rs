//! Named curve descriptor and SEC1 point encoding helpers.

use crate::error::{DhError, Result};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;

/// SEC1 tag byte of an uncompressed point.
pub const UNCOMPRESSED_TAG: u8 = 0x04;

/// Static description of a NIST curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Curve {
    name: &'static str,
    dh_len: usize,
    pub_len: usize,
}

impl Curve {
    /// NIST P-256 (secp256r1).
    pub const P256: Curve = Curve::nist("P256", 256);

    const fn nist(name: &'static str, bit_size: usize) -> Self {
        let byte_len = (bit_size + 7) / 8;
        Self {
            name,
            dh_len: byte_len,
            // Standard uncompressed format, type (1 byte) plus both coordinates
            pub_len: 1 + 2 * byte_len,
        }
    }

    /// Curve identifier as used in Noise protocol names.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Coordinate length in bytes; also the software DH output length.
    pub const fn dh_len(&self) -> usize {
        self.dh_len
    }

    /// Length of an uncompressed encoded public key.
    pub const fn pub_len(&self) -> usize {
        self.pub_len
    }

    /// Decode and validate an uncompressed P-256 point.
    ///
    /// Rejects wrong lengths, compressed or identity encodings and points
    /// that are not on the curve.
    pub fn decode_point(&self, encoded: &[u8]) -> Result<PublicKey> {
        if encoded.len() != self.pub_len {
            return Err(DhError::PointDecode(format!(
                "{} public key must be {} bytes (uncompressed), got {}",
                self.name,
                self.pub_len,
                encoded.len()
            )));
        }
        if encoded[0] != UNCOMPRESSED_TAG {
            return Err(DhError::PointDecode(format!(
                "expected uncompressed point tag 0x04, got {:#04x}",
                encoded[0]
            )));
        }

        // Also checks the point is on the curve.
        PublicKey::from_sec1_bytes(encoded)
            .map_err(|_| DhError::PointDecode(format!("not a valid {} point", self.name)))
    }

    /// Decode a point and return its fixed-width affine coordinates.
    pub fn point_coordinates(&self, encoded: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let point = self.decode_point(encoded)?.to_encoded_point(false);
        let bytes = point.as_bytes();
        let (x, y) = bytes[1..].split_at(self.dh_len);
        Ok((x.to_vec(), y.to_vec()))
    }

    /// Build an uncompressed point from affine coordinates.
    ///
    /// Coordinates shorter than the field size are left-padded, as TPMs may
    /// strip leading zero bytes.
    pub fn encode_coordinates(&self, x: &[u8], y: &[u8]) -> Result<Vec<u8>> {
        if x.len() > self.dh_len || y.len() > self.dh_len {
            return Err(DhError::PointDecode(format!(
                "coordinate longer than {} bytes",
                self.dh_len
            )));
        }

        let mut encoded = vec![0u8; self.pub_len];
        encoded[0] = UNCOMPRESSED_TAG;
        encoded[1 + self.dh_len - x.len()..1 + self.dh_len].copy_from_slice(x);
        encoded[self.pub_len - y.len()..].copy_from_slice(y);

        self.decode_point(&encoded)?;
        Ok(encoded)
    }
}
