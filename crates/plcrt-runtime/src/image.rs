//! Module image container format.
//!
//! A module image is an 8-byte header followed by an opaque,
//! externally-produced position-independent payload. The header layout
//! is a bit-for-bit compatibility contract with the build tooling:
//! 4-byte magic, then a little-endian CRC-32 (IEEE) computed over every
//! byte after the header.

use thiserror::Error;

/// Image magic signature.
pub const MAGIC: [u8; 4] = *b"UDLM";

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Image container errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImageError {
    /// The image is shorter than the fixed header.
    #[error("image truncated")]
    Truncated,
    /// The magic signature does not match.
    #[error("invalid image signature")]
    BadMagic,
    /// The payload checksum does not match the header.
    #[error("checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Parsed image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// CRC-32 (IEEE) over the payload.
    pub checksum: u32,
}

impl ImageHeader {
    /// Parse the header and verify the magic signature only.
    ///
    /// The flash execute-in-place path uses this form: the payload is
    /// not read, so its checksum cannot be recomputed.
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ImageError::Truncated);
        }
        if bytes[..4] != MAGIC {
            return Err(ImageError::BadMagic);
        }
        let checksum = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { checksum })
    }

    /// Parse the header and verify magic plus whole-payload checksum.
    pub fn verify(bytes: &[u8]) -> Result<Self, ImageError> {
        let header = Self::parse(bytes)?;
        let actual = crc32fast::hash(&bytes[HEADER_SIZE..]);
        if actual != header.checksum {
            return Err(ImageError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
        Ok(header)
    }

    /// Build a valid header for the given payload.
    #[must_use]
    pub fn seal(payload: &[u8]) -> [u8; HEADER_SIZE] {
        let checksum = crc32fast::hash(payload);
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&MAGIC);
        header[4..].copy_from_slice(&checksum.to_le_bytes());
        header
    }

    /// Return the payload portion of a full image.
    pub fn payload(bytes: &[u8]) -> Result<&[u8], ImageError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ImageError::Truncated);
        }
        Ok(&bytes[HEADER_SIZE..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(payload: &[u8]) -> Vec<u8> {
        let mut image = ImageHeader::seal(payload).to_vec();
        image.extend_from_slice(payload);
        image
    }

    #[test]
    fn seal_then_verify_roundtrips() {
        let image = sealed(b"module payload");
        let header = ImageHeader::verify(&image).unwrap();
        assert_eq!(header.checksum, crc32fast::hash(b"module payload"));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let mut image = sealed(b"module payload");
        let last = image.len() - 1;
        image[last] ^= 0x01;
        assert!(matches!(
            ImageHeader::verify(&image),
            Err(ImageError::ChecksumMismatch { .. })
        ));
        // The magic is intact, so a signature-only parse still succeeds.
        assert!(ImageHeader::parse(&image).is_ok());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut image = sealed(b"payload");
        image[0] = b'X';
        assert_eq!(ImageHeader::parse(&image), Err(ImageError::BadMagic));
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert_eq!(ImageHeader::parse(b"UDL"), Err(ImageError::Truncated));
    }
}
