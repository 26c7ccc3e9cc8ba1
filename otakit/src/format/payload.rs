/*
 * SPDX-FileCopyrightText: 2022-2025 The otakit developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::io::{self, Read};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Size of the fixed header fields: magic + format version + manifest size +
/// metadata signature size.
pub const PAYLOAD_HEADER_SIZE: u64 = 4 + 8 + 8 + 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown payload magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("Payload metadata ends at {metadata_total}, but payload is only {payload_size} bytes")]
    MetadataOutOfBounds {
        metadata_total: u64,
        payload_size: u64,
    },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The fixed big-endian prefix of an update engine payload. Everything after
/// these fields (the manifest, the metadata signature, and the blobs) is
/// opaque to us; payload generation is delegated to the delta generator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest_size: u64,
    pub metadata_signature_size: u32,
}

impl PayloadHeader {
    /// Parse the header from the beginning of a payload.
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != *PAYLOAD_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = reader.read_u64::<BigEndian>()?;
        if version != 2 {
            return Err(Error::UnsupportedVersion(version));
        }

        let manifest_size = reader.read_u64::<BigEndian>()?;
        let metadata_signature_size = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            version,
            manifest_size,
            metadata_signature_size,
        })
    }

    /// Total size of the metadata region: the fixed header, the manifest, and
    /// the metadata signature. This is the byte range a client needs in order
    /// to check whether the payload is applicable without downloading it.
    pub fn metadata_total(&self) -> u64 {
        PAYLOAD_HEADER_SIZE + self.manifest_size + u64::from(self.metadata_signature_size)
    }

    /// The metadata region must end strictly before the end of the payload.
    /// Anything else means the header is lying about its sizes.
    pub fn check_bounds(&self, payload_size: u64) -> Result<()> {
        let metadata_total = self.metadata_total();

        if metadata_total >= payload_size {
            return Err(Error::MetadataOutOfBounds {
                metadata_total,
                payload_size,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn header_bytes(version: u64, manifest_size: u64, sig_size: u32) -> Vec<u8> {
        let mut buf = PAYLOAD_MAGIC.to_vec();
        buf.extend_from_slice(&version.to_be_bytes());
        buf.extend_from_slice(&manifest_size.to_be_bytes());
        buf.extend_from_slice(&sig_size.to_be_bytes());
        buf
    }

    #[test]
    fn parse_header() {
        let data = header_bytes(2, 1000, 267);
        let header = PayloadHeader::from_reader(Cursor::new(data)).unwrap();

        assert_eq!(header.version, 2);
        assert_eq!(header.manifest_size, 1000);
        assert_eq!(header.metadata_signature_size, 267);
        assert_eq!(header.metadata_total(), 24 + 1000 + 267);
    }

    #[test]
    fn bad_magic() {
        let mut data = header_bytes(2, 0, 0);
        data[0] = b'X';

        assert_matches!(
            PayloadHeader::from_reader(Cursor::new(data)),
            Err(Error::UnknownMagic(_))
        );
    }

    #[test]
    fn bad_version() {
        let data = header_bytes(1, 0, 0);

        assert_matches!(
            PayloadHeader::from_reader(Cursor::new(data)),
            Err(Error::UnsupportedVersion(1))
        );
    }

    #[test]
    fn metadata_must_end_before_payload() {
        let header = PayloadHeader {
            version: 2,
            manifest_size: 100,
            metadata_signature_size: 10,
        };

        assert_matches!(header.check_bounds(1000), Ok(()));
        assert_matches!(
            header.check_bounds(134),
            Err(Error::MetadataOutOfBounds {
                metadata_total: 134,
                payload_size: 134,
            })
        );
        assert_matches!(
            header.check_bounds(100),
            Err(Error::MetadataOutOfBounds { .. })
        );
    }
}
