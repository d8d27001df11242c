use crc::{Crc, CRC_32_ISO_HDLC};
use sha1::{Digest, Sha1};

use crate::fdt::DtbBlob;
use crate::firmware::Firmware;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32/ISO-HDLC, stored big-endian as FIT does.
pub fn crc32_be(data: &[u8]) -> [u8; 4] {
    CRC32.checksum(data).to_be_bytes()
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Digest algorithms recognised in FIT `hash-*` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Crc32,
    Sha1,
}

impl HashAlgo {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "crc32" => Some(Self::Crc32),
            "sha1" => Some(Self::Sha1),
            _ => None,
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            Self::Crc32 => 4,
            Self::Sha1 => 20,
        }
    }
}

impl std::fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crc32 => write!(f, "crc32"),
            Self::Sha1 => write!(f, "sha1"),
        }
    }
}

/// Both digests over one blob's byte range in the buffer's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDigests {
    pub crc32: [u8; 4],
    pub sha1: [u8; 20],
}

impl BlobDigests {
    pub fn over(fw: &Firmware, blob: &DtbBlob) -> Self {
        let data = &fw[blob.range()];
        Self {
            crc32: crc32_be(data),
            sha1: sha1(data),
        }
    }

    pub fn of(&self, algo: HashAlgo) -> &[u8] {
        match algo {
            HashAlgo::Crc32 => &self.crc32,
            HashAlgo::Sha1 => &self.sha1,
        }
    }
}
