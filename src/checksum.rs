//! Incremental transfer digests.
//!
//! The digest is fed chunk by chunk in send order and rendered as lowercase
//! hex, so both ends of a transfer arrive at the same value without ever
//! holding the payload in memory.

use sha2::{Digest, Sha256};

/// Available digest algorithms. MD5 is the wire default; both ends of a
/// transfer must agree on the algorithm out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Md5,
    Sha256,
    Blake3,
}

impl Default for ChecksumKind {
    fn default() -> Self {
        Self::Md5
    }
}

/// Running digest over a streamed transfer.
pub struct TransferChecksum {
    inner: Inner,
}

enum Inner {
    Md5(md5::Context),
    Sha256(Sha256),
    Blake3(blake3::Hasher),
}

impl TransferChecksum {
    pub fn new(kind: ChecksumKind) -> Self {
        let inner = match kind {
            ChecksumKind::Md5 => Inner::Md5(md5::Context::new()),
            ChecksumKind::Sha256 => Inner::Sha256(Sha256::new()),
            ChecksumKind::Blake3 => Inner::Blake3(blake3::Hasher::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Md5(ctx) => ctx.consume(data),
            Inner::Sha256(h) => h.update(data),
            Inner::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Lowercase hex rendering of the final digest.
    pub fn finalize(self) -> String {
        match self.inner {
            Inner::Md5(ctx) => format!("{:x}", ctx.compute()),
            Inner::Sha256(h) => {
                let digest = h.finalize();
                digest.iter().map(|b| format!("{:02x}", b)).collect()
            }
            Inner::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// One-shot digest of a byte slice.
pub fn hex_digest(data: &[u8], kind: ChecksumKind) -> String {
    let mut sum = TransferChecksum::new(kind);
    sum.update(data);
    sum.finalize()
}
