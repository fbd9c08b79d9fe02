//! Hashing of identifiers onto the ring

use super::score::Score;

/// Maps identifiers (virtual node ids and data keys) onto the ring.
///
/// Implementations must be deterministic and should spread uniformly over
/// `[0, MAX_SCORE]`.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, origin: &str) -> Score;
}

/// CRC32 based encryptor: `crc32(origin) % (2^31 - 1)`
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Encryptor;

impl Crc32Encryptor {
    pub fn new() -> Self {
        Self
    }
}

impl Encryptor for Crc32Encryptor {
    fn encrypt(&self, origin: &str) -> Score {
        crc32fast::hash(origin.as_bytes()) % (i32::MAX as u32)
    }
}
