// src/checksum.rs

/// Body checksum collaborator used by packet encoding and dispatch.
pub trait Checksum: Send + Sync {
    fn compute(&self, bytes: &[u8]) -> u32;
}

/// IEEE CRC32, the checksum carried in every packet header.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32;

impl Checksum for Crc32 {
    #[inline]
    fn compute(&self, bytes: &[u8]) -> u32 {
        crc32fast::hash(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_the_reference_check_value() {
        assert_eq!(Crc32.compute(b"123456789"), 0xCBF4_3926);
        assert_eq!(Crc32.compute(b""), 0);
    }
}
