use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash algorithms a transfer may negotiate. Only SHA-256 is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    #[serde(rename = "SHA256")]
    Sha256,
}

/// Calculate SHA-256 checksum of data as lowercase hex.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compare two hex checksums, ignoring case.
pub fn matches(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

/// Whole-file hash fed incrementally, chunk by chunk.
#[derive(Clone, Default)]
pub struct StreamingChecksum {
    hasher: Sha256,
    bytes: u64,
}

impl std::fmt::Debug for StreamingChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingChecksum")
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut streaming = StreamingChecksum::new();
        for part in data.chunks(333) {
            streaming.update(part);
        }
        assert_eq!(streaming.bytes(), data.len() as u64);
        assert_eq!(streaming.finalize(), checksum(&data));
    }

    #[test]
    fn test_matches_ignores_case() {
        let sum = checksum(b"synergy");
        assert!(matches(&sum.to_uppercase(), &sum));
        assert!(!matches(&checksum(b"other"), &sum));
    }
}
