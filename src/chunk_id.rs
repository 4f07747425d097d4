//! Chunk identifiers.
//!
//! Three encodings exist in stored bundles. Only [`ChunkId::Content`] is
//! produced; the two legacy forms are recognized by [`ChunkId::parse`] so
//! older bundles can still be verified.
//!
//! | Form | Example |
//! |------|---------|
//! | `Content` | `3f9a0c1d2b4e5f60` |
//! | `LegacyRange` | `a1b2c3d4e5f6:1-120` |
//! | `LegacyIndex` | `chunk_0007` |

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Hex characters in a content-addressed id.
pub const CONTENT_ID_LEN: usize = 16;
const LEGACY_HASH_LEN: usize = 12;
const LEGACY_INDEX_PREFIX: &str = "chunk_";
const LEGACY_INDEX_DIGITS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkId {
    /// First 16 hex chars of SHA-256 over path, file hash and line range.
    Content(String),
    /// `<12 hex path hash>:<start>-<end>`.
    LegacyRange {
        path_hash: String,
        start: u64,
        end: u64,
    },
    /// `chunk_NNNN`, an ordinal within a single file.
    LegacyIndex(u32),
}

impl ChunkId {
    /// The canonical id for a line range of a file with the given content hash.
    ///
    /// Fields are joined with NUL so no path or hash can collide with a
    /// different field split.
    pub fn generate(path: &str, file_hash: &str, start_line: u64, end_line: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(file_hash.as_bytes());
        hasher.update([0u8]);
        hasher.update(start_line.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(end_line.to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        ChunkId::Content(digest[..CONTENT_ID_LEN].to_string())
    }

    /// Recognize any known id encoding.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == CONTENT_ID_LEN && is_lower_hex(raw) {
            return Some(ChunkId::Content(raw.to_string()));
        }

        if let Some(digits) = raw.strip_prefix(LEGACY_INDEX_PREFIX) {
            if digits.len() == LEGACY_INDEX_DIGITS && digits.bytes().all(|b| b.is_ascii_digit()) {
                return digits.parse().ok().map(ChunkId::LegacyIndex);
            }
            return None;
        }

        let (hash, range) = raw.split_once(':')?;
        if hash.len() != LEGACY_HASH_LEN || !is_lower_hex(hash) {
            return None;
        }
        let (start, end) = range.split_once('-')?;
        if !is_decimal(start) || !is_decimal(end) {
            return None;
        }
        Some(ChunkId::LegacyRange {
            path_hash: hash.to_string(),
            start: start.parse().ok()?,
            end: end.parse().ok()?,
        })
    }

    pub fn is_legacy(&self) -> bool {
        !matches!(self, ChunkId::Content(_))
    }

    pub fn format_name(&self) -> &'static str {
        match self {
            ChunkId::Content(_) => "content",
            ChunkId::LegacyRange { .. } => "legacy_range",
            ChunkId::LegacyIndex(_) => "legacy_index",
        }
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkId::Content(hex) => f.write_str(hex),
            ChunkId::LegacyRange {
                path_hash,
                start,
                end,
            } => write!(f, "{}:{}-{}", path_hash, start, end),
            ChunkId::LegacyIndex(n) => write!(f, "{}{:04}", LEGACY_INDEX_PREFIX, n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidChunkId(pub String);

impl fmt::Display for InvalidChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized chunk id `{}`", self.0)
    }
}

impl std::error::Error for InvalidChunkId {}

impl FromStr for ChunkId {
    type Err = InvalidChunkId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChunkId::parse(s).ok_or_else(|| InvalidChunkId(s.to_string()))
    }
}

impl Serialize for ChunkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
