//! Cache Compression
//!
//! LZ4 compression of stored payloads behind a small self-describing envelope.
//!
//! # Envelope
//!
//! ```text
//! ┌───────┬──────┬──────────┬─────────────────┬──────────────────┐
//! │ magic │ flag │ name_len │ algorithm name  │ payload          │
//! │ 0xB7  │ 0/1  │ u8       │ "lz4" / "none"  │ raw or compressed│
//! └───────┴──────┴──────────┴─────────────────┴──────────────────┘
//! ```
//!
//! Values that do not start with a valid envelope header are returned as-is,
//! so a store can be switched to compression without being cleared.
//!
//! # Example
//!
//! ```
//! use bulwark::cache::compression::{CompressionCodec, CompressionConfig};
//!
//! let codec = CompressionCodec::new(CompressionConfig::default());
//!
//! let data = vec![b'a'; 4096];
//! let stored = codec.encode(&data).unwrap();
//! assert!(stored.len() < data.len());
//!
//! let restored = codec.decode(&stored).unwrap();
//! assert_eq!(restored.as_ref(), data.as_slice());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::store::{Store, StoreStats};
use crate::error::{Error, Result};

const MAGIC: u8 = 0xB7;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast compression
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name, also written into the envelope
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Resolve an envelope name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "lz4" => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Wrap stores with compression
    pub enabled: bool,
    /// Minimum serialized size to compress (smaller payloads are stored raw)
    pub threshold_bytes: usize,
    /// Algorithm applied above the threshold
    pub algorithm: CompressionAlgorithm,
    /// Compression level (algorithm-specific)
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_bytes: 1024,
            algorithm: CompressionAlgorithm::Lz4,
            level: 4,
        }
    }
}

// =============================================================================
// Compressors
// =============================================================================

fn lz4_compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    lz4::block::compress(
        data,
        Some(lz4::block::CompressionMode::HIGHCOMPRESSION(level)),
        true,
    )
    .map_err(|e| Error::CompressionFailed {
        algorithm: CompressionAlgorithm::Lz4.to_string(),
        reason: e.to_string(),
    })
}

fn lz4_decompress(data: &[u8]) -> Result<Vec<u8>> {
    lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
        algorithm: CompressionAlgorithm::Lz4.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Envelope
// =============================================================================

/// Parsed envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Whether the payload is compressed
    pub compressed: bool,
    /// Algorithm recorded by the writer
    pub algorithm: CompressionAlgorithm,
    /// Offset of the payload within the stored value
    pub payload_offset: usize,
}

impl EnvelopeHeader {
    /// Parse a header, `None` for raw values
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (&magic, rest) = data.split_first()?;
        if magic != MAGIC {
            return None;
        }
        let (&flag, rest) = rest.split_first()?;
        let (&name_len, rest) = rest.split_first()?;
        let name = rest.get(..name_len as usize)?;
        let algorithm = CompressionAlgorithm::from_name(std::str::from_utf8(name).ok()?)?;
        let compressed = match flag {
            0 => false,
            1 => true,
            _ => return None,
        };
        Some(Self {
            compressed,
            algorithm,
            payload_offset: 3 + name_len as usize,
        })
    }
}

fn write_envelope(compressed: bool, algorithm: CompressionAlgorithm, payload: &[u8]) -> Bytes {
    let name = algorithm.name().as_bytes();
    let mut buf = BytesMut::with_capacity(3 + name.len() + payload.len());
    buf.put_u8(MAGIC);
    buf.put_u8(compressed as u8);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);
    buf.put_slice(payload);
    buf.freeze()
}

// =============================================================================
// Compression Stats
// =============================================================================

/// Cumulative compression statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressionStats {
    /// Payload bytes handed to the codec
    pub bytes_in: u64,
    /// Payload bytes written after compression (headers excluded)
    pub bytes_out: u64,
    /// Entries stored compressed
    pub compressed_entries: u64,
    /// Entries stored raw
    pub uncompressed_entries: u64,
    /// Original / compressed size across compressed entries (1.0 when none)
    pub ratio: f64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    compressed_in: AtomicU64,
    compressed_out: AtomicU64,
    compressed_entries: AtomicU64,
    uncompressed_entries: AtomicU64,
}

// =============================================================================
// Compression Codec
// =============================================================================

/// Threshold-gated compressor producing self-describing envelopes
#[derive(Debug)]
pub struct CompressionCodec {
    config: CompressionConfig,
    stats: StatsCounters,
}

impl CompressionCodec {
    /// Create a codec
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            stats: StatsCounters::default(),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Wrap a payload, compressing it when it reaches the threshold and
    /// compression actually shrinks it
    pub fn encode(&self, data: &[u8]) -> Result<Bytes> {
        let algorithm = self.config.algorithm;
        let attempt = data.len() >= self.config.threshold_bytes
            && algorithm != CompressionAlgorithm::None;

        let compressed = if attempt {
            let out = match algorithm {
                CompressionAlgorithm::Lz4 => lz4_compress(data, self.config.level)?,
                CompressionAlgorithm::None => data.to_vec(),
            };
            (out.len() < data.len()).then_some(out)
        } else {
            None
        };

        self.stats
            .bytes_in
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        Ok(match compressed {
            Some(out) => {
                self.stats
                    .bytes_out
                    .fetch_add(out.len() as u64, Ordering::Relaxed);
                self.stats
                    .compressed_in
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.stats
                    .compressed_out
                    .fetch_add(out.len() as u64, Ordering::Relaxed);
                self.stats.compressed_entries.fetch_add(1, Ordering::Relaxed);
                write_envelope(true, algorithm, &out)
            }
            None => {
                self.stats
                    .bytes_out
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.stats
                    .uncompressed_entries
                    .fetch_add(1, Ordering::Relaxed);
                write_envelope(false, CompressionAlgorithm::None, data)
            }
        })
    }

    /// Unwrap a stored value; raw values pass through unchanged
    pub fn decode(&self, data: &[u8]) -> Result<Bytes> {
        let Some(header) = EnvelopeHeader::parse(data) else {
            return Ok(Bytes::copy_from_slice(data));
        };

        let payload = &data[header.payload_offset..];
        if !header.compressed {
            return Ok(Bytes::copy_from_slice(payload));
        }

        match header.algorithm {
            CompressionAlgorithm::Lz4 => Ok(Bytes::from(lz4_decompress(payload)?)),
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(payload)),
        }
    }

    /// Snapshot statistics
    pub fn stats(&self) -> CompressionStats {
        let compressed_in = self.stats.compressed_in.load(Ordering::Relaxed);
        let compressed_out = self.stats.compressed_out.load(Ordering::Relaxed);
        CompressionStats {
            bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.stats.bytes_out.load(Ordering::Relaxed),
            compressed_entries: self.stats.compressed_entries.load(Ordering::Relaxed),
            uncompressed_entries: self.stats.uncompressed_entries.load(Ordering::Relaxed),
            ratio: if compressed_out == 0 {
                1.0
            } else {
                compressed_in as f64 / compressed_out as f64
            },
        }
    }
}

impl Default for CompressionCodec {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

// =============================================================================
// Compressed Store
// =============================================================================

/// Store decorator compressing values on the way in
pub struct CompressedStore {
    inner: Arc<dyn Store>,
    codec: CompressionCodec,
}

impl CompressedStore {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn Store>, config: CompressionConfig) -> Self {
        Self {
            inner,
            codec: CompressionCodec::new(config),
        }
    }

    /// Codec statistics
    pub fn compression_stats(&self) -> CompressionStats {
        self.codec.stats()
    }

    /// Wrapped store
    pub fn inner(&self) -> &Arc<dyn Store> {
        &self.inner
    }
}

#[async_trait]
impl Store for CompressedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.inner.get(key).await? {
            Some(stored) => Ok(Some(self.codec.decode(&stored)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let encoded = self.codec.encode(&value)?;
        self.inner.set(key, encoded, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<bool> {
        self.inner.clear().await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    fn stats(&self) -> StoreStats {
        self.inner.stats()
    }

    async fn is_healthy(&self) -> bool {
        self.inner.is_healthy().await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InProcessStore;
    use assert_matches::assert_matches;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    fn codec(threshold_bytes: usize) -> CompressionCodec {
        CompressionCodec::new(CompressionConfig {
            enabled: true,
            threshold_bytes,
            ..Default::default()
        })
    }

    #[test]
    fn test_small_payload_stored_uncompressed() {
        let codec = codec(1024);
        let stored = codec.encode(b"tiny").unwrap();

        let header = EnvelopeHeader::parse(&stored).unwrap();
        assert!(!header.compressed);
        assert_eq!(header.algorithm, CompressionAlgorithm::None);
        assert_eq!(codec.decode(&stored).unwrap().as_ref(), b"tiny");
    }

    #[test]
    fn test_large_payload_compressed() {
        let codec = codec(16);
        let stored = codec.encode(TEST_DATA).unwrap();

        let header = EnvelopeHeader::parse(&stored).unwrap();
        assert!(header.compressed);
        assert_eq!(header.algorithm, CompressionAlgorithm::Lz4);
        assert!(stored.len() < TEST_DATA.len());
        assert_eq!(codec.decode(&stored).unwrap().as_ref(), TEST_DATA);
    }

    #[test]
    fn test_incompressible_payload_kept_raw() {
        let codec = codec(0);
        let data: Vec<u8> = (0..64u32).map(|i| (i * 97 + 13) as u8).collect();

        let stored = codec.encode(&data).unwrap();
        let header = EnvelopeHeader::parse(&stored).unwrap();
        if !header.compressed {
            assert_eq!(&stored[header.payload_offset..], data.as_slice());
        }
        assert_eq!(codec.decode(&stored).unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_raw_values_pass_through() {
        let codec = codec(0);
        assert_eq!(codec.decode(b"{\"plain\":1}").unwrap().as_ref(), b"{\"plain\":1}");
        assert!(EnvelopeHeader::parse(&[MAGIC, 9, 3]).is_none());
        assert!(EnvelopeHeader::parse(&[]).is_none());
    }

    #[test]
    fn test_corrupt_payload_fails() {
        let codec = codec(0);
        let corrupt = write_envelope(true, CompressionAlgorithm::Lz4, &[16, 0, 0, 0, 0xFF, 0xFF]);
        assert_matches!(
            codec.decode(&corrupt),
            Err(Error::DecompressionFailed { .. })
        );
    }

    #[test]
    fn test_stats_ratio() {
        let codec = codec(16);
        assert_eq!(codec.stats().ratio, 1.0);

        let big = vec![b'x'; 8192];
        codec.encode(&big).unwrap();
        codec.encode(b"small").unwrap();

        let stats = codec.stats();
        assert_eq!(stats.compressed_entries, 1);
        assert_eq!(stats.uncompressed_entries, 1);
        assert_eq!(stats.bytes_in, 8192 + 5);
        assert!(stats.ratio > 10.0);
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(CompressionAlgorithm::None.name(), "none");
        assert_eq!(CompressionAlgorithm::Lz4.name(), "lz4");
        assert_eq!(CompressionAlgorithm::from_name("lz4"), Some(CompressionAlgorithm::Lz4));
        assert_eq!(CompressionAlgorithm::from_name("zstd"), None);
    }

    #[tokio::test]
    async fn test_compressed_store_roundtrip() {
        let inner = Arc::new(InProcessStore::new());
        let store = CompressedStore::new(
            inner.clone(),
            CompressionConfig {
                enabled: true,
                threshold_bytes: 32,
                ..Default::default()
            },
        );

        let big = Bytes::from(vec![b'z'; 4096]);
        store.set("k", big.clone(), Duration::ZERO).await.unwrap();

        let raw = inner.get("k").await.unwrap().unwrap();
        assert!(raw.len() < big.len());
        assert_eq!(store.get("k").await.unwrap().unwrap(), big);
        assert_eq!(store.compression_stats().compressed_entries, 1);
        assert_eq!(store.name(), "memory");
    }
}
