//! Cache Entry Types
//!
//! Entries owned by a store, and the timestamped envelope used for
//! staleness computations.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Entry held by the in-process store
#[derive(Clone)]
pub struct CacheEntry {
    /// Serialized value
    data: Bytes,
    /// Creation time
    created_at: Instant,
    /// Time-to-live (zero = no expiry)
    ttl: Duration,
    /// Write generation, used to match expiry timers to the write that armed them
    generation: u64,
}

impl CacheEntry {
    /// Create a new entry
    pub fn new(data: Bytes, ttl: Duration, generation: u64) -> Self {
        Self {
            data,
            created_at: Instant::now(),
            ttl,
            generation,
        }
    }

    /// Get data (zero-copy)
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Get data size
    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Write generation
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Time-to-live
    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Time since the entry was written
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Check if expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        !self.ttl.is_zero() && self.created_at.elapsed() >= self.ttl
    }

    /// Remaining lifetime, `None` for entries without expiry
    pub fn remaining_ttl(&self) -> Option<Duration> {
        if self.ttl.is_zero() {
            None
        } else {
            Some(self.ttl.saturating_sub(self.created_at.elapsed()))
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("size", &self.size())
            .field("ttl", &self.ttl)
            .field("generation", &self.generation)
            .field("is_expired", &self.is_expired())
            .finish()
    }
}

/// Value stored together with its write time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    /// The cached value
    pub value: T,
    /// When the value was written or last refreshed
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl<T> Timestamped<T> {
    /// Stamp a value with the current time
    pub fn now(value: T) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }

    /// Stamp a value with an explicit time
    pub fn at(value: T, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }

    /// Age of the value; timestamps in the future count as zero age
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

// =============================================================================
// Tests
// =============================================================================
