//! Configuration for rechunking and for the worker pool that executes it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RechunkError, Result};

// ============================================================================
// Byte sizes
// ============================================================================

/// A byte count parsed from human-readable strings such as `"1GB"`,
/// `"512 MiB"` or `"2.5gb"`.
///
/// Decimal units (`KB`, `MB`, `GB`, `TB`) are powers of 1000, binary units
/// (`KiB`, `MiB`, `GiB`, `TiB`) powers of 1024. A bare number is bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn bytes(n: u64) -> Self {
        Self(n)
    }

    pub const fn mb(n: u64) -> Self {
        Self(n * 1_000_000)
    }

    pub const fn gb(n: u64) -> Self {
        Self(n * 1_000_000_000)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = RechunkError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);

        let value: f64 = number
            .parse()
            .map_err(|_| RechunkError::config(format!("invalid byte size '{}'", s)))?;

        let multiplier: f64 = match unit.trim().to_lowercase().as_str() {
            "" | "b" => 1.0,
            "k" | "kb" => 1e3,
            "m" | "mb" => 1e6,
            "g" | "gb" => 1e9,
            "t" | "tb" => 1e12,
            "kib" => 1024.0,
            "mib" => 1024.0 * 1024.0,
            "gib" => 1024.0 * 1024.0 * 1024.0,
            "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
            other => {
                return Err(RechunkError::config(format!(
                    "unknown byte size unit '{}' in '{}'",
                    other, s
                )))
            }
        };

        Ok(Self((value * multiplier).round() as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(&str, u64); 4] = [
            ("TB", 1_000_000_000_000),
            ("GB", 1_000_000_000),
            ("MB", 1_000_000),
            ("KB", 1_000),
        ];
        for (name, size) in UNITS {
            if self.0 >= size {
                let value = self.0 as f64 / size as f64;
                return if value.fract() == 0.0 {
                    write!(f, "{}{}", value as u64, name)
                } else {
                    write!(f, "{:.2}{}", value, name)
                };
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bytes(n) => Ok(Self(n)),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

// ============================================================================
// Rechunk configuration
// ============================================================================

/// Configuration for a rechunk operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechunkConfig {
    /// Memory ceiling for a single unit of work.
    pub max_mem: ByteSize,

    /// Retries per failed task (0 means a single attempt).
    #[serde(default)]
    pub max_retries: u32,

    /// First retry delay in milliseconds (doubles each retry).
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,

    /// Upper bound on the retry delay in milliseconds.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Compression codec for the target store.
    #[serde(default)]
    pub compression: ZarrCompression,

    /// Compression level (1-9).
    #[serde(default = "default_compression_level")]
    pub compression_level: u8,

    /// Enable byte shuffle filter for better compression.
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

fn default_initial_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_compression_level() -> u8 {
    1
}

fn default_shuffle() -> bool {
    true
}

impl Default for RechunkConfig {
    fn default() -> Self {
        Self {
            max_mem: ByteSize::gb(1),
            max_retries: 0,
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            compression: ZarrCompression::BloscZstd,
            compression_level: default_compression_level(),
            shuffle: default_shuffle(),
        }
    }
}

impl RechunkConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_mem.as_u64() == 0 {
            return Err(RechunkError::config("max_mem must be > 0"));
        }

        if self.compression != ZarrCompression::None
            && (self.compression_level == 0 || self.compression_level > 9)
        {
            return Err(RechunkError::config("compression_level must be 1-9"));
        }

        if self.initial_retry_delay_ms > self.max_retry_delay_ms {
            return Err(RechunkError::config(
                "initial_retry_delay_ms must not exceed max_retry_delay_ms",
            ));
        }

        Ok(())
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

/// Compression codec for Zarr arrays written by the rechunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZarrCompression {
    /// No compression.
    None,
    /// Blosc with LZ4.
    BloscLz4,
    /// Blosc with Zstd (recommended).
    #[default]
    BloscZstd,
}

impl ZarrCompression {
    /// Get the codec name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BloscLz4 => "blosc_lz4",
            Self::BloscZstd => "blosc_zstd",
        }
    }
}

impl fmt::Display for ZarrCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Cluster configuration
// ============================================================================

/// Worker pool sizing.
///
/// The pool for a stage grows with the amount of queued work, between
/// `min_workers` and `max_workers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Memory available to one worker.
    pub worker_memory: ByteSize,
    /// Lower bound on concurrently running tasks.
    pub min_workers: usize,
    /// Upper bound on concurrently running tasks.
    pub max_workers: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            worker_memory: ByteSize::gb(4),
            min_workers: 1,
            max_workers: 4,
        }
    }
}

impl ClusterConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            return Err(RechunkError::config("min_workers must be > 0"));
        }

        if self.max_workers < self.min_workers {
            return Err(RechunkError::config("max_workers must be >= min_workers"));
        }

        if self.worker_memory.as_u64() == 0 {
            return Err(RechunkError::config("worker_memory must be > 0"));
        }

        Ok(())
    }

    /// Number of workers to run for `queued` tasks.
    pub fn pool_size(&self, queued: usize) -> usize {
        queued.clamp(self.min_workers, self.max_workers.max(self.min_workers))
    }

    /// Check that a per-task memory budget fits on one worker.
    pub fn check_budget(&self, max_mem: ByteSize) -> Result<()> {
        if max_mem > self.worker_memory {
            return Err(RechunkError::config(format!(
                "memory budget {} exceeds worker memory {}",
                max_mem, self.worker_memory
            )));
        }
        Ok(())
    }
}
