//! Fingerprint set configuration
//!
//! Sizing policy for fingerprint sets: a memory budget (a ratio of the
//! currently available system memory, an absolute byte count, or an explicit
//! number of fingerprints) is translated into a table capacity for the
//! selected fingerprint width and implementation.
//!
//! # Example
//!
//! ```
//! use tla_fpset::{FpSetConfig, FpWidth, MemoryBudget};
//!
//! let config = FpSetConfig::default()
//!     .with_width(FpWidth::Bits128)
//!     .with_memory(MemoryBudget::Fingerprints(1 << 20))
//!     .with_prefix_bits(2);
//! assert_eq!(config.shard_count(), 4);
//! assert_eq!(config.memory_in_fingerprint_cnt().unwrap(), 1 << 20);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::error::{FpSetError, FpSetResult};
use crate::fingerprint::{Fingerprint, FpFamily};

/// Largest supported number of shard routing bits.
pub const MAX_PREFIX_BITS: u32 = 30;

/// Default ratio between collision bucket and primary table that triggers a flush.
pub const DEFAULT_COLLISION_RATIO: f64 = 0.025;

/// Default number of bloom filter probes per fingerprint.
pub const DEFAULT_BLOOM_HASHES: u32 = 3;

/// Bytes of slot metadata stored next to each fingerprint (the slot tag).
const SLOT_TAG_BYTES: u64 = 1;

/// Fingerprint width in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FpWidth {
    #[default]
    Bits64,
    Bits128,
}

impl FpWidth {
    pub const fn bits(self) -> u32 {
        match self {
            FpWidth::Bits64 => 64,
            FpWidth::Bits128 => 128,
        }
    }

    pub const fn bytes(self) -> u64 {
        self.bits() as u64 / 8
    }

    /// Bytes one table slot occupies: the fingerprint plus its tag.
    pub const fn slot_bytes(self) -> u64 {
        self.bytes() + SLOT_TAG_BYTES
    }
}

impl fmt::Display for FpWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Which set implementation backs each shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FpSetKind {
    /// Exact hash table that spills to a sorted run on disk
    #[default]
    DiskBacked,
    /// Fixed-size bloom filter, approximate membership, never spills
    BloomFilter,
}

impl FpSetKind {
    pub const fn is_exact(self) -> bool {
        matches!(self, FpSetKind::DiskBacked)
    }
}

/// How much memory the fingerprint set may use
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBudget {
    /// Fraction of the currently available physical memory, in `(0, 1]`
    Ratio(f64),
    /// Absolute number of bytes
    Bytes(u64),
    /// Explicit table capacity in fingerprints
    Fingerprints(u64),
}

impl Default for MemoryBudget {
    fn default() -> Self {
        MemoryBudget::Ratio(0.25)
    }
}

/// Construction parameters for a fingerprint set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FpSetConfig {
    /// Memory budget for the whole set (all shards together)
    pub memory: MemoryBudget,
    /// Fingerprint width
    pub width: FpWidth,
    /// Number of high-order address bits used to route to shards (0 = unsharded)
    pub prefix_bits: u32,
    /// Hash family of the fingerprints stored in the set
    pub fp_index: FpFamily,
    /// Implementation of each shard
    pub kind: FpSetKind,
    /// Directory holding run and checkpoint files
    pub metadir: PathBuf,
    /// File stem of the run file (`<name>.fp`)
    pub name: String,
    /// Number of lock regions (bloom filter: put stripes); derived from
    /// available parallelism when `None`.
    /// Must be a power of two.
    pub lock_count: Option<usize>,
    /// Probes per fingerprint for the bloom filter
    pub bloom_hashes: u32,
    /// Share of in-memory fingerprints held by the collision bucket that triggers a flush
    pub collision_ratio: f64,
}

impl Default for FpSetConfig {
    fn default() -> Self {
        FpSetConfig {
            memory: MemoryBudget::default(),
            width: FpWidth::default(),
            prefix_bits: 0,
            fp_index: FpFamily::default(),
            kind: FpSetKind::default(),
            metadir: std::env::temp_dir(),
            name: "states".to_string(),
            lock_count: None,
            bloom_hashes: DEFAULT_BLOOM_HASHES,
            collision_ratio: DEFAULT_COLLISION_RATIO,
        }
    }
}

impl FpSetConfig {
    pub fn new(metadir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        FpSetConfig {
            metadir: metadir.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_memory(mut self, memory: MemoryBudget) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_width(mut self, width: FpWidth) -> Self {
        self.width = width;
        self
    }

    pub fn with_prefix_bits(mut self, prefix_bits: u32) -> Self {
        self.prefix_bits = prefix_bits;
        self
    }

    pub fn with_fp_index(mut self, fp_index: FpFamily) -> Self {
        self.fp_index = fp_index;
        self
    }

    pub fn with_kind(mut self, kind: FpSetKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_metadir(mut self, metadir: impl Into<PathBuf>) -> Self {
        self.metadir = metadir.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_lock_count(mut self, lock_count: usize) -> Self {
        self.lock_count = Some(lock_count);
        self
    }

    pub fn with_bloom_hashes(mut self, bloom_hashes: u32) -> Self {
        self.bloom_hashes = bloom_hashes;
        self
    }

    pub fn with_collision_ratio(mut self, collision_ratio: f64) -> Self {
        self.collision_ratio = collision_ratio;
        self
    }

    /// Check every field for a usable value.
    pub fn validate(&self) -> FpSetResult<()> {
        if self.prefix_bits > MAX_PREFIX_BITS {
            return Err(FpSetError::config(format!(
                "prefix_bits {} exceeds the maximum of {MAX_PREFIX_BITS}",
                self.prefix_bits
            )));
        }
        match self.memory {
            MemoryBudget::Ratio(r) if !(r > 0.0 && r <= 1.0) => {
                return Err(FpSetError::config(format!(
                    "memory ratio {r} must be in (0, 1]"
                )));
            }
            MemoryBudget::Bytes(0) | MemoryBudget::Fingerprints(0) => {
                return Err(FpSetError::config("memory budget must be non-zero"));
            }
            _ => {}
        }
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(FpSetError::config(format!(
                "set name {:?} must be a non-empty file stem",
                self.name
            )));
        }
        if let Some(n) = self.lock_count {
            if n == 0 || !n.is_power_of_two() {
                return Err(FpSetError::config(format!(
                    "lock_count {n} must be a non-zero power of two"
                )));
            }
        }
        if !(1..=32).contains(&self.bloom_hashes) {
            return Err(FpSetError::config(format!(
                "bloom_hashes {} must be between 1 and 32",
                self.bloom_hashes
            )));
        }
        if !(self.collision_ratio.is_finite() && self.collision_ratio > 0.0) {
            return Err(FpSetError::config(format!(
                "collision_ratio {} must be positive",
                self.collision_ratio
            )));
        }
        Ok(())
    }

    /// Memory budget resolved to bytes.
    pub fn memory_in_bytes(&self) -> FpSetResult<u64> {
        match self.memory {
            MemoryBudget::Bytes(n) => Ok(n),
            MemoryBudget::Fingerprints(n) => Ok(n.saturating_mul(self.width.slot_bytes())),
            MemoryBudget::Ratio(r) => {
                let available = available_memory();
                if available == 0 {
                    return Err(FpSetError::config(
                        "cannot determine available system memory for a ratio budget",
                    ));
                }
                Ok((available as f64 * r) as u64)
            }
        }
    }

    /// Memory budget resolved to a table capacity, in fingerprints.
    pub fn memory_in_fingerprint_cnt(&self) -> FpSetResult<u64> {
        match self.memory {
            MemoryBudget::Fingerprints(n) => Ok(n),
            _ => Ok(self.memory_in_bytes()? / self.width.slot_bytes()),
        }
    }

    /// A fresh hasher of the configured family, for computing the
    /// fingerprints stored in this set.
    pub fn hasher<F: Fingerprint>(&self) -> F::Hasher {
        F::hasher(self.fp_index)
    }

    /// Number of independent shards (`2^prefix_bits`).
    pub fn shard_count(&self) -> usize {
        1usize << self.prefix_bits
    }

    /// Configuration of shard `index`: its own file stem and a
    /// `1 / shard_count` share of the memory budget.
    pub fn shard_config(&self, index: usize) -> FpSetResult<FpSetConfig> {
        debug_assert!(index < self.shard_count());
        let memory = match self.memory {
            MemoryBudget::Fingerprints(n) => MemoryBudget::Fingerprints(n >> self.prefix_bits),
            _ => MemoryBudget::Bytes(self.memory_in_bytes()? >> self.prefix_bits),
        };
        Ok(FpSetConfig {
            memory,
            name: format!("{}_{index}", self.name),
            ..self.clone()
        })
    }

    /// Path of the sorted run file.
    pub fn run_path(&self) -> PathBuf {
        self.file_path("fp")
    }

    pub(crate) fn file_path(&self, extension: &str) -> PathBuf {
        self.metadir.join(format!("{}.{extension}", self.name))
    }

    pub fn metadir(&self) -> &Path {
        &self.metadir
    }
}

/// Currently available physical memory in bytes, 0 if unknown.
fn available_memory() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}
