//! tla-fpset - Fingerprint storage for explicit-state TLA+ model checking
//!
//! Answers "has this state been seen before?" for a stream of state
//! fingerprints, at high throughput and from many threads, with memory use
//! bounded by configuration.
//!
//! # Features
//!
//! - TLC-compatible 64-bit and 128-bit polynomial fingerprints
//! - Exact disk-backed set: bucketed in-memory table, collision bucket,
//!   and a sorted on-disk run that absorbs the table when it fills up
//! - Bloom filter set with fixed memory and no disk use
//! - Sharding across independent sets by fingerprint prefix
//! - Checkpoint and recovery of exact sets
//!
//! # Example
//!
//! ```rust,no_run
//! use tla_fpset::{open_fp_set, Fp64, FpFamily, FingerprintHasher, Fp64Hasher, FpSetConfig};
//!
//! let config = FpSetConfig::new("/tmp/tlc-meta", "states");
//! let set = open_fp_set::<Fp64>(&config)?;
//!
//! let fp = Fp64Hasher::new(FpFamily::default()).extend_str("x = 1").finish();
//! assert!(!set.put(fp)?);
//! assert!(set.put(fp)?);
//! set.close(true)?;
//! # Ok::<(), tla_fpset::FpSetError>(())
//! ```

pub mod arena;
pub mod bloom;
pub mod checkpoint;
pub mod collision;
pub mod config;
pub mod disk_run;
pub mod disk_set;
mod error;
pub mod fingerprint;
pub mod flush;
pub mod index;
pub mod multi;
mod set;

pub use bloom::BloomFilterFpSet;
pub use config::{FpSetConfig, FpSetKind, FpWidth, MemoryBudget, MAX_PREFIX_BITS};
pub use disk_set::DiskFpSet;
pub use error::{FpSetError, FpSetResult};
pub use fingerprint::{
    Fingerprint, FingerprintHasher, Fp128, Fp128Hasher, Fp64, Fp64Hasher, FpFamily, NUM_POLYS,
};
pub use multi::MultiFpSet;
pub use set::{birthday_collision_probability, open_fp_set, FpSet, FpSetStatistics};
