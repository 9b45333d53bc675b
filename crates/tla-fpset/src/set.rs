//! The driver-facing fingerprint set interface and its factory.

use crate::bloom::BloomFilterFpSet;
use crate::config::{FpSetConfig, FpSetKind};
use crate::disk_set::DiskFpSet;
use crate::error::{FpSetError, FpSetResult};
use crate::fingerprint::Fingerprint;
use crate::multi::MultiFpSet;

/// Counters describing a set's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FpSetStatistics {
    /// Distinct fingerprints inserted
    pub size: u64,
    /// Lookups answered from the table or the collision bucket
    pub mem_hits: u64,
    /// Lookups answered from the disk run
    pub disk_hits: u64,
    /// Completed flushes
    pub flushes: u64,
    /// Total time spent flushing
    pub flush_millis: u64,
    /// Live fingerprints in the table
    pub table_live: u64,
    /// Fingerprints in the collision bucket
    pub collisions: u64,
    /// Fingerprints in the disk run
    pub disk_count: u64,
    /// Table slots (bloom filters: bits)
    pub capacity: u64,
}

impl FpSetStatistics {
    /// Add another set's counters to these.
    pub fn accumulate(&mut self, other: &FpSetStatistics) {
        self.size += other.size;
        self.mem_hits += other.mem_hits;
        self.disk_hits += other.disk_hits;
        self.flushes += other.flushes;
        self.flush_millis += other.flush_millis;
        self.table_live += other.table_live;
        self.collisions += other.collisions;
        self.disk_count += other.disk_count;
        self.capacity += other.capacity;
    }
}

/// A concurrent set of fingerprints.
///
/// `put` and `contains` may be called from any number of threads. All other
/// operations are also thread-safe but are expected to be driven by a single
/// coordinator (checkpointing, recovery, shutdown).
pub trait FpSet<F: Fingerprint>: Send + Sync {
    /// Insert `fp`. Returns true iff it was already present.
    fn put(&self, fp: F) -> FpSetResult<bool>;

    /// Returns true iff `fp` is present.
    fn contains(&self, fp: F) -> FpSetResult<bool>;

    /// Number of distinct fingerprints inserted so far.
    fn size(&self) -> u64;

    /// [`FpSet::put`] for every element, in order.
    fn put_block(&self, fps: &[F]) -> FpSetResult<Vec<bool>> {
        fps.iter().map(|&fp| self.put(fp)).collect()
    }

    /// [`FpSet::contains`] for every element, in order.
    fn contains_block(&self, fps: &[F]) -> FpSetResult<Vec<bool>> {
        fps.iter().map(|&fp| self.contains(fp)).collect()
    }

    /// Probability that two distinct states shared a fingerprint, or `-1.0`
    /// when the set cannot tell.
    fn check_fps(&self) -> f64 {
        -1.0
    }

    /// Write a pending checkpoint.
    fn begin_chkpt(&self) -> FpSetResult<()> {
        Ok(())
    }

    /// Make the pending checkpoint the current one.
    fn commit_chkpt(&self) -> FpSetResult<()> {
        Ok(())
    }

    /// Reset the set to the last committed checkpoint.
    fn recover(&self) -> FpSetResult<()> {
        Ok(())
    }

    /// Re-insert a fingerprint replayed after [`FpSet::recover`].
    fn recover_fp(&self, fp: F) -> FpSetResult<()> {
        if self.put(fp)? {
            return Err(FpSetError::invariant(format!(
                "recovered fingerprint {fp:?} was already present"
            )));
        }
        Ok(())
    }

    /// Move everything held in memory to disk now.
    fn flush(&self) -> FpSetResult<()> {
        Ok(())
    }

    /// Make the next inserting `put` flush.
    fn request_flush(&self) {}

    fn statistics(&self) -> FpSetStatistics;

    /// Release memory. With `cleanup`, also delete the set's files.
    fn close(&self, cleanup: bool) -> FpSetResult<()>;

    /// True if membership answers are never false positives.
    fn is_exact(&self) -> bool;

    fn supports_checkpoint(&self) -> bool {
        self.is_exact()
    }
}

/// Birthday-bound collision probability of `n` random values in a
/// `2^width_bits` space.
pub fn birthday_collision_probability(n: u64, width_bits: u32) -> f64 {
    if n < 2 {
        return 0.0;
    }
    let n = n as f64;
    let pairs = n * (n - 1.0) / 2.0;
    let space = 2f64.powi(width_bits as i32);
    -(-pairs / space).exp_m1()
}

/// Open the set described by `config` for fingerprints of type `F`.
///
/// A non-zero `prefix_bits` yields a [`MultiFpSet`] of `2^prefix_bits` shards.
pub fn open_fp_set<F: Fingerprint>(config: &FpSetConfig) -> FpSetResult<Box<dyn FpSet<F>>> {
    config.validate()?;
    if config.width.bits() != F::WIDTH_BITS {
        return Err(FpSetError::WidthMismatch {
            configured: config.width.bits(),
            requested: F::WIDTH_BITS,
        });
    }
    if config.prefix_bits > 0 {
        return Ok(Box::new(MultiFpSet::<F>::new(config)?));
    }
    open_shard(config)
}

/// Open one unsharded set of the configured kind.
pub(crate) fn open_shard<F: Fingerprint>(config: &FpSetConfig) -> FpSetResult<Box<dyn FpSet<F>>> {
    Ok(match config.kind {
        FpSetKind::DiskBacked => Box::new(DiskFpSet::<F>::new(config)?),
        FpSetKind::BloomFilter => Box::new(BloomFilterFpSet::<F>::new(config)?),
    })
}
