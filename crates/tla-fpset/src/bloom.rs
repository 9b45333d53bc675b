//! Bloom filter fingerprint set.
//!
//! Fixed-memory alternative to [`crate::DiskFpSet`]: never spills to disk and
//! never fills up, but may report a fingerprint as present that was never
//! inserted. Bits are set with atomic `fetch_or` and `contains` takes no
//! locks beyond the shared guard that keeps the bit array alive until
//! `close`. A `put` checks and sets its `k` bits under one of a set of
//! striped mutexes picked by the first probe, so concurrent puts of the same
//! fingerprint see each other and exactly one of them reports it as new.
//!
//! Probe positions use enhanced double hashing over the fingerprint's two
//! probe lanes `(lo, hi)`:
//!
//! ```text
//! x = lo mod m, y = hi mod m
//! probe 0 = x
//! probe i = (x += y, y += i) mod m
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::FpSetConfig;
use crate::error::{FpSetError, FpSetResult};
use crate::fingerprint::Fingerprint;
use crate::set::{FpSet, FpSetStatistics};

/// Largest supported bit count; keeps probe sums below `2^64`.
const MAX_BITS: u64 = 1 << 63;

/// Probabilistic fingerprint set backed by a bloom filter.
pub struct BloomFilterFpSet<F: Fingerprint> {
    name: String,
    bits: RwLock<Box<[AtomicU64]>>,
    /// Serializes puts that share a first probe
    stripes: Box<[Mutex<()>]>,
    num_bits: u64,
    num_hashes: u32,
    inserted: AtomicU64,
    closed: AtomicBool,
    _marker: std::marker::PhantomData<fn(F)>,
}

impl<F: Fingerprint> BloomFilterFpSet<F> {
    /// A filter using the whole memory budget of `config` as its bit array.
    pub fn new(config: &FpSetConfig) -> FpSetResult<Self> {
        config.validate()?;
        if config.width.bits() != F::WIDTH_BITS {
            return Err(FpSetError::WidthMismatch {
                configured: config.width.bits(),
                requested: F::WIDTH_BITS,
            });
        }
        let bytes = config.memory_in_bytes()?;
        let num_bits = bytes.saturating_mul(8).min(MAX_BITS);
        if num_bits < 64 {
            return Err(FpSetError::config(format!(
                "bloom filter needs at least 8 bytes, budget is {bytes}"
            )));
        }
        let words = usize::try_from(num_bits.div_ceil(64))
            .map_err(|_| FpSetError::Allocation { bytes })?;
        let mut bits = Vec::new();
        bits.try_reserve_exact(words)
            .map_err(|_| FpSetError::Allocation { bytes })?;
        bits.extend((0..words).map(|_| AtomicU64::new(0)));
        let stripe_count = config
            .lock_count
            .unwrap_or_else(|| (num_cpus::get() * 8).next_power_of_two());
        let stripes = (0..stripe_count).map(|_| Mutex::new(())).collect();

        debug!(
            name = %config.name,
            bits = num_bits,
            hashes = config.bloom_hashes,
            "Allocated bloom filter"
        );
        Ok(BloomFilterFpSet {
            name: config.name.clone(),
            bits: RwLock::new(bits.into_boxed_slice()),
            stripes,
            num_bits,
            num_hashes: config.bloom_hashes,
            inserted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            _marker: std::marker::PhantomData,
        })
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Bit positions probed for `fp`.
    #[inline]
    fn probes(&self, fp: &F) -> impl Iterator<Item = u64> {
        let m = self.num_bits;
        let (lo, hi) = fp.probe_lanes();
        let mut x = lo % m;
        let mut y = hi % m;
        (0..self.num_hashes as u64).map(move |i| {
            if i > 0 {
                x = (x + y) % m;
                y = (y + i) % m;
            }
            x
        })
    }

    /// Expected false positive rate at the current insert count:
    /// `(1 - e^(-k n / m))^k`.
    pub fn estimated_fp_rate(&self) -> f64 {
        let n = self.inserted.load(Ordering::Relaxed) as f64;
        let m = self.num_bits as f64;
        let k = self.num_hashes as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }
}

impl<F: Fingerprint> FpSet<F> for BloomFilterFpSet<F> {
    fn put(&self, fp: F) -> FpSetResult<bool> {
        let bits = self.bits.read();
        if self.closed.load(Ordering::Acquire) {
            return Err(FpSetError::Closed);
        }
        let first = fp.probe_lanes().0 % self.num_bits;
        let _stripe = self.stripes[first as usize & (self.stripes.len() - 1)].lock();
        let mut present = true;
        for pos in self.probes(&fp) {
            let mask = 1u64 << (pos % 64);
            let old = bits[(pos / 64) as usize].fetch_or(mask, Ordering::AcqRel);
            if old & mask == 0 {
                present = false;
            }
        }
        if !present {
            self.inserted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(present)
    }

    fn contains(&self, fp: F) -> FpSetResult<bool> {
        let bits = self.bits.read();
        if self.closed.load(Ordering::Acquire) {
            return Err(FpSetError::Closed);
        }
        Ok(self.probes(&fp).all(|pos| {
            bits[(pos / 64) as usize].load(Ordering::Acquire) & (1u64 << (pos % 64)) != 0
        }))
    }

    fn size(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    fn statistics(&self) -> FpSetStatistics {
        FpSetStatistics {
            size: self.size(),
            capacity: self.num_bits,
            ..Default::default()
        }
    }

    fn close(&self, _cleanup: bool) -> FpSetResult<()> {
        let mut bits = self.bits.write();
        if !self.closed.swap(true, Ordering::AcqRel) {
            *bits = Box::new([]);
            debug!("Closed bloom filter {}", self.name);
        }
        Ok(())
    }

    fn is_exact(&self) -> bool {
        false
    }
}
