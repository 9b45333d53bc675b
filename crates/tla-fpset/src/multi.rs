//! Space-partitioned fingerprint set.
//!
//! The top `prefix_bits` bits of a fingerprint's address word pick one of
//! `2^prefix_bits` independent shards. Shards share nothing: each has its own
//! table, locks and run file (`<name>_<i>.fp`), and strips the same prefix
//! bits before addressing its own buckets. Routing only depends on the
//! fingerprint value, so it is stable across flushes and recovery.

use tracing::info;

use crate::config::FpSetConfig;
use crate::error::FpSetResult;
use crate::fingerprint::Fingerprint;
use crate::set::{open_shard, FpSet, FpSetStatistics};

/// Shard of `address_word` when routing on `prefix_bits` bits.
#[inline]
pub fn shard_index(address_word: u64, prefix_bits: u32) -> usize {
    if prefix_bits == 0 {
        return 0;
    }
    (address_word >> (64 - prefix_bits)) as usize
}

/// Fingerprint set split across independent shards.
pub struct MultiFpSet<F: Fingerprint> {
    prefix_bits: u32,
    shards: Vec<Box<dyn FpSet<F>>>,
}

impl<F: Fingerprint> MultiFpSet<F> {
    pub fn new(config: &FpSetConfig) -> FpSetResult<Self> {
        config.validate()?;
        let shards = (0..config.shard_count())
            .map(|i| open_shard::<F>(&config.shard_config(i)?))
            .collect::<FpSetResult<Vec<_>>>()?;
        info!(
            "Opened {} shards of {} ({:?})",
            shards.len(),
            config.name,
            config.kind
        );
        Ok(MultiFpSet {
            prefix_bits: config.prefix_bits,
            shards,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, fp: &F) -> &dyn FpSet<F> {
        &*self.shards[shard_index(fp.address_word(), self.prefix_bits)]
    }

    /// Positions of `fps` grouped by shard.
    fn group(&self, fps: &[F]) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.shards.len()];
        for (i, fp) in fps.iter().enumerate() {
            groups[shard_index(fp.address_word(), self.prefix_bits)].push(i);
        }
        groups
    }

    /// Run `op` on each shard's share of `fps`, scattering results back.
    fn per_shard_block(
        &self,
        fps: &[F],
        op: impl Fn(&dyn FpSet<F>, &[F]) -> FpSetResult<Vec<bool>>,
    ) -> FpSetResult<Vec<bool>> {
        let mut results = vec![false; fps.len()];
        for (shard, positions) in self.shards.iter().zip(self.group(fps)) {
            if positions.is_empty() {
                continue;
            }
            let batch: Vec<F> = positions.iter().map(|&i| fps[i]).collect();
            for (pos, found) in positions.into_iter().zip(op(&**shard, &batch)?) {
                results[pos] = found;
            }
        }
        Ok(results)
    }

    fn each_shard(&self, op: impl Fn(&dyn FpSet<F>) -> FpSetResult<()>) -> FpSetResult<()> {
        self.shards.iter().try_for_each(|shard| op(&**shard))
    }
}

impl<F: Fingerprint> FpSet<F> for MultiFpSet<F> {
    fn put(&self, fp: F) -> FpSetResult<bool> {
        self.shard(&fp).put(fp)
    }

    fn contains(&self, fp: F) -> FpSetResult<bool> {
        self.shard(&fp).contains(fp)
    }

    fn size(&self) -> u64 {
        self.shards.iter().map(|s| s.size()).sum()
    }

    fn put_block(&self, fps: &[F]) -> FpSetResult<Vec<bool>> {
        self.per_shard_block(fps, |shard, batch| shard.put_block(batch))
    }

    fn contains_block(&self, fps: &[F]) -> FpSetResult<Vec<bool>> {
        self.per_shard_block(fps, |shard, batch| shard.contains_block(batch))
    }

    /// Collision estimate over the combined size, if every shard is exact.
    fn check_fps(&self) -> f64 {
        if !self.is_exact() {
            return -1.0;
        }
        crate::set::birthday_collision_probability(self.size(), F::WIDTH_BITS)
    }

    fn begin_chkpt(&self) -> FpSetResult<()> {
        self.each_shard(|s| s.begin_chkpt())
    }

    fn commit_chkpt(&self) -> FpSetResult<()> {
        self.each_shard(|s| s.commit_chkpt())
    }

    fn recover(&self) -> FpSetResult<()> {
        self.each_shard(|s| s.recover())
    }

    fn recover_fp(&self, fp: F) -> FpSetResult<()> {
        self.shard(&fp).recover_fp(fp)
    }

    fn flush(&self) -> FpSetResult<()> {
        self.each_shard(|s| s.flush())
    }

    fn request_flush(&self) {
        for shard in &self.shards {
            shard.request_flush();
        }
    }

    fn statistics(&self) -> FpSetStatistics {
        let mut total = FpSetStatistics::default();
        for shard in &self.shards {
            total.accumulate(&shard.statistics());
        }
        total
    }

    fn close(&self, cleanup: bool) -> FpSetResult<()> {
        self.each_shard(|s| s.close(cleanup))
    }

    fn is_exact(&self) -> bool {
        self.shards.iter().all(|s| s.is_exact())
    }

    fn supports_checkpoint(&self) -> bool {
        self.shards.iter().all(|s| s.supports_checkpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FpSetKind, FpWidth, MemoryBudget};
    use crate::fingerprint::{Fp128, Fp64};
    use tempfile::tempdir;

    fn config(dir: &std::path::Path, prefix_bits: u32) -> FpSetConfig {
        FpSetConfig::new(dir, "states")
            .with_memory(MemoryBudget::Fingerprints(1 << 12))
            .with_prefix_bits(prefix_bits)
            .with_lock_count(2)
    }

    #[test]
    fn test_shard_index() {
        assert_eq!(shard_index(u64::MAX, 0), 0);
        assert_eq!(shard_index(u64::MAX, 2), 3);
        assert_eq!(shard_index(1 << 62, 2), 1);
        assert_eq!(shard_index((1 << 62) - 1, 2), 0);
        assert_eq!(shard_index(u64::MAX, 30), (1 << 30) - 1);
    }

    #[test]
    fn test_routing_and_shard_files() {
        let dir = tempdir().unwrap();
        let set = MultiFpSet::<Fp64>::new(&config(dir.path(), 2)).unwrap();
        assert_eq!(set.shard_count(), 4);
        for i in 0..4 {
            assert!(dir.path().join(format!("states_{i}.fp")).exists());
        }

        let fps: Vec<Fp64> = (0..4u64).map(|s| Fp64((s << 62) | 17)).collect();
        for &fp in &fps {
            assert!(!set.put(fp).unwrap());
        }
        for (i, shard) in set.shards.iter().enumerate() {
            assert_eq!(shard.size(), 1, "shard {i}");
            assert!(shard.contains(fps[i]).unwrap());
        }
        assert_eq!(set.size(), 4);
    }

    #[test]
    fn test_block_results_match_scalar() {
        let dir = tempdir().unwrap();
        let set = MultiFpSet::<Fp64>::new(&config(dir.path(), 3)).unwrap();
        let fps: Vec<Fp64> = (0..64u64).map(|i| Fp64(i.wrapping_mul(0x9E37_79B9_7F4A_7C15))).collect();
        set.put(fps[3]).unwrap();
        set.put(fps[40]).unwrap();

        let contained = set.contains_block(&fps).unwrap();
        for (i, &c) in contained.iter().enumerate() {
            assert_eq!(c, i == 3 || i == 40, "position {i}");
        }
        let put = set.put_block(&fps).unwrap();
        assert_eq!(put, contained);
        assert!(set.contains_block(&fps).unwrap().iter().all(|&c| c));
    }

    #[test]
    fn test_routing_stable_across_recovery() {
        let dir = tempdir().unwrap();
        let set = MultiFpSet::<Fp128>::new(&config(dir.path(), 1).with_width(FpWidth::Bits128)).unwrap();
        let fps: Vec<Fp128> = (0..200u64)
            .map(|i| Fp128::from_parts(i, i.wrapping_mul(0xD6E8_FEB8_6659_FD93)))
            .collect();
        for &fp in &fps {
            set.put(fp).unwrap();
        }
        set.begin_chkpt().unwrap();
        set.commit_chkpt().unwrap();
        set.recover().unwrap();
        assert_eq!(set.size(), 200);
        for &fp in &fps {
            assert!(set.contains(fp).unwrap());
        }
        assert!(set.check_fps() >= 0.0);
        set.close(true).unwrap();
        assert!(!dir.path().join("states_0.fp").exists());
    }

    #[test]
    fn test_bloom_shards_are_not_exact() {
        let dir = tempdir().unwrap();
        let set =
            MultiFpSet::<Fp64>::new(&config(dir.path(), 1).with_kind(FpSetKind::BloomFilter)).unwrap();
        assert!(!set.is_exact());
        assert_eq!(set.check_fps(), -1.0);
        set.put(Fp64(u64::MAX)).unwrap();
        assert!(set.contains(Fp64(u64::MAX)).unwrap());
    }
}
