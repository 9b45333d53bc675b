//! Property-based tests for fingerprint sets
//!
//! These tests check the membership contract of every set implementation
//! across randomized fingerprint streams, including streams that force
//! flushes, collision-bucket overflow and sharding.

use std::collections::HashSet;

use proptest::prelude::*;
use tempfile::{tempdir, TempDir};
use tla_fpset::{
    open_fp_set, Fingerprint, FingerprintHasher, Fp128, Fp128Hasher, Fp64, Fp64Hasher, FpFamily,
    FpSet, FpSetConfig, FpSetKind, FpWidth, MemoryBudget,
};

// ============================================================================
// Helper functions
// ============================================================================

/// Open a small exact set so that a few hundred puts already flush.
fn exact_set<F: Fingerprint>(capacity: u64, prefix_bits: u32) -> (TempDir, Box<dyn FpSet<F>>) {
    let dir = tempdir().unwrap();
    let width = if F::WIDTH_BITS == 64 {
        FpWidth::Bits64
    } else {
        FpWidth::Bits128
    };
    let config = FpSetConfig::new(dir.path(), "states")
        .with_width(width)
        .with_memory(MemoryBudget::Fingerprints(capacity))
        .with_prefix_bits(prefix_bits)
        .with_lock_count(2);
    let set = open_fp_set::<F>(&config).unwrap();
    (dir, set)
}

/// Fingerprints with only a few distinct high bits, so they crowd into few
/// buckets and overflow into the collision bucket.
fn clustered_fp64() -> impl Strategy<Value = Fp64> {
    (0u64..4, any::<u64>()).prop_map(|(hi, lo)| Fp64((hi << 62) | (lo >> 20)))
}

fn any_fp128() -> impl Strategy<Value = Fp128> {
    (any::<u64>(), any::<u64>()).prop_map(|(lo, hi)| Fp128::from_parts(lo, hi))
}

// ============================================================================
// Membership properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_put_reports_prior_membership(fps in prop::collection::vec(any::<u64>(), 1..600)) {
        let (_dir, set) = exact_set::<Fp64>(128, 0);
        let mut seen = HashSet::new();
        for v in fps {
            let was_present = set.put(Fp64(v)).unwrap();
            prop_assert_eq!(was_present, !seen.insert(v));
            prop_assert!(set.contains(Fp64(v)).unwrap());
        }
        prop_assert_eq!(set.size(), seen.len() as u64);
    }

    #[test]
    fn prop_flush_round_trip(fps in prop::collection::hash_set(clustered_fp64(), 1..800)) {
        let (_dir, set) = exact_set::<Fp64>(256, 0);
        for &fp in &fps {
            prop_assert!(!set.put(fp).unwrap());
        }
        set.flush().unwrap();
        prop_assert_eq!(set.size(), fps.len() as u64);
        for &fp in &fps {
            prop_assert!(set.contains(fp).unwrap());
        }
        let stats = set.statistics();
        prop_assert_eq!(stats.disk_count, fps.len() as u64);
    }

    #[test]
    fn prop_absent_stays_absent(
        present in prop::collection::hash_set(any::<u64>(), 1..300),
        probe in any::<u64>(),
    ) {
        prop_assume!(!present.contains(&probe));
        let (_dir, set) = exact_set::<Fp64>(64, 0);
        for &v in &present {
            set.put(Fp64(v)).unwrap();
        }
        prop_assert!(!set.contains(Fp64(probe)).unwrap());
        set.flush().unwrap();
        prop_assert!(!set.contains(Fp64(probe)).unwrap());
    }

    #[test]
    fn prop_block_matches_scalar(
        first in prop::collection::vec(any_fp128(), 0..200),
        second in prop::collection::vec(any_fp128(), 0..200),
    ) {
        let (_dir_a, scalar) = exact_set::<Fp128>(128, 2);
        let (_dir_b, batched) = exact_set::<Fp128>(128, 2);
        for &fp in &first {
            scalar.put(fp).unwrap();
        }
        batched.put_block(&first).unwrap();

        let expected: Vec<bool> = second.iter().map(|&fp| scalar.contains(fp).unwrap()).collect();
        prop_assert_eq!(batched.contains_block(&second).unwrap(), expected);

        let expected: Vec<bool> = second.iter().map(|&fp| scalar.put(fp).unwrap()).collect();
        prop_assert_eq!(batched.put_block(&second).unwrap(), expected);
        prop_assert_eq!(batched.size(), scalar.size());
    }

    #[test]
    fn prop_sharded_set_survives_checkpoint(
        fps in prop::collection::hash_set(any::<u64>(), 1..400),
        prefix_bits in 1u32..4,
    ) {
        let (_dir, set) = exact_set::<Fp64>(256, prefix_bits);
        for &v in &fps {
            set.put(Fp64(v)).unwrap();
        }
        set.begin_chkpt().unwrap();
        set.commit_chkpt().unwrap();
        set.recover().unwrap();
        prop_assert_eq!(set.size(), fps.len() as u64);
        for &v in &fps {
            prop_assert!(set.put(Fp64(v)).unwrap());
        }
    }

    #[test]
    fn prop_bloom_has_no_false_negatives(fps in prop::collection::vec(any::<u64>(), 1..500)) {
        let dir = tempdir().unwrap();
        let config = FpSetConfig::new(dir.path(), "bloom")
            .with_kind(FpSetKind::BloomFilter)
            .with_memory(MemoryBudget::Bytes(2048));
        let set = open_fp_set::<Fp64>(&config).unwrap();
        for &v in &fps {
            set.put(Fp64(v)).unwrap();
        }
        for &v in &fps {
            prop_assert!(set.contains(Fp64(v)).unwrap());
        }
    }
}

// ============================================================================
// Fingerprint properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn prop_extension_is_incremental(a in ".*", b in ".*", family in 0usize..131) {
        let family = FpFamily::new(family).unwrap();
        let whole = Fp64Hasher::new(family).extend_str(&format!("{a}{b}")).finish();
        let split = Fp64Hasher::new(family).extend_str(&a).extend_str(&b).finish();
        prop_assert_eq!(whole, split);
    }

    #[test]
    fn prop_wide_lanes_match_narrow(bytes in prop::collection::vec(any::<u8>(), 0..64), family in 0usize..131) {
        let family = FpFamily::new(family).unwrap();
        let wide = Fp128Hasher::new(family).extend_bytes(&bytes).finish();
        let low = Fp64Hasher::new(family).extend_bytes(&bytes).finish();
        let high = Fp64Hasher::new(family.next()).extend_bytes(&bytes).finish();
        prop_assert_eq!(wide.lower(), low.as_u64());
        prop_assert_eq!(wide.higher(), high.as_u64());
    }

    #[test]
    fn prop_encoding_preserves_order(a in any_fp128(), b in any_fp128()) {
        let mut ea = [0u8; 16];
        let mut eb = [0u8; 16];
        a.encode(&mut ea);
        b.encode(&mut eb);
        prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        prop_assert_eq!(a.cmp(&b), a.as_u128().cmp(&b.as_u128()));
    }
}
