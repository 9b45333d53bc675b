//! Bucket addressing and lock-region layout of the in-memory table
//!
//! The table is a sequence of equally sized buckets. A fingerprint's bucket
//! is chosen by the top `r = floor(log2(capacity))` bits of its address word
//! after the shard prefix bits have been stripped. Because the address is a
//! prefix of the fingerprint value, bucket `b` only ever holds values that
//! are smaller than every value of bucket `b + 1`; sorting each bucket and
//! concatenating them therefore yields a globally sorted sequence.
//!
//! With `R = 2^r` and `B0 = min(INITIAL_BUCKET_CAPACITY, R)` there are
//! `R / B0` buckets. For a power-of-two capacity each bucket holds exactly
//! `B0` slots and addresses map to slots by masking. Otherwise the remainder
//! `capacity - R` is spread over the buckets: each gets
//! `capacity / (R / B0)` slots, which is always less than `2 * B0`.
//!
//! Lock regions group a power-of-two number of consecutive buckets. Each
//! region owns its own slot arena, so a bucket never spans two regions.

use std::ops::Range;

use crate::error::{FpSetError, FpSetResult};

/// Bucket size of a power-of-two table, and the address granularity of any table.
pub const INITIAL_BUCKET_CAPACITY: usize = 16;

/// Where a fingerprint's bucket lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLocation {
    /// Global bucket number
    pub bucket: usize,
    /// Lock region owning the bucket
    pub region: usize,
    /// First slot of the bucket, relative to the region's arena
    pub offset: usize,
}

/// Geometry of one fingerprint table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableIndex {
    capacity: usize,
    log2_capacity: u32,
    granularity_shift: u32,
    prefix_bits: u32,
    bucket_count: usize,
    bucket_capacity: usize,
    region_count: usize,
    buckets_per_region: usize,
}

impl TableIndex {
    /// Lay out a table of `capacity` slots, with `lock_regions` requested
    /// lock regions (capped at the bucket count).
    pub fn new(capacity: usize, prefix_bits: u32, lock_regions: usize) -> FpSetResult<Self> {
        if capacity == 0 {
            return Err(FpSetError::config(
                "memory budget too small for a single fingerprint",
            ));
        }
        if !lock_regions.is_power_of_two() {
            return Err(FpSetError::config(format!(
                "lock region count {lock_regions} must be a non-zero power of two"
            )));
        }
        let log2_capacity = capacity.ilog2();
        let addressable = 1usize << log2_capacity;
        let granularity = INITIAL_BUCKET_CAPACITY.min(addressable);
        let bucket_count = addressable / granularity;
        let bucket_capacity = capacity / bucket_count;
        debug_assert!(bucket_capacity < 2 * granularity);

        let region_count = lock_regions.min(bucket_count);
        Ok(TableIndex {
            capacity,
            log2_capacity,
            granularity_shift: granularity.trailing_zeros(),
            prefix_bits,
            bucket_count,
            bucket_capacity,
            region_count,
            buckets_per_region: bucket_count / region_count,
        })
    }

    /// Requested capacity (may exceed [`TableIndex::table_len`] by less than one slot per bucket).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of usable slots.
    pub fn table_len(&self) -> usize {
        self.bucket_count * self.bucket_capacity
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }

    pub fn region_count(&self) -> usize {
        self.region_count
    }

    pub fn is_power_of_two(&self) -> bool {
        self.capacity.is_power_of_two()
    }

    /// Slots owned by each lock region.
    pub fn slots_per_region(&self) -> usize {
        self.buckets_per_region * self.bucket_capacity
    }

    /// Logical address of an address word: its top `r` bits after the prefix.
    #[inline]
    pub fn address(&self, address_word: u64) -> usize {
        if self.log2_capacity == 0 {
            return 0;
        }
        let key = address_word << self.prefix_bits;
        (key >> (64 - self.log2_capacity)) as usize
    }

    #[inline]
    pub fn bucket_of(&self, address_word: u64) -> usize {
        self.address(address_word) >> self.granularity_shift
    }

    /// Global position of the first slot of `bucket`.
    #[inline]
    pub fn bucket_base(&self, bucket: usize) -> usize {
        debug_assert!(bucket < self.bucket_count);
        if self.is_power_of_two() {
            bucket << self.granularity_shift
        } else {
            bucket * self.bucket_capacity
        }
    }

    /// Global base position of the bucket holding `address_word`.
    #[inline]
    pub fn bucket_base_position(&self, address_word: u64) -> usize {
        self.bucket_base(self.bucket_of(address_word))
    }

    /// Base of the bucket after the one containing `position`, wrapping
    /// around at the end of the table.
    #[inline]
    pub fn next_bucket_base_position(&self, position: usize) -> usize {
        if self.is_power_of_two() {
            let base = position & !(self.bucket_capacity - 1);
            (base + self.bucket_capacity) & (self.table_len() - 1)
        } else {
            let base = position - position % self.bucket_capacity;
            (base + self.bucket_capacity) % self.table_len()
        }
    }

    #[inline]
    pub fn region_of_bucket(&self, bucket: usize) -> usize {
        bucket / self.buckets_per_region
    }

    /// Buckets owned by `region`.
    pub fn region_buckets(&self, region: usize) -> Range<usize> {
        let first = region * self.buckets_per_region;
        first..first + self.buckets_per_region
    }

    /// Global slot range owned by `region`.
    pub fn region_slots(&self, region: usize) -> Range<usize> {
        let start = region * self.slots_per_region();
        start..start + self.slots_per_region()
    }

    #[inline]
    pub fn locate(&self, address_word: u64) -> BucketLocation {
        let bucket = self.bucket_of(address_word);
        let region = self.region_of_bucket(bucket);
        let offset = (bucket - region * self.buckets_per_region) * self.bucket_capacity;
        BucketLocation {
            bucket,
            region,
            offset,
        }
    }
}
