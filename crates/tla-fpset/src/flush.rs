//! Sorted streams used when flushing the table to disk.
//!
//! The in-memory table is never sorted as a whole. Each bucket only holds
//! values sharing one address prefix, so sorting buckets one at a time and
//! visiting them in order produces an ascending stream ([`BucketScan`]).
//! That stream is merged with the collision bucket and then with the
//! previous run ([`SortedMerge`]) straight into a [`RunWriter`].

use std::cmp::Ordering;
use std::iter::Peekable;

use crate::arena::SlotArena;
use crate::disk_run::{DiskRun, RunWriter};
use crate::error::FpSetResult;
use crate::fingerprint::Fingerprint;
use crate::index::TableIndex;

/// Ascending stream of the live fingerprints of a table.
pub struct BucketScan<'a, F: Fingerprint> {
    regions: &'a [&'a SlotArena<F>],
    bucket_capacity: usize,
    buckets_per_region: usize,
    region: usize,
    bucket: usize,
    buf: Vec<F>,
    pos: usize,
}

impl<'a, F: Fingerprint> BucketScan<'a, F> {
    /// `regions` must be the region arenas of `index`, in region order.
    pub fn new(index: &TableIndex, regions: &'a [&'a SlotArena<F>]) -> Self {
        debug_assert_eq!(regions.len(), index.region_count());
        BucketScan {
            regions,
            bucket_capacity: index.bucket_capacity(),
            buckets_per_region: index.bucket_count() / index.region_count(),
            region: 0,
            bucket: 0,
            buf: Vec::with_capacity(index.bucket_capacity()),
            pos: 0,
        }
    }

    /// Load and sort the next non-empty bucket. Returns false at the end of the table.
    fn fill(&mut self) -> bool {
        while self.region < self.regions.len() {
            let arena = self.regions[self.region];
            let offset = self.bucket * self.bucket_capacity;
            self.buf.clear();
            self.pos = 0;
            arena.collect_live(offset, self.bucket_capacity, &mut self.buf);

            self.bucket += 1;
            if self.bucket == self.buckets_per_region {
                self.bucket = 0;
                self.region += 1;
            }
            if !self.buf.is_empty() {
                self.buf.sort_unstable();
                return true;
            }
        }
        false
    }
}

impl<F: Fingerprint> Iterator for BucketScan<'_, F> {
    type Item = F;

    fn next(&mut self) -> Option<F> {
        if self.pos == self.buf.len() && !self.fill() {
            return None;
        }
        let fp = self.buf[self.pos];
        self.pos += 1;
        Some(fp)
    }
}

/// Two-way merge of ascending streams. Values present in both are emitted
/// once and counted.
pub struct SortedMerge<A: Iterator, B: Iterator<Item = A::Item>> {
    left: Peekable<A>,
    right: Peekable<B>,
    duplicates: u64,
}

impl<A, B> SortedMerge<A, B>
where
    A: Iterator,
    A::Item: Ord,
    B: Iterator<Item = A::Item>,
{
    pub fn new(left: A, right: B) -> Self {
        SortedMerge {
            left: left.peekable(),
            right: right.peekable(),
            duplicates: 0,
        }
    }

    /// Values seen in both inputs so far.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}

impl<A, B> Iterator for SortedMerge<A, B>
where
    A: Iterator,
    A::Item: Ord,
    B: Iterator<Item = A::Item>,
{
    type Item = A::Item;

    fn next(&mut self) -> Option<A::Item> {
        let order = match (self.left.peek(), self.right.peek()) {
            (Some(l), Some(r)) => l.cmp(r),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => return None,
        };
        match order {
            Ordering::Less => self.left.next(),
            Ordering::Greater => self.right.next(),
            Ordering::Equal => {
                self.duplicates += 1;
                self.right.next();
                self.left.next()
            }
        }
    }
}

/// Counts reported by [`merge_into`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    /// Entries written to the new run
    pub written: u64,
    /// Values found in more than one input
    pub duplicates: u64,
}

/// Merge the table stream, the collision bucket and the previous run into `writer`.
pub fn merge_into<F, M, C>(
    memory: M,
    collisions: C,
    previous: &DiskRun<F>,
    writer: &mut RunWriter<F>,
) -> FpSetResult<MergeCounts>
where
    F: Fingerprint,
    M: Iterator<Item = F>,
    C: Iterator<Item = F>,
{
    let mut in_memory = SortedMerge::new(memory, collisions);
    let mut all = SortedMerge::new(in_memory.by_ref(), previous.iter());
    for fp in all.by_ref() {
        writer.push(fp)?;
    }
    let disk_duplicates = all.duplicates();
    drop(all);
    Ok(MergeCounts {
        written: writer.len(),
        duplicates: in_memory.duplicates() + disk_duplicates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Slot;
    use crate::fingerprint::Fp64;
    use tempfile::tempdir;

    fn table_with(index: &TableIndex, values: &[u64]) -> Vec<SlotArena<Fp64>> {
        let mut regions: Vec<_> = (0..index.region_count())
            .map(|_| SlotArena::with_capacity(index.slots_per_region()).unwrap())
            .collect();
        for &v in values {
            let loc = index.locate(v);
            let arena = &mut regions[loc.region];
            let slot = (loc.offset..loc.offset + index.bucket_capacity())
                .find(|&i| arena.get(i).is_empty())
                .unwrap();
            arena.set(slot, Slot::Live(Fp64(v)));
        }
        regions
    }

    #[test]
    fn test_bucket_scan_is_sorted() {
        let index = TableIndex::new(300, 0, 4).unwrap();
        let mut x = 0x9E37_79B9_7F4A_7C15u64;
        let mut values = Vec::new();
        for _ in 0..150 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let base = index.bucket_base_position(x);
            let same_bucket = values
                .iter()
                .filter(|&&v| index.bucket_base_position(v) == base)
                .count();
            if same_bucket < index.bucket_capacity() {
                values.push(x);
            }
        }
        let regions = table_with(&index, &values);
        let refs: Vec<&SlotArena<Fp64>> = regions.iter().collect();
        let scanned: Vec<u64> = BucketScan::new(&index, &refs).map(|f| f.0).collect();
        values.sort_unstable();
        assert_eq!(scanned, values);
    }

    #[test]
    fn test_bucket_scan_skips_archived() {
        let index = TableIndex::new(32, 0, 1).unwrap();
        let mut regions = table_with(&index, &[1, 2, 3]);
        regions[0].archive_live();
        regions[0].set(5, Slot::Live(Fp64(4)));
        let refs: Vec<&SlotArena<Fp64>> = regions.iter().collect();
        let scanned: Vec<Fp64> = BucketScan::new(&index, &refs).collect();
        assert_eq!(scanned, vec![Fp64(4)]);
    }

    #[test]
    fn test_merge_coalesces_duplicates() {
        let left = [1u64, 4, 6, 9].map(Fp64);
        let right = [2u64, 4, 9, 10].map(Fp64);
        let mut merge = SortedMerge::new(left.into_iter(), right.into_iter());
        let out: Vec<u64> = merge.by_ref().map(|f| f.0).collect();
        assert_eq!(out, vec![1, 2, 4, 6, 9, 10]);
        assert_eq!(merge.duplicates(), 2);
    }

    #[test]
    fn test_merge_into_new_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.fp");
        let previous = {
            let mut w = RunWriter::new(&path, 2).unwrap();
            for v in [3u64, 8] {
                w.push(Fp64(v)).unwrap();
            }
            w.commit(&path).unwrap()
        };
        let mut writer = RunWriter::new(&path, 2).unwrap();
        let counts = merge_into(
            [1u64, 5].map(Fp64).into_iter(),
            [4u64, 8].map(Fp64).into_iter(),
            &previous,
            &mut writer,
        )
        .unwrap();
        assert_eq!(counts, MergeCounts { written: 5, duplicates: 1 });
        drop(previous);
        let run = writer.commit(&path).unwrap();
        assert_eq!(
            run.iter().map(|f| f.0).collect::<Vec<_>>(),
            vec![1, 3, 4, 5, 8]
        );
    }
}
