//! Overflow storage for fingerprints whose home bucket is full
//!
//! Kept ordered so that a flush can merge it with the sorted bucket stream
//! without sorting. It is always disjoint from the live table slots: a
//! fingerprint only lands here after the memory probe found it absent.

use std::collections::BTreeSet;

use crate::fingerprint::Fingerprint;

#[derive(Debug)]
pub struct CollisionBucket<F> {
    entries: BTreeSet<F>,
}

impl<F: Fingerprint> Default for CollisionBucket<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Fingerprint> CollisionBucket<F> {
    pub fn new() -> Self {
        CollisionBucket {
            entries: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn contains(&self, fp: &F) -> bool {
        self.entries.contains(fp)
    }

    /// Returns true if `fp` was not present before.
    pub fn insert(&mut self, fp: F) -> bool {
        self.entries.insert(fp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ascending iteration.
    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        self.entries.iter().copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fp64;

    #[test]
    fn test_insert_is_deduplicating_and_sorted() {
        let mut bucket = CollisionBucket::new();
        assert!(bucket.insert(Fp64(30)));
        assert!(bucket.insert(Fp64(10)));
        assert!(!bucket.insert(Fp64(30)));
        assert_eq!(bucket.len(), 2);
        assert!(bucket.contains(&Fp64(10)));
        assert!(!bucket.contains(&Fp64(20)));
        assert_eq!(bucket.iter().collect::<Vec<_>>(), vec![Fp64(10), Fp64(30)]);
        bucket.clear();
        assert!(bucket.is_empty());
    }
}
