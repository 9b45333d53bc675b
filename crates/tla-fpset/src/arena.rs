//! Slot storage for the in-memory fingerprint table
//!
//! A [`SlotArena`] is one explicitly sized allocation of fingerprint slots,
//! addressed by integer offset. The table is split into several arenas (one
//! per lock region), each allocated once at construction and released as a
//! whole.
//!
//! Fingerprint words and slot tags live in two parallel buffers so that a
//! zero fingerprint is an ordinary value: emptiness and disk residency are
//! carried by the tag, never by bits of the fingerprint itself.

use std::marker::PhantomData;

use crate::error::{FpSetError, FpSetResult};
use crate::fingerprint::Fingerprint;

/// Contents of one table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<F> {
    /// Never written since the table was (re)initialized
    Empty,
    /// Resident in memory only
    Live(F),
    /// Already written to the disk run; the slot may be reused
    Archived(F),
}

impl<F: Copy> Slot<F> {
    /// The stored fingerprint, whether live or archived.
    #[inline]
    pub fn fingerprint(&self) -> Option<F> {
        match *self {
            Slot::Empty => None,
            Slot::Live(fp) | Slot::Archived(fp) => Some(fp),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        matches!(self, Slot::Live(_))
    }
}

const TAG_EMPTY: u8 = 0;
const TAG_LIVE: u8 = 1;
const TAG_ARCHIVED: u8 = 2;

/// Fixed-size buffer of fingerprint slots.
pub struct SlotArena<F: Fingerprint> {
    /// `F::WORDS` words per slot
    words: Vec<u64>,
    tags: Vec<u8>,
    _marker: PhantomData<F>,
}

impl<F: Fingerprint> SlotArena<F> {
    /// Allocate `slots` empty slots.
    ///
    /// Fails with [`FpSetError::Allocation`] instead of aborting when the
    /// allocator cannot satisfy the request.
    pub fn with_capacity(slots: usize) -> FpSetResult<Self> {
        let word_count = slots
            .checked_mul(F::WORDS)
            .ok_or(FpSetError::Allocation { bytes: u64::MAX })?;
        let bytes = Self::bytes_for(slots);

        let mut words = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| FpSetError::Allocation { bytes })?;
        let mut tags = Vec::new();
        tags.try_reserve_exact(slots)
            .map_err(|_| FpSetError::Allocation { bytes })?;

        words.resize(word_count, 0);
        tags.resize(slots, TAG_EMPTY);
        Ok(SlotArena {
            words,
            tags,
            _marker: PhantomData,
        })
    }

    /// An arena with no slots, used once a set has been closed.
    pub fn empty() -> Self {
        SlotArena {
            words: Vec::new(),
            tags: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Bytes needed for `slots` slots.
    pub fn bytes_for(slots: usize) -> u64 {
        (slots as u64).saturating_mul(F::BYTES as u64 + 1)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Bytes held by this arena.
    pub fn allocated_bytes(&self) -> u64 {
        Self::bytes_for(self.len())
    }

    #[inline]
    fn words_of(&self, offset: usize) -> &[u64] {
        let start = offset * F::WORDS;
        &self.words[start..start + F::WORDS]
    }

    #[inline]
    pub fn get(&self, offset: usize) -> Slot<F> {
        debug_assert!(offset < self.len(), "slot {offset} out of range");
        match self.tags[offset] {
            TAG_EMPTY => Slot::Empty,
            TAG_LIVE => Slot::Live(F::load_words(self.words_of(offset))),
            _ => Slot::Archived(F::load_words(self.words_of(offset))),
        }
    }

    #[inline]
    pub fn set(&mut self, offset: usize, slot: Slot<F>) {
        debug_assert!(offset < self.len(), "slot {offset} out of range");
        let (tag, fp) = match slot {
            Slot::Empty => (TAG_EMPTY, None),
            Slot::Live(fp) => (TAG_LIVE, Some(fp)),
            Slot::Archived(fp) => (TAG_ARCHIVED, Some(fp)),
        };
        if let Some(fp) = fp {
            let start = offset * F::WORDS;
            fp.store_words(&mut self.words[start..start + F::WORDS]);
        }
        self.tags[offset] = tag;
    }

    /// Turn every live slot into an archived one. Returns how many changed.
    pub fn archive_live(&mut self) -> usize {
        let mut archived = 0;
        for tag in self.tags.iter_mut().filter(|t| **t == TAG_LIVE) {
            *tag = TAG_ARCHIVED;
            archived += 1;
        }
        archived
    }

    /// Reset every slot to empty.
    pub fn clear(&mut self) {
        self.tags.fill(TAG_EMPTY);
    }

    /// Append the live fingerprints of `offset..offset + len` to `out`.
    pub fn collect_live(&self, offset: usize, len: usize, out: &mut Vec<F>) {
        for (i, &tag) in self.tags[offset..offset + len].iter().enumerate() {
            if tag == TAG_LIVE {
                out.push(F::load_words(self.words_of(offset + i)));
            }
        }
    }

    /// Number of live slots.
    pub fn live_count(&self) -> usize {
        self.tags.iter().filter(|&&t| t == TAG_LIVE).count()
    }
}

impl<F: Fingerprint> std::fmt::Debug for SlotArena<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotArena")
            .field("slots", &self.len())
            .field("bytes", &self.allocated_bytes())
            .finish()
    }
}
