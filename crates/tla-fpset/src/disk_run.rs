//! Sorted on-disk run of fingerprints.
//!
//! Every flush rewrites the whole run: the previous run and the in-memory
//! fingerprints are merged into a new file, which then atomically replaces
//! the old one. A run is never modified in place, so a reader mapping it can
//! never observe a partially written file.
//!
//! # File Format
//!
//! ```text
//! Header (32 bytes, little-endian fields):
//!   magic:          [u8; 8]  "TLAFPRUN"
//!   version:        u32      format version (1)
//!   width:          u32      bytes per fingerprint (8 or 16)
//!   count:          u64      number of entries
//!   block_entries:  u32      entries per sparse index block
//!   reserved:       u32      zero
//! Entries (count * width bytes):
//!   fingerprint:    big-endian, most significant word first
//! ```
//!
//! Entries are strictly increasing. Because the encoding is big-endian,
//! byte order equals value order.
//!
//! # Lookup
//!
//! The sparse index keeps the last (largest) fingerprint of each block of
//! `block_entries` entries. A lookup binary-searches the index for the
//! first block whose maximum is not below the target, then binary-searches
//! inside that one block.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tempfile::NamedTempFile;

use crate::error::{FpSetError, FpSetResult, IoResultExt};
use crate::fingerprint::Fingerprint;

pub const RUN_MAGIC: &[u8; 8] = b"TLAFPRUN";
pub const RUN_FORMAT_VERSION: u32 = 1;
pub const RUN_HEADER_SIZE: usize = 32;

/// Entries per sparse index block.
pub const DEFAULT_BLOCK_ENTRIES: u32 = 1024;

/// Fixed header of a run file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunHeader {
    pub width_bytes: u32,
    pub count: u64,
    pub block_entries: u32,
}

impl RunHeader {
    pub fn encode(&self) -> [u8; RUN_HEADER_SIZE] {
        let mut buf = [0u8; RUN_HEADER_SIZE];
        buf[0..8].copy_from_slice(RUN_MAGIC);
        buf[8..12].copy_from_slice(&RUN_FORMAT_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.width_bytes.to_le_bytes());
        buf[16..24].copy_from_slice(&self.count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.block_entries.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8], path: &Path) -> FpSetResult<Self> {
        if bytes.len() < RUN_HEADER_SIZE {
            return Err(FpSetError::corrupt(path, "file shorter than run header"));
        }
        if &bytes[0..8] != RUN_MAGIC {
            return Err(FpSetError::corrupt(path, "bad magic"));
        }
        let u32_at = |at: usize| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(w)
        };
        let version = u32_at(8);
        if version != RUN_FORMAT_VERSION {
            return Err(FpSetError::corrupt(
                path,
                format!("unsupported format version {version}"),
            ));
        }
        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[16..24]);
        let header = RunHeader {
            width_bytes: u32_at(12),
            count: u64::from_le_bytes(count),
            block_entries: u32_at(24),
        };
        if header.block_entries == 0 {
            return Err(FpSetError::corrupt(path, "zero block size"));
        }
        Ok(header)
    }

    /// Expected file length for this header, or `None` if it overflows.
    pub fn file_len(&self) -> Option<u64> {
        self.count
            .checked_mul(self.width_bytes as u64)?
            .checked_add(RUN_HEADER_SIZE as u64)
    }

    /// Number of sparse index entries.
    pub fn block_count(&self) -> usize {
        self.count.div_ceil(self.block_entries as u64) as usize
    }
}

/// A memory-mapped, sorted run plus its sparse index.
pub struct DiskRun<F: Fingerprint> {
    path: PathBuf,
    map: Option<Mmap>,
    header: RunHeader,
    index: Vec<F>,
}

impl<F: Fingerprint> DiskRun<F> {
    /// Create an empty run file at `path`, replacing any existing one.
    pub fn create_empty(path: &Path) -> FpSetResult<Self> {
        RunWriter::<F>::new(path, DEFAULT_BLOCK_ENTRIES)?.commit(path)
    }

    /// Open an existing run, rebuilding its sparse index from the
    /// block-final entries.
    pub fn open(path: &Path) -> FpSetResult<Self> {
        let (map, header) = Self::map_file(path)?;
        let mut run = DiskRun {
            path: path.to_path_buf(),
            map: Some(map),
            header,
            index: Vec::with_capacity(header.block_count()),
        };
        let block = header.block_entries as u64;
        let mut end = block;
        while end < header.count {
            run.index.push(run.get(end - 1));
            end += block;
        }
        if header.count > 0 {
            run.index.push(run.get(header.count - 1));
        }
        Ok(run)
    }

    /// Open a run whose sparse index is already known (from a checkpoint
    /// header or a just-finished writer).
    pub fn open_with_index(path: &Path, index: Vec<F>) -> FpSetResult<Self> {
        let (map, header) = Self::map_file(path)?;
        if index.len() != header.block_count() {
            return Err(FpSetError::corrupt(
                path,
                format!(
                    "index has {} blocks, run needs {}",
                    index.len(),
                    header.block_count()
                ),
            ));
        }
        let run = DiskRun {
            path: path.to_path_buf(),
            map: Some(map),
            header,
            index,
        };
        if header.count > 0 && run.index.last() != Some(&run.get(header.count - 1)) {
            return Err(FpSetError::corrupt(path, "index does not match run contents"));
        }
        Ok(run)
    }

    fn map_file(path: &Path) -> FpSetResult<(Mmap, RunHeader)> {
        let file = File::open(path).at(path)?;
        // SAFETY: run files are written once through a temporary file and
        // renamed into place; a mapped file is never modified afterwards.
        let map = unsafe { Mmap::map(&file) }.at(path)?;
        let header = RunHeader::decode(&map, path)?;
        if header.width_bytes as usize != F::BYTES {
            return Err(FpSetError::corrupt(
                path,
                format!(
                    "run stores {}-byte fingerprints, expected {}",
                    header.width_bytes,
                    F::BYTES
                ),
            ));
        }
        let Some(expected) = header.file_len() else {
            return Err(FpSetError::corrupt(
                path,
                format!("entry count {} overflows the file size", header.count),
            ));
        };
        if map.len() as u64 != expected {
            return Err(FpSetError::corrupt(
                path,
                format!("file is {} bytes, header implies {expected}", map.len()),
            ));
        }
        Ok((map, header))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.header.count
    }

    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    pub fn header(&self) -> RunHeader {
        self.header
    }

    pub fn block_entries(&self) -> u32 {
        self.header.block_entries
    }

    /// Sparse index: the maximum fingerprint of every block.
    pub fn index(&self) -> &[F] {
        &self.index
    }

    /// Entry `i`. Panics if the run is unmapped or `i` is out of range.
    #[inline]
    pub fn get(&self, i: u64) -> F {
        assert!(i < self.header.count, "run entry {i} out of range");
        let Some(map) = &self.map else {
            panic!("disk run {} accessed while unmapped", self.path.display());
        };
        let start = RUN_HEADER_SIZE + i as usize * F::BYTES;
        F::decode(&map[start..start + F::BYTES])
    }

    /// Membership test: one search over the sparse index, one within a block.
    pub fn contains(&self, fp: &F) -> bool {
        if self.is_empty() || self.map.is_none() {
            return false;
        }
        let block = self.index.partition_point(|max| max < fp);
        if block == self.index.len() {
            return false;
        }
        let block_entries = self.header.block_entries as u64;
        let mut lo = block as u64 * block_entries;
        let mut hi = (lo + block_entries).min(self.header.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe = self.get(mid);
            if probe == *fp {
                return true;
            }
            if probe < *fp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        false
    }

    /// Ascending iteration over all entries.
    pub fn iter(&self) -> RunIter<'_, F> {
        RunIter { run: self, next: 0 }
    }

    /// Drop the mapping, so the file can be replaced on platforms that
    /// refuse to rename over a mapped file.
    pub fn unmap(&mut self) {
        self.map = None;
    }

    /// Re-establish a mapping dropped by [`DiskRun::unmap`].
    pub fn remap(&mut self) -> FpSetResult<()> {
        if self.map.is_none() {
            let (map, header) = Self::map_file(&self.path)?;
            if header != self.header {
                return Err(FpSetError::corrupt(&self.path, "run changed while unmapped"));
            }
            self.map = Some(map);
        }
        Ok(())
    }
}

impl<F: Fingerprint> std::fmt::Debug for DiskRun<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskRun")
            .field("path", &self.path)
            .field("count", &self.header.count)
            .field("blocks", &self.index.len())
            .field("mapped", &self.map.is_some())
            .finish()
    }
}

/// Iterator over the entries of a [`DiskRun`].
pub struct RunIter<'a, F: Fingerprint> {
    run: &'a DiskRun<F>,
    next: u64,
}

impl<F: Fingerprint> Iterator for RunIter<'_, F> {
    type Item = F;

    fn next(&mut self) -> Option<F> {
        if self.next >= self.run.len() {
            return None;
        }
        let fp = self.run.get(self.next);
        self.next += 1;
        Some(fp)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.run.len() - self.next) as usize;
        (left, Some(left))
    }
}

/// Writes a new run to a temporary file next to its destination.
///
/// Nothing becomes visible at the destination until [`RunWriter::commit`];
/// dropping the writer removes the temporary file.
pub struct RunWriter<F: Fingerprint> {
    out: BufWriter<NamedTempFile>,
    dir: PathBuf,
    block_entries: u32,
    count: u64,
    last: Option<F>,
    index: Vec<F>,
}

impl<F: Fingerprint> RunWriter<F> {
    /// Start a run that will replace `dest`.
    pub fn new(dest: &Path, block_entries: u32) -> FpSetResult<Self> {
        let dir = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let stem = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{stem}."))
            .suffix(".tmp")
            .tempfile_in(&dir)
            .at(&dir)?;
        let mut out = BufWriter::new(tmp);
        // Placeholder, rewritten with the final count on commit
        out.write_all(&[0u8; RUN_HEADER_SIZE]).at(&dir)?;
        Ok(RunWriter {
            out,
            dir,
            block_entries: block_entries.max(1),
            count: 0,
            last: None,
            index: Vec::new(),
        })
    }

    /// Append `fp`, which must be strictly greater than the previous entry.
    pub fn push(&mut self, fp: F) -> FpSetResult<()> {
        if let Some(last) = self.last {
            if fp <= last {
                return Err(FpSetError::invariant(format!(
                    "run entries out of order: {fp:?} after {last:?}"
                )));
            }
        }
        let mut buf = [0u8; 16];
        fp.encode(&mut buf);
        self.out.write_all(&buf[..F::BYTES]).at(&self.dir)?;
        self.count += 1;
        self.last = Some(fp);
        if self.count % self.block_entries as u64 == 0 {
            self.index.push(fp);
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Finalize the header, sync, and atomically move the run to `dest`.
    pub fn commit(mut self, dest: &Path) -> FpSetResult<DiskRun<F>> {
        if self.count % self.block_entries as u64 != 0 {
            if let Some(last) = self.last {
                self.index.push(last);
            }
        }
        let header = RunHeader {
            width_bytes: F::BYTES as u32,
            count: self.count,
            block_entries: self.block_entries,
        };
        let dir = self.dir;
        let mut tmp = self
            .out
            .into_inner()
            .map_err(|e| FpSetError::io(&dir, e.into_error()))?;
        let file = tmp.as_file_mut();
        file.seek(SeekFrom::Start(0)).at(&dir)?;
        file.write_all(&header.encode()).at(&dir)?;
        file.sync_all().at(&dir)?;
        tmp.persist(dest).map_err(|e| FpSetError::io(dest, e.error))?;
        DiskRun::open_with_index(dest, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{Fp128, Fp64};
    use tempfile::tempdir;

    fn write_run(path: &Path, values: &[u64], block: u32) -> DiskRun<Fp64> {
        let mut writer = RunWriter::new(path, block).unwrap();
        for &v in values {
            writer.push(Fp64(v)).unwrap();
        }
        writer.commit(path).unwrap()
    }

    #[test]
    fn test_write_and_lookup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.fp");
        let values: Vec<u64> = (0..100).map(|i| i * 3).collect();
        let run = write_run(&path, &values, 8);

        assert_eq!(run.len(), 100);
        assert_eq!(run.index().len(), 13);
        assert_eq!(run.index()[0], Fp64(21));
        assert_eq!(*run.index().last().unwrap(), Fp64(297));
        for &v in &values {
            assert!(run.contains(&Fp64(v)), "missing {v}");
            assert!(!run.contains(&Fp64(v + 1)));
        }
        assert!(!run.contains(&Fp64(1000)));
        assert_eq!(run.iter().map(|f| f.0).collect::<Vec<_>>(), values);
    }

    #[test]
    fn test_reopen_rebuilds_same_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.fp");
        let run = write_run(&path, &[1, 5, 9, 12, 40], 2);
        let reopened = DiskRun::<Fp64>::open(&path).unwrap();
        assert_eq!(reopened.index(), run.index());
        assert_eq!(reopened.len(), 5);
        assert!(reopened.contains(&Fp64(40)));
    }

    #[test]
    fn test_empty_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.fp");
        let run = DiskRun::<Fp128>::create_empty(&path).unwrap();
        assert!(run.is_empty());
        assert!(!run.contains(&Fp128::from_parts(0, 0)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), RUN_HEADER_SIZE as u64);
    }

    #[test]
    fn test_out_of_order_rejected_and_temp_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.fp");
        let mut writer = RunWriter::new(&path, 4).unwrap();
        writer.push(Fp64(10)).unwrap();
        let err = writer.push(Fp64(10)).unwrap_err();
        assert!(matches!(err, FpSetError::Invariant(_)));
        drop(writer);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_width_mismatch_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.fp");
        write_run(&path, &[1, 2, 3], 4);
        let err = DiskRun::<Fp128>::open(&path).unwrap_err();
        assert!(matches!(err, FpSetError::CorruptRun { .. }));
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.fp");
        write_run(&path, &[1, 2, 3], 4);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            DiskRun::<Fp64>::open(&path),
            Err(FpSetError::CorruptRun { .. })
        ));
    }

    #[test]
    fn test_huge_count_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.fp");
        write_run(&path, &[1, 2, 3], 4);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[16..24].copy_from_slice(&(u64::MAX / 4).to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let header = RunHeader::decode(&bytes, &path).unwrap();
        assert_eq!(header.file_len(), None);
        assert!(matches!(
            DiskRun::<Fp64>::open(&path),
            Err(FpSetError::CorruptRun { .. })
        ));
    }

    #[test]
    fn test_commit_onto_directory_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.fp");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        let mut writer = RunWriter::new(&path, 4).unwrap();
        writer.push(Fp64(3)).unwrap();
        assert!(matches!(writer.commit(&path), Err(FpSetError::Io { .. })));
        // Only the directory remains; the temporary run was removed
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_unmap_and_remap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.fp");
        let mut run = write_run(&path, &[7, 8], 4);
        run.unmap();
        assert!(!run.contains(&Fp64(7)));
        run.remap().unwrap();
        assert!(run.contains(&Fp64(7)));
    }

    #[test]
    fn test_wide_entries_are_big_endian() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.fp");
        let mut writer = RunWriter::new(&path, 4).unwrap();
        writer.push(Fp128::from_parts(2, 1)).unwrap();
        writer.commit(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[RUN_HEADER_SIZE..RUN_HEADER_SIZE + 8], &1u64.to_be_bytes());
        assert_eq!(&bytes[RUN_HEADER_SIZE + 8..], &2u64.to_be_bytes());
    }
}
