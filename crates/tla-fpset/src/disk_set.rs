//! Exact fingerprint set that spills to a sorted run on disk.
//!
//! # Layout
//!
//! - a fixed-capacity table of bucketed slots, split into lock regions
//!   (see [`crate::index`])
//! - an ordered collision bucket for fingerprints whose bucket is full
//! - one sorted run file holding everything flushed so far
//!
//! # Concurrency
//!
//! The disk run doubles as the phase lock. Every `put`/`contains` holds it
//! shared for its whole duration and only takes region locks underneath it.
//! A flush takes it exclusively, which waits for all in-flight operations to
//! drain; the region locks it then takes are uncontended. No caller can
//! observe a fingerprint that is neither in memory nor on disk.
//!
//! Lock order: disk run, region, collision bucket.

use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::arena::{Slot, SlotArena};
use crate::checkpoint::CheckpointPaths;
use crate::collision::CollisionBucket;
use crate::config::FpSetConfig;
use crate::disk_run::{DiskRun, RunWriter, DEFAULT_BLOCK_ENTRIES};
use crate::error::{FpSetError, FpSetResult, IoResultExt};
use crate::fingerprint::Fingerprint;
use crate::flush::{merge_into, BucketScan};
use crate::index::{BucketLocation, TableIndex};
use crate::set::{birthday_collision_probability, FpSet, FpSetStatistics};

/// Table occupancy required before the collision ratio can trigger a flush.
const MIN_FLUSH_LOAD: f64 = 0.25;

/// Outcome of probing one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Found,
    /// First reusable slot, relative to the region arena
    Vacant(usize),
    Full,
}

/// Lock regions derived from available parallelism.
fn default_lock_regions() -> usize {
    (num_cpus::get() * 8).next_power_of_two()
}

/// Exact, disk-backed fingerprint set.
pub struct DiskFpSet<F: Fingerprint> {
    config: FpSetConfig,
    paths: CheckpointPaths,
    index: TableIndex,
    disk: RwLock<DiskRun<F>>,
    regions: Box<[RwLock<SlotArena<F>>]>,
    collisions: RwLock<CollisionBucket<F>>,
    table_live: AtomicU64,
    collision_live: AtomicU64,
    inserted: AtomicU64,
    flusher_chosen: AtomicBool,
    force_flush: AtomicBool,
    closed: AtomicBool,
    mem_hits: AtomicU64,
    disk_hits: AtomicU64,
    flushes: AtomicU64,
    flush_millis: AtomicU64,
}

impl<F: Fingerprint> DiskFpSet<F> {
    /// Allocate the table and create an empty run in the metadata directory.
    ///
    /// An existing run file of the same name is replaced; use
    /// [`FpSet::recover`] to resume from a checkpoint.
    pub fn new(config: &FpSetConfig) -> FpSetResult<Self> {
        config.validate()?;
        if config.width.bits() != F::WIDTH_BITS {
            return Err(FpSetError::WidthMismatch {
                configured: config.width.bits(),
                requested: F::WIDTH_BITS,
            });
        }
        let capacity = usize::try_from(config.memory_in_fingerprint_cnt()?).map_err(|_| {
            FpSetError::config("table capacity does not fit the address space")
        })?;
        let lock_regions = config.lock_count.unwrap_or_else(default_lock_regions);
        let index = TableIndex::new(capacity, config.prefix_bits, lock_regions)?;

        let regions = (0..index.region_count())
            .map(|_| SlotArena::with_capacity(index.slots_per_region()).map(RwLock::new))
            .collect::<FpSetResult<Vec<_>>>()?
            .into_boxed_slice();

        fs::create_dir_all(&config.metadir).at(&config.metadir)?;
        let paths = CheckpointPaths::new(config);
        let disk = DiskRun::create_empty(&paths.run)?;

        debug!(
            name = %config.name,
            capacity = index.table_len(),
            buckets = index.bucket_count(),
            bucket_capacity = index.bucket_capacity(),
            regions = index.region_count(),
            "Allocated {}-bit fingerprint table",
            F::WIDTH_BITS
        );

        Ok(DiskFpSet {
            config: config.clone(),
            paths,
            index,
            disk: RwLock::new(disk),
            regions,
            collisions: RwLock::new(CollisionBucket::new()),
            table_live: AtomicU64::new(0),
            collision_live: AtomicU64::new(0),
            inserted: AtomicU64::new(0),
            flusher_chosen: AtomicBool::new(false),
            force_flush: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            mem_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_millis: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &FpSetConfig {
        &self.config
    }

    pub fn index(&self) -> &TableIndex {
        &self.index
    }

    /// Must be called with the disk run lock held.
    #[inline]
    fn ensure_open(&self) -> FpSetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FpSetError::Closed);
        }
        Ok(())
    }

    /// Probe the bucket at `loc` for `fp`. Stops at the first empty slot:
    /// slots are filled front to back and only emptied all at once.
    fn probe(&self, arena: &SlotArena<F>, loc: BucketLocation, fp: &F) -> Probe {
        let mut vacant = None;
        for slot in loc.offset..loc.offset + self.index.bucket_capacity() {
            match arena.get(slot) {
                Slot::Empty => return Probe::Vacant(vacant.unwrap_or(slot)),
                Slot::Live(stored) | Slot::Archived(stored) if stored == *fp => {
                    return Probe::Found
                }
                Slot::Archived(_) if vacant.is_none() => vacant = Some(slot),
                _ => {}
            }
        }
        vacant.map_or(Probe::Full, Probe::Vacant)
    }

    /// Look in memory (table, then collision bucket) and then on disk.
    fn lookup(&self, disk: &DiskRun<F>, loc: BucketLocation, fp: &F) -> bool {
        let in_table = {
            let arena = self.regions[loc.region].read();
            self.probe(&arena, loc, fp) == Probe::Found
        };
        if in_table || self.collisions.read().contains(fp) {
            self.mem_hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if disk.contains(fp) {
            self.disk_hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Flush trigger: the collision bucket grew too large a share of all
    /// in-memory fingerprints while the table is reasonably full, or the
    /// table is full, or a flush was requested.
    fn needs_flush(&self) -> bool {
        if self.force_flush.load(Ordering::Acquire) {
            return true;
        }
        let table = self.table_live.load(Ordering::Acquire) as f64;
        let collisions = self.collision_live.load(Ordering::Acquire) as f64;
        let slots = self.index.table_len() as f64;
        if table >= slots {
            return true;
        }
        table > 0.0
            && collisions / (table + collisions) >= self.config.collision_ratio
            && table / slots >= MIN_FLUSH_LOAD
    }

    /// Map the run again after a failed replacement. A run that cannot be
    /// mapped would silently answer "absent", so the set is closed instead.
    fn remap_or_close(&self, disk: &mut DiskRun<F>) {
        if let Err(e) = disk.remap() {
            self.closed.store(true, Ordering::Release);
            error!(
                name = %self.config.name,
                "Closing fingerprint set, run cannot be mapped again: {}",
                e
            );
        }
    }

    /// Flush with the disk run lock held exclusively.
    fn flush_locked(
        &self,
        disk: &mut RwLockWriteGuard<'_, DiskRun<F>>,
        forced: bool,
    ) -> FpSetResult<()> {
        if !forced && !self.needs_flush() {
            debug!("Flush no longer needed for {}", self.config.name);
            return Ok(());
        }
        self.force_flush.store(false, Ordering::Release);

        let mut regions: Vec<_> = self.regions.iter().map(|r| r.write()).collect();
        let mut collisions = self.collisions.write();
        let in_memory = self.table_live.load(Ordering::Acquire) + collisions.len() as u64;
        if in_memory == 0 {
            debug!("Nothing to flush for {}", self.config.name);
            return Ok(());
        }

        let start = Instant::now();
        let mut writer = RunWriter::new(&self.paths.run, DEFAULT_BLOCK_ENTRIES)?;
        let counts = {
            let arenas: Vec<&SlotArena<F>> = regions.iter().map(|g| &**g).collect();
            let scan = BucketScan::new(&self.index, &arenas);
            merge_into(scan, collisions.iter(), &**disk, &mut writer)?
        };
        if counts.duplicates > 0 {
            warn!(
                "Coalesced {} duplicate fingerprints while flushing {}",
                counts.duplicates, self.config.name
            );
        }

        // Windows refuses to rename over a mapped file
        if cfg!(windows) {
            disk.unmap();
        }
        match writer.commit(&self.paths.run) {
            Ok(run) => **disk = run,
            Err(e) => {
                self.remap_or_close(disk);
                return Err(e);
            }
        }

        for region in regions.iter_mut() {
            region.archive_live();
        }
        collisions.clear();
        self.table_live.store(0, Ordering::Release);
        self.collision_live.store(0, Ordering::Release);

        let millis = start.elapsed().as_millis() as u64;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flush_millis.fetch_add(millis, Ordering::Relaxed);
        info!(
            name = %self.config.name,
            flushed = in_memory,
            on_disk = counts.written,
            millis,
            "Flushed fingerprints to disk"
        );
        Ok(())
    }
}

impl<F: Fingerprint> FpSet<F> for DiskFpSet<F> {
    fn put(&self, fp: F) -> FpSetResult<bool> {
        let loc = self.index.locate(fp.address_word());
        let disk = self.disk.read();
        self.ensure_open()?;

        if self.lookup(&disk, loc, &fp) {
            return Ok(true);
        }

        {
            let mut arena = self.regions[loc.region].write();
            match self.probe(&arena, loc, &fp) {
                Probe::Found => return Ok(true),
                Probe::Vacant(slot) => {
                    arena.set(slot, Slot::Live(fp));
                    self.table_live.fetch_add(1, Ordering::AcqRel);
                }
                Probe::Full => {
                    if !self.collisions.write().insert(fp) {
                        return Ok(true);
                    }
                    self.collision_live.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
        self.inserted.fetch_add(1, Ordering::AcqRel);

        if self.needs_flush()
            && self
                .flusher_chosen
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            drop(disk);
            let result = {
                let mut disk = self.disk.write();
                self.ensure_open()
                    .and_then(|()| self.flush_locked(&mut disk, false))
            };
            self.flusher_chosen.store(false, Ordering::Release);
            result?;
        }
        Ok(false)
    }

    fn contains(&self, fp: F) -> FpSetResult<bool> {
        let loc = self.index.locate(fp.address_word());
        let disk = self.disk.read();
        self.ensure_open()?;
        Ok(self.lookup(&disk, loc, &fp))
    }

    fn size(&self) -> u64 {
        self.inserted.load(Ordering::Acquire)
    }

    fn check_fps(&self) -> f64 {
        birthday_collision_probability(self.size(), F::WIDTH_BITS)
    }

    fn begin_chkpt(&self) -> FpSetResult<()> {
        let mut disk = self.disk.write();
        self.ensure_open()?;
        self.flush_locked(&mut disk, true)?;
        self.paths.begin(&*disk, self.config.fp_index)?;
        info!(
            "Wrote checkpoint of {} ({} fingerprints)",
            self.config.name,
            disk.len()
        );
        Ok(())
    }

    fn commit_chkpt(&self) -> FpSetResult<()> {
        let _disk = self.disk.write();
        self.ensure_open()?;
        self.paths.commit()?;
        info!("Committed checkpoint of {}", self.config.name);
        Ok(())
    }

    fn recover(&self) -> FpSetResult<()> {
        let mut disk = self.disk.write();
        self.ensure_open()?;
        let header = self.paths.read_header::<F>(self.config.fp_index)?;

        disk.unmap();
        let run = match self.paths.restore(header) {
            Ok(run) => run,
            Err(e) => {
                self.remap_or_close(&mut disk);
                return Err(e);
            }
        };
        *disk = run;

        for region in self.regions.iter() {
            region.write().clear();
        }
        self.collisions.write().clear();
        self.table_live.store(0, Ordering::Release);
        self.collision_live.store(0, Ordering::Release);
        self.force_flush.store(false, Ordering::Release);
        self.inserted.store(disk.len(), Ordering::Release);
        info!(
            "Recovered {} from checkpoint ({} fingerprints)",
            self.config.name,
            disk.len()
        );
        Ok(())
    }

    fn flush(&self) -> FpSetResult<()> {
        let mut disk = self.disk.write();
        self.ensure_open()?;
        self.flush_locked(&mut disk, true)
    }

    fn request_flush(&self) {
        self.force_flush.store(true, Ordering::Release);
    }

    fn statistics(&self) -> FpSetStatistics {
        let disk_count = self.disk.read().len();
        FpSetStatistics {
            size: self.size(),
            mem_hits: self.mem_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_millis: self.flush_millis.load(Ordering::Relaxed),
            table_live: self.table_live.load(Ordering::Relaxed),
            collisions: self.collision_live.load(Ordering::Relaxed),
            disk_count,
            capacity: self.index.table_len() as u64,
        }
    }

    fn close(&self, cleanup: bool) -> FpSetResult<()> {
        let mut disk = self.disk.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for region in self.regions.iter() {
            *region.write() = SlotArena::empty();
        }
        self.collisions.write().clear();
        disk.unmap();

        if cleanup {
            match fs::remove_file(&self.paths.run) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete {:?}: {}", self.paths.run, e);
                    return Err(FpSetError::io(&self.paths.run, e));
                }
            }
        }
        debug!("Closed fingerprint set {}", self.config.name);
        Ok(())
    }

    fn is_exact(&self) -> bool {
        true
    }
}
