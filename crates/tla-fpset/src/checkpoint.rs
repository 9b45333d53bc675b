//! Checkpoint files of a disk-backed set.
//!
//! A checkpoint is a byte copy of the run plus a small JSON header carrying
//! the run's sparse index, so recovery does not have to rescan the run.
//!
//! ```text
//! <name>.fp                  current run
//! <name>.fp.chkpt            run copy of the last committed checkpoint
//! <name>.fp.chkpt.json       header of the last committed checkpoint
//! <name>.fp.chkpt.tmp        run copy written by begin, renamed by commit
//! <name>.fp.chkpt.json.tmp   header written by begin, renamed by commit
//! ```

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::FpSetConfig;
use crate::disk_run::DiskRun;
use crate::error::{FpSetError, FpSetResult, IoResultExt};
use crate::fingerprint::{Fingerprint, FpFamily};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Contents of `<name>.fp.chkpt.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "F: Fingerprint")]
pub struct CheckpointHeader<F> {
    pub version: u32,
    pub width_bits: u32,
    /// Hash family the fingerprints were computed with
    pub fp_index: FpFamily,
    /// Number of entries in the checkpointed run
    pub count: u64,
    pub block_entries: u32,
    /// Sparse index of the checkpointed run
    pub index: Vec<F>,
}

impl<F: Fingerprint> CheckpointHeader<F> {
    pub fn for_run(run: &DiskRun<F>, fp_index: FpFamily) -> Self {
        CheckpointHeader {
            version: CHECKPOINT_FORMAT_VERSION,
            width_bits: F::WIDTH_BITS,
            fp_index,
            count: run.len(),
            block_entries: run.block_entries(),
            index: run.index().to_vec(),
        }
    }
}

#[derive(Deserialize)]
struct HeaderFormat {
    version: u32,
    width_bits: u32,
    fp_index: FpFamily,
}

/// File names used by one set's checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub run: PathBuf,
    pub chkpt: PathBuf,
    pub header: PathBuf,
    pub tmp_chkpt: PathBuf,
    pub tmp_header: PathBuf,
}

impl CheckpointPaths {
    pub fn new(config: &FpSetConfig) -> Self {
        CheckpointPaths {
            run: config.run_path(),
            chkpt: config.file_path("fp.chkpt"),
            header: config.file_path("fp.chkpt.json"),
            tmp_chkpt: config.file_path("fp.chkpt.tmp"),
            tmp_header: config.file_path("fp.chkpt.json.tmp"),
        }
    }

    /// Write the temporary checkpoint files for `run`, whose fingerprints
    /// belong to hash family `fp_index`.
    pub fn begin<F: Fingerprint>(
        &self,
        run: &DiskRun<F>,
        fp_index: FpFamily,
    ) -> FpSetResult<()> {
        fs::copy(run.path(), &self.tmp_chkpt).at(&self.tmp_chkpt)?;
        File::open(&self.tmp_chkpt)
            .and_then(|f| f.sync_all())
            .at(&self.tmp_chkpt)?;

        let file = File::create(&self.tmp_header).at(&self.tmp_header)?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, &CheckpointHeader::for_run(run, fp_index))?;
        out.flush().at(&self.tmp_header)?;
        out.get_ref().sync_all().at(&self.tmp_header)?;
        Ok(())
    }

    /// Move the temporary checkpoint files into place.
    pub fn commit(&self) -> FpSetResult<()> {
        if !self.tmp_chkpt.exists() || !self.tmp_header.exists() {
            return Err(FpSetError::checkpoint(format!(
                "no checkpoint in progress for {}",
                self.run.display()
            )));
        }
        fs::rename(&self.tmp_chkpt, &self.chkpt).at(&self.chkpt)?;
        fs::rename(&self.tmp_header, &self.header).at(&self.header)?;
        Ok(())
    }

    /// Read the committed header and check it against the set's width and
    /// hash family.
    pub fn read_header<F: Fingerprint>(
        &self,
        fp_index: FpFamily,
    ) -> FpSetResult<CheckpointHeader<F>> {
        let text = match fs::read_to_string(&self.header) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FpSetError::checkpoint(format!(
                    "no committed checkpoint at {}",
                    self.header.display()
                )));
            }
            Err(e) => return Err(FpSetError::io(&self.header, e)),
        };
        // Check the format before the width-dependent index is parsed
        let format: HeaderFormat = serde_json::from_str(&text)?;
        if format.version != CHECKPOINT_FORMAT_VERSION {
            return Err(FpSetError::checkpoint(format!(
                "unsupported checkpoint version {}",
                format.version
            )));
        }
        if format.width_bits != F::WIDTH_BITS {
            return Err(FpSetError::WidthMismatch {
                configured: F::WIDTH_BITS,
                requested: format.width_bits,
            });
        }
        if format.fp_index != fp_index {
            return Err(FpSetError::checkpoint(format!(
                "checkpoint holds hash family {} fingerprints, set uses family {}",
                format.fp_index.index(),
                fp_index.index()
            )));
        }
        let header: CheckpointHeader<F> = serde_json::from_str(&text)?;
        Ok(header)
    }

    /// Replace the run with the committed checkpoint copy and open it.
    pub fn restore<F: Fingerprint>(&self, header: CheckpointHeader<F>) -> FpSetResult<DiskRun<F>> {
        let dir = self
            .run
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = NamedTempFile::new_in(&dir).at(&dir)?;
        let mut source = File::open(&self.chkpt).at(&self.chkpt)?;
        io::copy(&mut source, tmp.as_file_mut()).at(&self.chkpt)?;
        tmp.as_file().sync_all().at(&dir)?;
        tmp.persist(&self.run)
            .map_err(|e| FpSetError::io(&self.run, e.error))?;

        let run = DiskRun::open_with_index(&self.run, header.index)?;
        if run.len() != header.count || run.block_entries() != header.block_entries {
            return Err(FpSetError::checkpoint(format!(
                "checkpoint header describes {} entries, run has {}",
                header.count,
                run.len()
            )));
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_run::RunWriter;
    use crate::fingerprint::{Fp128, Fp64};
    use tempfile::tempdir;

    fn run_with(path: &std::path::Path, values: &[u64]) -> DiskRun<Fp64> {
        let mut writer = RunWriter::new(path, 2).unwrap();
        for &v in values {
            writer.push(Fp64(v)).unwrap();
        }
        writer.commit(path).unwrap()
    }

    #[test]
    fn test_checkpoint_file_names() {
        let config = FpSetConfig::new("/meta", "states_1");
        let paths = CheckpointPaths::new(&config);
        assert_eq!(paths.chkpt, PathBuf::from("/meta/states_1.fp.chkpt"));
        assert_eq!(paths.header, PathBuf::from("/meta/states_1.fp.chkpt.json"));
        assert_eq!(paths.tmp_chkpt, PathBuf::from("/meta/states_1.fp.chkpt.tmp"));
    }

    #[test]
    fn test_begin_commit_restore() {
        let dir = tempdir().unwrap();
        let config = FpSetConfig::new(dir.path(), "states");
        let paths = CheckpointPaths::new(&config);
        let run = run_with(&paths.run, &[2, 4, 6, 8, 10]);

        paths.begin(&run, FpFamily::default()).unwrap();
        assert!(!paths.chkpt.exists());
        paths.commit().unwrap();
        assert!(paths.chkpt.exists() && paths.header.exists());
        assert!(!paths.tmp_chkpt.exists());

        // The live run moves on after the checkpoint
        drop(run);
        run_with(&paths.run, &[1]);

        let header = paths.read_header::<Fp64>(FpFamily::default()).unwrap();
        assert_eq!(header.count, 5);
        assert_eq!(header.index, vec![Fp64(4), Fp64(8), Fp64(10)]);
        let restored = paths.restore(header).unwrap();
        assert_eq!(restored.len(), 5);
        assert!(restored.contains(&Fp64(6)));
        assert!(!restored.contains(&Fp64(1)));
    }

    #[test]
    fn test_commit_without_begin_fails() {
        let dir = tempdir().unwrap();
        let paths = CheckpointPaths::new(&FpSetConfig::new(dir.path(), "states"));
        assert!(matches!(paths.commit(), Err(FpSetError::Checkpoint(_))));
        assert!(matches!(
            paths.read_header::<Fp64>(FpFamily::default()),
            Err(FpSetError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_header_width_is_checked() {
        let dir = tempdir().unwrap();
        let paths = CheckpointPaths::new(&FpSetConfig::new(dir.path(), "states"));
        let run = run_with(&paths.run, &[3]);
        paths.begin(&run, FpFamily::default()).unwrap();
        paths.commit().unwrap();
        assert!(matches!(
            paths.read_header::<Fp128>(FpFamily::default()),
            Err(FpSetError::WidthMismatch { .. })
        ));
    }

    #[test]
    fn test_header_family_is_checked() {
        let dir = tempdir().unwrap();
        let paths = CheckpointPaths::new(&FpSetConfig::new(dir.path(), "states"));
        let run = run_with(&paths.run, &[3, 9]);
        let family = FpFamily::new(7).unwrap();
        paths.begin(&run, family).unwrap();
        paths.commit().unwrap();

        let header = paths.read_header::<Fp64>(family).unwrap();
        assert_eq!(header.fp_index, family);
        assert!(matches!(
            paths.read_header::<Fp64>(FpFamily::default()),
            Err(FpSetError::Checkpoint(_))
        ));
    }
}
