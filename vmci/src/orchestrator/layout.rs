//! Per-run working directory.
//!
//! ```text
//! <work_dir>/runs/<run_id>/
//!   disk.img       writable working copy of the baseline image
//!   console.log    serial console capture
//!   stages/        one log per stage
//!   diffs/         one JSON file per non-passing assertion
//!   report.json    final run report
//! ```

use crate::artifacts::bundle::files;
use std::path::{Path, PathBuf};
use vmci_shared::{VmciError, VmciResult};

#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(work_dir: &Path, run_id: &str) -> Self {
        Self {
            root: work_dir.join("runs").join(run_id),
        }
    }

    /// Create the directory tree.
    pub fn prepare(&self) -> VmciResult<()> {
        for dir in [self.stages_dir(), self.diffs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                VmciError::Storage(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disk(&self) -> PathBuf {
        self.root.join(files::IMAGE)
    }

    pub fn console_log(&self) -> PathBuf {
        self.root.join(files::CONSOLE_LOG)
    }

    pub fn stages_dir(&self) -> PathBuf {
        self.root.join(files::STAGES_DIR)
    }

    pub fn diffs_dir(&self) -> PathBuf {
        self.root.join(files::DIFFS_DIR)
    }

    pub fn report(&self) -> PathBuf {
        self.root.join(files::REPORT)
    }
}
