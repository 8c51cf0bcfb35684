//! Per-stage log files.
//!
//! Each stage appends what it did to `stages/<stage>.log` in the run
//! directory. These files are published with every bundle, passing or not.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use vmci_shared::{ExecutionRecord, VmciResult};

pub struct StageLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl StageLog {
    /// Open (append) the log for `stage` under `dir`.
    pub fn open(dir: &Path, stage: &str) -> VmciResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.log", stage));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a line. Log write failures are traced, never fatal.
    pub fn line(&self, text: impl AsRef<str>) {
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{}", text.as_ref()).and_then(|_| file.flush()) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write stage log");
        }
    }

    /// Append a command transcript.
    pub fn record(&self, record: &ExecutionRecord) {
        let mut text = format!("$ {}  # as {}\n", record.command(), record.identity());
        text.push_str(&record.combined_output());
        match (record.exit_code(), record.error()) {
            (_, Some(err)) => text.push_str(&format!("[error: {}, {}ms]", err, record.duration_ms())),
            (Some(code), None) => {
                text.push_str(&format!("[exit {}, {}ms]", code, record.duration_ms()))
            }
            (None, None) => text.push_str(&format!("[no exit status, {}ms]", record.duration_ms())),
        }
        self.line(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_record_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let log = StageLog::open(dir.path(), "provision").unwrap();
        let record = ExecutionRecord::captured(
            "apt-get install -y inventory",
            "operator",
            "done\n",
            "",
            Some(0),
            Utc::now(),
            1200,
        );
        log.line("provisioning started");
        log.record(&record);

        let text = std::fs::read_to_string(dir.path().join("provision.log")).unwrap();
        assert_eq!(
            text,
            "provisioning started\n$ apt-get install -y inventory  # as operator\ndone\n[exit 0, 1200ms]\n"
        );
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        StageLog::open(dir.path(), "boot").unwrap().line("first");
        StageLog::open(dir.path(), "boot").unwrap().line("second");
        let text = std::fs::read_to_string(dir.path().join("boot.log")).unwrap();
        assert_eq!(text, "first\nsecond\n");
    }
}
