//! Bundle metadata, layout and version tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use vmci_shared::{VmciError, VmciResult};

/// File names inside a bundle directory.
pub mod files {
    pub const MANIFEST: &str = "manifest.json";
    pub const IMAGE: &str = "disk.img";
    pub const KERNEL: &str = "vmlinuz";
    pub const INITRD: &str = "initrd.img";
    pub const CONSOLE_LOG: &str = "console.log";
    pub const STAGES_DIR: &str = "stages";
    pub const DIFFS_DIR: &str = "diffs";
    pub const REPORT: &str = "report.json";
}

/// Tag that resolves through the latest-known-good pointer.
pub const LATEST: &str = "latest";

/// Final verdict of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Passed,
    Failed,
}

impl Verdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Passed => "PASSED",
            Verdict::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> VmciResult<Self> {
        match s {
            "PASSED" => Ok(Verdict::Passed),
            "FAILED" => Ok(Verdict::Failed),
            other => Err(VmciError::Corrupt(format!("unknown verdict '{}'", other))),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata record stored as `manifest.json` in every bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub version_tag: String,
    /// Baseline this bundle was derived from; `None` for imported seeds.
    pub parent_tag: Option<String>,
    pub commit: String,
    pub pipeline_id: String,
    pub run_id: String,
    pub verdict: Verdict,
    pub created_at: DateTime<Utc>,
    /// sha256 of `disk.img`; `None` when the bundle carries no image.
    pub image_digest: Option<String>,
    pub has_kernel: bool,
    pub has_initrd: bool,
    #[serde(default)]
    pub build_info: BTreeMap<String, String>,
}

/// A verified baseline ready to boot.
#[derive(Debug, Clone)]
pub struct BaselineBundle {
    pub tag: String,
    pub dir: PathBuf,
    pub metadata: BundleMetadata,
}

impl BaselineBundle {
    pub fn image(&self) -> PathBuf {
        self.dir.join(files::IMAGE)
    }

    pub fn kernel(&self) -> Option<PathBuf> {
        self.metadata.has_kernel.then(|| self.dir.join(files::KERNEL))
    }

    pub fn initrd(&self) -> Option<PathBuf> {
        self.metadata.has_initrd.then(|| self.dir.join(files::INITRD))
    }
}

/// Everything a run hands to the store for publishing.
///
/// Every input is optional except identity fields: a failed run publishes
/// whatever it managed to produce.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub tag: String,
    pub parent_tag: Option<String>,
    pub commit: String,
    pub pipeline_id: String,
    pub run_id: String,
    pub verdict: Verdict,
    pub image: Option<PathBuf>,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub console_log: Option<PathBuf>,
    pub stage_logs: Option<PathBuf>,
    pub diffs: Option<PathBuf>,
    /// Serialized run report written as `report.json`.
    pub report: Option<Vec<u8>>,
    pub build_info: BTreeMap<String, String>,
}

impl PublishRequest {
    pub fn new(
        tag: impl Into<String>,
        commit: impl Into<String>,
        pipeline_id: impl Into<String>,
        run_id: impl Into<String>,
        verdict: Verdict,
    ) -> Self {
        Self {
            tag: tag.into(),
            parent_tag: None,
            commit: commit.into(),
            pipeline_id: pipeline_id.into(),
            run_id: run_id.into(),
            verdict,
            image: None,
            kernel: None,
            initrd: None,
            console_log: None,
            stage_logs: None,
            diffs: None,
            report: None,
            build_info: BTreeMap::new(),
        }
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishedBundle {
    pub tag: String,
    pub dir: PathBuf,
    pub metadata: BundleMetadata,
    /// Whether the latest-known-good pointer now names this bundle.
    pub promoted: bool,
}

/// New version tag: `<pipeline>-<commit7>-<ulid>`, lowercase.
///
/// ULIDs sort by creation time, so tags of one pipeline and commit order
/// chronologically.
pub fn new_version_tag(pipeline_id: &str, commit: &str) -> String {
    let pipeline: String = pipeline_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let pipeline = pipeline.trim_matches('-');
    let pipeline = if pipeline.is_empty() { "vmci" } else { pipeline };

    let commit: String = commit
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(7)
        .collect::<String>()
        .to_ascii_lowercase();
    let commit = if commit.is_empty() {
        "unknown".to_string()
    } else {
        commit
    };

    format!(
        "{}-{}-{}",
        pipeline,
        commit,
        ulid::Ulid::new().to_string().to_ascii_lowercase()
    )
}

/// Reject tags that cannot name a bundle directory.
pub fn validate_tag(tag: &str) -> VmciResult<()> {
    let valid = !tag.is_empty()
        && tag != LATEST
        && !tag.starts_with('.')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(VmciError::Config(format!("invalid version tag '{}'", tag)))
    }
}

/// Read and parse a bundle manifest.
pub fn read_manifest(dir: &Path) -> VmciResult<BundleMetadata> {
    let path = dir.join(files::MANIFEST);
    let data = std::fs::read(&path)
        .map_err(|e| VmciError::Corrupt(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&data)
        .map_err(|e| VmciError::Corrupt(format!("invalid manifest {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_tag_format() {
        let tag = new_version_tag("Nightly Build", "ABCDEF0123456789");
        let parts: Vec<&str> = tag.rsplitn(2, '-').collect();
        assert_eq!(parts[1], "nightly-build-abcdef0");
        assert_eq!(parts[0].len(), 26);
        assert_eq!(tag, tag.to_ascii_lowercase());
        validate_tag(&tag).unwrap();
    }

    #[test]
    fn test_version_tags_are_unique() {
        let a = new_version_tag("ci", "abc1234");
        let b = new_version_tag("ci", "abc1234");
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_tag() {
        assert!(validate_tag("ci-abc1234-01h").is_ok());
        assert!(validate_tag("../etc").is_err());
        assert!(validate_tag("a/b").is_err());
        assert!(validate_tag("").is_err());
        assert!(validate_tag(LATEST).is_err());
        assert!(validate_tag(".staging").is_err());
    }

    #[test]
    fn test_verdict_serialization() {
        assert_eq!(serde_json::to_string(&Verdict::Passed).unwrap(), "\"PASSED\"");
        assert_eq!(Verdict::parse("FAILED").unwrap(), Verdict::Failed);
        assert!(Verdict::parse("MAYBE").is_err());
    }
}
