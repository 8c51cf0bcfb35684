//! Filesystem-backed artifact store.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   index.db                 version index + latest pointer
//!   bundles/<tag>/
//!     manifest.json
//!     disk.img  vmlinuz  initrd.img
//!     console.log  report.json
//!     stages/<stage>.log
//!     diffs/<operation>.json
//!   bundles/.staging-<tag>/  in-progress publishes
//! ```

use super::ArtifactStore;
use super::bundle::{
    BaselineBundle, BundleMetadata, LATEST, PublishRequest, PublishedBundle, Verdict, files,
    read_manifest, validate_tag,
};
use super::db::{VersionIndex, VersionRow};
use crate::util::fs::{atomic_write, atomic_write_json, copy_tree, sha256_file};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use vmci_shared::{VmciError, VmciResult};

pub struct FsArtifactStore {
    root: PathBuf,
    bundles_dir: PathBuf,
    index: VersionIndex,
}

impl FsArtifactStore {
    /// Open the store rooted at `root`, creating it if needed.
    pub fn open(root: impl AsRef<Path>) -> VmciResult<Self> {
        let root = root.as_ref().to_path_buf();
        let bundles_dir = root.join("bundles");
        fs::create_dir_all(&bundles_dir).map_err(|e| {
            VmciError::Storage(format!("cannot create store at {}: {}", root.display(), e))
        })?;
        let index = VersionIndex::open(&root.join("index.db"))?;
        Ok(Self {
            root,
            bundles_dir,
            index,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundle_dir(&self, tag: &str) -> PathBuf {
        self.bundles_dir.join(tag)
    }

    /// Recent versions, newest first.
    pub fn versions(&self, limit: usize) -> VmciResult<Vec<VersionRow>> {
        self.index.list(limit)
    }

    fn resolve(&self, tag: &str) -> VmciResult<String> {
        if tag.is_empty() || tag == LATEST {
            return self.index.pointer(LATEST)?.ok_or_else(|| {
                VmciError::NotFound("no known-good baseline has been published yet".to_string())
            });
        }
        validate_tag(tag)?;
        Ok(tag.to_string())
    }

    fn write_bundle(&self, request: &PublishRequest, staging: &Path) -> VmciResult<BundleMetadata> {
        fs::create_dir_all(staging)?;

        let copy_file = |src: &Option<PathBuf>, name: &str| -> VmciResult<bool> {
            match src {
                Some(path) if path.is_file() => {
                    fs::copy(path, staging.join(name)).map_err(|e| {
                        VmciError::Publish(format!("copying {}: {}", path.display(), e))
                    })?;
                    Ok(true)
                }
                Some(path) => {
                    tracing::warn!(path = %path.display(), "Publish input missing, skipping");
                    Ok(false)
                }
                None => Ok(false),
            }
        };

        let has_image = copy_file(&request.image, files::IMAGE)?;
        let has_kernel = copy_file(&request.kernel, files::KERNEL)?;
        let has_initrd = copy_file(&request.initrd, files::INITRD)?;
        copy_file(&request.console_log, files::CONSOLE_LOG)?;

        if let Some(dir) = &request.stage_logs {
            copy_tree(dir, &staging.join(files::STAGES_DIR))?;
        }
        if let Some(dir) = &request.diffs {
            copy_tree(dir, &staging.join(files::DIFFS_DIR))?;
        }
        if let Some(report) = &request.report {
            atomic_write(&staging.join(files::REPORT), report)?;
        }

        let image_digest = if has_image {
            Some(sha256_file(&staging.join(files::IMAGE))?)
        } else {
            None
        };

        let metadata = BundleMetadata {
            version_tag: request.tag.clone(),
            parent_tag: request.parent_tag.clone(),
            commit: request.commit.clone(),
            pipeline_id: request.pipeline_id.clone(),
            run_id: request.run_id.clone(),
            verdict: request.verdict,
            created_at: Utc::now(),
            image_digest,
            has_kernel,
            has_initrd,
            build_info: request.build_info.clone(),
        };
        atomic_write_json(&staging.join(files::MANIFEST), &metadata)?;
        Ok(metadata)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn fetch(&self, tag: &str) -> VmciResult<BaselineBundle> {
        let tag = self.resolve(tag)?;
        let dir = self.bundle_dir(&tag);
        if !dir.is_dir() {
            return Err(VmciError::NotFound(format!("baseline bundle '{}'", tag)));
        }

        let metadata = read_manifest(&dir)?;
        if metadata.version_tag != tag {
            return Err(VmciError::Corrupt(format!(
                "bundle '{}' manifest names '{}'",
                tag, metadata.version_tag
            )));
        }
        if !metadata.verdict.is_passed() {
            tracing::warn!(tag = %tag, "Fetching a bundle from a failed run");
        }

        let expected = metadata
            .image_digest
            .as_deref()
            .ok_or_else(|| VmciError::Fetch(format!("bundle '{}' carries no VM image", tag)))?;
        let image = dir.join(files::IMAGE);
        if !image.is_file() {
            return Err(VmciError::Corrupt(format!("bundle '{}' is missing its image", tag)));
        }
        let actual = sha256_file(&image)?;
        if actual != expected {
            return Err(VmciError::Corrupt(format!(
                "bundle '{}' image digest mismatch: expected {}, found {}",
                tag, expected, actual
            )));
        }
        for (present, name) in [
            (metadata.has_kernel, files::KERNEL),
            (metadata.has_initrd, files::INITRD),
        ] {
            if present && !dir.join(name).is_file() {
                return Err(VmciError::Corrupt(format!("bundle '{}' is missing {}", tag, name)));
            }
        }

        tracing::info!(tag = %tag, digest = %actual, "Fetched baseline bundle");
        Ok(BaselineBundle { tag, dir, metadata })
    }

    fn publish(&self, request: &PublishRequest) -> VmciResult<PublishedBundle> {
        validate_tag(&request.tag).map_err(|e| VmciError::Publish(e.to_string()))?;
        let target = self.bundle_dir(&request.tag);
        if target.exists() {
            return Err(VmciError::Publish(format!(
                "version '{}' already exists",
                request.tag
            )));
        }

        let staging = self.bundles_dir.join(format!(".staging-{}", request.tag));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        let metadata = match self.write_bundle(request, &staging) {
            Ok(metadata) => metadata,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(VmciError::Publish(e.to_string()));
            }
        };

        fs::rename(&staging, &target).map_err(|e| {
            let _ = fs::remove_dir_all(&staging);
            VmciError::Publish(format!("finalizing {}: {}", target.display(), e))
        })?;

        self.index
            .insert(&metadata)
            .map_err(|e| VmciError::Publish(e.to_string()))?;

        let promoted = metadata.verdict == Verdict::Passed && metadata.image_digest.is_some();
        if promoted {
            self.index
                .set_pointer(LATEST, &metadata.version_tag)
                .map_err(|e| VmciError::Publish(e.to_string()))?;
        }

        tracing::info!(
            tag = %metadata.version_tag,
            verdict = %metadata.verdict,
            promoted,
            "Published bundle"
        );

        Ok(PublishedBundle {
            tag: metadata.version_tag.clone(),
            dir: target,
            metadata,
            promoted,
        })
    }

    fn latest(&self) -> VmciResult<Option<String>> {
        self.index.pointer(LATEST)
    }
}
