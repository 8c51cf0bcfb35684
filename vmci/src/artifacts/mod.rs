//! Artifact manager: baseline bundles in, versioned bundles out.
//!
//! A run reads exactly one baseline bundle and never modifies it; every
//! publish creates a new, immutable version. The latest-known-good pointer
//! only ever moves to a bundle whose run passed.

pub mod bundle;
mod db;
mod store;

pub use bundle::{
    BaselineBundle, BundleMetadata, LATEST, PublishRequest, PublishedBundle, Verdict,
    new_version_tag, validate_tag,
};
pub use db::VersionRow;
pub use store::FsArtifactStore;

use std::path::PathBuf;
use vmci_shared::{VmciError, VmciResult};

/// Storage backend for baseline and published bundles.
pub trait ArtifactStore: Send + Sync {
    /// Retrieve and verify a bundle. `latest` (or an empty tag) resolves
    /// through the latest-known-good pointer.
    fn fetch(&self, tag: &str) -> VmciResult<BaselineBundle>;

    /// Write a new version. Fails rather than overwrite an existing one.
    fn publish(&self, request: &PublishRequest) -> VmciResult<PublishedBundle>;

    /// Tag the latest-known-good pointer names, if any.
    fn latest(&self) -> VmciResult<Option<String>>;
}

/// Local files used to seed a store with a first baseline.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub tag: String,
    pub image: PathBuf,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub commit: String,
    pub pipeline_id: String,
}

/// Seed the store with a known-good baseline built outside the pipeline.
///
/// The imported bundle becomes the latest-known-good version.
pub fn import(store: &dyn ArtifactStore, request: &ImportRequest) -> VmciResult<PublishedBundle> {
    validate_tag(&request.tag)?;
    for path in [Some(&request.image), request.kernel.as_ref(), request.initrd.as_ref()]
        .into_iter()
        .flatten()
    {
        if !path.is_file() {
            return Err(VmciError::Config(format!(
                "import input {} does not exist",
                path.display()
            )));
        }
    }

    let mut publish = PublishRequest::new(
        &request.tag,
        &request.commit,
        &request.pipeline_id,
        format!("import-{}", uuid::Uuid::new_v4()),
        Verdict::Passed,
    );
    publish.image = Some(request.image.clone());
    publish.kernel = request.kernel.clone();
    publish.initrd = request.initrd.clone();
    publish
        .build_info
        .insert("source".to_string(), "import".to_string());

    store.publish(&publish)
}
