//! The upload descriptor persisted in the info sidecar.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// On-disk locations of an upload's artifacts.
///
/// `bin_path` points at `incomplete/<id>.bin` while the upload is in
/// flight and at the content-addressed `complete/...` path after finish.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRefs {
    pub bin_path: String,
    pub info_path: String,
}

/// Current descriptor of an upload, serialized as JSON into
/// `meta/<shard>/<id>.info`.
///
/// The sidecar and the database row must agree on `id`; if either is
/// missing the upload is treated as not-found.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadInfo {
    /// Upload id, 32 hex chars.
    pub id: String,
    /// Total declared size in bytes; -1 while the length is deferred.
    pub size: i64,
    /// True until the client declares a length for a deferred-length upload.
    pub size_is_deferred: bool,
    /// Bytes durably written so far.
    pub offset: i64,
    /// Client-supplied metadata (filename, filetype, ...). Values are
    /// untrusted and never used for path construction.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// True for partial uploads awaiting concatenation.
    #[serde(default)]
    pub is_partial: bool,
    /// True for the final upload of a concatenation.
    #[serde(default)]
    pub is_final: bool,
    /// Ids of the partial uploads concatenated into this one.
    #[serde(default)]
    pub partial_uploads: Vec<String>,
    /// Artifact locations.
    pub storage: StorageRefs,
}

impl UploadInfo {
    /// Create a descriptor for a fresh upload with no bytes received.
    pub fn new(id: String) -> Self {
        Self {
            id,
            size: -1,
            size_is_deferred: true,
            offset: 0,
            metadata: HashMap::new(),
            is_partial: false,
            is_final: false,
            partial_uploads: Vec::new(),
            storage: StorageRefs::default(),
        }
    }

    /// Whether the declared length has been reached.
    pub fn is_complete(&self) -> bool {
        !self.size_is_deferred && self.size >= 0 && self.offset >= self.size
    }

    /// Whether the upload carried an account claim at creation.
    pub fn is_identified(&self) -> bool {
        self.metadata
            .get(crate::METADATA_IDENTIFIED)
            .is_some_and(|v| !v.is_empty())
    }
}
