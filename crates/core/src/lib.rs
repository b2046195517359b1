//! Core domain types and shared logic for the depot upload service.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Upload identifiers and content hashes
//! - The upload descriptor persisted in the info sidecar
//! - Lifecycle event types carried on the event bus
//! - Configuration types

pub mod config;
pub mod error;
pub mod event;
pub mod hash;
pub mod id;
pub mod info;

pub use error::{Error, Result};
pub use event::{EventKind, UploadEvent};
pub use hash::{ContentHash, ContentHasher};
pub use id::UploadId;
pub use info::{StorageRefs, UploadInfo};

/// Metadata key set on identified uploads so the finish step can select
/// the longer expiry.
pub const METADATA_IDENTIFIED: &str = "identified";

/// Metadata key holding the unix expiry timestamp, stamped at finish.
pub const METADATA_EXPIRES: &str = "expires";
