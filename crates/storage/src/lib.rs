//! Sharded content-addressed blob store.
//!
//! Uploads accumulate in a flat `incomplete/` directory while bytes
//! arrive; a JSON info sidecar lives under `meta/<shard>/`. On finish the
//! blob is hashed and promoted to `complete/<shard-of-hash>/<hex>.bin`,
//! where it may be shared by every upload row with the same content.
//! Termination removes the sidecar and tombstones the row first, and only
//! deletes the blob once no other live row references its hash.

pub mod error;
pub mod hooks;
pub mod store;
pub mod upload;

pub use error::{StorageError, StorageResult};
pub use store::ShardedStore;
pub use upload::FileUpload;
