//! Metadata store for the depot upload service.
//!
//! One row per upload attempt, in SQLite or MySQL. The [`MetadataStore`]
//! trait is the only surface the rest of the system sees; both backends
//! apply the same forward-only migrations at startup.

pub mod error;
pub mod migrations;
pub mod models;
pub mod mysql;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{NewUpload, UploadRow, UploadSummary};
pub use mysql::MySqlStore;
pub use store::{MetadataStore, SqliteStore};

use depot_core::config::{DatabaseConfig, ExpirationConfig};
use std::sync::Arc;

/// Construct a metadata store from configuration. Migrations are applied
/// before the store is returned; a failure here is fatal at startup.
pub async fn from_config(
    database: &DatabaseConfig,
    expiration: &ExpirationConfig,
) -> MetadataResult<Arc<dyn MetadataStore>> {
    match database {
        DatabaseConfig::Sqlite { dsn } => {
            Ok(Arc::new(SqliteStore::new(dsn, expiration.clone()).await?))
        }
        DatabaseConfig::Mysql { dsn } => {
            Ok(Arc::new(MySqlStore::new(dsn, expiration.clone()).await?))
        }
    }
}
