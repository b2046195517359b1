//! Database models mapping to the uploads schema.

use serde::Serialize;
use sqlx::FromRow;

/// One row per upload attempt.
///
/// Sentinel semantics: `expires_at == -1` means "not yet set",
/// `deleted_at == -1` means "live", `file_size == -1` means "unfinished".
/// `sha256sum` stays NULL until the upload finishes.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub id: String,
    pub uploader_ip: String,
    pub sha256sum: Option<Vec<u8>>,
    pub created_at: i64,
    pub expires_at: i64,
    pub deleted_at: i64,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub jwt_nick: String,
    pub jwt_account: String,
    pub jwt_issuer: String,
}

impl UploadRow {
    /// A row is live until it is tombstoned.
    pub fn is_live(&self) -> bool {
        self.deleted_at == -1
    }

    /// Whether the upload was created with an account claim.
    pub fn is_identified(&self) -> bool {
        !self.jwt_account.is_empty()
    }
}

/// Fields recorded when an upload is created.
#[derive(Debug, Clone, Default)]
pub struct NewUpload {
    pub id: String,
    pub uploader_ip: String,
    pub file_name: String,
    pub file_type: String,
    pub jwt_nick: String,
    pub jwt_account: String,
    pub jwt_issuer: String,
}

/// Loose projection returned by the admin listing.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UploadSummary {
    pub id: String,
    #[serde(rename = "remote")]
    pub uploader_ip: String,
    #[serde(rename = "created")]
    pub created_at: i64,
    #[serde(rename = "account")]
    pub jwt_account: String,
}
