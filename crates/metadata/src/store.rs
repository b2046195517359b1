//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{NewUpload, UploadRow, UploadSummary};
use async_trait::async_trait;
use depot_core::config::ExpirationConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Typed surface over the uploads table.
///
/// Write operations must affect exactly one row; anything else is an
/// invariant violation surfaced as [`MetadataError::Internal`].
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Run pending schema migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Insert a fresh row with `created_at = now` and sentinel
    /// `expires_at`/`deleted_at`/`file_size`. Fails with `AlreadyExists`
    /// on id collision.
    async fn new_upload(&self, upload: &NewUpload) -> MetadataResult<()>;

    /// Record hash, expiry and size for a finished upload.
    async fn finish_upload(
        &self,
        id: &str,
        sha256: &[u8],
        expires_at: i64,
        file_size: i64,
    ) -> MetadataResult<()>;

    /// Tombstone a row by setting `deleted_at`.
    async fn terminate_upload(&self, id: &str, when: i64) -> MetadataResult<()>;

    /// Fetch a row by id; `None` when absent.
    async fn fetch_upload(&self, id: &str) -> MetadataResult<Option<UploadRow>>;

    /// Count *other* live rows sharing the `sha256sum` of row `id`.
    /// Zero means the blob is no longer referenced once `id` goes away.
    async fn fetch_duplicate_count(&self, id: &str) -> MetadataResult<i64>;

    /// Ids of live rows whose expiry has passed, plus unfinished uploads
    /// older than one day.
    async fn fetch_expired_ids(&self, now: i64) -> MetadataResult<Vec<String>>;

    /// Live rows whose id, uploader IP or account match `%filter%`,
    /// newest first, paged.
    async fn list_uploads(
        &self,
        filter: &str,
        page: u32,
        per_page: u32,
    ) -> MetadataResult<Vec<UploadSummary>>;

    /// Total live rows matching `%filter%`.
    async fn count_uploads(&self, filter: &str) -> MetadataResult<i64>;
}

/// Shared SQL. Both backends use `?` placeholders so the statements are
/// portable between SQLite and MySQL.
pub(crate) mod sql {
    pub const NEW_UPLOAD: &str = "INSERT INTO uploads \
        (id, created_at, uploader_ip, file_name, file_type, jwt_nick, jwt_account, jwt_issuer) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

    pub const FINISH_UPLOAD: &str =
        "UPDATE uploads SET sha256sum = ?, expires_at = ?, file_size = ? WHERE id = ?";

    pub const TERMINATE_UPLOAD: &str = "UPDATE uploads SET deleted_at = ? WHERE id = ?";

    pub const FETCH_UPLOAD: &str = "SELECT * FROM uploads WHERE id = ?";

    pub const DUPLICATE_COUNT: &str = "SELECT COUNT(id) FROM uploads \
        WHERE id != ? AND deleted_at = -1 \
        AND sha256sum = (SELECT sha256sum FROM uploads WHERE id = ?)";

    // The sentinel must not satisfy the first clause, or every in-progress
    // upload would expire on the next sweep. Sentinel rows only expire via
    // the incomplete-older-than-one-day clause.
    pub const EXPIRED_IDS: &str = "SELECT id FROM uploads WHERE deleted_at = -1 AND ( \
        (expires_at > -1 AND expires_at <= ?) \
        OR ((expires_at IS NULL OR expires_at = -1) AND created_at <= ?) \
        )";

    pub const LIST_UPLOADS: &str = "SELECT id, uploader_ip, created_at, jwt_account \
        FROM uploads \
        WHERE deleted_at = -1 AND (id LIKE ? OR uploader_ip LIKE ? OR jwt_account LIKE ?) \
        ORDER BY created_at DESC \
        LIMIT ? OFFSET ?";

    pub const COUNT_UPLOADS: &str = "SELECT COUNT(*) FROM uploads \
        WHERE deleted_at = -1 AND (id LIKE ? OR uploader_ip LIKE ? OR jwt_account LIKE ?)";
}

/// Incomplete uploads older than this many seconds are expired even
/// though they never received an expiry timestamp.
pub(crate) const INCOMPLETE_MAX_AGE_SECS: i64 = 86400;

pub(crate) fn ensure_one_row(affected: u64, what: &str) -> MetadataResult<()> {
    if affected == 1 {
        Ok(())
    } else {
        Err(MetadataError::Internal(format!(
            "{what}: expected 1 affected row, got {affected}"
        )))
    }
}

/// SQLite-backed metadata store.
///
/// SQLite is a single-writer engine, so every write statement runs under
/// a process-wide write lock while reads take the shared side. The
/// write-ahead log stays disabled: the data directory may live on a
/// networked filesystem, where WAL does not work.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    write_lock: RwLock<()>,
    expiration: ExpirationConfig,
}

impl SqliteStore {
    /// Open (creating if missing) and migrate a SQLite database.
    pub async fn new(path: &str, expiration: ExpirationConfig) -> MetadataResult<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{path}?mode=rwc"))?
            .create_if_missing(true)
            // Prevent transient "database is locked" errors when another
            // cooperating process holds the file lock.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        let store = Self {
            pool,
            write_lock: RwLock::new(()),
            expiration,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        let _guard = self.write_lock.write().await;
        crate::migrations::apply_sqlite(&self.pool, &self.expiration).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn new_upload(&self, upload: &NewUpload) -> MetadataResult<()> {
        let _guard = self.write_lock.write().await;
        let result = sqlx::query(sql::NEW_UPLOAD)
            .bind(&upload.id)
            .bind(OffsetDateTime::now_utc().unix_timestamp())
            .bind(&upload.uploader_ip)
            .bind(&upload.file_name)
            .bind(&upload.file_type)
            .bind(&upload.jwt_nick)
            .bind(&upload.jwt_account)
            .bind(&upload.jwt_issuer)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => ensure_one_row(done.rows_affected(), "new_upload"),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                MetadataError::AlreadyExists(format!("upload id {}", upload.id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn finish_upload(
        &self,
        id: &str,
        sha256: &[u8],
        expires_at: i64,
        file_size: i64,
    ) -> MetadataResult<()> {
        let _guard = self.write_lock.write().await;
        let done = sqlx::query(sql::FINISH_UPLOAD)
            .bind(sha256)
            .bind(expires_at)
            .bind(file_size)
            .bind(id)
            .execute(&self.pool)
            .await?;
        ensure_one_row(done.rows_affected(), "finish_upload")
    }

    async fn terminate_upload(&self, id: &str, when: i64) -> MetadataResult<()> {
        let _guard = self.write_lock.write().await;
        let done = sqlx::query(sql::TERMINATE_UPLOAD)
            .bind(when)
            .bind(id)
            .execute(&self.pool)
            .await?;
        ensure_one_row(done.rows_affected(), "terminate_upload")
    }

    async fn fetch_upload(&self, id: &str) -> MetadataResult<Option<UploadRow>> {
        let _guard = self.write_lock.read().await;
        let row = sqlx::query_as::<_, UploadRow>(sql::FETCH_UPLOAD)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn fetch_duplicate_count(&self, id: &str) -> MetadataResult<i64> {
        let _guard = self.write_lock.read().await;
        let count: i64 = sqlx::query_scalar(sql::DUPLICATE_COUNT)
            .bind(id)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_expired_ids(&self, now: i64) -> MetadataResult<Vec<String>> {
        let _guard = self.write_lock.read().await;
        let rows: Vec<(String,)> = sqlx::query_as(sql::EXPIRED_IDS)
            .bind(now)
            .bind(now - INCOMPLETE_MAX_AGE_SECS)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn list_uploads(
        &self,
        filter: &str,
        page: u32,
        per_page: u32,
    ) -> MetadataResult<Vec<UploadSummary>> {
        let _guard = self.write_lock.read().await;
        let pattern = format!("%{filter}%");
        let offset = i64::from(per_page) * i64::from(page.saturating_sub(1));
        let rows = sqlx::query_as::<_, UploadSummary>(sql::LIST_UPLOADS)
            .bind(&pattern)
            .bind(&pattern)
            .bind(&pattern)
            .bind(i64::from(per_page))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn count_uploads(&self, filter: &str) -> MetadataResult<i64> {
        let _guard = self.write_lock.read().await;
        let pattern = format!("%{filter}%");
        let count: i64 = sqlx::query_scalar(sql::COUNT_UPLOADS)
            .bind(&pattern)
            .bind(&pattern)
            .bind(&pattern)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
