//! MySQL metadata store.
//!
//! Same statements as the SQLite backend, but MySQL handles write
//! concurrency itself so no process-wide lock is taken.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{NewUpload, UploadRow, UploadSummary};
use crate::store::{INCOMPLETE_MAX_AGE_SECS, MetadataStore, ensure_one_row, sql};
use async_trait::async_trait;
use depot_core::config::ExpirationConfig;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, Pool};
use time::OffsetDateTime;

/// MySQL-backed metadata store.
pub struct MySqlStore {
    pool: Pool<MySql>,
    expiration: ExpirationConfig,
}

impl MySqlStore {
    /// Connect to and migrate a MySQL database.
    pub async fn new(dsn: &str, expiration: ExpirationConfig) -> MetadataResult<Self> {
        let pool = MySqlPoolOptions::new().connect(dsn).await?;
        let store = Self { pool, expiration };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<MySql> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for MySqlStore {
    async fn migrate(&self) -> MetadataResult<()> {
        crate::migrations::apply_mysql(&self.pool, &self.expiration).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn new_upload(&self, upload: &NewUpload) -> MetadataResult<()> {
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
        let done = sqlx::query(sql::TERMINATE_UPLOAD)
            .bind(when)
            .bind(id)
            .execute(&self.pool)
            .await?;
        ensure_one_row(done.rows_affected(), "terminate_upload")
    }

    async fn fetch_upload(&self, id: &str) -> MetadataResult<Option<UploadRow>> {
        let row = sqlx::query_as::<_, UploadRow>(sql::FETCH_UPLOAD)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn fetch_duplicate_count(&self, id: &str) -> MetadataResult<i64> {
        let count: i64 = sqlx::query_scalar(sql::DUPLICATE_COUNT)
            .bind(id)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_expired_ids(&self, now: i64) -> MetadataResult<Vec<String>> {
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
