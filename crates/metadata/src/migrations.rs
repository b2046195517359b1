//! Forward-only schema migrations.
//!
//! Migrations are identified by monotonically increasing ids and recorded
//! in `schema_migrations`. The history carries the uploads table through
//! its renames and backfills to the current schema (migration 6); the DDL
//! is written to be valid on both SQLite and MySQL.

use crate::error::MetadataResult;
use depot_core::config::ExpirationConfig;
use sqlx::{MySql, Pool, Sqlite};
use std::collections::HashSet;
use time::OffsetDateTime;

/// A single migration: an id and the statements applied under it.
pub struct Migration {
    pub id: &'static str,
    pub statements: Vec<String>,
}

/// The full migration history.
///
/// Migration 5 backfills `expires_at` for pre-existing rows from the
/// configured max ages, which is why the expiration config reaches this
/// far down.
pub fn migrations(expiration: &ExpirationConfig) -> Vec<Migration> {
    vec![
        Migration {
            id: "1",
            statements: vec![
                "CREATE TABLE uploads( \
                    id VARCHAR(36) PRIMARY KEY, \
                    uploader_ip BLOB, \
                    sha256sum BLOB, \
                    created_at BIGINT \
                )"
                .to_string(),
            ],
        },
        Migration {
            id: "2",
            statements: vec![
                "ALTER TABLE uploads ADD deleted SMALLINT DEFAULT 0 NOT NULL".to_string(),
            ],
        },
        // uploader_ip becomes a VARCHAR; old BLOB values are dropped.
        Migration {
            id: "3",
            statements: vec![
                "CREATE TABLE new_uploads( \
                    id VARCHAR(36) PRIMARY KEY, \
                    uploader_ip VARCHAR(45), \
                    sha256sum BLOB, \
                    created_at BIGINT, \
                    deleted SMALLINT DEFAULT 0 NOT NULL \
                )"
                .to_string(),
                "INSERT INTO new_uploads(id, sha256sum, created_at, deleted) \
                    SELECT id, sha256sum, created_at, deleted FROM uploads"
                    .to_string(),
                "DROP TABLE uploads".to_string(),
                "ALTER TABLE new_uploads RENAME TO uploads".to_string(),
            ],
        },
        Migration {
            id: "4",
            statements: vec![
                "CREATE TABLE new_uploads( \
                    id VARCHAR(36) PRIMARY KEY, \
                    uploader_ip VARCHAR(45), \
                    sha256sum BLOB, \
                    created_at BIGINT, \
                    deleted SMALLINT DEFAULT 0 NOT NULL, \
                    jwt_account VARCHAR(255), \
                    jwt_issuer VARCHAR(255) \
                )"
                .to_string(),
                "INSERT INTO new_uploads(id, uploader_ip, sha256sum, created_at, deleted) \
                    SELECT id, uploader_ip, sha256sum, created_at, deleted FROM uploads"
                    .to_string(),
                "DROP TABLE uploads".to_string(),
                "ALTER TABLE new_uploads RENAME TO uploads".to_string(),
            ],
        },
        // Rows predating expiry tracking get an expires_at backfilled from
        // their creation time and the configured max ages.
        Migration {
            id: "5",
            statements: vec![
                "CREATE TABLE new_uploads( \
                    id VARCHAR(36) PRIMARY KEY, \
                    uploader_ip VARCHAR(45), \
                    sha256sum BLOB, \
                    created_at BIGINT, \
                    expires_at BIGINT, \
                    deleted SMALLINT DEFAULT 0 NOT NULL, \
                    jwt_account VARCHAR(255) DEFAULT '' NOT NULL, \
                    jwt_issuer VARCHAR(255) DEFAULT '' NOT NULL \
                )"
                .to_string(),
                format!(
                    "INSERT INTO new_uploads(id, uploader_ip, sha256sum, created_at, deleted, \
                        jwt_account, jwt_issuer, expires_at) \
                        SELECT id, uploader_ip, sha256sum, created_at, deleted, \
                        CASE WHEN jwt_account IS NULL THEN '' ELSE jwt_account END, \
                        CASE WHEN jwt_issuer IS NULL THEN '' ELSE jwt_issuer END, \
                        CASE WHEN jwt_account IS NOT NULL THEN created_at + {identified} \
                        ELSE created_at + {anonymous} END \
                        FROM uploads",
                    identified = expiration.max_age_identified_secs,
                    anonymous = expiration.max_age_anonymous_secs,
                ),
                "DROP TABLE uploads".to_string(),
                "ALTER TABLE new_uploads RENAME TO uploads".to_string(),
            ],
        },
        // Final schema: the deleted flag becomes a deleted_at timestamp
        // (-1 = live), plus file metadata and the nick claim.
        Migration {
            id: "6",
            statements: vec![
                "CREATE TABLE new_uploads( \
                    id VARCHAR(36) PRIMARY KEY, \
                    uploader_ip VARCHAR(45) NOT NULL, \
                    sha256sum BLOB, \
                    created_at BIGINT NOT NULL, \
                    expires_at BIGINT DEFAULT -1 NOT NULL, \
                    deleted_at BIGINT DEFAULT -1 NOT NULL, \
                    file_name VARCHAR(255) DEFAULT '' NOT NULL, \
                    file_type VARCHAR(255) DEFAULT '' NOT NULL, \
                    file_size BIGINT DEFAULT -1 NOT NULL, \
                    jwt_nick VARCHAR(255) DEFAULT '' NOT NULL, \
                    jwt_account VARCHAR(255) DEFAULT '' NOT NULL, \
                    jwt_issuer VARCHAR(255) DEFAULT '' NOT NULL \
                )"
                .to_string(),
                "INSERT INTO new_uploads(id, uploader_ip, sha256sum, created_at, expires_at, \
                    deleted_at, jwt_account, jwt_issuer) \
                    SELECT id, uploader_ip, sha256sum, created_at, \
                    COALESCE(expires_at, -1), \
                    CASE WHEN deleted = 0 THEN -1 ELSE 1 END, \
                    jwt_account, jwt_issuer \
                    FROM uploads"
                    .to_string(),
                "DROP TABLE uploads".to_string(),
                "ALTER TABLE new_uploads RENAME TO uploads".to_string(),
            ],
        },
    ]
}

const CREATE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations( \
    id VARCHAR(32) PRIMARY KEY, \
    applied_at BIGINT NOT NULL \
)";

/// Apply pending migrations on SQLite. Returns the number applied.
pub async fn apply_sqlite(
    pool: &Pool<Sqlite>,
    expiration: &ExpirationConfig,
) -> MetadataResult<usize> {
    sqlx::query(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let applied: Vec<(String,)> = sqlx::query_as("SELECT id FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let applied: HashSet<String> = applied.into_iter().map(|(id,)| id).collect();

    let mut count = 0;
    for migration in migrations(expiration) {
        if applied.contains(migration.id) {
            continue;
        }
        let mut tx = pool.begin().await?;
        for statement in &migration.statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_migrations(id, applied_at) VALUES (?, ?)")
            .bind(migration.id)
            .bind(OffsetDateTime::now_utc().unix_timestamp())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        count += 1;
    }

    if count > 0 {
        tracing::info!(count, "applied schema migrations");
    }
    Ok(count)
}

/// Apply pending migrations on MySQL. Returns the number applied.
///
/// MySQL auto-commits DDL, so a failed migration can leave the
/// intermediate `new_uploads` table behind; re-running after fixing the
/// cause requires dropping it by hand. The same caveat applies to the
/// original deployment this history was carried over from.
pub async fn apply_mysql(
    pool: &Pool<MySql>,
    expiration: &ExpirationConfig,
) -> MetadataResult<usize> {
    sqlx::query(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let applied: Vec<(String,)> = sqlx::query_as("SELECT id FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let applied: HashSet<String> = applied.into_iter().map(|(id,)| id).collect();

    let mut count = 0;
    for migration in migrations(expiration) {
        if applied.contains(migration.id) {
            continue;
        }
        for statement in &migration.statements {
            sqlx::query(statement).execute(pool).await?;
        }
        sqlx::query("INSERT INTO schema_migrations(id, applied_at) VALUES (?, ?)")
            .bind(migration.id)
            .bind(OffsetDateTime::now_utc().unix_timestamp())
            .execute(pool)
            .await?;
        count += 1;
    }

    if count > 0 {
        tracing::info!(count, "applied schema migrations");
    }
    Ok(count)
}
