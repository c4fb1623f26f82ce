//! Blob metadata persistence layer.
//!
//! This crate offers an async API around SQLite (sqlx) for the blob catalog:
//! path-addressed records pairing ownership and free-form JSON properties
//! with the size and digest of the bytes held in the object store. The HTTP
//! daemon composes it with the object store facade from `blob-store`.

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use thiserror::Error;
use ulid::Ulid;

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Maximum serialized size in bytes for a blob's free-form properties.
pub const MAX_PROPERTIES_SIZE: usize = 10 * 1024;

/// Maximum length in characters for a blob path.
pub const MAX_PATH_LEN: usize = 200;

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/blobs/blobs.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await?;

        // Run embedded migrations. The directory is resolved relative to this crate.
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    /// Exposes the underlying pool for composed queries (reporting, housekeeping).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts a new blob record and returns the persisted row.
    ///
    /// The caller never supplies the id; a fresh ULID is minted here so that
    /// the storage key derived from it is unique for the lifetime of the record.
    pub async fn insert_blob(&self, data: NewBlob<'_>) -> Result<BlobRecord> {
        validate_path(data.path)?;
        let properties = serde_json::to_string(data.properties)?;
        validate_properties_len(properties.len())?;

        let id = Ulid::new();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO blobs (
                id, path, size, sha256, properties,
                created_by, updated_by, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(data.path)
        .bind(data.size)
        .bind("")
        .bind(&properties)
        .bind(data.created_by)
        .bind(data.created_by)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                anyhow::Error::new(BlobError::DuplicatePath(data.path.to_owned()))
            } else {
                err.into()
            }
        })?;

        self.fetch_blob(BlobKey::ById(id))
            .await?
            .ok_or_else(|| anyhow!("blob inserted but missing when reloaded (path={})", data.path))
    }

    /// Retrieves a blob by id or by its logical path.
    pub async fn fetch_blob(&self, key: BlobKey<'_>) -> Result<Option<BlobRecord>> {
        let row = match key {
            BlobKey::ById(id) => {
                sqlx::query("SELECT * FROM blobs WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await?
            }
            BlobKey::ByPath(path) => {
                sqlx::query("SELECT * FROM blobs WHERE path = ?")
                    .bind(path)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        row.map(map_blob).transpose()
    }

    /// Replaces the free-form properties of an existing blob.
    pub async fn update_properties(
        &self,
        id: Ulid,
        properties: &serde_json::Value,
        updated_by: &str,
    ) -> Result<Option<BlobRecord>> {
        let serialized = serde_json::to_string(properties)?;
        validate_properties_len(serialized.len())?;

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE blobs
            SET properties = ?, updated_by = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&serialized)
        .bind(updated_by)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.fetch_blob(BlobKey::ById(id)).await
    }

    /// Records the verified size and digest once the object-store write has
    /// succeeded. This is phase two of the upload protocol.
    pub async fn finalize_upload(
        &self,
        id: Ulid,
        size: i64,
        sha256: &str,
        updated_by: &str,
    ) -> Result<Option<BlobRecord>> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE blobs
            SET size = ?, sha256 = ?, updated_by = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(size)
        .bind(sha256)
        .bind(updated_by)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.fetch_blob(BlobKey::ById(id)).await
    }

    /// Removes a blob record. Returns whether a row was deleted.
    pub async fn delete_blob(&self, id: Ulid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM blobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lists blobs ordered by the whitelisted sort column.
    pub async fn list_blobs(&self, query: BlobQuery) -> Result<Vec<BlobRecord>> {
        let sql = format!(
            "SELECT * FROM blobs ORDER BY {} LIMIT ? OFFSET ?",
            query.order.as_sql()
        );
        let mut rows = sqlx::query(&sql)
            .bind(query.limit)
            .bind(query.offset)
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_blob(row)?);
        }
        Ok(out)
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn map_blob(row: SqliteRow) -> Result<BlobRecord> {
    let id: String = row.try_get("id")?;
    let properties: String = row.try_get("properties")?;

    Ok(BlobRecord {
        id: Ulid::from_string(&id).map_err(|err| anyhow!("invalid ULID '{}': {}", id, err))?,
        path: row.try_get("path")?,
        size: row.try_get("size")?,
        sha256: row.try_get("sha256")?,
        properties: serde_json::from_str(&properties)?,
        created_by: row.try_get("created_by")?,
        updated_by: row.try_get("updated_by")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}

/// Validates a logical blob path: non-empty, absolute, bounded length.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(anyhow::Error::new(BlobError::InvalidPath(
            "path is empty".into(),
        )));
    }
    if !path.starts_with('/') {
        return Err(anyhow::Error::new(BlobError::InvalidPath(
            "path does not start with /".into(),
        )));
    }
    if path.chars().count() > MAX_PATH_LEN {
        return Err(anyhow::Error::new(BlobError::InvalidPath(
            "path is too long".into(),
        )));
    }
    Ok(())
}

fn validate_properties_len(len: usize) -> Result<()> {
    if len > MAX_PROPERTIES_SIZE {
        return Err(anyhow::Error::new(BlobError::PropertiesTooLarge(len)));
    }
    Ok(())
}

/// Returns the dot-included extension of a path (`"/a/b.txt"` -> `".txt"`).
pub fn path_extension(path: &str) -> &str {
    let basename = path.rsplit('/').next().unwrap_or(path);
    match basename.rfind('.') {
        Some(idx) if idx > 0 => &basename[idx..],
        _ => "",
    }
}

/// Errors returned by the metadata layer.
#[derive(Debug, Error, Clone)]
pub enum BlobError {
    #[error("a blob already exists at path '{0}'")]
    DuplicatePath(String),
    #[error("blob '{0}' not found")]
    NotFound(Ulid),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("properties too large: {0} bytes")]
    PropertiesTooLarge(usize),
}

/// Input payload for blob creation. The declared size is provisional until
/// `finalize_upload` records the verified byte count.
#[derive(Debug, Clone)]
pub struct NewBlob<'a> {
    pub path: &'a str,
    pub size: i64,
    pub properties: &'a serde_json::Value,
    pub created_by: &'a str,
}

/// Lookup key for a blob: by immutable id or by logical path.
#[derive(Debug, Clone, Copy)]
pub enum BlobKey<'a> {
    ById(Ulid),
    ByPath(&'a str),
}

/// Persisted blob metadata row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobRecord {
    pub id: Ulid,
    pub path: String,
    pub size: i64,
    pub sha256: String,
    pub properties: serde_json::Value,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlobRecord {
    /// Physical object-store key for this blob: `{id}/{id}{ext}`.
    ///
    /// The key depends only on the immutable id (plus the upload extension),
    /// so metadata updates never relocate the stored bytes.
    pub fn storage_key(&self) -> String {
        let ext = path_extension(&self.path);
        format!("{id}/{id}{ext}", id = self.id)
    }

    /// Extension of the blob's path, dot included (may be empty).
    pub fn extension(&self) -> &str {
        path_extension(&self.path)
    }

    /// Basename of the logical path, used as the download filename.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Listing parameters. Offsets and limits are validated by the API layer;
/// the order column is constrained by construction.
#[derive(Debug, Clone, Copy)]
pub struct BlobQuery {
    pub offset: i64,
    pub limit: i64,
    pub order: BlobOrder,
}

impl Default for BlobQuery {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 1_000,
            order: BlobOrder::Path,
        }
    }
}

/// Whitelisted sort columns for listings. Free-form `order_by` strings from
/// clients are parsed into this enum and never interpolated into SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobOrder {
    Path,
    CreatedAt,
    UpdatedAt,
    Size,
}

impl BlobOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            BlobOrder::Path => "path ASC",
            BlobOrder::CreatedAt => "created_at DESC",
            BlobOrder::UpdatedAt => "updated_at DESC",
            BlobOrder::Size => "size DESC",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlobOrder::Path => "path",
            BlobOrder::CreatedAt => "created_at",
            BlobOrder::UpdatedAt => "updated_at",
            BlobOrder::Size => "size",
        }
    }
}

impl FromStr for BlobOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "path" => Ok(BlobOrder::Path),
            "created_at" => Ok(BlobOrder::CreatedAt),
            "updated_at" => Ok(BlobOrder::UpdatedAt),
            "size" => Ok(BlobOrder::Size),
            other => Err(anyhow!("unknown order column: {}", other)),
        }
    }
}
