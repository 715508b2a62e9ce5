//! Durable mapping from image identity to the voucher codes found for it.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::models::voucher::VoucherCode;
use crate::services::acquisition::is_remote;
use crate::services::ban_list::BanSnapshot;

pub mod json_store;
pub mod postgres;

pub use json_store::JsonVoucherStore;
pub use postgres::PgVoucherStore;

/// Codes ever found for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherRecord {
    pub key: String,
    pub codes: Vec<VoucherCode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read/write contract the pipeline needs from a result store.
///
/// `upsert` merges: codes already stored are never removed or reordered, new
/// codes are appended in the order given, banned codes are never written.
/// Records returned by any method omit codes on the current ban-list.
#[async_trait]
pub trait VoucherStore: Send + Sync {
    /// Create the backing schema (directory, table) if it does not exist.
    async fn create_if_absent(&self) -> Result<(), StoreError>;

    async fn read_by_key(&self, key: &str) -> Result<Option<VoucherRecord>, StoreError>;

    async fn upsert(&self, key: &str, codes: &[VoucherCode]) -> Result<VoucherRecord, StoreError>;

    async fn list_all(&self) -> Result<Vec<VoucherRecord>, StoreError>;
}

/// Append `incoming` to `existing`, skipping duplicates and banned codes.
/// Returns how many codes were added.
pub(crate) fn merge_codes(
    existing: &mut Vec<VoucherCode>,
    incoming: &[VoucherCode],
    banned: &BanSnapshot,
) -> usize {
    let mut seen: HashSet<VoucherCode> = existing.iter().cloned().collect();
    let before = existing.len();
    for code in incoming {
        if !banned.contains(code.as_str()) && seen.insert(code.clone()) {
            existing.push(code.clone());
        }
    }
    existing.len() - before
}

/// Drop codes that are banned now. Stored records stay append-only; codes
/// banned after they were written are hidden on every read instead.
pub(crate) fn without_banned(mut record: VoucherRecord, banned: &BanSnapshot) -> VoucherRecord {
    record.codes.retain(|code| !banned.contains(code.as_str()));
    record
}

/// Store key for a job input. URLs are keyed by their trimmed text; local
/// paths are normalized lexically so `a\b`, `./a/b` and `a//b` share a key.
pub fn normalize_key(input: &str) -> String {
    let trimmed = input.trim();
    if is_remote(trimmed) {
        return trimmed.to_string();
    }

    let unified = trimmed.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let segments: Vec<&str> = unified
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();

    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Result store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Result record could not be (de)serialized: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Stored record for {key} is invalid: {reason}")]
    Corrupt { key: String, reason: String },
}
