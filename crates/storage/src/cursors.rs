use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::db::DbPool;
use crate::{fmt_dt, parse_dt, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStatus {
    Idle,
    Syncing,
    Error,
}

impl CursorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CursorStatus::Idle => "idle",
            CursorStatus::Syncing => "syncing",
            CursorStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "idle" => Ok(CursorStatus::Idle),
            "syncing" => Ok(CursorStatus::Syncing),
            "error" => Ok(CursorStatus::Error),
            other => Err(StorageError::Corrupt(format!(
                "unknown cursor status: '{other}'"
            ))),
        }
    }
}

/// Incremental-sync high-water mark for one (profile, currency) pair.
#[derive(Debug, Clone)]
pub struct SyncCursor {
    pub profile_id: i64,
    pub currency: String,
    pub entity: String,
    pub balance_id: Option<i64>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_end_date: Option<DateTime<Utc>>,
    pub status: CursorStatus,
    pub error: Option<String>,
    pub count: i64,
}

/// Atomically flip the cursor to `syncing` and return it. `None` means
/// another worker already holds the pair; at most one `syncing` row per
/// (profile, currency) can exist.
pub async fn claim_cursor(
    pool: &DbPool,
    profile_id: i64,
    currency: &str,
    entity: &str,
    balance_id: i64,
) -> Result<Option<SyncCursor>, StorageError> {
    sqlx::query(
        "INSERT INTO sync_cursors (profile_id, currency, entity, balance_id)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (profile_id, currency) DO UPDATE SET
             entity = excluded.entity,
             balance_id = excluded.balance_id",
    )
    .bind(profile_id)
    .bind(currency)
    .bind(entity)
    .bind(balance_id)
    .execute(pool)
    .await?;

    let claimed = sqlx::query(
        "UPDATE sync_cursors SET status = 'syncing', error = NULL
         WHERE profile_id = ? AND currency = ? AND status != 'syncing'",
    )
    .bind(profile_id)
    .bind(currency)
    .execute(pool)
    .await?;

    if claimed.rows_affected() == 0 {
        return Ok(None);
    }
    get_cursor(pool, profile_id, currency).await
}

pub async fn get_cursor(
    pool: &DbPool,
    profile_id: i64,
    currency: &str,
) -> Result<Option<SyncCursor>, StorageError> {
    let row = sqlx::query("SELECT * FROM sync_cursors WHERE profile_id = ? AND currency = ?")
        .bind(profile_id)
        .bind(currency)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else { return Ok(None) };
    let status: String = row.try_get("status")?;
    let last_synced_at: Option<String> = row.try_get("last_synced_at")?;
    let last_end_date: Option<String> = row.try_get("last_end_date")?;

    Ok(Some(SyncCursor {
        profile_id: row.try_get("profile_id")?,
        currency: row.try_get("currency")?,
        entity: row.try_get("entity")?,
        balance_id: row.try_get("balance_id")?,
        last_synced_at: last_synced_at.as_deref().map(parse_dt).transpose()?,
        last_end_date: last_end_date.as_deref().map(parse_dt).transpose()?,
        status: CursorStatus::parse(&status)?,
        error: row.try_get("error")?,
        count: row.try_get("count")?,
    }))
}

/// Successful sync: advance the watermark, bump the running count, release
/// the claim.
pub async fn complete_cursor(
    pool: &DbPool,
    profile_id: i64,
    currency: &str,
    end_date: DateTime<Utc>,
    synced: i64,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE sync_cursors SET
             status = 'idle',
             error = NULL,
             last_synced_at = ?,
             last_end_date = ?,
             count = count + ?
         WHERE profile_id = ? AND currency = ?",
    )
    .bind(fmt_dt(now))
    .bind(fmt_dt(end_date))
    .bind(synced)
    .bind(profile_id)
    .bind(currency)
    .execute(pool)
    .await?;
    Ok(())
}

/// Failed sync: record the error and leave `last_end_date` untouched so the
/// next run retries the same window.
pub async fn fail_cursor(
    pool: &DbPool,
    profile_id: i64,
    currency: &str,
    error: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE sync_cursors SET status = 'error', error = ?
         WHERE profile_id = ? AND currency = ?",
    )
    .bind(error)
    .bind(profile_id)
    .bind(currency)
    .execute(pool)
    .await?;
    Ok(())
}
