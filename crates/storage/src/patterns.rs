use rust_decimal::Decimal;
use sqlx::Row;
use std::str::FromStr;

use tally_core::Pattern;

use crate::db::DbPool;
use crate::{parse_decimal, StorageError};

/// Insert a pattern with its embedding. Re-submitting the same
/// `(kind, value, target_kind)` keeps the single existing row and
/// increments its usage instead; the returned id is the surviving row's.
pub async fn upsert_pattern(
    pool: &DbPool,
    pattern: &Pattern,
    vector: &[f32],
) -> Result<String, StorageError> {
    sqlx::query(
        r#"
        INSERT INTO patterns (
            id, kind, value, regex, target_kind, target_id, target_name,
            auto_approve, boost, times_used, times_approved, times_rejected,
            active, vector
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (kind, value, target_kind) DO UPDATE SET
            times_used = patterns.times_used + 1,
            times_approved = patterns.times_approved + 1
        "#,
    )
    .bind(&pattern.id)
    .bind(pattern.kind.as_str())
    .bind(&pattern.value)
    .bind(pattern.regex.as_deref())
    .bind(pattern.target_kind.as_str())
    .bind(&pattern.target_id)
    .bind(&pattern.target_name)
    .bind(pattern.auto_approve)
    .bind(pattern.boost.to_string())
    .bind(pattern.times_used)
    .bind(pattern.times_approved)
    .bind(pattern.times_rejected)
    .bind(pattern.active)
    .bind(encode_vector(vector))
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT id FROM patterns WHERE kind = ? AND value = ? AND target_kind = ?")
        .bind(pattern.kind.as_str())
        .bind(&pattern.value)
        .bind(pattern.target_kind.as_str())
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("id")?)
}

pub async fn get_pattern(pool: &DbPool, id: &str) -> Result<Option<Pattern>, StorageError> {
    let row = sqlx::query("SELECT * FROM patterns WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_pattern).transpose()
}

/// All active patterns with their stored vectors, for index rebuild at
/// startup and for the exact-tier pattern checks.
pub async fn load_active_patterns(
    pool: &DbPool,
) -> Result<Vec<(Pattern, Vec<f32>)>, StorageError> {
    let rows = sqlx::query("SELECT * FROM patterns WHERE active = 1 ORDER BY id")
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            let pattern = row_to_pattern(row)?;
            let blob: Option<Vec<u8>> = row.try_get("vector")?;
            Ok((pattern, blob.map(|b| decode_vector(&b)).unwrap_or_default()))
        })
        .collect()
}

pub async fn record_approval(pool: &DbPool, id: &str) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE patterns SET times_used = times_used + 1, times_approved = times_approved + 1
         WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// A rejection both counts against the pattern and walks back one prior
/// approval credit; counters never go below zero.
pub async fn record_rejection(pool: &DbPool, id: &str) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE patterns SET
             times_rejected = times_rejected + 1,
             times_approved = MAX(times_approved - 1, 0)
         WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_boost(
    pool: &DbPool,
    id: &str,
    boost: Decimal,
    auto_approve: bool,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE patterns SET boost = ?, auto_approve = ? WHERE id = ?")
        .bind(boost.to_string())
        .bind(auto_approve)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn deactivate_pattern(pool: &DbPool, id: &str) -> Result<(), StorageError> {
    sqlx::query("UPDATE patterns SET active = 0 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Learning-loop bookkeeping ─────────────────────────────────────────────────

/// Exactly-once guard for review processing, keyed by
/// `(suggestion_id, reviewed_at)`. `true` means this review is fresh.
pub async fn mark_review_processed(
    pool: &DbPool,
    suggestion_id: &str,
    reviewed_at: &str,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO processed_reviews (suggestion_id, reviewed_at) VALUES (?, ?)",
    )
    .bind(suggestion_id)
    .bind(reviewed_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn get_poll_cursor(pool: &DbPool) -> Result<Option<String>, StorageError> {
    let row = sqlx::query("SELECT last_polled_at FROM learning_state WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(row.try_get("last_polled_at")?),
        None => Ok(None),
    }
}

pub async fn set_poll_cursor(pool: &DbPool, polled_at: &str) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO learning_state (id, last_polled_at) VALUES (1, ?)
         ON CONFLICT (id) DO UPDATE SET last_polled_at = excluded.last_polled_at",
    )
    .bind(polled_at)
    .execute(pool)
    .await?;
    Ok(())
}

// ── Vector codec ──────────────────────────────────────────────────────────────

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn row_to_pattern(row: &sqlx::sqlite::SqliteRow) -> Result<Pattern, StorageError> {
    let kind: String = row.try_get("kind")?;
    let target_kind: String = row.try_get("target_kind")?;
    let boost: String = row.try_get("boost")?;

    Ok(Pattern {
        id: row.try_get("id")?,
        kind: tally_core::PatternKind::from_str(&kind).map_err(StorageError::Corrupt)?,
        value: row.try_get("value")?,
        regex: row.try_get("regex")?,
        target_kind: tally_core::TargetKind::from_str(&target_kind)
            .map_err(StorageError::Corrupt)?,
        target_id: row.try_get("target_id")?,
        target_name: row.try_get("target_name")?,
        auto_approve: row.try_get("auto_approve")?,
        boost: parse_decimal(&boost)?,
        times_used: row.try_get("times_used")?,
        times_approved: row.try_get("times_approved")?,
        times_rejected: row.try_get("times_rejected")?,
        active: row.try_get("active")?,
    })
}
