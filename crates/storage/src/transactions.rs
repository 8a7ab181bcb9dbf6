use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use std::str::FromStr;

use tally_core::{BankTransaction, CardDetails, FxDetails, MatchStatus};

use crate::db::DbPool;
use crate::{fmt_dt, parse_dt, parse_opt_decimal, StorageError};

/// Insert new transactions and refresh the mutable fields of existing ones.
/// Match state (`status`, `attempts`, `best_confidence`, `suggestion_id`)
/// is never touched here, which is what makes ingestion replay-safe.
pub async fn upsert_transactions(
    pool: &DbPool,
    transactions: &[BankTransaction],
    now: DateTime<Utc>,
) -> Result<u64, StorageError> {
    let mut written = 0u64;
    for tx in transactions {
        let result = sqlx::query(
            r#"
            INSERT INTO bank_transactions (
                reference, entity, profile_id, direction, kind, occurred_at,
                amount, currency, description, payment_reference,
                counterparty_name, counterparty_account,
                from_amount, from_currency, exchange_rate, fees,
                merchant_name, merchant_category, card_last4, card_holder,
                running_balance, status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            ON CONFLICT (reference) DO UPDATE SET
                description = excluded.description,
                payment_reference = excluded.payment_reference,
                counterparty_name = excluded.counterparty_name,
                counterparty_account = excluded.counterparty_account,
                from_amount = excluded.from_amount,
                from_currency = excluded.from_currency,
                exchange_rate = excluded.exchange_rate,
                fees = excluded.fees,
                running_balance = excluded.running_balance,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&tx.reference)
        .bind(&tx.entity)
        .bind(tx.profile_id)
        .bind(tx.direction.to_string())
        .bind(tx.kind.as_str())
        .bind(fmt_dt(tx.occurred_at))
        .bind(tx.amount.to_string())
        .bind(&tx.currency)
        .bind(tx.description.as_deref())
        .bind(tx.payment_reference.as_deref())
        .bind(tx.counterparty_name.as_deref())
        .bind(tx.counterparty_account.as_deref())
        .bind(tx.fx.as_ref().map(|fx| fx.from_amount.to_string()))
        .bind(tx.fx.as_ref().map(|fx| fx.from_currency.clone()))
        .bind(tx.fx.as_ref().map(|fx| fx.rate.to_string()))
        .bind(tx.fees.map(|f| f.to_string()))
        .bind(tx.card.as_ref().and_then(|c| c.merchant.clone()))
        .bind(tx.card.as_ref().and_then(|c| c.category.clone()))
        .bind(tx.card.as_ref().and_then(|c| c.last4.clone()))
        .bind(tx.card.as_ref().and_then(|c| c.cardholder.clone()))
        .bind(tx.running_balance.map(|b| b.to_string()))
        .bind(fmt_dt(now))
        .bind(fmt_dt(now))
        .execute(pool)
        .await?;
        written += result.rows_affected();
    }
    Ok(written)
}

/// Pending transactions for one entity, oldest first, capped.
pub async fn pending_for_entity(
    pool: &DbPool,
    entity: &str,
    limit: i64,
) -> Result<Vec<BankTransaction>, StorageError> {
    let rows = sqlx::query(
        "SELECT * FROM bank_transactions
         WHERE entity = ? AND status = 'pending'
         ORDER BY occurred_at ASC
         LIMIT ?",
    )
    .bind(entity)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_transaction).collect()
}

pub async fn get_transaction(
    pool: &DbPool,
    reference: &str,
) -> Result<Option<BankTransaction>, StorageError> {
    let row = sqlx::query("SELECT * FROM bank_transactions WHERE reference = ?")
        .bind(reference)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_transaction).transpose()
}

pub async fn get_by_suggestion(
    pool: &DbPool,
    suggestion_id: &str,
) -> Result<Option<BankTransaction>, StorageError> {
    let row = sqlx::query("SELECT * FROM bank_transactions WHERE suggestion_id = ?")
        .bind(suggestion_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_transaction).transpose()
}

/// Transition `pending -> submitted`, recording the attempt.
///
/// Guarded by the attempts counter read when the lease was taken: a stale
/// worker whose lease expired finds the row changed underneath it and gets
/// `false` back instead of clobbering a newer attempt. `best_confidence`
/// keeps the maximum ever observed, not the latest.
pub async fn mark_submitted(
    pool: &DbPool,
    reference: &str,
    confidence: Decimal,
    expected_attempts: i64,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        r#"
        UPDATE bank_transactions SET
            status = 'submitted',
            status_reason = NULL,
            last_attempt_at = ?,
            attempts = attempts + 1,
            best_confidence = CASE
                WHEN best_confidence IS NULL
                  OR CAST(best_confidence AS REAL) < CAST(? AS REAL)
                THEN ?
                ELSE best_confidence
            END,
            updated_at = ?
        WHERE reference = ? AND status = 'pending' AND attempts = ?
        "#,
    )
    .bind(fmt_dt(now))
    .bind(confidence.to_string())
    .bind(confidence.to_string())
    .bind(fmt_dt(now))
    .bind(reference)
    .bind(expected_attempts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Backfill the opaque suggestion id once the approval service has
/// acknowledged the submission.
pub async fn record_suggestion_id(
    pool: &DbPool,
    reference: &str,
    suggestion_id: &str,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE bank_transactions SET suggestion_id = ? WHERE reference = ?")
        .bind(suggestion_id)
        .bind(reference)
        .execute(pool)
        .await?;
    Ok(())
}

/// Roll a failed emission back to `pending`. Attempts and best confidence
/// stay as an advisory record of the attempt.
pub async fn revert_to_pending(
    pool: &DbPool,
    reference: &str,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE bank_transactions
         SET status = 'pending', suggestion_id = NULL, updated_at = ?
         WHERE reference = ? AND status = 'submitted'",
    )
    .bind(fmt_dt(now))
    .bind(reference)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_matched(
    pool: &DbPool,
    reference: &str,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE bank_transactions
         SET status = 'matched', status_reason = NULL, updated_at = ?
         WHERE reference = ? AND status = 'submitted'",
    )
    .bind(fmt_dt(now))
    .bind(reference)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal failure with an operator-visible explanation. Never regresses a
/// row that already reached `matched`.
pub async fn mark_unmatched(
    pool: &DbPool,
    reference: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE bank_transactions
         SET status = 'unmatched', status_reason = ?, updated_at = ?
         WHERE reference = ? AND status IN ('pending', 'submitted')",
    )
    .bind(reason)
    .bind(fmt_dt(now))
    .bind(reference)
    .execute(pool)
    .await?;
    Ok(())
}

/// How many prior approvals this counterparty already has.
pub async fn counterparty_approvals(
    pool: &DbPool,
    counterparty_name: &str,
) -> Result<i64, StorageError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM bank_transactions
         WHERE counterparty_name = ? AND status = 'matched'",
    )
    .bind(counterparty_name)
    .fetch_one(pool)
    .await?;
    Ok(row.try_get("n")?)
}

/// Entities that currently have pending work, for batch planning.
pub async fn entities_with_pending(pool: &DbPool) -> Result<Vec<String>, StorageError> {
    let rows = sqlx::query(
        "SELECT DISTINCT entity FROM bank_transactions WHERE status = 'pending' ORDER BY entity",
    )
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| r.try_get::<String, _>("entity").map_err(Into::into))
        .collect()
}

pub async fn count_by_status(pool: &DbPool, entity: &str) -> Result<Vec<(String, i64)>, StorageError> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM bank_transactions WHERE entity = ? GROUP BY status",
    )
    .bind(entity)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| {
            Ok((
                r.try_get::<String, _>("status")?,
                r.try_get::<i64, _>("n")?,
            ))
        })
        .collect()
}

// ── Leases ────────────────────────────────────────────────────────────────────

/// Claim a short-TTL scoring lease on one transaction. Returns `false`
/// when another worker holds an unexpired lease.
pub async fn acquire_lease(
    pool: &DbPool,
    reference: &str,
    holder: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    sqlx::query("DELETE FROM tx_leases WHERE reference = ? AND expires_at <= ?")
        .bind(reference)
        .bind(fmt_dt(now))
        .execute(pool)
        .await?;

    let result = sqlx::query(
        "INSERT INTO tx_leases (reference, holder, expires_at) VALUES (?, ?, ?)
         ON CONFLICT (reference) DO NOTHING",
    )
    .bind(reference)
    .bind(holder)
    .bind(fmt_dt(now + ttl))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn release_lease(
    pool: &DbPool,
    reference: &str,
    holder: &str,
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM tx_leases WHERE reference = ? AND holder = ?")
        .bind(reference)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Row mapping ───────────────────────────────────────────────────────────────

fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> Result<BankTransaction, StorageError> {
    let direction: String = row.try_get("direction")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let occurred_at: String = row.try_get("occurred_at")?;
    let amount: String = row.try_get("amount")?;

    let from_amount = parse_opt_decimal(row.try_get("from_amount")?)?;
    let from_currency: Option<String> = row.try_get("from_currency")?;
    let exchange_rate = parse_opt_decimal(row.try_get("exchange_rate")?)?;
    let fx = match (from_amount, from_currency, exchange_rate) {
        (Some(from_amount), Some(from_currency), Some(rate)) => Some(FxDetails {
            from_amount,
            from_currency,
            rate,
        }),
        _ => None,
    };

    let merchant: Option<String> = row.try_get("merchant_name")?;
    let category: Option<String> = row.try_get("merchant_category")?;
    let last4: Option<String> = row.try_get("card_last4")?;
    let cardholder: Option<String> = row.try_get("card_holder")?;
    let card = if merchant.is_some() || category.is_some() || last4.is_some() || cardholder.is_some()
    {
        Some(CardDetails {
            merchant,
            category,
            last4,
            cardholder,
        })
    } else {
        None
    };

    let last_attempt_at: Option<String> = row.try_get("last_attempt_at")?;

    Ok(BankTransaction {
        reference: row.try_get("reference")?,
        entity: row.try_get("entity")?,
        profile_id: row.try_get("profile_id")?,
        direction: direction
            .parse()
            .map_err(|e: String| StorageError::Corrupt(e))?,
        kind: kind.parse().map_err(|e: String| StorageError::Corrupt(e))?,
        occurred_at: parse_dt(&occurred_at)?,
        amount: Decimal::from_str(&amount)
            .map_err(|e| StorageError::Corrupt(format!("amount: {e}")))?,
        currency: row.try_get("currency")?,
        description: row.try_get("description")?,
        payment_reference: row.try_get("payment_reference")?,
        counterparty_name: row.try_get("counterparty_name")?,
        counterparty_account: row.try_get("counterparty_account")?,
        fx,
        fees: parse_opt_decimal(row.try_get("fees")?)?,
        card,
        running_balance: parse_opt_decimal(row.try_get("running_balance")?)?,
        status: status
            .parse::<MatchStatus>()
            .map_err(StorageError::Corrupt)?,
        status_reason: row.try_get("status_reason")?,
        last_attempt_at: last_attempt_at.as_deref().map(parse_dt).transpose()?,
        attempts: row.try_get("attempts")?,
        best_confidence: parse_opt_decimal(row.try_get("best_confidence")?)?,
        suggestion_id: row.try_get("suggestion_id")?,
    })
}
