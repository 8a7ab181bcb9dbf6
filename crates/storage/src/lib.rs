pub mod cursors;
pub mod db;
pub mod patterns;
pub mod transactions;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

pub use cursors::{claim_cursor, complete_cursor, fail_cursor, get_cursor, CursorStatus, SyncCursor};
pub use db::{create_db, create_db_in_memory, DbPool};
pub use patterns::{
    deactivate_pattern, get_pattern, get_poll_cursor, load_active_patterns, mark_review_processed,
    record_approval, record_rejection, set_boost, set_poll_cursor, upsert_pattern,
};
pub use transactions::{
    acquire_lease, count_by_status, counterparty_approvals, entities_with_pending,
    get_by_suggestion, get_transaction, mark_matched, mark_submitted, mark_unmatched,
    pending_for_entity, record_suggestion_id, release_lease, revert_to_pending,
    upsert_transactions,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Timestamps are stored as fixed-width UTC strings so that lexicographic
/// comparison in SQL equals chronological comparison.
pub(crate) fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_dt(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp '{s}': {e}")))
}

pub(crate) fn parse_decimal(s: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(s).map_err(|e| StorageError::Corrupt(format!("decimal '{s}': {e}")))
}

pub(crate) fn parse_opt_decimal(s: Option<String>) -> Result<Option<Decimal>, StorageError> {
    s.as_deref().map(parse_decimal).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tally_core::{
        BankTransaction, Direction, MatchStatus, Pattern, PatternKind, TargetKind, TransactionKind,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    fn tx(reference: &str) -> BankTransaction {
        BankTransaction {
            reference: reference.into(),
            entity: "Phygrid Limited".into(),
            profile_id: 19,
            direction: Direction::Debit,
            kind: TransactionKind::Transfer,
            occurred_at: t0(),
            amount: Decimal::new(123_456, 2),
            currency: "EUR".into(),
            description: Some("supplier payment".into()),
            payment_reference: Some("INV-7788".into()),
            counterparty_name: Some("Acme Ltd".into()),
            counterparty_account: None,
            fx: None,
            fees: None,
            card: None,
            running_balance: Some(Decimal::new(1_000_000, 2)),
            status: MatchStatus::Pending,
            status_reason: None,
            last_attempt_at: None,
            attempts: 0,
            best_confidence: None,
            suggestion_id: None,
        }
    }

    fn pattern(id: &str, value: &str) -> Pattern {
        Pattern {
            id: id.into(),
            kind: PatternKind::Counterparty,
            value: value.into(),
            regex: None,
            target_kind: TargetKind::Account,
            target_id: "1100".into(),
            target_name: "Accounts Payable".into(),
            auto_approve: false,
            boost: Decimal::new(10, 2),
            times_used: 1,
            times_approved: 1,
            times_rejected: 0,
            active: true,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let pool = create_db_in_memory().await.unwrap();
        let transactions = vec![tx("TRANSFER-1"), tx("TRANSFER-2")];

        upsert_transactions(&pool, &transactions, t0()).await.unwrap();
        upsert_transactions(&pool, &transactions, t0()).await.unwrap();

        let pending = pending_for_entity(&pool, "Phygrid Limited", 100).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn upsert_refreshes_mutable_fields_but_not_match_state() {
        let pool = create_db_in_memory().await.unwrap();
        let original = tx("TRANSFER-1");
        upsert_transactions(&pool, &[original.clone()], t0()).await.unwrap();

        assert!(
            mark_submitted(&pool, "TRANSFER-1", Decimal::new(90, 2), 0, t0())
                .await
                .unwrap()
        );
        record_suggestion_id(&pool, "TRANSFER-1", "sugg-1").await.unwrap();

        let mut updated = original;
        updated.description = Some("supplier payment (corrected)".into());
        updated.running_balance = Some(Decimal::new(900_000, 2));
        upsert_transactions(&pool, &[updated], t0() + Duration::hours(1))
            .await
            .unwrap();

        let row = get_transaction(&pool, "TRANSFER-1").await.unwrap().unwrap();
        assert_eq!(
            row.description.as_deref(),
            Some("supplier payment (corrected)")
        );
        // Match state survived the replay.
        assert_eq!(row.status, MatchStatus::Submitted);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.suggestion_id.as_deref(), Some("sugg-1"));
    }

    #[tokio::test]
    async fn best_confidence_keeps_the_maximum() {
        let pool = create_db_in_memory().await.unwrap();
        upsert_transactions(&pool, &[tx("TRANSFER-1")], t0()).await.unwrap();

        assert!(
            mark_submitted(&pool, "TRANSFER-1", Decimal::new(90, 2), 0, t0())
                .await
                .unwrap()
        );
        revert_to_pending(&pool, "TRANSFER-1", t0()).await.unwrap();
        assert!(
            mark_submitted(&pool, "TRANSFER-1", Decimal::new(75, 2), 1, t0())
                .await
                .unwrap()
        );

        let row = get_transaction(&pool, "TRANSFER-1").await.unwrap().unwrap();
        assert_eq!(row.best_confidence, Some(Decimal::new(90, 2)));
        assert_eq!(row.attempts, 2);
    }

    #[tokio::test]
    async fn stale_attempts_guard_rejects_the_write() {
        let pool = create_db_in_memory().await.unwrap();
        upsert_transactions(&pool, &[tx("TRANSFER-1")], t0()).await.unwrap();

        assert!(
            mark_submitted(&pool, "TRANSFER-1", Decimal::new(90, 2), 0, t0())
                .await
                .unwrap()
        );
        revert_to_pending(&pool, "TRANSFER-1", t0()).await.unwrap();

        // A worker that leased before the first submission still holds
        // expected_attempts = 0 and must be turned away.
        assert!(
            !mark_submitted(&pool, "TRANSFER-1", Decimal::new(80, 2), 0, t0())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn status_never_regresses() {
        let pool = create_db_in_memory().await.unwrap();
        upsert_transactions(&pool, &[tx("TRANSFER-1")], t0()).await.unwrap();

        mark_submitted(&pool, "TRANSFER-1", Decimal::new(95, 2), 0, t0())
            .await
            .unwrap();
        mark_matched(&pool, "TRANSFER-1", t0()).await.unwrap();

        // A terminal row ignores both unmatched and re-submission attempts.
        mark_unmatched(&pool, "TRANSFER-1", "late failure", t0()).await.unwrap();
        let row = get_transaction(&pool, "TRANSFER-1").await.unwrap().unwrap();
        assert_eq!(row.status, MatchStatus::Matched);

        assert!(
            !mark_submitted(&pool, "TRANSFER-1", Decimal::new(99, 2), 1, t0())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn unmatched_records_a_reason() {
        let pool = create_db_in_memory().await.unwrap();
        upsert_transactions(&pool, &[tx("TRANSFER-1")], t0()).await.unwrap();

        mark_unmatched(&pool, "TRANSFER-1", "quarantined: bad kind", t0())
            .await
            .unwrap();
        let row = get_transaction(&pool, "TRANSFER-1").await.unwrap().unwrap();
        assert_eq!(row.status, MatchStatus::Unmatched);
        assert_eq!(row.status_reason.as_deref(), Some("quarantined: bad kind"));
    }

    #[tokio::test]
    async fn lease_excludes_second_worker_until_expiry() {
        let pool = create_db_in_memory().await.unwrap();
        let ttl = Duration::minutes(2);

        assert!(acquire_lease(&pool, "TRANSFER-1", "w1", ttl, t0()).await.unwrap());
        assert!(!acquire_lease(&pool, "TRANSFER-1", "w2", ttl, t0()).await.unwrap());

        // After expiry the lease can be retaken.
        let later = t0() + Duration::minutes(3);
        assert!(acquire_lease(&pool, "TRANSFER-1", "w2", ttl, later).await.unwrap());

        release_lease(&pool, "TRANSFER-1", "w2").await.unwrap();
        assert!(acquire_lease(&pool, "TRANSFER-1", "w3", ttl, later).await.unwrap());
    }

    #[tokio::test]
    async fn cursor_claim_is_exclusive() {
        let pool = create_db_in_memory().await.unwrap();

        let claimed = claim_cursor(&pool, 19, "EUR", "Phygrid Limited", 7).await.unwrap();
        assert!(claimed.is_some());
        assert_eq!(claimed.unwrap().status, CursorStatus::Syncing);

        // Second claim while syncing is refused.
        assert!(claim_cursor(&pool, 19, "EUR", "Phygrid Limited", 7)
            .await
            .unwrap()
            .is_none());

        complete_cursor(&pool, 19, "EUR", t0(), 42, t0()).await.unwrap();
        let cursor = get_cursor(&pool, 19, "EUR").await.unwrap().unwrap();
        assert_eq!(cursor.status, CursorStatus::Idle);
        assert_eq!(cursor.count, 42);
        assert_eq!(cursor.last_end_date, Some(t0()));

        // Idle again: claimable.
        assert!(claim_cursor(&pool, 19, "EUR", "Phygrid Limited", 7)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn failed_cursor_keeps_watermark() {
        let pool = create_db_in_memory().await.unwrap();
        claim_cursor(&pool, 19, "EUR", "Phygrid Limited", 7).await.unwrap();
        complete_cursor(&pool, 19, "EUR", t0(), 10, t0()).await.unwrap();

        claim_cursor(&pool, 19, "EUR", "Phygrid Limited", 7).await.unwrap();
        fail_cursor(&pool, 19, "EUR", "statement fetch failed").await.unwrap();

        let cursor = get_cursor(&pool, 19, "EUR").await.unwrap().unwrap();
        assert_eq!(cursor.status, CursorStatus::Error);
        assert_eq!(cursor.error.as_deref(), Some("statement fetch failed"));
        assert_eq!(cursor.last_end_date, Some(t0()));
    }

    #[tokio::test]
    async fn duplicate_pattern_increments_usage() {
        let pool = create_db_in_memory().await.unwrap();
        let first = upsert_pattern(&pool, &pattern("p1", "acme"), &[1.0, 0.0]).await.unwrap();
        let second = upsert_pattern(&pool, &pattern("p2", "acme"), &[0.0, 1.0]).await.unwrap();

        assert_eq!(first, "p1");
        assert_eq!(second, "p1");

        let active = load_active_patterns(&pool).await.unwrap();
        assert_eq!(active.len(), 1);
        let (surviving, vector) = &active[0];
        assert_eq!(surviving.times_approved, 2);
        assert_eq!(surviving.times_used, 2);
        // The original vector is kept.
        assert_eq!(vector, &vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn rejection_counters_floor_at_zero() {
        let pool = create_db_in_memory().await.unwrap();
        let mut p = pattern("p1", "acme");
        p.times_approved = 0;
        upsert_pattern(&pool, &p, &[1.0]).await.unwrap();

        record_rejection(&pool, "p1").await.unwrap();
        record_rejection(&pool, "p1").await.unwrap();

        let stored = get_pattern(&pool, "p1").await.unwrap().unwrap();
        assert_eq!(stored.times_approved, 0);
        assert_eq!(stored.times_rejected, 2);
    }

    #[tokio::test]
    async fn deactivated_patterns_leave_the_active_set() {
        let pool = create_db_in_memory().await.unwrap();
        upsert_pattern(&pool, &pattern("p1", "acme"), &[1.0]).await.unwrap();
        deactivate_pattern(&pool, "p1").await.unwrap();
        assert!(load_active_patterns(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn review_processing_is_exactly_once() {
        let pool = create_db_in_memory().await.unwrap();
        assert!(mark_review_processed(&pool, "s1", "2025-03-10T12:00:00Z").await.unwrap());
        assert!(!mark_review_processed(&pool, "s1", "2025-03-10T12:00:00Z").await.unwrap());
        // A later review of the same suggestion is a new event.
        assert!(mark_review_processed(&pool, "s1", "2025-03-11T09:00:00Z").await.unwrap());
    }

    #[tokio::test]
    async fn counterparty_approvals_counts_matched_rows() {
        let pool = create_db_in_memory().await.unwrap();
        for i in 0..3 {
            let mut t = tx(&format!("TRANSFER-{i}"));
            t.counterparty_name = Some("Acme Ltd".into());
            upsert_transactions(&pool, &[t], t0()).await.unwrap();
            mark_submitted(
                &pool,
                &format!("TRANSFER-{i}"),
                Decimal::new(90, 2),
                0,
                t0(),
            )
            .await
            .unwrap();
            mark_matched(&pool, &format!("TRANSFER-{i}"), t0()).await.unwrap();
        }

        assert_eq!(counterparty_approvals(&pool, "Acme Ltd").await.unwrap(), 3);
        assert_eq!(counterparty_approvals(&pool, "Globex").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn poll_cursor_round_trips() {
        let pool = create_db_in_memory().await.unwrap();
        assert!(get_poll_cursor(&pool).await.unwrap().is_none());
        set_poll_cursor(&pool, "2025-03-10T12:00:00Z").await.unwrap();
        set_poll_cursor(&pool, "2025-03-11T12:00:00Z").await.unwrap();
        assert_eq!(
            get_poll_cursor(&pool).await.unwrap().as_deref(),
            Some("2025-03-11T12:00:00Z")
        );
    }
}
