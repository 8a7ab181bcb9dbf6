use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use tally_bank::{BankClient, WireBalance, MAX_STATEMENT_DAYS};
use tally_core::{BankTransaction, Clock, Entity, EntityMap};
use tally_storage::DbPool;

use crate::ReconError;

/// Days re-fetched behind the watermark to catch retroactive postings.
const OVERLAP_DAYS: i64 = 2;
/// Lookback used on the very first sync of a (profile, currency) pair.
const INITIAL_LOOKBACK_DAYS: i64 = 90;

#[derive(Debug, Default, Clone)]
pub struct SyncOutcome {
    pub synced: i64,
    pub quarantined: usize,
    pub skipped: usize,
}

/// Incremental statement ingestion: one cursor per (profile, currency),
/// upsert by reference, watermark advanced only on success.
pub struct SyncService {
    bank: Arc<BankClient>,
    db: DbPool,
    entities: Arc<EntityMap>,
    clock: Arc<dyn Clock>,
}

impl SyncService {
    pub fn new(
        bank: Arc<BankClient>,
        db: DbPool,
        entities: Arc<EntityMap>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bank,
            db,
            entities,
            clock,
        }
    }

    /// Sync every configured entity. Failures are isolated per entity.
    pub async fn sync_all(&self) -> Vec<(String, Result<SyncOutcome, ReconError>)> {
        let mut results = Vec::new();
        for entity in self.entities.entities() {
            let result = self.sync_entity(entity).await;
            if let Err(e) = &result {
                tracing::error!(entity = %entity.display_name, error = %e, "entity sync failed");
            }
            results.push((entity.display_name.clone(), result));
        }
        results
    }

    pub async fn sync_entity(&self, entity: &Entity) -> Result<SyncOutcome, ReconError> {
        let balances = self.bank.list_balances(entity.profile_id).await?;
        let mut outcome = SyncOutcome::default();

        for balance in balances {
            let one = self.sync_balance(entity, &balance).await?;
            outcome.synced += one.synced;
            outcome.quarantined += one.quarantined;
            outcome.skipped += one.skipped;
        }

        tracing::info!(
            entity = %entity.display_name,
            synced = outcome.synced,
            quarantined = outcome.quarantined,
            "entity sync complete"
        );
        Ok(outcome)
    }

    async fn sync_balance(
        &self,
        entity: &Entity,
        balance: &WireBalance,
    ) -> Result<SyncOutcome, ReconError> {
        let Some(cursor) = tally_storage::claim_cursor(
            &self.db,
            entity.profile_id,
            &balance.currency,
            &entity.display_name,
            balance.id,
        )
        .await?
        else {
            tracing::debug!(
                profile = entity.profile_id,
                currency = %balance.currency,
                "cursor already syncing, skipping"
            );
            return Ok(SyncOutcome {
                skipped: 1,
                ..SyncOutcome::default()
            });
        };

        let now = self.clock.now();
        let (start, end) = plan_window(cursor.last_end_date, now);

        match self.fetch_window(entity, balance, start, end).await {
            Ok((transactions, quarantined)) => {
                let synced = transactions.len() as i64;
                tally_storage::upsert_transactions(&self.db, &transactions, now).await?;
                tally_storage::complete_cursor(
                    &self.db,
                    entity.profile_id,
                    &balance.currency,
                    end,
                    synced,
                    now,
                )
                .await?;
                tracing::info!(
                    profile = entity.profile_id,
                    currency = %balance.currency,
                    synced,
                    quarantined,
                    "balance sync complete"
                );
                Ok(SyncOutcome {
                    synced,
                    quarantined,
                    skipped: 0,
                })
            }
            Err(e) => {
                // The watermark stays put so the next run retries the same
                // window.
                tally_storage::fail_cursor(
                    &self.db,
                    entity.profile_id,
                    &balance.currency,
                    &e.to_string(),
                )
                .await?;
                Err(e)
            }
        }
    }

    /// Fetch `[start, end]`, splitting into provider-sized chunks when the
    /// window has grown past the statement limit. Lines that fail
    /// validation are quarantined, not fatal.
    async fn fetch_window(
        &self,
        entity: &Entity,
        balance: &WireBalance,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Vec<BankTransaction>, usize), ReconError> {
        let mut transactions = Vec::new();
        let mut quarantined = 0;

        for (chunk_start, chunk_end) in window_chunks(start, end) {
            let statement = self
                .bank
                .get_statement(
                    entity.profile_id,
                    balance.id,
                    &balance.currency,
                    chunk_start,
                    chunk_end,
                )
                .await?;

            for wire in statement.transactions {
                match wire.into_domain(&balance.currency, &entity.display_name, entity.profile_id)
                {
                    Ok(tx) => transactions.push(tx),
                    Err(e) => {
                        tracing::warn!(
                            profile = entity.profile_id,
                            currency = %balance.currency,
                            error = %e,
                            "quarantining unparseable statement line"
                        );
                        quarantined += 1;
                    }
                }
            }
        }

        Ok((transactions, quarantined))
    }
}

/// Incremental window: overlap behind the watermark, or the initial
/// lookback on first sync.
pub fn plan_window(
    last_end_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = match last_end_date {
        Some(watermark) => watermark - Duration::days(OVERLAP_DAYS),
        None => now - Duration::days(INITIAL_LOOKBACK_DAYS),
    };
    (start.min(now), now)
}

/// Split a window into chunks the statement endpoint accepts.
pub fn window_chunks(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut chunks = Vec::new();
    let mut chunk_start = start;
    while chunk_start < end {
        let chunk_end = (chunk_start + Duration::days(MAX_STATEMENT_DAYS)).min(end);
        chunks.push((chunk_start, chunk_end));
        chunk_start = chunk_end;
    }
    if chunks.is_empty() {
        chunks.push((start, end));
    }
    chunks
}
