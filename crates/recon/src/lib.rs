pub mod learning;
pub mod orchestrator;
pub mod scheduler;
pub mod sync;

use thiserror::Error;

pub use learning::{LearningLoop, LearningOutcome};
pub use orchestrator::{BatchSummary, Orchestrator, OrchestratorConfig};
pub use scheduler::{CronSchedule, Scheduler};
pub use sync::{SyncOutcome, SyncService};

#[derive(Debug, Error)]
pub enum ReconError {
    #[error(transparent)]
    Bank(#[from] tally_bank::BankError),
    #[error(transparent)]
    Approval(#[from] tally_approval::ApprovalError),
    #[error(transparent)]
    Storage(#[from] tally_storage::StorageError),
    #[error(transparent)]
    Match(#[from] tally_match::MatchError),
    #[error("a batch for entity '{0}' is already in flight")]
    BatchInFlight(String),
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
}

#[cfg(test)]
pub(crate) mod testutil {
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tally_approval::{
        ApprovalApi, ApprovalError, BatchAck, BatchPayload, EnrichmentPayload, GlQuery,
        NewPattern, SuggestionAck, SuggestionPayload, SuggestionRecord,
    };
    use tally_core::{
        BankTransaction, Direction, Entity, EntityMap, GlEntry, MatchStatus, Pattern,
        PatternKind, TargetKind, TransactionKind,
    };

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    pub fn transaction(build: impl FnOnce(&mut BankTransaction)) -> BankTransaction {
        let mut tx = BankTransaction {
            reference: "TRANSFER-100".into(),
            entity: "Phygrid Limited".into(),
            profile_id: 19_941_830,
            direction: Direction::Debit,
            kind: TransactionKind::Transfer,
            occurred_at: t0(),
            amount: Decimal::new(123_456, 2),
            currency: "EUR".into(),
            description: None,
            payment_reference: None,
            counterparty_name: None,
            counterparty_account: None,
            fx: None,
            fees: None,
            card: None,
            running_balance: None,
            status: MatchStatus::Pending,
            status_reason: None,
            last_attempt_at: None,
            attempts: 0,
            best_confidence: None,
            suggestion_id: None,
        };
        build(&mut tx);
        tx
    }

    pub fn gl_entry(transaction_id: &str, amount: Decimal, date: DateTime<Utc>) -> GlEntry {
        GlEntry {
            transaction_id: transaction_id.into(),
            line_id: 1,
            transaction_type: "VendBill".into(),
            date,
            amount,
            currency: "EUR".into(),
            account_id: 1100,
            account_name: "Accounts Payable".into(),
            entity_id: 2,
            entity_name: "Phygrid Limited".into(),
            memo: None,
            is_reconciled: false,
        }
    }

    pub fn group_entities() -> EntityMap {
        EntityMap::new(vec![
            Entity {
                key: "phygrid-ltd".into(),
                profile_id: 19_941_830,
                subsidiary_id: 2,
                display_name: "Phygrid Limited".into(),
                jurisdiction: "UK".into(),
                currency: "GBP".into(),
                aliases: vec!["Phygrid Ltd".into()],
                known_ibans: vec![],
            },
            Entity {
                key: "ombori-ag".into(),
                profile_id: 47_253_364,
                subsidiary_id: 7,
                display_name: "Ombori AG".into(),
                jurisdiction: "CH".into(),
                currency: "CHF".into(),
                aliases: vec![],
                known_ibans: vec!["BE82967831096568".into()],
            },
        ])
    }

    /// In-memory approval service double: records everything, can be told
    /// to fail submissions, serves a configurable review feed.
    #[derive(Default)]
    pub struct StubApproval {
        pub submitted: Mutex<Vec<SuggestionPayload>>,
        pub enrichments: Mutex<Vec<EnrichmentPayload>>,
        pub created_patterns: Mutex<Vec<NewPattern>>,
        pub gl_entries: Mutex<Vec<GlEntry>>,
        pub reviewed: Mutex<Vec<SuggestionRecord>>,
        pub patterns: Mutex<Vec<Pattern>>,
        pub fail_submissions: AtomicBool,
        next_id: AtomicUsize,
    }

    #[async_trait]
    impl ApprovalApi for StubApproval {
        async fn submit_suggestion(
            &self,
            suggestion: &SuggestionPayload,
        ) -> Result<SuggestionAck, ApprovalError> {
            if self.fail_submissions.load(Ordering::SeqCst) {
                return Err(ApprovalError::Transient("approval service down".into()));
            }
            // Dedup on the idempotency key, echoing the canonical ack.
            let mut submitted = self.submitted.lock().unwrap();
            if let Some(pos) = submitted
                .iter()
                .position(|s| s.wise_transaction_id == suggestion.wise_transaction_id)
            {
                return Ok(SuggestionAck {
                    id: format!("sugg-{pos}"),
                    status: "pending_review".into(),
                });
            }
            submitted.push(suggestion.clone());
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(SuggestionAck {
                id: format!("sugg-{id}"),
                status: "pending_review".into(),
            })
        }

        async fn submit_batch(&self, batch: &BatchPayload) -> Result<BatchAck, ApprovalError> {
            Ok(BatchAck {
                batch_id: "batch-1".into(),
                count: batch.suggestions.len() as i64,
            })
        }

        async fn get_suggestion(&self, id: &str) -> Result<SuggestionRecord, ApprovalError> {
            self.reviewed
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .ok_or_else(|| ApprovalError::Api {
                    status: 404,
                    body: format!("no suggestion {id}"),
                })
        }

        async fn reviewed_since(
            &self,
            since: Option<&str>,
        ) -> Result<Vec<SuggestionRecord>, ApprovalError> {
            let reviewed = self.reviewed.lock().unwrap();
            Ok(reviewed
                .iter()
                .filter(|r| match (since, r.reviewed_at.as_deref()) {
                    (Some(since), Some(at)) => at >= since,
                    _ => true,
                })
                .cloned()
                .collect())
        }

        async fn get_gl_entries(&self, _query: &GlQuery) -> Result<Vec<GlEntry>, ApprovalError> {
            Ok(self.gl_entries.lock().unwrap().clone())
        }

        async fn list_patterns(&self, _active_only: bool) -> Result<Vec<Pattern>, ApprovalError> {
            Ok(self.patterns.lock().unwrap().clone())
        }

        async fn create_pattern(&self, pattern: &NewPattern) -> Result<String, ApprovalError> {
            let mut created = self.created_patterns.lock().unwrap();
            created.push(pattern.clone());
            let id = format!("remote-pat-{}", created.len());

            // The service starts serving accepted patterns immediately.
            let kind: PatternKind = pattern
                .pattern_type
                .parse()
                .map_err(ApprovalError::Decode)?;
            let target_kind: TargetKind = pattern
                .target_type
                .parse()
                .map_err(ApprovalError::Decode)?;
            self.patterns.lock().unwrap().push(Pattern {
                id: id.clone(),
                kind,
                value: pattern.pattern_value.clone(),
                regex: pattern.is_regex.then(|| pattern.pattern_value.clone()),
                target_kind,
                target_id: pattern.target_netsuite_id.clone(),
                target_name: pattern.target_name.clone(),
                auto_approve: false,
                boost: Decimal::new(10, 2),
                times_used: 1,
                times_approved: 1,
                times_rejected: 0,
                active: true,
            });
            Ok(id)
        }

        async fn enrich(&self, payload: &EnrichmentPayload) -> Result<bool, ApprovalError> {
            self.enrichments.lock().unwrap().push(payload.clone());
            Ok(true)
        }
    }
}
