use chrono::Duration;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;

use tally_approval::{ApprovalApi, GlFetcher, GlQuery, SlackNotifier, SuggestionPayload};
use tally_core::{BankTransaction, Candidate, Clock, EntityMap, GlEntry, Pattern};
use tally_match::{
    apply_adjustments, classify, match_exact, match_fuzzy, match_llm, policy_for,
    select_candidate, text, Adjustments, Embedder, IcDetection, LlmScorer, PatternIndex, Policy,
};
use tally_storage::DbPool;

use crate::ReconError;

const EARLY_EXIT_SCORE: Decimal = Decimal::from_parts(95, 0, 0, false, 2); // 0.95
const LLM_GATE_SCORE: Decimal = Decimal::from_parts(80, 0, 0, false, 2); // 0.80
const REPEAT_COUNTERPARTY_MIN: i64 = 3;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_tx_per_run: usize,
    pub date_window_days: i64,
    pub fuzzy_similarity_min: f64,
    pub worker_pool: usize,
    pub lease_ttl_secs: u64,
    pub tx_deadline_secs: u64,
    pub batch_deadline_secs: u64,
    pub quarantine_alert_threshold: usize,
    pub large_amount_threshold: Decimal,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tx_per_run: 500,
            date_window_days: 7,
            fuzzy_similarity_min: 0.85,
            worker_pool: 8,
            lease_ttl_secs: 120,
            tx_deadline_secs: 300,
            batch_deadline_secs: 1800,
            quarantine_alert_threshold: 5,
            large_amount_threshold: Decimal::new(5_000_000, 2),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    pub entity: String,
    pub processed: usize,
    pub submitted: usize,
    pub auto_approved: usize,
    pub suggested: usize,
    pub review: usize,
    pub manual: usize,
    pub no_candidates: usize,
    pub lease_skipped: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub quarantined: usize,
    pub errors: Vec<String>,
}

enum TxOutcome {
    Submitted { policy: Policy, had_candidate: bool },
    LeaseHeld,
    Conflict,
    Quarantined(String),
    Failed(String),
    DeadlineSkipped,
}

/// Runs the per-entity matching batch: select pending transactions, pull
/// GL candidates, cascade the tiers, score, pick one candidate and submit.
///
/// One batch per entity may be in flight at a time; transactions within a
/// batch are scored concurrently under the worker pool, each behind a
/// short-TTL lease.
pub struct Orchestrator {
    db: DbPool,
    gl: Arc<GlFetcher>,
    approval: Arc<dyn ApprovalApi>,
    index: Arc<PatternIndex>,
    embedder: Arc<dyn Embedder>,
    llm: Option<Arc<dyn LlmScorer>>,
    entities: Arc<EntityMap>,
    slack: Arc<SlackNotifier>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    in_flight: Mutex<HashSet<String>>,
    worker_id: String,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DbPool,
        gl: Arc<GlFetcher>,
        approval: Arc<dyn ApprovalApi>,
        index: Arc<PatternIndex>,
        embedder: Arc<dyn Embedder>,
        llm: Option<Arc<dyn LlmScorer>>,
        entities: Arc<EntityMap>,
        slack: Arc<SlackNotifier>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            gl,
            approval,
            index,
            embedder,
            llm,
            entities,
            slack,
            clock,
            config,
            in_flight: Mutex::new(HashSet::new()),
            worker_id: format!("tally-{}", std::process::id()),
        }
    }

    /// Run batches for every entity that has pending work.
    pub async fn run_all(&self) -> Vec<BatchSummary> {
        let entities = match tally_storage::entities_with_pending(&self.db).await {
            Ok(entities) => entities,
            Err(e) => {
                tracing::error!(error = %e, "failed to list entities with pending work");
                return Vec::new();
            }
        };

        let mut summaries = Vec::new();
        for entity in entities {
            match self.run_entity_batch(&entity).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => tracing::error!(entity = %entity, error = %e, "batch failed"),
            }
        }
        summaries
    }

    pub async fn run_entity_batch(&self, entity: &str) -> Result<BatchSummary, ReconError> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(entity.to_string()) {
                return Err(ReconError::BatchInFlight(entity.to_string()));
            }
        }

        let result = self.run_entity_inner(entity).await;
        self.in_flight.lock().await.remove(entity);

        if let Ok(summary) = &result {
            self.notify(summary).await;
        }
        result
    }

    async fn run_entity_inner(&self, entity: &str) -> Result<BatchSummary, ReconError> {
        let batch_start = self.clock.now();
        let deadline = batch_start + Duration::seconds(self.config.batch_deadline_secs as i64);

        let pending = tally_storage::pending_for_entity(
            &self.db,
            entity,
            self.config.max_tx_per_run as i64,
        )
        .await?;

        let mut summary = BatchSummary {
            entity: entity.to_string(),
            processed: pending.len(),
            ..BatchSummary::default()
        };
        if pending.is_empty() {
            return Ok(summary);
        }

        let patterns = self.load_patterns().await;
        tracing::info!(
            entity,
            pending = pending.len(),
            patterns = patterns.len(),
            "starting batch"
        );

        let outcomes: Vec<(String, Decimal, TxOutcome)> = stream::iter(pending)
            .map(|tx| {
                let patterns = &patterns;
                async move {
                    let reference = tx.reference.clone();
                    let amount = tx.amount.abs();
                    if self.clock.now() > deadline {
                        return (reference, amount, TxOutcome::DeadlineSkipped);
                    }

                    let outcome = match tokio::time::timeout(
                        StdDuration::from_secs(self.config.tx_deadline_secs),
                        self.process_transaction(tx, patterns),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            // Deadline hit mid-flight: undo any submitted
                            // state and free the lease for the next run.
                            let now = self.clock.now();
                            let _ =
                                tally_storage::revert_to_pending(&self.db, &reference, now).await;
                            let _ = tally_storage::release_lease(
                                &self.db,
                                &reference,
                                &self.worker_id,
                            )
                            .await;
                            TxOutcome::Failed("transaction deadline exceeded".into())
                        }
                    };
                    (reference, amount, outcome)
                }
            })
            .buffer_unordered(self.config.worker_pool.max(1))
            .collect()
            .await;

        for (reference, amount, outcome) in outcomes {
            match outcome {
                TxOutcome::Submitted {
                    policy,
                    had_candidate,
                } => {
                    summary.submitted += 1;
                    match policy {
                        Policy::AutoApprove => summary.auto_approved += 1,
                        Policy::Suggest => summary.suggested += 1,
                        Policy::Review => summary.review += 1,
                        Policy::Manual => summary.manual += 1,
                    }
                    if !had_candidate {
                        summary.no_candidates += 1;
                        if amount >= self.config.large_amount_threshold {
                            self.slack
                                .discrepancy_alert(
                                    &summary.entity,
                                    &format!("unmatched transaction {reference} of {amount}"),
                                )
                                .await;
                        }
                    }
                }
                TxOutcome::LeaseHeld => summary.lease_skipped += 1,
                TxOutcome::Conflict => summary.conflicts += 1,
                TxOutcome::Quarantined(reason) => {
                    summary.quarantined += 1;
                    summary.errors.push(format!("{reference}: {reason}"));
                }
                TxOutcome::Failed(reason) => {
                    summary.failed += 1;
                    summary.errors.push(format!("{reference}: {reason}"));
                }
                TxOutcome::DeadlineSkipped => {
                    summary.failed += 1;
                    summary.errors.push(format!("{reference}: batch deadline"));
                }
            }
        }

        tracing::info!(
            entity,
            submitted = summary.submitted,
            auto_approved = summary.auto_approved,
            failed = summary.failed,
            "batch complete"
        );
        Ok(summary)
    }

    /// Patterns come from the approval service; the local store is the
    /// fallback when it is unreachable.
    async fn load_patterns(&self) -> Vec<Pattern> {
        match self.approval.list_patterns(true).await {
            Ok(patterns) => patterns,
            Err(e) => {
                tracing::warn!(error = %e, "pattern fetch failed, using local store");
                match tally_storage::load_active_patterns(&self.db).await {
                    Ok(stored) => stored.into_iter().map(|(p, _)| p).collect(),
                    Err(e) => {
                        tracing::error!(error = %e, "local pattern load failed");
                        Vec::new()
                    }
                }
            }
        }
    }

    async fn process_transaction(
        &self,
        tx: BankTransaction,
        patterns: &[Pattern],
    ) -> TxOutcome {
        let now = self.clock.now();
        let lease_ttl = Duration::seconds(self.config.lease_ttl_secs as i64);

        match tally_storage::acquire_lease(&self.db, &tx.reference, &self.worker_id, lease_ttl, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => return TxOutcome::LeaseHeld,
            Err(e) => return TxOutcome::Failed(e.to_string()),
        }

        let outcome = self.score_and_submit(&tx, patterns).await;
        let _ = tally_storage::release_lease(&self.db, &tx.reference, &self.worker_id).await;
        outcome
    }

    async fn score_and_submit(&self, tx: &BankTransaction, patterns: &[Pattern]) -> TxOutcome {
        // Re-read under the lease: another worker may have finished this
        // transaction between selection and lease acquisition.
        let current = match tally_storage::get_transaction(&self.db, &tx.reference).await {
            Ok(Some(current)) => current,
            Ok(None) => return TxOutcome::Conflict,
            Err(e) => return TxOutcome::Failed(e.to_string()),
        };
        if current.status != tally_core::MatchStatus::Pending {
            return TxOutcome::Conflict;
        }
        let expected_attempts = current.attempts;

        let Some(entity) = self.entities.by_profile(tx.profile_id) else {
            let reason = format!("no entity configured for profile {}", tx.profile_id);
            let now = self.clock.now();
            let _ = tally_storage::mark_unmatched(&self.db, &tx.reference, &reason, now).await;
            return TxOutcome::Quarantined(reason);
        };

        let window = Duration::days(self.config.date_window_days);
        let query = GlQuery {
            subsidiary_id: entity.subsidiary_id,
            start: tx.occurred_at - window,
            end: tx.occurred_at + window,
            account_types: Vec::new(),
            unreconciled_only: true,
        };
        let gl_entries = match self.gl.get_gl_entries(&query).await {
            Ok(entries) => entries,
            Err(e) => return TxOutcome::Failed(format!("gl fetch: {e}")),
        };

        let (candidates, detection) = self.run_tiers(tx, &gl_entries, patterns).await;
        self.submit(tx, candidates, &detection, expected_attempts).await
    }

    /// The four-tier cascade. Tiers add candidates in order; scoring
    /// adjustments are applied as each tier lands so the early-exit check
    /// sees final scores.
    async fn run_tiers(
        &self,
        tx: &BankTransaction,
        gl_entries: &[GlEntry],
        patterns: &[Pattern],
    ) -> (Vec<Candidate>, IcDetection) {
        let detection = classify(tx, &self.entities);
        let context = self.tx_adjustments(tx, &detection).await;

        let mut candidates = Vec::new();
        let mut best_base = Decimal::ZERO;

        let tier1 = match_exact(tx, gl_entries, &self.entities, patterns);
        best_base = best_base.max(max_score(&tier1));
        self.finalize_tier(tx, tier1, &context, &mut candidates);

        if max_score(&candidates) < EARLY_EXIT_SCORE {
            let tier2 = match_fuzzy(tx, gl_entries, &candidates, self.config.fuzzy_similarity_min);
            best_base = best_base.max(max_score(&tier2));
            self.finalize_tier(tx, tier2, &context, &mut candidates);
        }

        if max_score(&candidates) < EARLY_EXIT_SCORE
            && best_base < LLM_GATE_SCORE
            && !gl_entries.is_empty()
        {
            if let Some(scorer) = &self.llm {
                match match_llm(tx, gl_entries, scorer.as_ref()).await {
                    Ok(Some(candidate)) => {
                        self.finalize_tier(tx, vec![candidate], &context, &mut candidates);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // A bad model response is never fatal for the batch.
                        tracing::warn!(tx = %tx.reference, error = %e, "llm tier skipped");
                    }
                }
            }
        }

        tally_match::intercompany::annotate(&mut candidates, &detection);
        (candidates, detection)
    }

    fn finalize_tier(
        &self,
        tx: &BankTransaction,
        tier: Vec<Candidate>,
        context: &TxContext,
        out: &mut Vec<Candidate>,
    ) {
        for mut candidate in tier {
            let adjustments = Adjustments {
                intercompany: context.intercompany,
                pattern_boost: context.pattern_boost,
                repeat_counterparty: context.repeat_counterparty,
                fx_variance: context.fx_variance,
                date_drift_days: (tx.occurred_at.date_naive() - candidate.gl_date.date_naive())
                    .num_days(),
            };
            let (score, reasons) = apply_adjustments(candidate.score, &adjustments);
            candidate.score = score;
            candidate.reasons.extend(reasons);
            out.push(candidate);
        }
    }

    /// Transaction-level adjustment context, computed once per transaction.
    async fn tx_adjustments(&self, tx: &BankTransaction, detection: &IcDetection) -> TxContext {
        let pattern_boost = match self.embedder.embed(&text::embedding_text(tx)).await {
            Ok(vector) => self.index.boost_for(&vector).map(|hit| hit.boost),
            Err(e) => {
                tracing::warn!(tx = %tx.reference, error = %e, "pattern boost lookup failed");
                None
            }
        };

        let repeat_counterparty = match tx.counterparty_name.as_deref() {
            Some(name) => tally_storage::counterparty_approvals(&self.db, name)
                .await
                .map(|n| n >= REPEAT_COUNTERPARTY_MIN)
                .unwrap_or(false),
            None => false,
        };

        TxContext {
            intercompany: detection.is_intercompany,
            pattern_boost,
            repeat_counterparty,
            fx_variance: fx_variance(tx),
        }
    }

    async fn submit(
        &self,
        tx: &BankTransaction,
        mut candidates: Vec<Candidate>,
        detection: &IcDetection,
        expected_attempts: i64,
    ) -> TxOutcome {
        let selected =
            select_candidate(&mut candidates, tx.comparable_amount(), tx.occurred_at)
                .map(|i| candidates[i].clone());
        let confidence = selected
            .as_ref()
            .map(|c| c.score)
            .unwrap_or(Decimal::ZERO);
        let policy = policy_for(confidence);

        let now = self.clock.now();
        match tally_storage::mark_submitted(&self.db, &tx.reference, confidence, expected_attempts, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(tx = %tx.reference, "stale scoring attempt dropped");
                return TxOutcome::Conflict;
            }
            Err(e) => return TxOutcome::Failed(e.to_string()),
        }

        let payload = build_suggestion(tx, selected.as_ref(), detection, policy);
        match self.approval.submit_suggestion(&payload).await {
            Ok(ack) => {
                if let Err(e) =
                    tally_storage::record_suggestion_id(&self.db, &tx.reference, &ack.id).await
                {
                    tracing::error!(tx = %tx.reference, error = %e, "failed to record suggestion id");
                }
                TxOutcome::Submitted {
                    policy,
                    had_candidate: selected.is_some(),
                }
            }
            Err(e) => {
                let _ = tally_storage::revert_to_pending(&self.db, &tx.reference, self.clock.now())
                    .await;
                TxOutcome::Failed(format!("emit: {e}"))
            }
        }
    }

    async fn notify(&self, summary: &BatchSummary) {
        self.slack
            .batch_summary(
                &summary.entity,
                summary.processed,
                summary.submitted,
                summary.auto_approved,
                summary.no_candidates,
                summary.quarantined,
            )
            .await;
        if summary.quarantined > self.config.quarantine_alert_threshold {
            self.slack
                .discrepancy_alert(
                    &summary.entity,
                    &format!(
                        "{} records quarantined (threshold {})",
                        summary.quarantined, self.config.quarantine_alert_threshold
                    ),
                )
                .await;
        }
    }
}

struct TxContext {
    intercompany: bool,
    pattern_boost: Option<Decimal>,
    repeat_counterparty: bool,
    fx_variance: Option<Decimal>,
}

fn max_score(candidates: &[Candidate]) -> Decimal {
    candidates
        .iter()
        .map(|c| c.score)
        .max()
        .unwrap_or(Decimal::ZERO)
}

/// Relative gap between the rate the bank applied and the rate implied by
/// the two legs of the conversion.
fn fx_variance(tx: &BankTransaction) -> Option<Decimal> {
    let fx = tx.fx.as_ref()?;
    if fx.from_amount.is_zero() || fx.rate.is_zero() {
        return None;
    }
    let implied = (tx.amount.abs() / fx.from_amount.abs()).round_dp(8);
    Some(((fx.rate - implied).abs() / implied).round_dp(4))
}

fn build_suggestion(
    tx: &BankTransaction,
    selected: Option<&Candidate>,
    detection: &IcDetection,
    policy: Policy,
) -> SuggestionPayload {
    SuggestionPayload {
        wise_transaction_id: tx.reference.clone(),
        wise_profile_id: tx.profile_id,
        entity_name: tx.entity.clone(),
        transaction_date: tx.occurred_at.date_naive().to_string(),
        amount: tx.amount,
        currency: tx.currency.clone(),
        transaction_type: tx.kind.as_str().to_string(),
        match_type: selected
            .map(|c| c.tier.as_str().to_string())
            .unwrap_or_else(|| "unmatched".to_string()),
        confidence_score: selected.map(|c| c.score).unwrap_or(Decimal::ZERO),
        recommended_action: policy.as_str().to_string(),
        description: tx.description.clone(),
        counterparty: tx.counterparty_name.clone(),
        match_reasons: selected
            .map(|c| c.reasons.clone())
            .unwrap_or_else(|| vec!["no-candidate".to_string()]),
        netsuite_transaction_id: selected.map(|c| c.gl_tx_id.clone()),
        netsuite_line_id: selected.map(|c| c.gl_line_id),
        netsuite_type: selected.map(|c| c.gl_type.clone()),
        suggested_account_id: selected.map(|c| c.gl_account_id),
        suggested_account_name: selected.map(|c| c.gl_account_name.clone()),
        is_intercompany: detection.is_intercompany,
        counterparty_entity: detection.counterparty_entity.clone(),
        llm_model: selected.and_then(|c| c.llm_model.clone()),
        llm_prompt_version: selected.and_then(|c| c.llm_prompt_version.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fx_variance_measures_rate_gap() {
        use tally_core::FxDetails;
        let mut tx = crate::testutil::transaction(|t| {
            t.amount = Decimal::new(102_000, 2); // 1020.00 USD
            t.currency = "USD".into();
        });
        tx.fx = Some(FxDetails {
            from_amount: Decimal::new(100_000, 2), // 1000.00 EUR
            from_currency: "EUR".into(),
            rate: Decimal::new(102, 2), // matches implied exactly
        });
        assert_eq!(fx_variance(&tx), Some(Decimal::ZERO));

        // Rate off by ~2.9% from the implied 1.02.
        tx.fx.as_mut().unwrap().rate = Decimal::new(105, 2);
        let variance = fx_variance(&tx).unwrap();
        assert!(variance > Decimal::new(200, 4));

        tx.fx = None;
        assert_eq!(fx_variance(&tx), None);
    }

    #[test]
    fn unmatched_suggestion_carries_no_gl_link() {
        let tx = crate::testutil::transaction(|_| {});
        let detection = IcDetection::default();
        let payload = build_suggestion(&tx, None, &detection, Policy::Manual);
        assert_eq!(payload.match_type, "unmatched");
        assert_eq!(payload.confidence_score, Decimal::ZERO);
        assert!(payload.netsuite_transaction_id.is_none());
        assert_eq!(payload.match_reasons, vec!["no-candidate".to_string()]);
    }
}
