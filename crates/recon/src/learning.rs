use rust_decimal::Decimal;
use std::sync::Arc;

use tally_approval::{
    ApprovalApi, EnrichmentData, EnrichmentPayload, NewPattern, SuggestionRecord,
};
use tally_core::{BankTransaction, Clock, EntityMap, Pattern, PatternKind, TargetKind};
use tally_match::{text, Embedder, PatternIndex};
use tally_storage::DbPool;

use crate::ReconError;

/// A new pattern enters the pool with the minimum boost and no
/// auto-approve rights; it has to earn both.
const INITIAL_BOOST: Decimal = Decimal::from_parts(10, 0, 0, false, 2); // 0.10
const BOOST_STEP: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05
const BOOST_CAP: Decimal = Decimal::from_parts(25, 0, 0, false, 2); // 0.25

/// Explicit correspondences carry more weight than a fresh embedding
/// pattern: a counterparty name is a strong signal, a structured reference
/// format stronger still.
const COUNTERPARTY_BOOST: Decimal = Decimal::from_parts(15, 0, 0, false, 2); // 0.15
const REFERENCE_BOOST: Decimal = Decimal::from_parts(20, 0, 0, false, 2); // 0.20

/// Counterparty names shorter than this are too ambiguous to reuse.
const MIN_COUNTERPARTY_LEN: usize = 3;

/// Similarity above which an approval reinforces an existing pattern
/// instead of creating a near-duplicate.
const DEDUP_SIMILARITY: f32 = 0.95;

const PROMOTE_MIN_APPROVALS: i64 = 10;
const PROMOTE_MAX_REJECTION_RATE: f64 = 0.05;
const DEACTIVATE_REJECTIONS: i64 = 3;

#[derive(Debug, Default, Clone)]
pub struct LearningOutcome {
    pub processed: usize,
    pub patterns_created: usize,
    pub patterns_reinforced: usize,
    pub patterns_promoted: usize,
    pub patterns_deactivated: usize,
    pub rejections: usize,
}

/// Turns reviewed suggestions into reusable patterns, without letting the
/// loop poison its own training signal: each review event is consumed
/// exactly once, rejections walk back approval credit, and a pattern that
/// keeps getting rejected is pulled from the search set entirely.
pub struct LearningLoop {
    db: DbPool,
    approval: Arc<dyn ApprovalApi>,
    index: Arc<PatternIndex>,
    embedder: Arc<dyn Embedder>,
    entities: Arc<EntityMap>,
    clock: Arc<dyn Clock>,
}

impl LearningLoop {
    pub fn new(
        db: DbPool,
        approval: Arc<dyn ApprovalApi>,
        index: Arc<PatternIndex>,
        embedder: Arc<dyn Embedder>,
        entities: Arc<EntityMap>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            approval,
            index,
            embedder,
            entities,
            clock,
        }
    }

    /// One poll cycle: fetch reviews since the cursor, fold each fresh one
    /// into the pattern pool, advance the cursor to the newest review seen.
    ///
    /// When the service reports several reviews of the same suggestion the
    /// latest `reviewed_at` wins; earlier events were already consumed
    /// under their own keys.
    pub async fn poll_once(&self) -> Result<LearningOutcome, ReconError> {
        let cursor = tally_storage::get_poll_cursor(&self.db).await?;
        let reviewed = self.approval.reviewed_since(cursor.as_deref()).await?;

        let mut outcome = LearningOutcome::default();
        let mut newest = cursor;

        for record in reviewed {
            let Some(reviewed_at) = record.reviewed_at.clone() else {
                continue;
            };

            let fresh =
                tally_storage::mark_review_processed(&self.db, &record.id, &reviewed_at).await?;
            if !fresh {
                continue;
            }
            outcome.processed += 1;

            if record.is_approved() {
                self.handle_approval(&record, &mut outcome).await?;
            } else if record.is_rejected() {
                self.handle_rejection(&record, &mut outcome).await?;
            }

            if newest.as_deref() < Some(reviewed_at.as_str()) {
                newest = Some(reviewed_at);
            }
        }

        if let Some(newest) = &newest {
            tally_storage::set_poll_cursor(&self.db, newest).await?;
        }
        tracing::info!(
            processed = outcome.processed,
            created = outcome.patterns_created,
            reinforced = outcome.patterns_reinforced,
            deactivated = outcome.patterns_deactivated,
            "learning poll complete"
        );
        Ok(outcome)
    }

    async fn handle_approval(
        &self,
        record: &SuggestionRecord,
        outcome: &mut LearningOutcome,
    ) -> Result<(), ReconError> {
        let Some(tx) =
            tally_storage::get_transaction(&self.db, &record.wise_transaction_id).await?
        else {
            tracing::warn!(
                suggestion = %record.id,
                tx = %record.wise_transaction_id,
                "approved suggestion references unknown transaction"
            );
            return Ok(());
        };

        tally_storage::mark_matched(&self.db, &tx.reference, self.clock.now()).await?;
        self.deliver_enrichment(record, &tx).await;

        let target_id = record
            .suggested_account_id
            .map(|id| id.to_string())
            .or_else(|| record.netsuite_transaction_id.clone());
        let Some(target_id) = target_id else {
            return Ok(());
        };
        let target_name = record.suggested_account_name.clone().unwrap_or_default();

        // Counterparty names and structured references become standalone
        // patterns usable by the exact tier; they need no embedding.
        self.learn_explicit_patterns(&tx, &target_id, &target_name, outcome)
            .await?;

        let embed_text = text::embedding_text(&tx);
        if embed_text.is_empty() {
            return Ok(());
        }
        let vector = match self.embedder.embed(&embed_text).await {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!(tx = %tx.reference, error = %e, "embedding failed, skipping pattern");
                return Ok(());
            }
        };

        // Near-duplicate of an existing pattern with the same target:
        // reinforce instead of multiplying entries.
        if let Some(hit) = self
            .index
            .nearest(&vector, 1)
            .into_iter()
            .find(|hit| hit.similarity >= DEDUP_SIMILARITY)
        {
            if let Some(existing) = tally_storage::get_pattern(&self.db, &hit.pattern_id).await? {
                if existing.target_id == target_id {
                    tally_storage::record_approval(&self.db, &existing.id).await?;
                    outcome.patterns_reinforced += 1;
                    self.maybe_promote(&existing.id, outcome).await?;
                    return Ok(());
                }
            }
        }

        let pattern = Pattern {
            id: format!("pat-{}", tx.reference.to_lowercase()),
            kind: PatternKind::Description,
            value: embed_text,
            regex: None,
            target_kind: TargetKind::Account,
            target_id,
            target_name,
            auto_approve: false,
            boost: INITIAL_BOOST,
            times_used: 1,
            times_approved: 1,
            times_rejected: 0,
            active: true,
        };

        let stored_id = tally_storage::upsert_pattern(&self.db, &pattern, &vector).await?;
        if stored_id == pattern.id {
            outcome.patterns_created += 1;
            self.index.insert(&stored_id, pattern.boost, vector);
            self.publish_pattern(&tx, &pattern).await;
        } else {
            // The uniqueness tuple already existed; the upsert bumped its
            // usage counters.
            outcome.patterns_reinforced += 1;
            self.maybe_promote(&stored_id, outcome).await?;
        }
        Ok(())
    }

    /// Store and publish the explicit patterns derivable from an approved
    /// transaction. Re-learning a known correspondence bumps its usage via
    /// the uniqueness tuple instead of adding a row.
    async fn learn_explicit_patterns(
        &self,
        tx: &BankTransaction,
        target_id: &str,
        target_name: &str,
        outcome: &mut LearningOutcome,
    ) -> Result<(), ReconError> {
        for pattern in extract_explicit_patterns(tx, target_id, target_name) {
            let stored_id = tally_storage::upsert_pattern(&self.db, &pattern, &[]).await?;
            if stored_id == pattern.id {
                outcome.patterns_created += 1;
                self.publish_pattern(tx, &pattern).await;
            } else {
                outcome.patterns_reinforced += 1;
                self.maybe_promote(&stored_id, outcome).await?;
            }
        }
        Ok(())
    }

    async fn handle_rejection(
        &self,
        record: &SuggestionRecord,
        outcome: &mut LearningOutcome,
    ) -> Result<(), ReconError> {
        outcome.rejections += 1;

        if let Some(tx) =
            tally_storage::get_transaction(&self.db, &record.wise_transaction_id).await?
        {
            tally_storage::mark_unmatched(
                &self.db,
                &tx.reference,
                "suggestion rejected by reviewer",
                self.clock.now(),
            )
            .await?;

            // Charge the rejection to the pattern that most resembles the
            // transaction, if any is close enough to have boosted it.
            let embed_text = text::embedding_text(&tx);
            if !embed_text.is_empty() {
                if let Ok(vector) = self.embedder.embed(&embed_text).await {
                    if let Some(hit) = self
                        .index
                        .nearest(&vector, 1)
                        .into_iter()
                        .find(|hit| hit.similarity >= DEDUP_SIMILARITY)
                    {
                        tally_storage::record_rejection(&self.db, &hit.pattern_id).await?;
                        self.maybe_deactivate(&hit.pattern_id, outcome).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn maybe_promote(
        &self,
        pattern_id: &str,
        outcome: &mut LearningOutcome,
    ) -> Result<(), ReconError> {
        let Some(pattern) = tally_storage::get_pattern(&self.db, pattern_id).await? else {
            return Ok(());
        };
        if pattern.times_approved < PROMOTE_MIN_APPROVALS
            || pattern.rejection_rate() >= PROMOTE_MAX_REJECTION_RATE
        {
            return Ok(());
        }

        let boost = (pattern.boost + BOOST_STEP).min(BOOST_CAP);
        let auto_approve = pattern.times_rejected == 0;
        if boost != pattern.boost || auto_approve != pattern.auto_approve {
            tally_storage::set_boost(&self.db, pattern_id, boost, auto_approve).await?;
            self.index.set_boost(pattern_id, boost);
            outcome.patterns_promoted += 1;
            tracing::info!(pattern = pattern_id, %boost, auto_approve, "pattern promoted");
        }
        Ok(())
    }

    async fn maybe_deactivate(
        &self,
        pattern_id: &str,
        outcome: &mut LearningOutcome,
    ) -> Result<(), ReconError> {
        let Some(pattern) = tally_storage::get_pattern(&self.db, pattern_id).await? else {
            return Ok(());
        };
        if pattern.times_rejected >= DEACTIVATE_REJECTIONS {
            tally_storage::deactivate_pattern(&self.db, pattern_id).await?;
            self.index.remove(pattern_id);
            outcome.patterns_deactivated += 1;
            tracing::info!(pattern = pattern_id, "pattern deactivated after repeated rejections");
        }
        Ok(())
    }

    /// Enrichment for the accounting side of a confirmed match. Best
    /// effort: a failure is logged and the review stays consumed.
    async fn deliver_enrichment(&self, record: &SuggestionRecord, tx: &BankTransaction) {
        let Some(netsuite_id) = record.netsuite_transaction_id.clone() else {
            return;
        };

        let detection = tally_match::classify(tx, &self.entities);
        let payload = EnrichmentPayload {
            netsuite_transaction_id: netsuite_id,
            wise_transaction_id: tx.reference.clone(),
            enrichment_data: EnrichmentData {
                counterparty_name: tx.counterparty_name.clone(),
                counterparty_iban: tx.counterparty_account.clone(),
                payment_reference: tx.payment_reference.clone(),
                fx_rate: tx.fx.as_ref().map(|fx| fx.rate),
                from_amount: tx.fx.as_ref().map(|fx| fx.from_amount),
                from_currency: tx.fx.as_ref().map(|fx| fx.from_currency.clone()),
                fees: tx.fees,
                is_intercompany: Some(detection.is_intercompany),
                ic_entity: detection.counterparty_entity,
                merchant_name: tx.card.as_ref().and_then(|c| c.merchant.clone()),
                card_last4: tx.card.as_ref().and_then(|c| c.last4.clone()),
            },
        };

        if let Err(e) = self.approval.enrich(&payload).await {
            tracing::warn!(tx = %tx.reference, error = %e, "enrichment delivery failed");
        }
    }

    async fn publish_pattern(&self, tx: &BankTransaction, pattern: &Pattern) {
        let new_pattern = NewPattern {
            pattern_type: pattern.kind.as_str().to_string(),
            pattern_value: pattern.value.clone(),
            is_regex: pattern.regex.is_some(),
            target_type: pattern.target_kind.as_str().to_string(),
            target_netsuite_id: pattern.target_id.clone(),
            target_name: pattern.target_name.clone(),
            description: Some(format!("learned from {}", tx.reference)),
        };
        if let Err(e) = self.approval.create_pattern(&new_pattern).await {
            tracing::warn!(tx = %tx.reference, error = %e, "pattern publish failed");
        }
    }
}

/// Explicit, reusable correspondences carried by an approved transaction:
/// the counterparty name, the card merchant, and any recognizable
/// reference format.
fn extract_explicit_patterns(
    tx: &BankTransaction,
    target_id: &str,
    target_name: &str,
) -> Vec<Pattern> {
    let mut patterns = Vec::new();

    let explicit = |suffix: &str, kind: PatternKind, value: &str, regex: Option<String>, boost| {
        Pattern {
            id: format!("pat-{suffix}-{}", tx.reference.to_lowercase()),
            kind,
            value: value.to_string(),
            regex,
            target_kind: TargetKind::Account,
            target_id: target_id.to_string(),
            target_name: target_name.to_string(),
            auto_approve: false,
            boost,
            times_used: 1,
            times_approved: 1,
            times_rejected: 0,
            active: true,
        }
    };

    if let Some(name) = tx.counterparty_name.as_deref() {
        let name = name.trim();
        if name.len() >= MIN_COUNTERPARTY_LEN {
            patterns.push(explicit(
                "counterparty",
                PatternKind::Counterparty,
                name,
                None,
                COUNTERPARTY_BOOST,
            ));
        }
    }

    if let Some(reference) = tx.payment_reference.as_deref() {
        if let Some(regex) = reference_regex(reference) {
            patterns.push(explicit(
                "reference",
                PatternKind::Reference,
                &regex,
                Some(regex.clone()),
                REFERENCE_BOOST,
            ));
        }
    }

    if let Some(merchant) = tx.card.as_ref().and_then(|c| c.merchant.as_deref()) {
        let merchant = merchant.trim();
        if merchant.len() >= MIN_COUNTERPARTY_LEN {
            patterns.push(explicit(
                "merchant",
                PatternKind::Counterparty,
                merchant,
                None,
                COUNTERPARTY_BOOST,
            ));
        }
    }

    patterns
}

/// Structured reference formats generalize into a regex; free text does
/// not produce a pattern.
fn reference_regex(reference: &str) -> Option<String> {
    const FORMATS: &[(&str, &str)] = &[
        (r"(?i)INV[-/]\d{4}[-/]\d+", r"INV[-/]\d{4}[-/]\d+"),
        (r"(?i)PO[-/]\d{4}[-/]\d+", r"PO[-/]\d{4}[-/]\d+"),
        (r"(?i)Invoice\s*#?\s*\d+", r"Invoice\s*#?\s*\d+"),
        (r"(?i)Bill\s*#?\s*\d+", r"Bill\s*#?\s*\d+"),
    ];

    for (probe, output) in FORMATS {
        let matched = regex::Regex::new(probe)
            .map(|re| re.is_match(reference))
            .unwrap_or(false);
        if matched {
            return Some((*output).to_string());
        }
    }
    None
}
