use rust_decimal::Decimal;
use tally_core::{BankTransaction, Candidate, GlEntry, MatchTier};

use crate::text::{longest_common_alnum_substring, name_similarity};

const SAME_CURRENCY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01
const CROSS_CURRENCY_TOLERANCE: Decimal = Decimal::from_parts(2, 0, 0, false, 2); // 0.02 relative
const MAX_DATE_DIFF_DAYS: i64 = 5;

const STRONG_NAME_SIMILARITY: f64 = 0.95;
const MIN_REFERENCE_LCS: usize = 6;
const STRONG_REFERENCE_LCS: usize = 10;

const SCORE_HIGH: Decimal = Decimal::from_parts(85, 0, 0, false, 2); // 0.85
const SCORE_MEDIUM: Decimal = Decimal::from_parts(75, 0, 0, false, 2); // 0.75

/// Tier 2: tolerant amount and date windows, requiring at least one of
/// counterparty-name similarity, a partial reference match, or an
/// amount-plus-entity hit with no competing same-day same-amount line.
///
/// GL entries already claimed by an earlier tier are skipped: later tiers
/// add candidates, they never replace them.
pub fn match_fuzzy(
    tx: &BankTransaction,
    gl_entries: &[GlEntry],
    existing: &[Candidate],
    similarity_min: f64,
) -> Vec<Candidate> {
    gl_entries
        .iter()
        .filter(|entry| {
            !existing
                .iter()
                .any(|c| c.gl_tx_id == entry.transaction_id && c.gl_line_id == entry.line_id)
        })
        .filter_map(|entry| try_match(tx, entry, gl_entries, similarity_min))
        .collect()
}

fn try_match(
    tx: &BankTransaction,
    entry: &GlEntry,
    window: &[GlEntry],
    similarity_min: f64,
) -> Option<Candidate> {
    let mut reasons = Vec::new();

    let amount_reason = check_amount(tx, entry)?;
    reasons.push(amount_reason);

    let date_diff = (tx.occurred_at.date_naive() - entry.date.date_naive())
        .num_days()
        .abs();
    if date_diff > MAX_DATE_DIFF_DAYS {
        return None;
    }
    reasons.push(format!("date-within-{date_diff}-days"));

    let similarity = best_name_similarity(tx, entry);
    let lcs = tx
        .payment_reference
        .as_deref()
        .map(|r| longest_common_alnum_substring(r, entry.memo.as_deref().unwrap_or("")))
        .unwrap_or(0);

    let signal = if similarity >= similarity_min {
        reasons.push(format!("name-similarity-{}", (similarity * 100.0) as u32));
        true
    } else if lcs >= MIN_REFERENCE_LCS {
        reasons.push("reference-partial-match".to_string());
        true
    } else if amount_entity_unique(entry, window) {
        reasons.push("amount-entity-unique".to_string());
        true
    } else {
        false
    };
    if !signal {
        return None;
    }

    let score = if similarity >= STRONG_NAME_SIMILARITY || lcs >= STRONG_REFERENCE_LCS {
        SCORE_HIGH
    } else {
        SCORE_MEDIUM
    };

    let mut candidate = Candidate::from_gl(&tx.reference, entry, score, MatchTier::Fuzzy);
    candidate.reasons = reasons;
    Some(candidate)
}

/// Same-currency comparisons allow a one-cent rounding gap; cross-currency
/// comparisons use the original-leg amount with a 2% band.
fn check_amount(tx: &BankTransaction, entry: &GlEntry) -> Option<String> {
    let gl_amount = entry.abs_amount();
    if tx.is_cross_currency() {
        if gl_amount.is_zero() {
            return None;
        }
        let variance = (tx.comparable_amount() - gl_amount).abs() / gl_amount;
        if variance <= CROSS_CURRENCY_TOLERANCE {
            return Some(format!(
                "amount-within-{:.2}%",
                variance * Decimal::ONE_HUNDRED
            ));
        }
        return None;
    }

    if (tx.amount.abs() - gl_amount).abs() <= SAME_CURRENCY_TOLERANCE {
        Some("amount-within-tolerance".to_string())
    } else {
        None
    }
}

/// Counterparty name compared against both the GL memo and the GL entity
/// name; the stronger signal wins.
fn best_name_similarity(tx: &BankTransaction, entry: &GlEntry) -> f64 {
    let Some(name) = tx.counterparty_name.as_deref() else {
        return 0.0;
    };
    let memo_sim = entry
        .memo
        .as_deref()
        .map(|m| name_similarity(name, m))
        .unwrap_or(0.0);
    let entity_sim = name_similarity(name, &entry.entity_name);
    memo_sim.max(entity_sim)
}

/// True when no other GL line in the window shares this entry's entity,
/// day and amount.
fn amount_entity_unique(entry: &GlEntry, window: &[GlEntry]) -> bool {
    window
        .iter()
        .filter(|other| {
            other.entity_name == entry.entity_name
                && other.date.date_naive() == entry.date.date_naive()
                && other.abs_amount() == entry.abs_amount()
        })
        .count()
        == 1
}
