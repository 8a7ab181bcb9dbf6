use rust_decimal::Decimal;
use tally_core::{BankTransaction, Candidate, EntityMap, GlEntry, MatchTier, Pattern, PatternKind};

use crate::text::alphanumeric_upper;

const SCORE_ALL_SIGNALS: Decimal = Decimal::from_parts(100, 0, 0, false, 2); // 1.00
const SCORE_AMOUNT_REF: Decimal = Decimal::from_parts(95, 0, 0, false, 2); // 0.95
const SCORE_AMOUNT_DATE: Decimal = Decimal::from_parts(90, 0, 0, false, 2); // 0.90

const MAX_DATE_DIFF_DAYS: i64 = 1;

/// Tier 1: amount equal to the cent, date within one day, scored by which
/// corroborating signal is present (reference containment, known entity
/// IBAN, or an exact pattern hit).
pub fn match_exact(
    tx: &BankTransaction,
    gl_entries: &[GlEntry],
    entities: &EntityMap,
    patterns: &[Pattern],
) -> Vec<Candidate> {
    gl_entries
        .iter()
        .filter_map(|entry| try_match(tx, entry, entities, patterns))
        .collect()
}

fn try_match(
    tx: &BankTransaction,
    entry: &GlEntry,
    entities: &EntityMap,
    patterns: &[Pattern],
) -> Option<Candidate> {
    if tx.comparable_amount() != entry.abs_amount() {
        return None;
    }

    let date_diff = (tx.occurred_at.date_naive() - entry.date.date_naive())
        .num_days()
        .abs();
    if date_diff > MAX_DATE_DIFF_DAYS {
        return None;
    }

    let mut reasons = vec!["amount-exact".to_string()];
    reasons.push(if date_diff == 0 {
        "date-exact".to_string()
    } else {
        "date-within-1-day".to_string()
    });

    let (score, signal) = if reference_contains_gl_id(tx, entry) {
        (SCORE_ALL_SIGNALS, Some("reference-match"))
    } else if counterparty_iban_known(tx, entities) {
        (SCORE_AMOUNT_REF, Some("counterparty-iban-known"))
    } else if pattern_exact_hit(tx, patterns) {
        (SCORE_AMOUNT_REF, Some("pattern-exact-match"))
    } else {
        (SCORE_AMOUNT_DATE, None)
    };
    if let Some(signal) = signal {
        reasons.push(signal.to_string());
    }

    let mut candidate = Candidate::from_gl(&tx.reference, entry, score, MatchTier::Exact);
    candidate.reasons = reasons;
    Some(candidate)
}

/// Case-insensitive containment of the GL transaction id in the payment
/// reference, after stripping everything but letters and digits.
fn reference_contains_gl_id(tx: &BankTransaction, entry: &GlEntry) -> bool {
    let Some(reference) = tx.payment_reference.as_deref() else {
        return false;
    };
    let needle = alphanumeric_upper(&entry.transaction_id);
    if needle.is_empty() {
        return false;
    }
    alphanumeric_upper(reference).contains(&needle)
}

fn counterparty_iban_known(tx: &BankTransaction, entities: &EntityMap) -> bool {
    tx.counterparty_account
        .as_deref()
        .is_some_and(|iban| entities.is_known_iban(iban))
}

fn pattern_exact_hit(tx: &BankTransaction, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|p| {
        p.active
            && matches!(p.kind, PatternKind::Reference | PatternKind::Counterparty)
            && p.matches(tx)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{entry, transaction};
    use chrono::Duration;
    use rust_decimal::Decimal;
    use tally_core::{Entity, TargetKind};

    fn entities_with_iban(iban: &str) -> EntityMap {
        EntityMap::new(vec![Entity {
            key: "ombori-ag".into(),
            profile_id: 47,
            subsidiary_id: 7,
            display_name: "Ombori AG".into(),
            jurisdiction: "CH".into(),
            currency: "CHF".into(),
            aliases: vec![],
            known_ibans: vec![iban.into()],
        }])
    }

    #[test]
    fn all_signals_score_one() {
        let tx = transaction(|t| {
            t.amount = Decimal::new(123_456, 2);
            t.payment_reference = Some("INV-7788".into());
            t.counterparty_name = Some("Acme Ltd".into());
        });
        let gl = entry("INV-7788", Decimal::new(123_456, 2), tx.occurred_at);

        let candidates = match_exact(&tx, &[gl], &EntityMap::default(), &[]);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.score, Decimal::new(100, 2));
        assert_eq!(c.tier, MatchTier::Exact);
        assert!(c.reasons.contains(&"amount-exact".to_string()));
        assert!(c.reasons.contains(&"date-exact".to_string()));
        assert!(c.reasons.contains(&"reference-match".to_string()));
    }

    #[test]
    fn iban_signal_scores_95() {
        let tx = transaction(|t| {
            t.amount = Decimal::new(50_000, 2);
            t.counterparty_account = Some("BE82 9678 3109 6568".into());
        });
        let gl = entry("JE-100", Decimal::new(50_000, 2), tx.occurred_at);

        let candidates = match_exact(&tx, &[gl], &entities_with_iban("BE82967831096568"), &[]);
        assert_eq!(candidates[0].score, Decimal::new(95, 2));
        assert!(candidates[0]
            .reasons
            .contains(&"counterparty-iban-known".to_string()));
    }

    #[test]
    fn amount_and_date_alone_score_90() {
        let tx = transaction(|t| t.amount = Decimal::new(9_999, 2));
        let gl = entry(
            "JE-7",
            Decimal::new(9_999, 2),
            tx.occurred_at - Duration::days(1),
        );
        let candidates = match_exact(&tx, &[gl], &EntityMap::default(), &[]);
        assert_eq!(candidates[0].score, Decimal::new(90, 2));
        assert!(candidates[0]
            .reasons
            .contains(&"date-within-1-day".to_string()));
    }

    #[test]
    fn cent_difference_misses() {
        let tx = transaction(|t| t.amount = Decimal::new(1_000, 2)); // 10.00
        let gl = entry("JE-1", Decimal::new(1_001, 2), tx.occurred_at); // 10.01
        assert!(match_exact(&tx, &[gl], &EntityMap::default(), &[]).is_empty());
    }

    #[test]
    fn two_day_drift_misses() {
        let tx = transaction(|t| t.amount = Decimal::new(1_000, 2));
        let gl = entry(
            "JE-1",
            Decimal::new(1_000, 2),
            tx.occurred_at - Duration::days(2),
        );
        assert!(match_exact(&tx, &[gl], &EntityMap::default(), &[]).is_empty());
    }

    #[test]
    fn pattern_hit_scores_95() {
        let tx = transaction(|t| {
            t.amount = Decimal::new(7_500, 2);
            t.counterparty_name = Some("Monthly Hosting Co".into());
        });
        let gl = entry("JE-12", Decimal::new(7_500, 2), tx.occurred_at);
        let pattern = Pattern {
            id: "p1".into(),
            kind: PatternKind::Counterparty,
            value: "monthly hosting".into(),
            regex: None,
            target_kind: TargetKind::Account,
            target_id: "6000".into(),
            target_name: "Hosting".into(),
            auto_approve: false,
            boost: Decimal::new(10, 2),
            times_used: 0,
            times_approved: 0,
            times_rejected: 0,
            active: true,
        };

        let candidates = match_exact(&tx, &[gl], &EntityMap::default(), &[pattern]);
        assert_eq!(candidates[0].score, Decimal::new(95, 2));
        assert!(candidates[0]
            .reasons
            .contains(&"pattern-exact-match".to_string()));
    }

    #[test]
    fn reference_containment_ignores_separators() {
        let tx = transaction(|t| {
            t.amount = Decimal::new(2_000, 2);
            t.payment_reference = Some("payment for inv 7788 march".into());
        });
        let gl = entry("INV-7788", Decimal::new(2_000, 2), tx.occurred_at);
        let candidates = match_exact(&tx, &[gl], &EntityMap::default(), &[]);
        assert_eq!(candidates[0].score, Decimal::new(100, 2));
    }
}
