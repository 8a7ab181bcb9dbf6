use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use tally_core::Candidate;

const IC_BONUS: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // +0.05
const REPEAT_COUNTERPARTY_BONUS: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // +0.05
const FX_VARIANCE_PENALTY: Decimal = Decimal::from_parts(15, 0, 0, false, 2); // -0.15
const DATE_DRIFT_PENALTY: Decimal = Decimal::from_parts(10, 0, 0, false, 2); // -0.10

/// Relative FX variance above which the penalty applies.
const FX_VARIANCE_LIMIT: Decimal = Decimal::from_parts(2, 0, 0, false, 2); // 0.02
/// Days of drift above which the penalty applies.
const DATE_DRIFT_LIMIT_DAYS: i64 = 3;

const AUTO_APPROVE_MIN: Decimal = Decimal::from_parts(95, 0, 0, false, 2); // 0.95
const SUGGEST_MIN: Decimal = Decimal::from_parts(80, 0, 0, false, 2); // 0.80
const REVIEW_MIN: Decimal = Decimal::from_parts(60, 0, 0, false, 2); // 0.60

/// What the approval service should do with a suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    AutoApprove,
    Suggest,
    Review,
    Manual,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::AutoApprove => "auto_approve",
            Policy::Suggest => "suggest",
            Policy::Review => "review",
            Policy::Manual => "manual",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn policy_for(score: Decimal) -> Policy {
    if score >= AUTO_APPROVE_MIN {
        Policy::AutoApprove
    } else if score >= SUGGEST_MIN {
        Policy::Suggest
    } else if score >= REVIEW_MIN {
        Policy::Review
    } else {
        Policy::Manual
    }
}

/// Context gathered by the orchestrator before final scoring.
#[derive(Debug, Clone, Default)]
pub struct Adjustments {
    pub intercompany: bool,
    /// Boost from the nearest qualifying pattern, already in [0.10, 0.25].
    pub pattern_boost: Option<Decimal>,
    /// Counterparty seen in three or more prior approvals.
    pub repeat_counterparty: bool,
    /// Relative deviation of the applied FX rate from the reference rate.
    pub fx_variance: Option<Decimal>,
    pub date_drift_days: i64,
}

/// `clamp(base + sum(adjustments), 0, 1)` with a reason string per applied
/// adjustment, in application order.
pub fn apply_adjustments(base: Decimal, adj: &Adjustments) -> (Decimal, Vec<String>) {
    let mut score = base;
    let mut reasons = Vec::new();

    if adj.intercompany {
        score += IC_BONUS;
        reasons.push(format!("+{IC_BONUS} intercompany"));
    }
    if let Some(boost) = adj.pattern_boost {
        score += boost;
        reasons.push(format!("+{boost} pattern-match"));
    }
    if adj.repeat_counterparty {
        score += REPEAT_COUNTERPARTY_BONUS;
        reasons.push(format!("+{REPEAT_COUNTERPARTY_BONUS} repeat-counterparty"));
    }
    if adj.fx_variance.is_some_and(|v| v > FX_VARIANCE_LIMIT) {
        score -= FX_VARIANCE_PENALTY;
        reasons.push(format!("-{FX_VARIANCE_PENALTY} fx-variance"));
    }
    if adj.date_drift_days.abs() > DATE_DRIFT_LIMIT_DAYS {
        score -= DATE_DRIFT_PENALTY;
        reasons.push(format!("-{DATE_DRIFT_PENALTY} date-drift"));
    }

    (score.clamp(Decimal::ZERO, Decimal::ONE), reasons)
}

/// Marks exactly one candidate as selected and returns its index.
///
/// The ordering is total, so selection is deterministic for identical
/// inputs: higher score, then smaller amount gap, then smaller date gap,
/// then lexicographically smaller GL id.
pub fn select_candidate(
    candidates: &mut [Candidate],
    tx_amount: Decimal,
    tx_date: DateTime<Utc>,
) -> Option<usize> {
    for candidate in candidates.iter_mut() {
        candidate.selected = false;
    }

    let winner = (0..candidates.len()).min_by(|&a, &b| {
        let (a, b) = (&candidates[a], &candidates[b]);
        b.score
            .cmp(&a.score)
            .then_with(|| amount_gap(a, tx_amount).cmp(&amount_gap(b, tx_amount)))
            .then_with(|| date_gap(a, tx_date).cmp(&date_gap(b, tx_date)))
            .then_with(|| a.gl_tx_id.cmp(&b.gl_tx_id))
    })?;

    candidates[winner].selected = true;
    Some(winner)
}

fn amount_gap(candidate: &Candidate, tx_amount: Decimal) -> Decimal {
    (candidate.gl_amount.abs() - tx_amount.abs()).abs()
}

fn date_gap(candidate: &Candidate, tx_date: DateTime<Utc>) -> i64 {
    (candidate.gl_date.date_naive() - tx_date.date_naive())
        .num_days()
        .abs()
}
