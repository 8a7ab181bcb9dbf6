use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::transaction::BankTransaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternKind {
    Counterparty,
    Reference,
    AmountRange,
    Description,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::Counterparty => "counterparty",
            PatternKind::Reference => "reference",
            PatternKind::AmountRange => "amount_range",
            PatternKind::Description => "description",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counterparty" => Ok(PatternKind::Counterparty),
            "reference" => Ok(PatternKind::Reference),
            "amount_range" => Ok(PatternKind::AmountRange),
            "description" => Ok(PatternKind::Description),
            other => Err(format!("unknown pattern kind: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    Vendor,
    Customer,
    Account,
    Subsidiary,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Vendor => "vendor",
            TargetKind::Customer => "customer",
            TargetKind::Account => "account",
            TargetKind::Subsidiary => "subsidiary",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vendor" => Ok(TargetKind::Vendor),
            "customer" => Ok(TargetKind::Customer),
            "account" => Ok(TargetKind::Account),
            "subsidiary" => Ok(TargetKind::Subsidiary),
            other => Err(format!("unknown target kind: '{other}'")),
        }
    }
}

/// A previously approved correspondence, reusable to boost confidence on
/// similar future transactions. Unique by `(kind, value, target_kind)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub kind: PatternKind,
    pub value: String,
    /// When set, `value` is interpreted as this regular expression instead
    /// of a literal.
    pub regex: Option<String>,
    pub target_kind: TargetKind,
    pub target_id: String,
    pub target_name: String,
    pub auto_approve: bool,
    /// Confidence boost in [0.10, 0.25] once the pattern is live.
    pub boost: Decimal,
    pub times_used: i64,
    pub times_approved: i64,
    pub times_rejected: i64,
    pub active: bool,
}

impl Pattern {
    /// Rejection rate over all reviewed uses, 0 when never reviewed.
    pub fn rejection_rate(&self) -> f64 {
        let reviewed = self.times_approved + self.times_rejected;
        if reviewed == 0 {
            return 0.0;
        }
        self.times_rejected as f64 / reviewed as f64
    }

    /// Whether this pattern matches the given transaction's corresponding
    /// field. Regex patterns match case-insensitively; literal patterns are
    /// case-insensitive substring matches.
    pub fn matches(&self, tx: &BankTransaction) -> bool {
        let field = match self.kind {
            PatternKind::Counterparty => tx.counterparty_name.as_deref(),
            PatternKind::Reference => tx.payment_reference.as_deref(),
            PatternKind::Description => tx.description.as_deref(),
            PatternKind::AmountRange => return self.matches_amount(tx.amount.abs()),
        };
        let Some(field) = field else {
            return false;
        };
        match &self.regex {
            Some(re) => match regex_lite(re) {
                Some(re) => re.is_match(field),
                None => false,
            },
            None => field.to_lowercase().contains(&self.value.to_lowercase()),
        }
    }

    fn matches_amount(&self, amount: Decimal) -> bool {
        let Some((lo, hi)) = self.value.split_once("..") else {
            return false;
        };
        match (lo.trim().parse::<Decimal>(), hi.trim().parse::<Decimal>()) {
            (Ok(lo), Ok(hi)) => amount >= lo && amount <= hi,
            _ => false,
        }
    }
}

fn regex_lite(pattern: &str) -> Option<regex::Regex> {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .ok()
}
