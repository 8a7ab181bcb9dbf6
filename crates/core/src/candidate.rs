use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::gl::GlEntry;

/// Which matching stage produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchTier {
    Exact,
    Fuzzy,
    Llm,
    Pattern,
}

impl MatchTier {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchTier::Exact => "exact",
            MatchTier::Fuzzy => "fuzzy",
            MatchTier::Llm => "llm",
            MatchTier::Pattern => "pattern",
        }
    }
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MatchTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(MatchTier::Exact),
            "fuzzy" => Ok(MatchTier::Fuzzy),
            "llm" => Ok(MatchTier::Llm),
            "pattern" => Ok(MatchTier::Pattern),
            other => Err(format!("unknown match tier: '{other}'")),
        }
    }
}

/// One scored pairing of a bank transaction with a GL line.
///
/// Candidates are scoped to a single scoring attempt; at most one per
/// transaction carries `selected = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub tx_reference: String,
    pub gl_tx_id: String,
    pub gl_line_id: i64,
    pub gl_type: String,
    pub gl_amount: Decimal,
    pub gl_date: DateTime<Utc>,
    pub gl_entity: String,
    pub gl_account_id: i64,
    pub gl_account_name: String,
    pub gl_memo: Option<String>,
    /// Final score in [0, 1] after adjustments.
    pub score: Decimal,
    pub tier: MatchTier,
    /// Ordered, human-readable match reasons.
    pub reasons: Vec<String>,
    pub selected: bool,
    pub is_intercompany: bool,
    pub counterparty_entity: Option<String>,
    /// Provenance for LLM-produced candidates.
    pub llm_model: Option<String>,
    pub llm_prompt_version: Option<String>,
}

impl Candidate {
    pub fn from_gl(tx_reference: &str, entry: &GlEntry, score: Decimal, tier: MatchTier) -> Self {
        Candidate {
            tx_reference: tx_reference.to_string(),
            gl_tx_id: entry.transaction_id.clone(),
            gl_line_id: entry.line_id,
            gl_type: entry.transaction_type.clone(),
            gl_amount: entry.amount,
            gl_date: entry.date,
            gl_entity: entry.entity_name.clone(),
            gl_account_id: entry.account_id,
            gl_account_name: entry.account_name.clone(),
            gl_memo: entry.memo.clone(),
            score,
            tier,
            reasons: Vec::new(),
            selected: false,
            is_intercompany: false,
            counterparty_entity: None,
            llm_model: None,
            llm_prompt_version: None,
        }
    }

}
