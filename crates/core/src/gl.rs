use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A general-ledger line pulled from the approval service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlEntry {
    pub transaction_id: String,
    pub line_id: i64,
    pub transaction_type: String,
    pub date: DateTime<Utc>,
    pub amount: Decimal,
    pub currency: String,
    pub account_id: i64,
    pub account_name: String,
    pub entity_id: i64,
    pub entity_name: String,
    pub memo: Option<String>,
    #[serde(default)]
    pub is_reconciled: bool,
}

impl GlEntry {
    pub fn abs_amount(&self) -> Decimal {
        self.amount.abs()
    }
}
