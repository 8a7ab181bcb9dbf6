pub mod confidence;
pub mod exact;
pub mod fuzzy;
pub mod intercompany;
pub mod llm;
pub mod text;
pub mod vector;

use thiserror::Error;

pub use confidence::{apply_adjustments, policy_for, select_candidate, Adjustments, Policy};
pub use exact::match_exact;
pub use fuzzy::match_fuzzy;
pub use intercompany::{classify, IcDetection};
pub use llm::{match_llm, HttpLlmScorer, LlmScorer, LlmVerdict, MockLlmScorer, PROMPT_VERSION};
pub use vector::{cosine_similarity, Embedder, HttpEmbedder, MockEmbedder, PatternHit, PatternIndex};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("llm scoring failed: {0}")]
    Llm(String),
    #[error("llm returned an unusable response: {0}")]
    LlmInvalidResponse(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use tally_core::{BankTransaction, Direction, GlEntry, MatchStatus, TransactionKind};

    /// A pending EUR transfer on 2025-03-10; callers mutate what they need.
    pub fn transaction(build: impl FnOnce(&mut BankTransaction)) -> BankTransaction {
        let mut tx = BankTransaction {
            reference: "TRANSFER-100".into(),
            entity: "Phygrid Limited".into(),
            profile_id: 19_941_830,
            direction: Direction::Debit,
            kind: TransactionKind::Transfer,
            occurred_at: Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap(),
            amount: Decimal::new(100_000, 2),
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

    pub fn entry(
        transaction_id: &str,
        amount: Decimal,
        date: chrono::DateTime<Utc>,
    ) -> GlEntry {
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
}
