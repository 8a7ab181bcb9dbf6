use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Debit,
    Credit,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Debit => write!(f, "DEBIT"),
            Direction::Credit => write!(f, "CREDIT"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(Direction::Debit),
            "CREDIT" => Ok(Direction::Credit),
            other => Err(format!("unknown direction: '{other}'")),
        }
    }
}

/// Statement transaction kind as reported by the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Transfer,
    Deposit,
    Card,
    Conversion,
    MoneyAdded,
    IncomingCrossBalance,
    OutgoingCrossBalance,
    DirectDebit,
    BalanceInterest,
    BalanceAdjustment,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Transfer => "TRANSFER",
            TransactionKind::Deposit => "DEPOSIT",
            TransactionKind::Card => "CARD",
            TransactionKind::Conversion => "CONVERSION",
            TransactionKind::MoneyAdded => "MONEY_ADDED",
            TransactionKind::IncomingCrossBalance => "INCOMING_CROSS_BALANCE",
            TransactionKind::OutgoingCrossBalance => "OUTGOING_CROSS_BALANCE",
            TransactionKind::DirectDebit => "DIRECT_DEBIT",
            TransactionKind::BalanceInterest => "BALANCE_INTEREST",
            TransactionKind::BalanceAdjustment => "BALANCE_ADJUSTMENT",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRANSFER" => Ok(TransactionKind::Transfer),
            "DEPOSIT" => Ok(TransactionKind::Deposit),
            "CARD" => Ok(TransactionKind::Card),
            "CONVERSION" => Ok(TransactionKind::Conversion),
            "MONEY_ADDED" => Ok(TransactionKind::MoneyAdded),
            "INCOMING_CROSS_BALANCE" => Ok(TransactionKind::IncomingCrossBalance),
            "OUTGOING_CROSS_BALANCE" => Ok(TransactionKind::OutgoingCrossBalance),
            "DIRECT_DEBIT" => Ok(TransactionKind::DirectDebit),
            "BALANCE_INTEREST" => Ok(TransactionKind::BalanceInterest),
            "BALANCE_ADJUSTMENT" => Ok(TransactionKind::BalanceAdjustment),
            other => Err(format!("unknown transaction kind: '{other}'")),
        }
    }
}

/// Reconciliation lifecycle of a bank transaction.
///
/// The status only ever advances: `Pending -> Submitted -> {Matched, Unmatched}`.
/// A validation failure may short-circuit straight to `Unmatched` (with a
/// reason recorded), but no transition ever moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    Pending,
    Submitted,
    Matched,
    Unmatched,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Submitted => "submitted",
            MatchStatus::Matched => "matched",
            MatchStatus::Unmatched => "unmatched",
        }
    }

    fn rank(self) -> u8 {
        match self {
            MatchStatus::Pending => 0,
            MatchStatus::Submitted => 1,
            MatchStatus::Matched | MatchStatus::Unmatched => 2,
        }
    }

    /// Whether moving to `next` is a forward transition.
    pub fn can_advance_to(self, next: MatchStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MatchStatus::Matched | MatchStatus::Unmatched)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MatchStatus::Pending),
            "submitted" => Ok(MatchStatus::Submitted),
            "matched" => Ok(MatchStatus::Matched),
            "unmatched" => Ok(MatchStatus::Unmatched),
            other => Err(format!("unknown match status: '{other}'")),
        }
    }
}

/// Currency-exchange block attached to cross-currency transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FxDetails {
    pub from_amount: Decimal,
    pub from_currency: String,
    /// Rate actually applied by the bank, 8 fractional digits.
    pub rate: Decimal,
}

/// Card block attached to CARD transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDetails {
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub last4: Option<String>,
    pub cardholder: Option<String>,
}

/// A bank statement line, keyed by the bank's globally unique reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    pub reference: String,
    pub entity: String,
    pub profile_id: i64,
    pub direction: Direction,
    pub kind: TransactionKind,
    pub occurred_at: DateTime<Utc>,
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub payment_reference: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_account: Option<String>,
    pub fx: Option<FxDetails>,
    pub fees: Option<Decimal>,
    pub card: Option<CardDetails>,
    pub running_balance: Option<Decimal>,

    pub status: MatchStatus,
    pub status_reason: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub best_confidence: Option<Decimal>,
    pub suggestion_id: Option<String>,
}

impl BankTransaction {
    /// The amount to compare against GL entries on the original side of a
    /// conversion: the `from` leg when an FX block is present.
    pub fn comparable_amount(&self) -> Decimal {
        match &self.fx {
            Some(fx) => fx.from_amount.abs(),
            None => self.amount.abs(),
        }
    }

    pub fn is_cross_currency(&self) -> bool {
        self.fx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_advances_forward_only() {
        assert!(MatchStatus::Pending.can_advance_to(MatchStatus::Submitted));
        assert!(MatchStatus::Pending.can_advance_to(MatchStatus::Unmatched));
        assert!(MatchStatus::Submitted.can_advance_to(MatchStatus::Matched));
        assert!(!MatchStatus::Submitted.can_advance_to(MatchStatus::Pending));
        assert!(!MatchStatus::Matched.can_advance_to(MatchStatus::Submitted));
        assert!(!MatchStatus::Matched.can_advance_to(MatchStatus::Unmatched));
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            TransactionKind::Transfer,
            TransactionKind::IncomingCrossBalance,
            TransactionKind::BalanceAdjustment,
        ] {
            assert_eq!(kind.as_str().parse::<TransactionKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!("LOAN".parse::<TransactionKind>().is_err());
    }

    #[test]
    fn comparable_amount_prefers_fx_leg() {
        let mut tx = BankTransaction {
            reference: "TRANSFER-1".into(),
            entity: "Acme Ltd".into(),
            profile_id: 1,
            direction: Direction::Debit,
            kind: TransactionKind::Conversion,
            occurred_at: Utc::now(),
            amount: Decimal::new(102_000, 2),
            currency: "USD".into(),
            description: None,
            payment_reference: None,
            counterparty_name: None,
            counterparty_account: None,
            fx: Some(FxDetails {
                from_amount: Decimal::new(100_000, 2),
                from_currency: "EUR".into(),
                rate: Decimal::new(102_000_000, 8),
            }),
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
        assert_eq!(tx.comparable_amount(), Decimal::new(100_000, 2));
        tx.fx = None;
        assert_eq!(tx.comparable_amount(), Decimal::new(102_000, 2));
    }
}
