use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use tally_core::{BankTransaction, CardDetails, Direction, FxDetails, MatchStatus};

#[derive(Debug, Error)]
pub enum StatementError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Business profile visible to the API token.
#[derive(Debug, Clone, Deserialize)]
pub struct WireProfile {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub details: ProfileDetails,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDetails {
    #[serde(default)]
    pub name: String,
    pub registration_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireBalance {
    pub id: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Statement {
    #[serde(default)]
    pub transactions: Vec<WireTransaction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoneyValue {
    #[serde(default)]
    pub value: Decimal,
    pub currency: Option<String>,
}

/// One statement line as the bank serializes it. Counterparty details live
/// in a type-dependent `details` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTransaction {
    pub reference_number: String,
    #[serde(rename = "type")]
    pub direction: String,
    pub date: String,
    pub amount: MoneyValue,
    pub total_fees: Option<MoneyValue>,
    pub running_balance: Option<MoneyValue>,
    #[serde(default)]
    pub details: TransactionDetails,
    pub exchange_details: Option<ExchangeDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDetails {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub description: Option<String>,
    pub payment_reference: Option<String>,
    pub recipient: Option<Recipient>,
    pub sender_name: Option<String>,
    pub sender_account: Option<String>,
    pub merchant: Option<Merchant>,
    pub card_last_four_digits: Option<String>,
    pub card_holder_full_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub name: Option<String>,
    pub bank_account: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Merchant {
    pub name: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeDetails {
    pub from_amount: Option<MoneyValue>,
    pub rate: Option<Decimal>,
}

impl WireTransaction {
    /// Lift a statement line into the domain model. Counterparty fields
    /// come from the type-specific block: recipient for transfers, sender
    /// for deposits, merchant for card spend.
    pub fn into_domain(
        self,
        currency: &str,
        entity: &str,
        profile_id: i64,
    ) -> Result<BankTransaction, StatementError> {
        if self.reference_number.is_empty() {
            return Err(StatementError::MissingField("referenceNumber"));
        }

        let direction: Direction =
            self.direction
                .parse()
                .map_err(|message| StatementError::InvalidValue {
                    field: "type",
                    message,
                })?;
        let kind = self
            .details
            .kind
            .parse()
            .map_err(|message| StatementError::InvalidValue {
                field: "details.type",
                message,
            })?;
        let occurred_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&self.date)
            .map_err(|e| StatementError::InvalidValue {
                field: "date",
                message: e.to_string(),
            })?
            .with_timezone(&Utc);

        let (counterparty_name, counterparty_account) = match self.details.kind.as_str() {
            "TRANSFER" => match &self.details.recipient {
                Some(recipient) => (recipient.name.clone(), recipient.bank_account.clone()),
                None => (None, None),
            },
            "DEPOSIT" => (
                self.details.sender_name.clone(),
                self.details.sender_account.clone(),
            ),
            _ => (None, None),
        };

        let card = if self.details.kind == "CARD" {
            Some(CardDetails {
                merchant: self.details.merchant.as_ref().and_then(|m| m.name.clone()),
                category: self
                    .details
                    .merchant
                    .as_ref()
                    .and_then(|m| m.category.clone()),
                last4: self.details.card_last_four_digits.clone(),
                cardholder: self.details.card_holder_full_name.clone(),
            })
        } else {
            None
        };

        let fx = self.exchange_details.and_then(|ex| {
            let from = ex.from_amount?;
            Some(FxDetails {
                from_amount: from.value,
                from_currency: from.currency.unwrap_or_default(),
                rate: ex.rate?,
            })
        });

        Ok(BankTransaction {
            reference: self.reference_number,
            entity: entity.to_string(),
            profile_id,
            direction,
            kind,
            occurred_at,
            amount: self.amount.value,
            currency: currency.to_string(),
            description: self.details.description,
            payment_reference: self.details.payment_reference,
            counterparty_name,
            counterparty_account,
            fx,
            fees: self.total_fees.map(|f| f.value),
            card,
            running_balance: self.running_balance.map(|b| b.value),
            status: MatchStatus::Pending,
            status_reason: None,
            last_attempt_at: None,
            attempts: 0,
            best_confidence: None,
            suggestion_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::TransactionKind;

    fn transfer_json() -> &'static str {
        r#"{
            "referenceNumber": "TRANSFER-1950972714",
            "type": "DEBIT",
            "date": "2025-03-10T09:30:00.000Z",
            "amount": {"value": 1234.56, "currency": "EUR"},
            "totalFees": {"value": 1.25, "currency": "EUR"},
            "runningBalance": {"value": 10000.00, "currency": "EUR"},
            "details": {
                "type": "TRANSFER",
                "description": "Sent money to Acme Ltd",
                "paymentReference": "INV-7788",
                "recipient": {"name": "Acme Ltd", "bankAccount": "BE82967831096568"}
            }
        }"#
    }

    #[test]
    fn parses_transfer_with_recipient() {
        let wire: WireTransaction = serde_json::from_str(transfer_json()).unwrap();
        let tx = wire.into_domain("EUR", "Phygrid Limited", 19).unwrap();

        assert_eq!(tx.reference, "TRANSFER-1950972714");
        assert_eq!(tx.direction, Direction::Debit);
        assert_eq!(tx.kind, TransactionKind::Transfer);
        assert_eq!(tx.amount, Decimal::new(123_456, 2));
        assert_eq!(tx.counterparty_name.as_deref(), Some("Acme Ltd"));
        assert_eq!(
            tx.counterparty_account.as_deref(),
            Some("BE82967831096568")
        );
        assert_eq!(tx.fees, Some(Decimal::new(125, 2)));
        assert_eq!(tx.status, MatchStatus::Pending);
        assert_eq!(tx.attempts, 0);
    }

    #[test]
    fn parses_card_block() {
        let raw = r#"{
            "referenceNumber": "CARD-77",
            "type": "DEBIT",
            "date": "2025-03-11T18:00:00.000Z",
            "amount": {"value": 42.00, "currency": "EUR"},
            "details": {
                "type": "CARD",
                "description": "Card payment",
                "merchant": {"name": "Cloud Hosting Inc", "category": "computer services"},
                "cardLastFourDigits": "4242",
                "cardHolderFullName": "Jo Bloggs"
            }
        }"#;
        let wire: WireTransaction = serde_json::from_str(raw).unwrap();
        let tx = wire.into_domain("EUR", "Phygrid Limited", 19).unwrap();

        let card = tx.card.unwrap();
        assert_eq!(card.merchant.as_deref(), Some("Cloud Hosting Inc"));
        assert_eq!(card.last4.as_deref(), Some("4242"));
        assert!(tx.counterparty_name.is_none());
    }

    #[test]
    fn parses_fx_block() {
        let raw = r#"{
            "referenceNumber": "CONVERSION-9",
            "type": "CREDIT",
            "date": "2025-04-02T08:00:00.000Z",
            "amount": {"value": 1020.00, "currency": "USD"},
            "details": {"type": "CONVERSION", "description": "Converted EUR to USD"},
            "exchangeDetails": {
                "fromAmount": {"value": 1000.00, "currency": "EUR"},
                "rate": 1.02
            }
        }"#;
        let wire: WireTransaction = serde_json::from_str(raw).unwrap();
        let tx = wire.into_domain("USD", "Phygrid Limited", 19).unwrap();

        let fx = tx.fx.unwrap();
        assert_eq!(fx.from_amount, Decimal::new(100_000, 2));
        assert_eq!(fx.from_currency, "EUR");
        assert_eq!(fx.rate, Decimal::new(102, 2));
    }

    #[test]
    fn unknown_kind_is_a_validation_error() {
        let raw = r#"{
            "referenceNumber": "LOAN-1",
            "type": "DEBIT",
            "date": "2025-03-10T09:30:00.000Z",
            "amount": {"value": 10.00, "currency": "EUR"},
            "details": {"type": "LOAN"}
        }"#;
        let wire: WireTransaction = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            wire.into_domain("EUR", "Phygrid Limited", 19),
            Err(StatementError::InvalidValue { field: "details.type", .. })
        ));
    }

    #[test]
    fn missing_reference_is_rejected() {
        let raw = r#"{
            "referenceNumber": "",
            "type": "DEBIT",
            "date": "2025-03-10T09:30:00.000Z",
            "amount": {"value": 10.00, "currency": "EUR"},
            "details": {"type": "TRANSFER"}
        }"#;
        let wire: WireTransaction = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            wire.into_domain("EUR", "Phygrid Limited", 19),
            Err(StatementError::MissingField("referenceNumber"))
        ));
    }
}
