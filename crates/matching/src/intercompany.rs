use tally_core::{BankTransaction, Candidate, EntityMap};

/// Outcome of intercompany classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IcDetection {
    pub is_intercompany: bool,
    pub counterparty_entity: Option<String>,
    pub method: Option<&'static str>,
}

impl IcDetection {
    fn hit(entity: &str, method: &'static str) -> Self {
        IcDetection {
            is_intercompany: true,
            counterparty_entity: Some(entity.to_string()),
            method: Some(method),
        }
    }
}

/// Classifies a transaction as intercompany when the counterparty resolves
/// to a group entity by name, by IBAN, or via the payment reference (an
/// "IC" token or an embedded entity alias).
pub fn classify(tx: &BankTransaction, entities: &EntityMap) -> IcDetection {
    if let Some(name) = tx.counterparty_name.as_deref() {
        if let Some(entity) = entities.match_name(name) {
            return IcDetection::hit(&entity.display_name, "counterparty-name");
        }
    }

    if let Some(iban) = tx.counterparty_account.as_deref() {
        if let Some(entity) = entities.match_iban(iban) {
            return IcDetection::hit(&entity.display_name, "counterparty-iban");
        }
    }

    if let Some(reference) = tx.payment_reference.as_deref() {
        if let Some(entity) = entities.find_in_text(reference) {
            return IcDetection::hit(&entity.display_name, "reference-entity");
        }
        if has_ic_token(reference) {
            return IcDetection {
                is_intercompany: true,
                counterparty_entity: None,
                method: Some("reference-ic-token"),
            };
        }
    }

    IcDetection::default()
}

/// "IC" must appear as a standalone token, not inside a longer word.
fn has_ic_token(reference: &str) -> bool {
    reference
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token.eq_ignore_ascii_case("ic"))
}

/// Stamps the detection result onto every candidate of the transaction.
pub fn annotate(candidates: &mut [Candidate], detection: &IcDetection) {
    for candidate in candidates {
        candidate.is_intercompany = detection.is_intercompany;
        candidate.counterparty_entity = detection.counterparty_entity.clone();
    }
}
