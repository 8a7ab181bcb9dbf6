use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tally_core::{BankTransaction, Candidate, GlEntry, MatchTier};

use crate::MatchError;

/// Bumped whenever the matching prompt changes; recorded on every candidate
/// the scorer produces so past decisions stay auditable.
pub const PROMPT_VERSION: &str = "recon-match/2";

const MIN_CONFIDENCE: Decimal = Decimal::from_parts(50, 0, 0, false, 2); // 0.50
const MAX_CONFIDENCE: Decimal = Decimal::from_parts(89, 0, 0, false, 2); // 0.89
const MAX_CANDIDATES: usize = 5;

const SYSTEM_PROMPT: &str = "You are a financial reconciliation assistant. \
Given one bank transaction and a numbered list of candidate ledger entries, \
pick the best match, if any. Consider amounts (exact or within FX tolerance), \
date proximity, payment references and invoice numbers in any format, and \
company-name variations. Respond with JSON only: \
{\"gl_id\": \"<transaction id or null>\", \"confidence\": <0.0-1.0>, \
\"reasoning\": \"<one sentence>\"}";

/// What the model said about a transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmVerdict {
    pub gl_id: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Abstraction over the scoring model so tests can stub it
/// deterministically.
#[async_trait]
pub trait LlmScorer: Send + Sync {
    fn model_id(&self) -> &str;

    async fn score(
        &self,
        tx: &BankTransaction,
        candidates: &[GlEntry],
    ) -> Result<LlmVerdict, MatchError>;
}

/// Tier 3: ranks the window by amount and date closeness, sends the top
/// five entries to the scorer, and converts a valid verdict into a single
/// candidate with confidence clamped to [0.50, 0.89].
///
/// A verdict naming an unknown GL id is discarded, not propagated: a bad
/// model answer must never fail the batch.
pub async fn match_llm(
    tx: &BankTransaction,
    gl_entries: &[GlEntry],
    scorer: &dyn LlmScorer,
) -> Result<Option<Candidate>, MatchError> {
    if gl_entries.is_empty() {
        return Ok(None);
    }

    let shortlist = shortlist(tx, gl_entries);
    let verdict = scorer.score(tx, &shortlist).await?;

    let Some(gl_id) = verdict.gl_id else {
        return Ok(None);
    };
    let Some(entry) = shortlist.iter().find(|e| e.transaction_id == gl_id) else {
        tracing::warn!(
            tx = %tx.reference,
            gl_id = %gl_id,
            "discarding llm verdict for unknown gl id"
        );
        return Ok(None);
    };

    let confidence = Decimal::from_str(&format!("{:.2}", verdict.confidence))
        .map_err(|e| MatchError::LlmInvalidResponse(e.to_string()))?
        .clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);

    let mut candidate = Candidate::from_gl(&tx.reference, entry, confidence, MatchTier::Llm);
    candidate.reasons.push("llm-match".to_string());
    if !verdict.reasoning.is_empty() {
        candidate.reasons.push(verdict.reasoning.clone());
    }
    candidate.llm_model = Some(scorer.model_id().to_string());
    candidate.llm_prompt_version = Some(PROMPT_VERSION.to_string());
    Ok(Some(candidate))
}

/// Top candidates by (amount closeness, date closeness).
fn shortlist(tx: &BankTransaction, gl_entries: &[GlEntry]) -> Vec<GlEntry> {
    let mut ranked: Vec<&GlEntry> = gl_entries.iter().collect();
    ranked.sort_by_key(|entry| {
        let amount_gap = (tx.comparable_amount() - entry.abs_amount()).abs();
        let date_gap = (tx.occurred_at.date_naive() - entry.date.date_naive())
            .num_days()
            .abs();
        (amount_gap, date_gap, entry.transaction_id.clone())
    });
    ranked.into_iter().take(MAX_CANDIDATES).cloned().collect()
}

// ── HTTP scorer ───────────────────────────────────────────────────────────────

/// Scorer backed by an Anthropic-style messages endpoint.
pub struct HttpLlmScorer {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl HttpLlmScorer {
    pub fn new(api_base: &str, api_key: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn build_prompt(tx: &BankTransaction, candidates: &[GlEntry]) -> String {
        let mut prompt = format!(
            "Bank transaction:\n- Reference: {}\n- Date: {}\n- Amount: {} {}\n- Kind: {}\n- Description: {}\n- Payment reference: {}\n- Counterparty: {}\n",
            tx.reference,
            tx.occurred_at.date_naive(),
            tx.amount,
            tx.currency,
            tx.kind,
            tx.description.as_deref().unwrap_or("n/a"),
            tx.payment_reference.as_deref().unwrap_or("n/a"),
            tx.counterparty_name.as_deref().unwrap_or("n/a"),
        );
        if let Some(fx) = &tx.fx {
            prompt.push_str(&format!(
                "- Original amount: {} {} at rate {}\n",
                fx.from_amount, fx.from_currency, fx.rate
            ));
        }
        prompt.push_str("\nCandidate ledger entries:\n");
        for entry in candidates {
            prompt.push_str(&format!(
                "[{}] date {} amount {} {} type {} account {} memo {}\n",
                entry.transaction_id,
                entry.date.date_naive(),
                entry.amount,
                entry.currency,
                entry.transaction_type,
                entry.account_name,
                entry.memo.as_deref().unwrap_or("n/a"),
            ));
        }
        prompt
    }

    /// Models occasionally wrap their JSON in a markdown fence.
    fn strip_fences(content: &str) -> &str {
        let content = content.trim();
        let content = content
            .strip_prefix("```json")
            .or_else(|| content.strip_prefix("```"))
            .unwrap_or(content);
        content.strip_suffix("```").unwrap_or(content).trim()
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LlmScorer for HttpLlmScorer {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn score(
        &self,
        tx: &BankTransaction,
        candidates: &[GlEntry],
    ) -> Result<LlmVerdict, MatchError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 500,
            "system": SYSTEM_PROMPT,
            "messages": [{"role": "user", "content": Self::build_prompt(tx, candidates)}],
        });

        let response = self
            .http
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| MatchError::Llm(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MatchError::Llm(format!(
                "scoring endpoint returned {}",
                response.status()
            )));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| MatchError::Llm(e.to_string()))?;
        let text = parsed
            .content
            .first()
            .map(|c| c.text.as_str())
            .unwrap_or_default();

        serde_json::from_str(Self::strip_fences(text))
            .map_err(|e| MatchError::LlmInvalidResponse(e.to_string()))
    }
}

// ── Mock scorer ───────────────────────────────────────────────────────────────

/// Returns a preconfigured verdict; records every transaction it was asked
/// about.
pub struct MockLlmScorer {
    pub verdict: LlmVerdict,
    pub calls: std::sync::Mutex<Vec<String>>,
}

impl MockLlmScorer {
    pub fn new(verdict: LlmVerdict) -> Self {
        Self {
            verdict,
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn no_match() -> Self {
        Self::new(LlmVerdict {
            gl_id: None,
            confidence: 0.0,
            reasoning: String::new(),
        })
    }
}

#[async_trait]
impl LlmScorer for MockLlmScorer {
    fn model_id(&self) -> &str {
        "mock-scorer"
    }

    async fn score(
        &self,
        tx: &BankTransaction,
        _candidates: &[GlEntry],
    ) -> Result<LlmVerdict, MatchError> {
        self.calls.lock().unwrap().push(tx.reference.clone());
        Ok(self.verdict.clone())
    }
}
