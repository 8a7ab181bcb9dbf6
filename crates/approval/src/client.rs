use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use tally_core::{GlEntry, Pattern, PatternKind, TargetKind};

use crate::ApprovalError;
use tally_bank::RetryPolicy;

/// A reconciliation suggestion as submitted to the approval service.
/// `wise_transaction_id` doubles as the idempotency key: resubmitting the
/// same transaction is a server-side no-op.
#[derive(Debug, Clone, Serialize)]
pub struct SuggestionPayload {
    pub wise_transaction_id: String,
    pub wise_profile_id: i64,
    pub entity_name: String,
    pub transaction_date: String,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_type: String,
    pub match_type: String,
    pub confidence_score: Decimal,
    pub recommended_action: String,
    pub description: Option<String>,
    pub counterparty: Option<String>,
    pub match_reasons: Vec<String>,
    pub netsuite_transaction_id: Option<String>,
    pub netsuite_line_id: Option<i64>,
    pub netsuite_type: Option<String>,
    pub suggested_account_id: Option<i64>,
    pub suggested_account_name: Option<String>,
    pub is_intercompany: bool,
    pub counterparty_entity: Option<String>,
    pub llm_model: Option<String>,
    pub llm_prompt_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuggestionAck {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPayload {
    pub entity_name: String,
    pub start_date: String,
    pub end_date: String,
    pub suggestions: Vec<SuggestionPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchAck {
    pub batch_id: String,
    pub count: i64,
}

/// Review state of a suggestion, as read back from the service.
#[derive(Debug, Clone, Deserialize)]
pub struct SuggestionRecord {
    pub id: String,
    pub status: String,
    pub wise_transaction_id: String,
    #[serde(default)]
    pub netsuite_transaction_id: Option<String>,
    #[serde(default)]
    pub suggested_account_id: Option<i64>,
    #[serde(default)]
    pub suggested_account_name: Option<String>,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub reviewed_at: Option<String>,
}

impl SuggestionRecord {
    pub fn is_approved(&self) -> bool {
        matches!(self.status.as_str(), "approved" | "auto_approved")
    }

    pub fn is_rejected(&self) -> bool {
        self.status == "rejected"
    }
}

#[derive(Debug, Clone)]
pub struct GlQuery {
    pub subsidiary_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub account_types: Vec<String>,
    pub unreconciled_only: bool,
}

impl GlQuery {
    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.subsidiary_id,
            self.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.end.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.account_types.join(","),
            self.unreconciled_only,
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPattern {
    pub pattern_type: String,
    pub pattern_value: String,
    pub is_regex: bool,
    pub target_type: String,
    pub target_netsuite_id: String,
    pub target_name: String,
    pub description: Option<String>,
}

/// Enrichment delivered once a match is confirmed; only non-null fields
/// travel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_iban: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_rate: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fees: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_intercompany: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ic_entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_last4: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentPayload {
    pub netsuite_transaction_id: String,
    pub wise_transaction_id: String,
    pub enrichment_data: EnrichmentData,
}

/// The approval-service surface the pipeline needs. Tests substitute an
/// in-memory implementation.
#[async_trait]
pub trait ApprovalApi: Send + Sync {
    async fn submit_suggestion(
        &self,
        suggestion: &SuggestionPayload,
    ) -> Result<SuggestionAck, ApprovalError>;

    async fn submit_batch(&self, batch: &BatchPayload) -> Result<BatchAck, ApprovalError>;

    async fn get_suggestion(&self, id: &str) -> Result<SuggestionRecord, ApprovalError>;

    /// Suggestions reviewed after `since`, oldest first. Feeds the
    /// learning loop's poll cursor.
    async fn reviewed_since(
        &self,
        since: Option<&str>,
    ) -> Result<Vec<SuggestionRecord>, ApprovalError>;

    async fn get_gl_entries(&self, query: &GlQuery) -> Result<Vec<GlEntry>, ApprovalError>;

    async fn list_patterns(&self, active_only: bool) -> Result<Vec<Pattern>, ApprovalError>;

    async fn create_pattern(&self, pattern: &NewPattern) -> Result<String, ApprovalError>;

    async fn enrich(&self, payload: &EnrichmentPayload) -> Result<bool, ApprovalError>;
}

// ── HTTP implementation ───────────────────────────────────────────────────────

pub struct HttpApprovalClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl HttpApprovalClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ApprovalError> {
        let mut attempt = 0;
        loop {
            let mut request = self
                .http
                .request(method.clone(), format!("{}{}", self.base_url, path))
                .header("X-API-Key", &self.api_key);
            if let Some(body) = &body {
                request = request.json(body);
            }

            let outcome = match request.send().await {
                Err(e) => Err(ApprovalError::Transient(e.to_string())),
                Ok(response) if response.status().is_server_error() => Err(
                    ApprovalError::Transient(format!("server error: {}", response.status())),
                ),
                Ok(response) => Ok(response),
            };

            match outcome {
                Err(err) if attempt + 1 < self.retry.max_attempts => {
                    tracing::warn!(path, attempt, error = %err, "transient approval-service error, retrying");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn json_or_error<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApprovalError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApprovalError::Api {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| ApprovalError::Decode(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct Items<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WirePattern {
    id: String,
    pattern_type: String,
    pattern_value: String,
    #[serde(default)]
    is_regex: bool,
    target_type: String,
    target_netsuite_id: String,
    target_name: String,
    #[serde(default)]
    is_auto_approve: bool,
    #[serde(default)]
    confidence_boost: Option<Decimal>,
    #[serde(default)]
    times_used: i64,
    #[serde(default)]
    times_approved: i64,
    #[serde(default)]
    times_rejected: i64,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

impl WirePattern {
    fn into_domain(self) -> Result<Pattern, ApprovalError> {
        Ok(Pattern {
            regex: self.is_regex.then(|| self.pattern_value.clone()),
            kind: PatternKind::from_str(&self.pattern_type).map_err(ApprovalError::Decode)?,
            target_kind: TargetKind::from_str(&self.target_type).map_err(ApprovalError::Decode)?,
            id: self.id,
            value: self.pattern_value,
            target_id: self.target_netsuite_id,
            target_name: self.target_name,
            auto_approve: self.is_auto_approve,
            boost: self.confidence_boost.unwrap_or_else(|| Decimal::new(10, 2)),
            times_used: self.times_used,
            times_approved: self.times_approved,
            times_rejected: self.times_rejected,
            active: self.is_active,
        })
    }
}

#[async_trait]
impl ApprovalApi for HttpApprovalClient {
    async fn submit_suggestion(
        &self,
        suggestion: &SuggestionPayload,
    ) -> Result<SuggestionAck, ApprovalError> {
        let response = self
            .request(
                reqwest::Method::POST,
                "/api/recon/suggestions",
                Some(serde_json::to_value(suggestion).map_err(|e| ApprovalError::Decode(e.to_string()))?),
            )
            .await?;

        // A duplicate submission is success: the service echoes the
        // canonical suggestion it already holds.
        if response.status().as_u16() == 409 {
            return response
                .json()
                .await
                .map_err(|e| ApprovalError::Decode(format!("duplicate ack: {e}")));
        }
        Self::json_or_error(response).await
    }

    async fn submit_batch(&self, batch: &BatchPayload) -> Result<BatchAck, ApprovalError> {
        let response = self
            .request(
                reqwest::Method::POST,
                "/api/recon/suggestions/batch",
                Some(serde_json::to_value(batch).map_err(|e| ApprovalError::Decode(e.to_string()))?),
            )
            .await?;
        Self::json_or_error(response).await
    }

    async fn get_suggestion(&self, id: &str) -> Result<SuggestionRecord, ApprovalError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/recon/suggestions/{id}"),
                None,
            )
            .await?;
        Self::json_or_error(response).await
    }

    async fn reviewed_since(
        &self,
        since: Option<&str>,
    ) -> Result<Vec<SuggestionRecord>, ApprovalError> {
        let path = match since {
            Some(since) => format!(
                "/api/recon/suggestions?reviewed=true&reviewed_since={}",
                urlencode(since)
            ),
            None => "/api/recon/suggestions?reviewed=true".to_string(),
        };
        let response = self.request(reqwest::Method::GET, &path, None).await?;
        let items: Items<SuggestionRecord> = Self::json_or_error(response).await?;
        Ok(items.items)
    }

    async fn get_gl_entries(&self, query: &GlQuery) -> Result<Vec<GlEntry>, ApprovalError> {
        let mut path = format!(
            "/api/recon/gl-entries?subsidiary_id={}&start_date={}&end_date={}&unreconciled_only={}",
            query.subsidiary_id,
            query.start.date_naive(),
            query.end.date_naive(),
            query.unreconciled_only,
        );
        if !query.account_types.is_empty() {
            path.push_str(&format!(
                "&account_types={}",
                urlencode(&query.account_types.join(","))
            ));
        }

        let response = self.request(reqwest::Method::GET, &path, None).await?;
        let items: Items<GlEntry> = Self::json_or_error(response).await?;
        Ok(items.items)
    }

    async fn list_patterns(&self, active_only: bool) -> Result<Vec<Pattern>, ApprovalError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/recon/patterns?active_only={active_only}"),
                None,
            )
            .await?;
        let items: Items<WirePattern> = Self::json_or_error(response).await?;
        items.items.into_iter().map(WirePattern::into_domain).collect()
    }

    async fn create_pattern(&self, pattern: &NewPattern) -> Result<String, ApprovalError> {
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let response = self
            .request(
                reqwest::Method::POST,
                "/api/recon/patterns",
                Some(serde_json::to_value(pattern).map_err(|e| ApprovalError::Decode(e.to_string()))?),
            )
            .await?;
        let created: Created = Self::json_or_error(response).await?;
        Ok(created.id)
    }

    async fn enrich(&self, payload: &EnrichmentPayload) -> Result<bool, ApprovalError> {
        #[derive(Deserialize)]
        struct Outcome {
            #[serde(default)]
            success: bool,
        }
        let response = self
            .request(
                reqwest::Method::POST,
                "/api/recon/enrich",
                Some(serde_json::to_value(payload).map_err(|e| ApprovalError::Decode(e.to_string()))?),
            )
            .await?;
        let outcome: Outcome = Self::json_or_error(response).await?;
        Ok(outcome.success)
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrichment_omits_null_fields() {
        let payload = EnrichmentPayload {
            netsuite_transaction_id: "INV-7788".into(),
            wise_transaction_id: "TRANSFER-100".into(),
            enrichment_data: EnrichmentData {
                counterparty_name: Some("Acme Ltd".into()),
                fx_rate: Some(Decimal::new(102, 2)),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        let data = &json["enrichment_data"];
        assert_eq!(data["counterparty_name"], "Acme Ltd");
        assert_eq!(data["fx_rate"], "1.02");
        assert!(data.get("merchant_name").is_none());
        assert!(data.get("fees").is_none());
    }

    #[test]
    fn wire_pattern_maps_to_domain() {
        let wire = WirePattern {
            id: "p1".into(),
            pattern_type: "reference".into(),
            pattern_value: "INV-.*".into(),
            is_regex: true,
            target_type: "account".into(),
            target_netsuite_id: "1100".into(),
            target_name: "Accounts Payable".into(),
            is_auto_approve: false,
            confidence_boost: Some(Decimal::new(20, 2)),
            times_used: 4,
            times_approved: 4,
            times_rejected: 0,
            is_active: true,
        };
        let pattern = wire.into_domain().unwrap();
        assert_eq!(pattern.kind, PatternKind::Reference);
        assert_eq!(pattern.regex.as_deref(), Some("INV-.*"));
        assert_eq!(pattern.boost, Decimal::new(20, 2));
    }

    #[test]
    fn gl_query_cache_key_is_stable() {
        use chrono::TimeZone;
        let query = GlQuery {
            subsidiary_id: 7,
            start: Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 3, 17, 0, 0, 0).unwrap(),
            account_types: vec!["Bank".into()],
            unreconciled_only: true,
        };
        assert_eq!(query.cache_key(), query.cache_key());
        let mut other = query.clone();
        other.unreconciled_only = false;
        assert_ne!(query.cache_key(), other.cache_key());
    }

    #[test]
    fn suggestion_serializes_decimals_as_strings() {
        let payload = SuggestionPayload {
            wise_transaction_id: "TRANSFER-100".into(),
            wise_profile_id: 19,
            entity_name: "Phygrid Limited".into(),
            transaction_date: "2025-03-10".into(),
            amount: Decimal::new(123_456, 2),
            currency: "EUR".into(),
            transaction_type: "TRANSFER".into(),
            match_type: "exact".into(),
            confidence_score: Decimal::new(100, 2),
            recommended_action: "auto_approve".into(),
            description: None,
            counterparty: None,
            match_reasons: vec!["amount-exact".into()],
            netsuite_transaction_id: Some("INV-7788".into()),
            netsuite_line_id: Some(1),
            netsuite_type: Some("VendBill".into()),
            suggested_account_id: Some(1100),
            suggested_account_name: Some("Accounts Payable".into()),
            is_intercompany: false,
            counterparty_entity: None,
            llm_model: None,
            llm_prompt_version: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["amount"], "1234.56");
        assert_eq!(json["confidence_score"], "1.00");
    }
}
