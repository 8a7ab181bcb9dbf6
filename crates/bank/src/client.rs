use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

use tally_core::Clock;

use crate::retry::{RateLimiter, RetryPolicy};
use crate::sca::{ScaSession, ScaSigner, SessionCache};
use crate::statement::{Statement, WireBalance, WireProfile};
use crate::BankError;

/// Longest statement window the bank accepts.
pub const MAX_STATEMENT_DAYS: i64 = 469;

/// Read-only client for the bank API: profiles, balances and per-balance
/// statements, with the second-factor handshake handled transparently.
pub struct BankClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    signer: Option<ScaSigner>,
    sessions: SessionCache,
    limiter: RateLimiter,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl BankClient {
    pub fn new(
        base_url: &str,
        token: &str,
        signer: Option<ScaSigner>,
        session_ttl_secs: u64,
        rate_per_sec: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            signer,
            sessions: SessionCache::new(session_ttl_secs),
            limiter: RateLimiter::new(rate_per_sec),
            retry: RetryPolicy::default(),
            clock,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_key_file(
        base_url: &str,
        token: &str,
        key_path: Option<&Path>,
        session_ttl_secs: u64,
        rate_per_sec: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BankError> {
        let signer = key_path.map(ScaSigner::from_pem_file).transpose()?;
        Ok(Self::new(
            base_url,
            token,
            signer,
            session_ttl_secs,
            rate_per_sec,
            clock,
        ))
    }

    /// Business profiles visible to the token.
    pub async fn list_profiles(&self) -> Result<Vec<WireProfile>, BankError> {
        let profiles: Vec<WireProfile> = self.get_json("/v2/profiles", 0).await?;
        Ok(profiles
            .into_iter()
            .filter(|p| p.kind == "BUSINESS")
            .collect())
    }

    pub async fn list_balances(&self, profile_id: i64) -> Result<Vec<WireBalance>, BankError> {
        self.get_json(
            &format!("/v4/profiles/{profile_id}/balances?types=STANDARD"),
            profile_id,
        )
        .await
    }

    /// Statement for one balance over `[start, end]`. Requires the signed
    /// second-factor handshake; windows beyond the provider limit are
    /// rejected up front.
    pub async fn get_statement(
        &self,
        profile_id: i64,
        balance_id: i64,
        currency: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Statement, BankError> {
        if (end - start).num_days() > MAX_STATEMENT_DAYS {
            return Err(BankError::RangeTooLarge);
        }

        let path = format!(
            "/v1/profiles/{profile_id}/balance-statements/{balance_id}/statement.json?currency={currency}&intervalStart={}&intervalEnd={}&type=COMPACT",
            start.to_rfc3339_opts(SecondsFormat::Millis, true),
            end.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        self.get_statement_with_sca(profile_id, &path).await
    }

    // ── Plain requests ────────────────────────────────────────────────────────

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        rate_key: i64,
    ) -> Result<T, BankError> {
        if self.token.is_empty() {
            return Err(BankError::AuthRequired("no API token configured".into()));
        }

        let mut attempt = 0;
        loop {
            self.limiter.acquire(rate_key).await;
            match self.try_get_json(path).await {
                Err(err @ BankError::Transient(_)) if attempt + 1 < self.retry.max_attempts => {
                    tracing::warn!(path, attempt, error = %err, "transient bank error, retrying");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BankError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| BankError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BankError::Transient(format!("server error: {status}")));
        }
        if status.as_u16() == 401 {
            return Err(BankError::AuthRequired("token rejected".into()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BankError::Fatal {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| BankError::Decode(e.to_string()))
    }

    // ── SCA-protected requests ────────────────────────────────────────────────

    /// The profile's session slot stays locked across the whole exchange,
    /// so concurrent callers coalesce onto one handshake and reuse the
    /// winner's session afterwards.
    async fn get_statement_with_sca(
        &self,
        profile_id: i64,
        path: &str,
    ) -> Result<Statement, BankError> {
        if self.token.is_empty() {
            return Err(BankError::AuthRequired("no API token configured".into()));
        }

        let slot = self.sessions.slot(profile_id).await;
        let mut session = slot.lock().await;

        let mut attempt = 0;
        loop {
            match self.try_statement(profile_id, path, &mut session).await {
                Err(err @ BankError::Transient(_)) if attempt + 1 < self.retry.max_attempts => {
                    tracing::warn!(
                        profile_id,
                        attempt,
                        error = %err,
                        "transient statement error, retrying"
                    );
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_statement(
        &self,
        profile_id: i64,
        path: &str,
        session: &mut Option<ScaSession>,
    ) -> Result<Statement, BankError> {
        self.limiter.acquire(profile_id).await;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.get(&url).bearer_auth(&self.token);
        if let Some(current) = session
            .as_ref()
            .filter(|s| self.sessions.is_fresh(s, self.clock.now()))
        {
            request = request
                .header("x-2fa-approval", &current.ott)
                .header("X-Signature", &current.signature);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BankError::Transient(e.to_string()))?;
        let status = response.status();

        if status.as_u16() == 403 {
            let Some(ott) = response
                .headers()
                .get("x-2fa-approval")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            else {
                let body = response.text().await.unwrap_or_default();
                return Err(BankError::Fatal { status: 403, body });
            };

            // Challenge: sign the one-time token and retry once with the
            // signed pair. Success establishes the session for this profile.
            *session = None;
            let signer = self
                .signer
                .as_ref()
                .ok_or_else(|| BankError::AuthRequired("no signing key configured".into()))?;
            let signature = signer.sign(&ott)?;

            self.limiter.acquire(profile_id).await;
            let retried = self
                .http
                .get(&url)
                .bearer_auth(&self.token)
                .header("x-2fa-approval", &ott)
                .header("X-Signature", &signature)
                .send()
                .await
                .map_err(|e| BankError::Transient(e.to_string()))?;

            let retried_status = retried.status();
            if retried_status.is_success() {
                *session = Some(ScaSession {
                    ott,
                    signature,
                    obtained_at: self.clock.now(),
                });
                return retried
                    .json()
                    .await
                    .map_err(|e| BankError::Decode(e.to_string()));
            }
            if retried_status.as_u16() == 403 {
                return Err(BankError::AuthRequired(
                    "signed second-factor retry was rejected".into(),
                ));
            }
            if retried_status.is_server_error() {
                return Err(BankError::Transient(format!(
                    "server error: {retried_status}"
                )));
            }
            let body = retried.text().await.unwrap_or_default();
            return Err(BankError::Fatal {
                status: retried_status.as_u16(),
                body,
            });
        }

        if status.as_u16() == 404 {
            // Balance without statement data in the window.
            return Ok(Statement::default());
        }
        if status.is_server_error() {
            return Err(BankError::Transient(format!("server error: {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BankError::Fatal {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| BankError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tally_core::FrozenClock;

    fn client() -> BankClient {
        let clock = Arc::new(FrozenClock::new(
            Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap(),
        ));
        BankClient::new("http://bank.invalid", "token", None, 300, 1000.0, clock).with_retry(
            RetryPolicy {
                base: std::time::Duration::from_millis(1),
                cap: std::time::Duration::from_millis(2),
                max_attempts: 1,
            },
        )
    }

    #[tokio::test]
    async fn statement_window_of_469_days_is_accepted_470_rejected() {
        let c = client();
        let end = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();

        // 470 days fails before any network activity.
        let result = c
            .get_statement(1, 2, "EUR", end - Duration::days(470), end)
            .await;
        assert!(matches!(result, Err(BankError::RangeTooLarge)));

        // 469 days passes validation; the unreachable host then surfaces
        // as a transient error rather than a range error.
        let result = c
            .get_statement(1, 2, "EUR", end - Duration::days(469), end)
            .await;
        assert!(matches!(result, Err(BankError::Transient(_))));
    }

    #[tokio::test]
    async fn missing_token_is_auth_required() {
        let clock = Arc::new(FrozenClock::new(Utc::now()));
        let c = BankClient::new("http://bank.invalid", "", None, 300, 1000.0, clock);
        assert!(matches!(
            c.list_profiles().await,
            Err(BankError::AuthRequired(_))
        ));
    }
}
