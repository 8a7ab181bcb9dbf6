use serde_json::json;

/// Fire-and-forget webhook notifications. Delivery problems are logged and
/// swallowed; reconciliation never fails because a message did not post.
pub struct SlackNotifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
}

impl SlackNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    async fn post(&self, text: String) {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("slack webhook not configured, dropping notification");
            return;
        };

        let result = self.http.post(url).json(&json!({ "text": text })).send().await;
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(status = %response.status(), "slack webhook rejected notification");
            }
            Err(e) => tracing::warn!(error = %e, "failed to post slack notification"),
            Ok(_) => {}
        }
    }

    /// Per-batch summary with counts by outcome.
    pub async fn batch_summary(
        &self,
        entity: &str,
        processed: usize,
        submitted: usize,
        auto_approved: usize,
        unmatched: usize,
        quarantined: usize,
    ) {
        self.post(format!(
            ":bank: Reconciliation batch for *{entity}*: {processed} processed, \
             {submitted} submitted, {auto_approved} auto-approved, \
             {unmatched} unmatched, {quarantined} quarantined",
        ))
        .await;
    }

    /// Raised when a batch quarantines more records than the configured
    /// threshold, or a single large amount fails to match.
    pub async fn discrepancy_alert(&self, entity: &str, detail: &str) {
        self.post(format!(
            ":rotating_light: Reconciliation discrepancy for *{entity}*: {detail}"
        ))
        .await;
    }

    /// Fatal auth problems page the on-call channel.
    pub async fn auth_failure(&self, entity: &str, error: &str) {
        self.post(format!(
            ":lock: Bank authentication failed for *{entity}*: {error}; cursor not advanced"
        ))
        .await;
    }

    /// Morning digest of pending approvals, broken down by entity.
    pub async fn daily_digest(&self, pending_total: i64, by_entity: &[(String, i64)]) {
        let mut lines: Vec<String> = by_entity
            .iter()
            .map(|(entity, count)| format!("• {entity}: {count}"))
            .collect();
        if lines.is_empty() {
            lines.push("No pending items".to_string());
        }
        self.post(format!(
            ":newspaper: Daily reconciliation digest: {pending_total} pending approvals\n{}",
            lines.join("\n")
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_webhook_is_a_quiet_no_op() {
        let notifier = SlackNotifier::disabled();
        notifier.batch_summary("Phygrid Limited", 10, 8, 2, 0, 0).await;
        notifier.discrepancy_alert("Phygrid Limited", "6 quarantined").await;
        notifier.daily_digest(0, &[]).await;
    }

    #[tokio::test]
    async fn unreachable_webhook_does_not_error() {
        let notifier = SlackNotifier::new(Some("http://slack.invalid/hook".into()));
        notifier.auth_failure("Ombori AG", "token rejected").await;
    }
}
