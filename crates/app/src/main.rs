use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use tally_approval::{GlFetcher, HttpApprovalClient, SlackNotifier};
use tally_bank::BankClient;
use tally_core::{Clock, Settings, SystemClock};
use tally_match::{Embedder, HttpEmbedder, HttpLlmScorer, LlmScorer, PatternIndex};
use tally_recon::{LearningLoop, Orchestrator, OrchestratorConfig, Scheduler, SyncService};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TALLY_CONFIG").ok())
        .unwrap_or_else(|| "tally.toml".to_string());
    let settings = Settings::load(&PathBuf::from(&config_path))
        .unwrap_or_else(|e| panic!("failed to load config {config_path}: {e}"));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let entities = Arc::new(settings.entity_map());
    if entities.is_empty() {
        tracing::warn!("no entities configured; nothing will sync");
    }

    let db = tally_storage::create_db(&settings.database.path)
        .await
        .expect("failed to open database");

    let bank = Arc::new(
        BankClient::with_key_file(
            &settings.bank.api_base,
            &settings.bank.token,
            settings.bank.private_key_path.as_deref(),
            settings.session.ttl_secs,
            settings.bank.rate_per_sec,
            clock.clone(),
        )
        .expect("failed to construct bank client"),
    );

    let approval = Arc::new(HttpApprovalClient::new(
        &settings.approval.base_url,
        &settings.approval.api_key,
    ));
    let gl = Arc::new(GlFetcher::new(
        approval.clone(),
        settings.gl.cache_ttl_secs,
        clock.clone(),
    ));
    let slack = Arc::new(SlackNotifier::new(settings.slack.webhook_url.clone()));

    // Rebuild the in-process vector index from the persisted patterns.
    let index = Arc::new(PatternIndex::new(settings.pattern.similarity_min as f32));
    let stored = tally_storage::load_active_patterns(&db)
        .await
        .expect("failed to load patterns");
    for (pattern, vector) in stored {
        if !vector.is_empty() {
            index.insert(&pattern.id, pattern.boost, vector);
        }
    }
    tracing::info!(patterns = index.len(), "pattern index ready");

    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(
        &settings.embedder.api_base,
        &settings.embedder.api_key,
        &settings.embedder.model,
        settings.embedder.dimension,
    ));
    let llm: Option<Arc<dyn LlmScorer>> = (settings.llm.enabled && !settings.llm.api_key.is_empty())
        .then(|| {
            Arc::new(HttpLlmScorer::new(
                &settings.llm.api_base,
                &settings.llm.api_key,
                &settings.llm.model,
            )) as Arc<dyn LlmScorer>
        });
    if llm.is_none() {
        tracing::info!("llm matching disabled");
    }

    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        gl,
        approval.clone(),
        index.clone(),
        embedder.clone(),
        llm,
        entities.clone(),
        slack.clone(),
        clock.clone(),
        OrchestratorConfig {
            max_tx_per_run: settings.batch.max_tx_per_run,
            date_window_days: settings.matching.date_window_days,
            fuzzy_similarity_min: settings.matching.fuzzy_similarity_min,
            worker_pool: settings.batch.worker_pool,
            lease_ttl_secs: settings.batch.lease_ttl_secs,
            tx_deadline_secs: settings.batch.tx_deadline_secs,
            batch_deadline_secs: settings.batch.deadline_secs,
            quarantine_alert_threshold: settings.slack.quarantine_alert_threshold,
            large_amount_threshold: rust_decimal::Decimal::try_from(
                settings.slack.large_amount_threshold,
            )
            .unwrap_or_default(),
        },
    ));
    let sync = Arc::new(SyncService::new(
        bank,
        db.clone(),
        entities.clone(),
        clock.clone(),
    ));
    let learning = Arc::new(LearningLoop::new(
        db.clone(),
        approval,
        index,
        embedder,
        entities.clone(),
        clock.clone(),
    ));

    let scheduler = Scheduler::new(
        &settings.scheduler.cron,
        settings.slack.digest_hour,
        clock.clone(),
    )
    .expect("invalid scheduler.cron expression");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(cron = %settings.scheduler.cron, "scheduler starting");
    let db_for_digest = db.clone();
    let slack_for_digest = slack.clone();
    let entities_for_digest = entities.clone();
    scheduler
        .run(
            || {
                let sync = sync.clone();
                let orchestrator = orchestrator.clone();
                let learning = learning.clone();
                let slack = slack.clone();
                async move {
                    for (entity, result) in sync.sync_all().await {
                        if let Err(e) = result {
                            tracing::error!(entity = %entity, error = %e, "sync failed");
                            if let tally_recon::ReconError::Bank(bank_err) = &e {
                                if bank_err.is_fatal_for_batch() {
                                    slack.auth_failure(&entity, &bank_err.to_string()).await;
                                }
                            }
                        }
                    }
                    orchestrator.run_all().await;
                    if let Err(e) = learning.poll_once().await {
                        tracing::error!(error = %e, "learning poll failed");
                    }
                }
            },
            || {
                let db = db_for_digest.clone();
                let slack = slack_for_digest.clone();
                let entities = entities_for_digest.clone();
                async move {
                    let mut by_entity = Vec::new();
                    let mut total = 0;
                    for entity in entities.entities() {
                        match tally_storage::count_by_status(&db, &entity.display_name).await {
                            Ok(counts) => {
                                let pending = counts
                                    .iter()
                                    .filter(|(status, _)| status == "submitted")
                                    .map(|(_, n)| n)
                                    .sum::<i64>();
                                if pending > 0 {
                                    total += pending;
                                    by_entity.push((entity.display_name.clone(), pending));
                                }
                            }
                            Err(e) => tracing::error!(error = %e, "digest count failed"),
                        }
                    }
                    slack.daily_digest(total, &by_entity).await;
                }
            },
            shutdown_rx,
        )
        .await;

    tracing::info!("shut down cleanly");
}
