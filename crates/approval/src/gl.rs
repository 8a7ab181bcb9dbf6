use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use tally_core::{Clock, GlEntry};

use crate::client::{ApprovalApi, GlQuery};
use crate::ApprovalError;

struct CacheSlot {
    fetched_at: DateTime<Utc>,
    entries: Vec<GlEntry>,
}

/// Windowed GL pulls with a short-TTL advisory cache keyed by the full
/// query tuple. Misses always go to the service; the cache only saves
/// repeat lookups within a batch.
pub struct GlFetcher {
    api: Arc<dyn ApprovalApi>,
    cache: RwLock<HashMap<String, CacheSlot>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl GlFetcher {
    pub fn new(api: Arc<dyn ApprovalApi>, ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            api,
            cache: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs as i64),
            clock,
        }
    }

    pub async fn get_gl_entries(&self, query: &GlQuery) -> Result<Vec<GlEntry>, ApprovalError> {
        let key = query.cache_key();
        let now = self.clock.now();

        {
            let cache = self.cache.read().await;
            if let Some(slot) = cache.get(&key) {
                if now - slot.fetched_at < self.ttl {
                    return Ok(slot.entries.clone());
                }
            }
        }

        let entries = self.api.get_gl_entries(query).await?;

        let mut cache = self.cache.write().await;
        cache.retain(|_, slot| now - slot.fetched_at < self.ttl);
        cache.insert(
            key,
            CacheSlot {
                fetched_at: now,
                entries: entries.clone(),
            },
        );
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        BatchAck, BatchPayload, EnrichmentPayload, NewPattern, SuggestionAck, SuggestionPayload,
        SuggestionRecord,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tally_core::{FrozenClock, Pattern};

    struct CountingApi {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ApprovalApi for CountingApi {
        async fn submit_suggestion(
            &self,
            _s: &SuggestionPayload,
        ) -> Result<SuggestionAck, ApprovalError> {
            unimplemented!()
        }
        async fn submit_batch(&self, _b: &BatchPayload) -> Result<BatchAck, ApprovalError> {
            unimplemented!()
        }
        async fn get_suggestion(&self, _id: &str) -> Result<SuggestionRecord, ApprovalError> {
            unimplemented!()
        }
        async fn reviewed_since(
            &self,
            _since: Option<&str>,
        ) -> Result<Vec<SuggestionRecord>, ApprovalError> {
            unimplemented!()
        }
        async fn get_gl_entries(&self, query: &GlQuery) -> Result<Vec<GlEntry>, ApprovalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![GlEntry {
                transaction_id: "INV-1".into(),
                line_id: 1,
                transaction_type: "VendBill".into(),
                date: query.start,
                amount: Decimal::new(1_000, 2),
                currency: "EUR".into(),
                account_id: 1100,
                account_name: "Accounts Payable".into(),
                entity_id: 7,
                entity_name: "Ombori AG".into(),
                memo: None,
                is_reconciled: false,
            }])
        }
        async fn list_patterns(&self, _active_only: bool) -> Result<Vec<Pattern>, ApprovalError> {
            unimplemented!()
        }
        async fn create_pattern(&self, _p: &NewPattern) -> Result<String, ApprovalError> {
            unimplemented!()
        }
        async fn enrich(&self, _p: &EnrichmentPayload) -> Result<bool, ApprovalError> {
            unimplemented!()
        }
    }

    fn query() -> GlQuery {
        GlQuery {
            subsidiary_id: 7,
            start: Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 3, 17, 0, 0, 0).unwrap(),
            account_types: vec![],
            unreconciled_only: true,
        }
    }

    #[tokio::test]
    async fn second_fetch_within_ttl_hits_cache() {
        let api = Arc::new(CountingApi {
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(FrozenClock::new(
            Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap(),
        ));
        let fetcher = GlFetcher::new(api.clone(), 600, clock.clone());

        fetcher.get_gl_entries(&query()).await.unwrap();
        fetcher.get_gl_entries(&query()).await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        // Past the TTL the cache is stale and the service is hit again.
        clock.advance(Duration::seconds(601));
        fetcher.get_gl_entries(&query()).await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn different_tuples_do_not_share_slots() {
        let api = Arc::new(CountingApi {
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(FrozenClock::new(Utc::now()));
        let fetcher = GlFetcher::new(api.clone(), 600, clock);

        fetcher.get_gl_entries(&query()).await.unwrap();
        let mut other = query();
        other.subsidiary_id = 8;
        fetcher.get_gl_entries(&other).await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }
}
