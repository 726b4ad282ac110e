// ============================================================================
// SECTION 8: CACHE STORE
// ============================================================================
// Bounded, deduplicated, time-bucketed persistence:
//
//   "<prefix>:<YYYY-MM-DD>"        most-recent-first list of stored entries
//   "<prefix>:<YYYY-MM-DD>:seen"   set of record ids present in that list
//
// Both keys share one TTL, refreshed on every append. Every operation
// degrades to a no-op or an empty read when the backend is unreachable;
// callers never see a store error.
// ============================================================================

pub mod backend;
pub mod resp;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, trace, warn};

use crate::config::{RetentionConfig, StoreBackendKind, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::log_store;
use crate::types::{Domain, Record, RecordId, Severity, Timestamp};

pub use backend::{KvBackend, MemoryBackend};
pub use resp::RedisBackend;

// ----------------------------------------------------------------------------
// 8.1 Keys & Entries
// ----------------------------------------------------------------------------

/// `"<prefix>:<YYYY-MM-DD>"` for the UTC day of `ts`.
pub fn bucket_key(prefix: &str, ts: Timestamp) -> String {
    format!("{}:{}", prefix, ts.day_key())
}

/// Seen-set key of a bucket.
pub fn seen_key(bucket: &str) -> String {
    format!("{}:seen", bucket)
}

fn day_bucket(prefix: &str, day: NaiveDate) -> String {
    format!("{}:{}", prefix, day.format("%Y-%m-%d"))
}

/// Parse a window such as `30m`, `1h`, `12h`, `24h` or `7d`.
pub fn parse_window(text: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(text.trim())
}

/// What the store holds for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    pub timestamp: Timestamp,
    pub id: RecordId,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub payload: JsonValue,
}

impl StoredEntry {
    pub fn from_record(record: &Record) -> Self {
        Self {
            timestamp: record.timestamp,
            id: record.id.clone(),
            kind: record.kind.clone(),
            severity: record.severity,
            payload: record.payload.clone(),
        }
    }

    pub fn into_record(self, domain: Domain) -> Record {
        Record {
            id: self.id,
            timestamp: self.timestamp,
            domain,
            kind: self.kind,
            severity: self.severity,
            payload: self.payload,
        }
    }
}

/// Result of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New id, now stored
    Stored,
    /// Id already present in the bucket; nothing written
    Duplicate,
    /// Store disabled or unreachable; nothing written
    Unavailable,
}

// ----------------------------------------------------------------------------
// 8.2 Store Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreStatsTracker {
    stored: AtomicU64,
    duplicates: AtomicU64,
    evicted: AtomicU64,
    degraded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub stored: u64,
    pub duplicates: u64,
    pub evicted: u64,
    pub degraded: u64,
}

// ----------------------------------------------------------------------------
// 8.3 Cache Store
// ----------------------------------------------------------------------------

/// Shared handle to the cache store. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct CacheStore {
    backend: Option<Arc<dyn KvBackend>>,
    retention: RetentionConfig,
    stats: Arc<StoreStatsTracker>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn KvBackend>, retention: RetentionConfig) -> Self {
        Self {
            backend: Some(backend),
            retention,
            stats: Arc::new(StoreStatsTracker::default()),
        }
    }

    /// A store that persists nothing and replays nothing.
    pub fn disabled(retention: RetentionConfig) -> Self {
        Self {
            backend: None,
            retention,
            stats: Arc::new(StoreStatsTracker::default()),
        }
    }

    /// Build from configuration. Only a malformed URL is an error; an
    /// unreachable server is not.
    pub fn from_config(config: &StoreConfig, retention: RetentionConfig) -> StoreResult<Self> {
        if !config.enabled {
            info!(target: "hostd::store", "Store disabled, replay will be empty");
            return Ok(Self::disabled(retention));
        }
        let backend: Arc<dyn KvBackend> = match config.backend {
            StoreBackendKind::Redis => Arc::new(RedisBackend::new(&config.url, config.timeout)?),
            StoreBackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        info!(target: "hostd::store", backend = backend.name(), "Store configured");
        Ok(Self::new(backend, retention))
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn retention(&self) -> &RetentionConfig {
        &self.retention
    }

    /// Whether the backend answers right now.
    pub async fn is_available(&self) -> bool {
        match &self.backend {
            Some(backend) => backend.ping().await.is_ok(),
            None => false,
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            stored: self.stats.stored.load(AtomicOrdering::Relaxed),
            duplicates: self.stats.duplicates.load(AtomicOrdering::Relaxed),
            evicted: self.stats.evicted.load(AtomicOrdering::Relaxed),
            degraded: self.stats.degraded.load(AtomicOrdering::Relaxed),
        }
    }

    fn degraded(&self, operation: &'static str, key: &str, error: &StoreError) {
        self.stats.degraded.fetch_add(1, AtomicOrdering::Relaxed);
        log_store!(operation, error, key = %key);
    }

    /// Store a record in its domain's bucket for the record's day.
    pub async fn record(&self, record: &Record) -> AppendOutcome {
        let key = bucket_key(record.domain.key_prefix(), record.timestamp);
        self.append(&key, record).await
    }

    /// Append a record to a bucket unless its id is already there.
    ///
    /// Trims the bucket to the cap of the record's retention class, removes
    /// the ids of trimmed entries from the seen-set, and refreshes the TTL of
    /// both keys.
    pub async fn append(&self, bucket: &str, record: &Record) -> AppendOutcome {
        let Some(backend) = &self.backend else {
            return AppendOutcome::Unavailable;
        };
        match self.try_append(backend.as_ref(), bucket, record).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.degraded("append", bucket, &error);
                AppendOutcome::Unavailable
            }
        }
    }

    async fn try_append(
        &self,
        backend: &dyn KvBackend,
        bucket: &str,
        record: &Record,
    ) -> StoreResult<AppendOutcome> {
        let policy = self.retention.policy(record.domain.retention_class());
        let seen = seen_key(bucket);
        let id = record.id.as_str();

        let entry = serde_json::to_string(&StoredEntry::from_record(record)).map_err(|e| {
            StoreError::Serialization {
                message: e.to_string(),
            }
        })?;

        // The marker goes in first so a failed push can never leave an entry
        // without one; a failed push takes the marker back out.
        if !backend.sadd(&seen, id).await? {
            self.stats.duplicates.fetch_add(1, AtomicOrdering::Relaxed);
            trace!(target: "hostd::store", key = %bucket, id = %id, "Duplicate suppressed");
            return Ok(AppendOutcome::Duplicate);
        }
        let len = match backend.lpush(bucket, &entry).await {
            Ok(len) => len,
            Err(error) => {
                if let Err(rollback) = backend.srem(&seen, &[id.to_string()]).await {
                    warn!(
                        target: "hostd::store",
                        key = %bucket,
                        id = %id,
                        error = %rollback,
                        "Could not roll back dedup marker"
                    );
                }
                return Err(error);
            }
        };

        let cap = policy.max_per_bucket.max(1);
        if len > cap {
            let evicted = backend.lrange(bucket, cap as isize, -1).await?;
            backend.ltrim(bucket, 0, cap as isize - 1).await?;
            let evicted_ids: Vec<String> = evicted
                .iter()
                .filter_map(|raw| serde_json::from_str::<StoredEntry>(raw).ok())
                .map(|e| e.id.as_str().to_string())
                .filter(|evicted_id| evicted_id != id)
                .collect();
            if !evicted_ids.is_empty() {
                backend.srem(&seen, &evicted_ids).await?;
            }
            self.stats
                .evicted
                .fetch_add(evicted.len() as u64, AtomicOrdering::Relaxed);
        }

        backend.expire(bucket, policy.ttl).await?;
        backend.expire(&seen, policy.ttl).await?;

        self.stats.stored.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(AppendOutcome::Stored)
    }

    /// Entries of `prefix` no older than `window`, ascending by timestamp.
    pub async fn read_window(&self, prefix: &str, window: Duration, per_bucket_limit: usize) -> Vec<StoredEntry> {
        self.read_window_at(prefix, window, per_bucket_limit, Timestamp::now())
            .await
    }

    /// `read_window` with an explicit "now".
    pub async fn read_window_at(
        &self,
        prefix: &str,
        window: Duration,
        per_bucket_limit: usize,
        now: Timestamp,
    ) -> Vec<StoredEntry> {
        let cutoff = now.sub_duration(window);
        let mut entries = self
            .read_buckets(prefix, cutoff, now, per_bucket_limit)
            .await;
        entries.retain(|e| e.timestamp >= cutoff);
        dedup_and_sort(entries)
    }

    /// Entries of `prefix` with `from <= timestamp <= to`, ascending.
    pub async fn read_range(
        &self,
        prefix: &str,
        from: Timestamp,
        to: Timestamp,
        per_bucket_limit: usize,
    ) -> Vec<StoredEntry> {
        if from > to {
            return Vec::new();
        }
        let mut entries = self.read_buckets(prefix, from, to, per_bucket_limit).await;
        entries.retain(|e| e.timestamp >= from && e.timestamp <= to);
        dedup_and_sort(entries)
    }

    /// Most recently appended entry of `prefix` for today, falling back to
    /// yesterday's bucket.
    pub async fn latest(&self, prefix: &str, now: Timestamp) -> Option<StoredEntry> {
        let backend = self.backend.as_ref()?;
        let today = now.to_datetime().date_naive();
        for day in [Some(today), today.pred_opt()].into_iter().flatten() {
            let key = day_bucket(prefix, day);
            match backend.lrange(&key, 0, 0).await {
                Ok(raw) => {
                    if let Some(entry) = raw.first().and_then(|r| serde_json::from_str(r).ok()) {
                        return Some(entry);
                    }
                }
                Err(error) => {
                    self.degraded("latest", &key, &error);
                    return None;
                }
            }
        }
        None
    }

    /// Read every calendar-day bucket intersecting `[from, to]` in parallel.
    async fn read_buckets(
        &self,
        prefix: &str,
        from: Timestamp,
        to: Timestamp,
        per_bucket_limit: usize,
    ) -> Vec<StoredEntry> {
        let Some(backend) = &self.backend else {
            return Vec::new();
        };

        let keys = day_keys_between(prefix, from, to);
        let stop = if per_bucket_limit == 0 {
            -1
        } else {
            per_bucket_limit as isize - 1
        };

        let reads = keys.iter().map(|key| {
            let backend = backend.clone();
            async move { (key, backend.lrange(key, 0, stop).await) }
        });

        let mut entries = Vec::new();
        for (key, result) in join_all(reads).await {
            match result {
                Ok(raw) => entries.extend(
                    raw.iter()
                        .filter_map(|r| serde_json::from_str::<StoredEntry>(r).ok()),
                ),
                Err(error) => self.degraded("read", key, &error),
            }
        }
        entries
    }
}

/// Bucket keys for each UTC day from `from` through `to`.
pub fn day_keys_between(prefix: &str, from: Timestamp, to: Timestamp) -> Vec<String> {
    let mut day = from.to_datetime().date_naive();
    let last = to.to_datetime().date_naive();
    let mut keys = Vec::new();
    while day <= last {
        keys.push(day_bucket(prefix, day));
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    keys
}

fn dedup_and_sort(entries: Vec<StoredEntry>) -> Vec<StoredEntry> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut unique: Vec<StoredEntry> = entries
        .into_iter()
        .filter(|e| seen.insert(e.id.clone()))
        .collect();
    unique.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionPolicy;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Timestamp {
        Timestamp::from_datetime(Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap())
    }

    fn record(n: u64, ts: Timestamp) -> Record {
        Record {
            id: RecordId::new(format!("id-{}", n)),
            timestamp: ts,
            domain: Domain::ContainerEvents,
            kind: "DOCKER_CONTAINER_STARTED".into(),
            severity: Some(Severity::Info),
            payload: json!({ "container": format!("c{}", n) }),
        }
    }

    fn store_with_cap(cap: usize) -> (CacheStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let mut retention = RetentionConfig::default();
        retention.activity = RetentionPolicy {
            ttl: Duration::from_secs(7 * 86_400),
            max_per_bucket: cap,
            lookback: Duration::from_secs(7 * 86_400),
        };
        (CacheStore::new(backend.clone(), retention), backend)
    }

    /// Memory backend whose next `lpush` calls fail.
    #[derive(Debug, Default)]
    struct PushFailing {
        inner: MemoryBackend,
        failing_pushes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl KvBackend for PushFailing {
        fn name(&self) -> &'static str {
            "push-failing"
        }
        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }
        async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.inner.sismember(key, member).await
        }
        async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.inner.sadd(key, member).await
        }
        async fn srem(&self, key: &str, members: &[String]) -> StoreResult<()> {
            self.inner.srem(key, members).await
        }
        async fn lpush(&self, key: &str, value: &str) -> StoreResult<usize> {
            let pending = self.failing_pushes.load(AtomicOrdering::Acquire);
            if pending > 0 {
                self.failing_pushes.store(pending - 1, AtomicOrdering::Release);
                return Err(StoreError::Connection {
                    endpoint: "push-failing".into(),
                    message: "connection reset".into(),
                });
            }
            self.inner.lpush(key, value).await
        }
        async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
            self.inner.lrange(key, start, stop).await
        }
        async fn ltrim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()> {
            self.inner.ltrim(key, start, stop).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.expire(key, ttl).await
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_bucket_keys() {
        let ts = at(2026, 3, 9, 14, 0);
        assert_eq!(bucket_key("activity:docker", ts), "activity:docker:2026-03-09");
        assert_eq!(seen_key("activity:docker:2026-03-09"), "activity:docker:2026-03-09:seen");
        assert_eq!(
            day_keys_between("p", at(2026, 2, 27, 23, 0), at(2026, 3, 1, 1, 0)),
            vec!["p:2026-02-27", "p:2026-02-28", "p:2026-03-01"]
        );
    }

    #[test]
    fn test_parse_window() {
        assert_eq!(parse_window("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_window("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_window("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert!(parse_window("soon").is_err());
    }

    #[tokio::test]
    async fn test_append_sets_ttl_on_both_keys() {
        let (store, backend) = store_with_cap(10);
        let ts = at(2026, 3, 9, 12, 0);
        assert_eq!(store.record(&record(1, ts)).await, AppendOutcome::Stored);
        let key = bucket_key("activity:docker", ts);
        assert!(backend.ttl(&key).unwrap() > Duration::from_secs(6 * 86_400));
        assert!(backend.ttl(&seen_key(&key)).is_some());
    }

    #[tokio::test]
    async fn test_failed_push_leaves_record_retryable() {
        let backend = Arc::new(PushFailing::default());
        backend.failing_pushes.store(1, AtomicOrdering::Release);
        let store = CacheStore::new(backend.clone(), RetentionConfig::default());
        let ts = at(2026, 3, 9, 12, 0);
        let key = bucket_key("activity:docker", ts);

        assert_eq!(store.record(&record(1, ts)).await, AppendOutcome::Unavailable);
        assert!(!backend.sismember(&seen_key(&key), "id-1").await.unwrap());
        assert!(backend.lrange(&key, 0, -1).await.unwrap().is_empty());

        // Replay after reconnect stores exactly once.
        assert_eq!(store.record(&record(1, ts)).await, AppendOutcome::Stored);
        assert_eq!(store.record(&record(1, ts)).await, AppendOutcome::Duplicate);
        assert_eq!(backend.lrange(&key, 0, -1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_growth_keeps_most_recent() {
        let (store, backend) = store_with_cap(5);
        let base = at(2026, 3, 9, 12, 0);
        for n in 0..8u64 {
            store
                .record(&record(n, base.add_duration(Duration::from_secs(n))))
                .await;
        }
        let key = bucket_key("activity:docker", base);
        let raw = backend.lrange(&key, 0, -1).await.unwrap();
        assert_eq!(raw.len(), 5);
        let ids: Vec<String> = raw
            .iter()
            .map(|r| serde_json::from_str::<StoredEntry>(r).unwrap().id.to_string())
            .collect();
        assert_eq!(ids, vec!["id-7", "id-6", "id-5", "id-4", "id-3"]);

        // Evicted ids left the seen-set, so they can be stored again.
        assert!(!backend.sismember(&seen_key(&key), "id-0").await.unwrap());
        assert!(backend.sismember(&seen_key(&key), "id-7").await.unwrap());
        assert_eq!(store.stats().evicted, 3);
    }

    #[tokio::test]
    async fn test_window_correctness() {
        let (store, _) = store_with_cap(100);
        let now = at(2026, 3, 9, 12, 0);
        let old = now.sub_duration(Duration::from_secs(25 * 3600));
        let inside = now.sub_duration(Duration::from_secs(3600));
        store.record(&record(1, old)).await;
        store.record(&record(2, inside)).await;

        let entries = store
            .read_window_at("activity:docker", Duration::from_secs(86_400), 0, now)
            .await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id.as_str(), "id-2");
        assert!(entries.iter().all(|e| e.timestamp >= now.sub_duration(Duration::from_secs(86_400))));
    }

    #[tokio::test]
    async fn test_multi_day_merge_is_chronological() {
        let (store, _) = store_with_cap(100);
        // Appended out of order across the midnight boundary.
        let times = [
            (1, at(2026, 3, 9, 0, 5)),
            (2, at(2026, 3, 8, 23, 50)),
            (3, at(2026, 3, 9, 0, 1)),
            (4, at(2026, 3, 8, 23, 55)),
        ];
        for (n, ts) in times {
            store.record(&record(n, ts)).await;
        }
        let entries = store
            .read_window_at("activity:docker", Duration::from_secs(3600), 0, at(2026, 3, 9, 0, 30))
            .await;
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["id-2", "id-4", "id-3", "id-1"]);
    }

    #[tokio::test]
    async fn test_read_dedups_across_buckets() {
        let (store, backend) = store_with_cap(100);
        let ts = at(2026, 3, 9, 0, 1);
        let rec = record(9, ts);
        store.record(&rec).await;
        // Same id landed in yesterday's bucket as well.
        let raw = serde_json::to_string(&StoredEntry::from_record(&rec)).unwrap();
        backend.lpush("activity:docker:2026-03-08", &raw).await.unwrap();

        let entries = store
            .read_window_at("activity:docker", Duration::from_secs(7200), 0, at(2026, 3, 9, 1, 0))
            .await;
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_read_range_bounds() {
        let (store, _) = store_with_cap(100);
        for n in 0..6u64 {
            store.record(&record(n, at(2026, 3, 9, n as u32, 0))).await;
        }
        let entries = store
            .read_range("activity:docker", at(2026, 3, 9, 2, 0), at(2026, 3, 9, 4, 0), 0)
            .await;
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["id-2", "id-3", "id-4"]);
    }

    #[tokio::test]
    async fn test_per_bucket_limit_reads_most_recent() {
        let (store, _) = store_with_cap(100);
        for n in 0..10u64 {
            store.record(&record(n, at(2026, 3, 9, 1, n as u32))).await;
        }
        let entries = store
            .read_window_at("activity:docker", Duration::from_secs(86_400), 3, at(2026, 3, 9, 2, 0))
            .await;
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["id-7", "id-8", "id-9"]);
    }

    #[tokio::test]
    async fn test_unavailable_backend_degrades() {
        let (store, backend) = store_with_cap(10);
        backend.set_available(false);
        let ts = at(2026, 3, 9, 12, 0);
        assert_eq!(store.record(&record(1, ts)).await, AppendOutcome::Unavailable);
        assert!(store
            .read_window_at("activity:docker", Duration::from_secs(3600), 0, ts)
            .await
            .is_empty());
        assert!(store.latest("activity:docker", ts).await.is_none());
        assert!(!store.is_available().await);
        assert!(store.stats().degraded >= 2);
    }

    #[tokio::test]
    async fn test_disabled_store() {
        let store = CacheStore::disabled(RetentionConfig::default());
        let ts = Timestamp::now();
        assert_eq!(store.record(&record(1, ts)).await, AppendOutcome::Unavailable);
        assert!(store.read_window("activity:docker", Duration::from_secs(60), 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_latest_falls_back_to_yesterday() {
        let (store, _) = store_with_cap(10);
        let mut rec = record(1, at(2026, 3, 8, 23, 59));
        rec.domain = Domain::Metrics;
        store.record(&rec).await;
        let latest = store.latest("metrics:host", at(2026, 3, 9, 0, 0)).await.unwrap();
        assert_eq!(latest.id.as_str(), "id-1");
    }

    proptest! {
        #[test]
        fn prop_append_is_idempotent(repeats in 1usize..12, n in 0u64..1000) {
            runtime().block_on(async {
                let (store, backend) = store_with_cap(50);
                let ts = at(2026, 3, 9, 12, 0);
                let rec = record(n, ts);
                let mut outcomes = Vec::new();
                for _ in 0..repeats {
                    outcomes.push(store.record(&rec).await);
                }
                let key = bucket_key("activity:docker", ts);
                let stored = backend.lrange(&key, 0, -1).await.unwrap();
                prop_assert_eq!(stored.len(), 1);
                prop_assert_eq!(outcomes[0], AppendOutcome::Stored);
                prop_assert!(outcomes[1..].iter().all(|o| *o == AppendOutcome::Duplicate));
                Ok(())
            })?;
        }

        #[test]
        fn prop_bucket_never_exceeds_cap(cap in 1usize..20, extra in 0usize..20) {
            runtime().block_on(async {
                let (store, backend) = store_with_cap(cap);
                let ts = at(2026, 3, 9, 12, 0);
                for n in 0..(cap + extra) as u64 {
                    store.record(&record(n, ts.add_duration(Duration::from_millis(n)))).await;
                }
                let key = bucket_key("activity:docker", ts);
                let stored = backend.lrange(&key, 0, -1).await.unwrap();
                prop_assert_eq!(stored.len(), cap);
                let newest: StoredEntry = serde_json::from_str(&stored[0]).unwrap();
                prop_assert_eq!(newest.id.to_string(), format!("id-{}", cap + extra - 1));
                Ok(())
            })?;
        }

        #[test]
        fn prop_window_is_sorted_unique_and_bounded(offsets in prop::collection::vec(0u64..(3 * 86_400), 1..40)) {
            runtime().block_on(async {
                let (store, _) = store_with_cap(1000);
                let now = at(2026, 3, 9, 12, 0);
                for (n, secs) in offsets.iter().enumerate() {
                    let rec = record(n as u64, now.sub_duration(Duration::from_secs(*secs)));
                    store.record(&rec).await;
                    store.record(&rec).await;
                }
                let window = Duration::from_secs(86_400);
                let entries = store.read_window_at("activity:docker", window, 0, now).await;
                let expected = offsets.iter().filter(|s| **s <= 86_400).count();
                prop_assert_eq!(entries.len(), expected);
                prop_assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
                prop_assert!(entries.iter().all(|e| e.timestamp >= now.sub_duration(window)));
                Ok(())
            })?;
        }
    }
}
