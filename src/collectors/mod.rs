// ============================================================================
// SECTION 9: COLLECTOR FRAMEWORK
// ============================================================================
// Long-lived background producers, one per data domain:
// - lifecycle (idempotent start, stop that releases subprocesses)
// - health and statistics per collector
// - live feed fan-out per domain
// - the recorder: store first, then publish new records live
//
// Collectors run for the whole agent lifetime whether or not anyone is
// subscribed. Only stop() ends a collector loop.
// ============================================================================

pub mod auth_log;
pub mod container_logs;
pub mod docker_events;
pub mod resources;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::constants::LIVE_FEED_CAPACITY;
use crate::error::{CollectorError, CollectorResult};
use crate::store::{AppendOutcome, CacheStore};
use crate::types::{Domain, Record, Timestamp};

pub use auth_log::AuthLogCollector;
pub use container_logs::ContainerLogsCollector;
pub use docker_events::DockerEventsCollector;
pub use resources::ResourceCollector;

// ----------------------------------------------------------------------------
// 9.1 Collector Trait
// ----------------------------------------------------------------------------

/// A long-lived producer of records for one or more domains.
#[async_trait]
pub trait Collector: Send + Sync + Debug {
    /// Unique name of this collector.
    fn name(&self) -> &str;

    /// Domains this collector writes. No two collectors share a domain.
    fn domains(&self) -> &'static [Domain];

    /// Start producing into `sink`. Calling start on a running collector is
    /// a no-op.
    async fn start(&mut self, sink: Recorder) -> CollectorResult<()>;

    /// Stop producing and release anything spawned.
    async fn stop(&mut self) -> CollectorResult<()>;

    fn is_running(&self) -> bool;

    fn health(&self) -> CollectorHealth;

    fn stats(&self) -> CollectorStats;
}

// ----------------------------------------------------------------------------
// 9.2 Collector Health & Statistics
// ----------------------------------------------------------------------------

/// Health status of a collector.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorHealth {
    pub status: CollectorStatus,
    pub last_success: Option<Timestamp>,
    pub last_error: Option<Timestamp>,
    pub last_error_message: Option<String>,
    pub consecutive_failures: u32,
    pub latency_ms: u64,
}

impl Default for CollectorHealth {
    fn default() -> Self {
        Self {
            status: CollectorStatus::Unknown,
            last_success: None,
            last_error: None,
            last_error_message: None,
            consecutive_failures: 0,
            latency_ms: 0,
        }
    }
}

/// Collector operational status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorStatus {
    /// Cycles are succeeding
    Healthy,
    /// Recent cycles failed, still retrying
    Degraded,
    /// Three or more consecutive failures, still retrying
    Failed,
    Stopped,
    Initializing,
    Unknown,
}

/// Statistics for a collector.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorStats {
    /// Records handed to the store
    pub records_produced: u64,
    /// Records newly stored
    pub records_stored: u64,
    /// Records the store already had
    pub duplicates_suppressed: u64,
    pub collection_cycles: u64,
    pub errors: u64,
    pub avg_cycle_us: u64,
    pub max_cycle_us: u64,
    pub started_at: Option<Timestamp>,
    pub uptime_secs: u64,
}

/// Tracks collector statistics with atomic operations.
#[derive(Debug)]
struct CollectorStatsTracker {
    records_produced: AtomicU64,
    records_stored: AtomicU64,
    duplicates_suppressed: AtomicU64,
    collection_cycles: AtomicU64,
    errors: AtomicU64,
    total_cycle_us: AtomicU64,
    max_cycle_us: AtomicU64,
    started_at: RwLock<Option<Timestamp>>,
}

impl CollectorStatsTracker {
    fn new() -> Self {
        Self {
            records_produced: AtomicU64::new(0),
            records_stored: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            collection_cycles: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_cycle_us: AtomicU64::new(0),
            max_cycle_us: AtomicU64::new(0),
            started_at: RwLock::new(None),
        }
    }

    fn record_cycle(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.collection_cycles.fetch_add(1, AtomicOrdering::Relaxed);
        self.total_cycle_us.fetch_add(us, AtomicOrdering::Relaxed);
        self.max_cycle_us.fetch_max(us, AtomicOrdering::Relaxed);
    }

    fn record_outcome(&self, outcome: AppendOutcome) {
        self.records_produced.fetch_add(1, AtomicOrdering::Relaxed);
        match outcome {
            AppendOutcome::Stored => {
                self.records_stored.fetch_add(1, AtomicOrdering::Relaxed);
            }
            AppendOutcome::Duplicate => {
                self.duplicates_suppressed.fetch_add(1, AtomicOrdering::Relaxed);
            }
            AppendOutcome::Unavailable => {}
        }
    }

    fn snapshot(&self) -> CollectorStats {
        let cycles = self.collection_cycles.load(AtomicOrdering::Relaxed);
        let total_us = self.total_cycle_us.load(AtomicOrdering::Relaxed);
        let started = *self.started_at.read();

        CollectorStats {
            records_produced: self.records_produced.load(AtomicOrdering::Relaxed),
            records_stored: self.records_stored.load(AtomicOrdering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(AtomicOrdering::Relaxed),
            collection_cycles: cycles,
            errors: self.errors.load(AtomicOrdering::Relaxed),
            avg_cycle_us: if cycles > 0 { total_us / cycles } else { 0 },
            max_cycle_us: self.max_cycle_us.load(AtomicOrdering::Relaxed),
            started_at: started,
            uptime_secs: started
                .map(|s| Timestamp::now().duration_since(s).as_secs())
                .unwrap_or(0),
        }
    }
}

/// Health and statistics shared between a collector and its loop task.
#[derive(Debug)]
pub struct CollectorMonitor {
    health: RwLock<CollectorHealth>,
    stats: CollectorStatsTracker,
}

impl CollectorMonitor {
    pub(crate) fn new() -> Self {
        Self {
            health: RwLock::new(CollectorHealth::default()),
            stats: CollectorStatsTracker::new(),
        }
    }

    /// Record a successful cycle.
    pub fn record_success(&self, duration: Duration) {
        self.stats.record_cycle(duration);

        let mut health = self.health.write();
        health.status = CollectorStatus::Healthy;
        health.last_success = Some(Timestamp::now());
        health.consecutive_failures = 0;
        health.latency_ms = duration.as_millis() as u64;
    }

    /// Record a failed cycle.
    pub fn record_error(&self, error: &str) {
        self.stats.errors.fetch_add(1, AtomicOrdering::Relaxed);

        let mut health = self.health.write();
        health.last_error = Some(Timestamp::now());
        health.last_error_message = Some(error.to_string());
        health.consecutive_failures += 1;

        if health.consecutive_failures >= 3 {
            health.status = CollectorStatus::Failed;
        } else {
            health.status = CollectorStatus::Degraded;
        }
    }

    /// Hand a record to the sink and count what happened to it.
    pub async fn emit(&self, sink: &Recorder, record: Record) -> AppendOutcome {
        let outcome = sink.record(record).await;
        self.stats.record_outcome(outcome);
        outcome
    }

    fn set_status(&self, status: CollectorStatus) {
        self.health.write().status = status;
    }

    pub fn health(&self) -> CollectorHealth {
        self.health.read().clone()
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats.snapshot()
    }
}

// ----------------------------------------------------------------------------
// 9.3 Base Collector
// ----------------------------------------------------------------------------

/// Lifecycle plumbing shared by every collector.
#[derive(Debug)]
pub struct BaseCollector {
    name: &'static str,
    running: AtomicBool,
    shutdown: CancellationToken,
    monitor: Arc<CollectorMonitor>,
    task: Option<JoinHandle<()>>,
}

impl BaseCollector {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            monitor: Arc::new(CollectorMonitor::new()),
            task: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    /// Claim the running state. `None` when already running; otherwise a
    /// fresh shutdown token for the new loop.
    pub fn begin(&mut self) -> Option<CancellationToken> {
        if self
            .running
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return None;
        }
        self.shutdown = CancellationToken::new();
        *self.monitor.stats.started_at.write() = Some(Timestamp::now());
        self.monitor.set_status(CollectorStatus::Initializing);
        Some(self.shutdown.clone())
    }

    pub fn monitor(&self) -> Arc<CollectorMonitor> {
        self.monitor.clone()
    }

    pub fn set_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// Cancel the loop and wait for it to release its resources.
    pub async fn halt(&mut self) {
        self.shutdown.cancel();
        self.running.store(false, AtomicOrdering::Release);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(target: "hostd::collector", collector = self.name, error = %e, "Collector task panicked");
                }
            }
        }
        self.monitor.set_status(CollectorStatus::Stopped);
    }

    pub fn health(&self) -> CollectorHealth {
        self.monitor.health()
    }

    pub fn stats(&self) -> CollectorStats {
        self.monitor.stats()
    }
}

// ----------------------------------------------------------------------------
// 9.4 Live Feeds
// ----------------------------------------------------------------------------

/// One broadcast feed per domain. Subscribers that fall more than the
/// capacity behind lose the oldest records and are told so.
#[derive(Debug, Clone)]
pub struct FeedHub {
    feeds: Arc<HashMap<Domain, broadcast::Sender<Arc<Record>>>>,
}

impl FeedHub {
    pub fn new(capacity: usize) -> Self {
        let feeds = Domain::ALL
            .iter()
            .map(|domain| (*domain, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self {
            feeds: Arc::new(feeds),
        }
    }

    /// Attach to a domain's live feed. Only records published after this
    /// call are delivered.
    pub fn subscribe(&self, domain: Domain) -> broadcast::Receiver<Arc<Record>> {
        match self.feeds.get(&domain) {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, record: Arc<Record>) -> usize {
        self.feeds
            .get(&record.domain)
            .and_then(|sender| sender.send(record).ok())
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, domain: Domain) -> usize {
        self.feeds
            .get(&domain)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new(LIVE_FEED_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// 9.5 Recorder
// ----------------------------------------------------------------------------

/// Where collectors put records: the store first, then the live feed.
///
/// A record the store already holds is not published again, so a retried
/// collector cycle never reaches subscribers twice. When the store is
/// unavailable the record still goes live.
#[derive(Debug, Clone)]
pub struct Recorder {
    store: CacheStore,
    feeds: FeedHub,
}

impl Recorder {
    pub fn new(store: CacheStore, feeds: FeedHub) -> Self {
        Self { store, feeds }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn feeds(&self) -> &FeedHub {
        &self.feeds
    }

    pub async fn record(&self, record: Record) -> AppendOutcome {
        let outcome = self.store.record(&record).await;
        if outcome != AppendOutcome::Duplicate {
            self.feeds.publish(Arc::new(record));
        }
        outcome
    }
}

// ----------------------------------------------------------------------------
// 9.6 Collector Registry
// ----------------------------------------------------------------------------

type SharedCollector = Arc<TokioRwLock<Box<dyn Collector>>>;

/// Point-in-time view of one collector for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorReport {
    pub name: String,
    pub running: bool,
    pub domains: Vec<Domain>,
    pub health: CollectorHealth,
    pub stats: CollectorStats,
}

/// Registry for managing all collectors.
#[derive(Debug)]
pub struct CollectorRegistry {
    collectors: DashMap<String, SharedCollector>,
    sink: Recorder,
}

impl CollectorRegistry {
    pub fn new(sink: Recorder) -> Self {
        Self {
            collectors: DashMap::new(),
            sink,
        }
    }

    pub fn register<C: Collector + 'static>(&self, collector: C) {
        let name = collector.name().to_string();
        self.collectors
            .insert(name, Arc::new(TokioRwLock::new(Box::new(collector))));
    }

    pub fn get(&self, name: &str) -> Option<SharedCollector> {
        self.collectors.get(name).map(|c| c.clone())
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collectors.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    pub async fn start_collector(&self, name: &str) -> CollectorResult<()> {
        let collector = self.get(name).ok_or_else(|| CollectorError::NotFound {
            name: name.to_string(),
        })?;
        collector.write().await.start(self.sink.clone()).await?;
        info!(target: "hostd::collector", name = name, "Collector started");
        Ok(())
    }

    pub async fn stop_collector(&self, name: &str) -> CollectorResult<()> {
        let collector = self.get(name).ok_or_else(|| CollectorError::NotFound {
            name: name.to_string(),
        })?;
        collector.write().await.stop().await?;
        info!(target: "hostd::collector", name = name, "Collector stopped");
        Ok(())
    }

    pub async fn start_all(&self) -> Vec<(String, CollectorResult<()>)> {
        let mut results = Vec::new();
        for name in self.list() {
            let result = self.start_collector(&name).await;
            results.push((name, result));
        }
        results
    }

    pub async fn stop_all(&self) {
        for name in self.list() {
            if let Err(e) = self.stop_collector(&name).await {
                warn!(target: "hostd::collector", name = %name, error = %e, "Collector stop failed");
            }
        }
    }

    pub async fn reports(&self) -> Vec<CollectorReport> {
        let mut reports = Vec::with_capacity(self.collectors.len());
        for name in self.list() {
            let Some(collector) = self.get(&name) else {
                continue;
            };
            let guard = collector.read().await;
            reports.push(CollectorReport {
                name,
                running: guard.is_running(),
                domains: guard.domains().to_vec(),
                health: guard.health(),
                stats: guard.stats(),
            });
        }
        reports
    }
}


#[cfg(test)]
mod tests {
    use super::testing::memory_recorder;
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(id: &str) -> Record {
        Record {
            id: crate::types::RecordId::new(id),
            timestamp: Timestamp::now(),
            domain: Domain::ContainerEvents,
            kind: "DOCKER_CONTAINER_STARTED".into(),
            severity: None,
            payload: json!({}),
        }
    }

    #[derive(Debug)]
    struct IdleCollector {
        base: BaseCollector,
        starts: u32,
    }

    #[async_trait]
    impl Collector for IdleCollector {
        fn name(&self) -> &str {
            self.base.name()
        }

        fn domains(&self) -> &'static [Domain] {
            &[Domain::ContainerEvents]
        }

        async fn start(&mut self, _sink: Recorder) -> CollectorResult<()> {
            let Some(token) = self.base.begin() else {
                return Ok(());
            };
            self.starts += 1;
            self.base.set_task(tokio::spawn(async move { token.cancelled().await }));
            Ok(())
        }

        async fn stop(&mut self) -> CollectorResult<()> {
            self.base.halt().await;
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.base.is_running()
        }

        fn health(&self) -> CollectorHealth {
            self.base.health()
        }

        fn stats(&self) -> CollectorStats {
            self.base.stats()
        }
    }

    #[test]
    fn test_monitor_failure_escalation() {
        let monitor = CollectorMonitor::new();
        monitor.record_error("boom");
        assert_eq!(monitor.health().status, CollectorStatus::Degraded);
        monitor.record_error("boom");
        monitor.record_error("boom");
        assert_eq!(monitor.health().status, CollectorStatus::Failed);
        assert_eq!(monitor.health().consecutive_failures, 3);

        monitor.record_success(Duration::from_millis(4));
        let health = monitor.health();
        assert_eq!(health.status, CollectorStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(monitor.stats().errors, 3);
        assert_eq!(monitor.stats().collection_cycles, 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_releases() {
        let (sink, _) = memory_recorder();
        let registry = CollectorRegistry::new(sink);
        registry.register(IdleCollector {
            base: BaseCollector::new("idle"),
            starts: 0,
        });

        registry.start_collector("idle").await.unwrap();
        registry.start_collector("idle").await.unwrap();
        {
            let shared = registry.get("idle").unwrap();
            let guard = shared.read().await;
            assert!(guard.is_running());
        }

        registry.stop_all().await;
        let reports = registry.reports().await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].running);
        assert_eq!(reports[0].health.status, CollectorStatus::Stopped);

        // Restart after stop spawns a fresh loop.
        registry.start_collector("idle").await.unwrap();
        assert!(registry.reports().await[0].running);
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_unknown_collector() {
        let (sink, _) = memory_recorder();
        let registry = CollectorRegistry::new(sink);
        assert!(matches!(
            registry.start_collector("nope").await,
            Err(CollectorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_recorder_publishes_only_new_records() {
        let (sink, _) = memory_recorder();
        let mut live = sink.feeds().subscribe(Domain::ContainerEvents);

        assert_eq!(sink.record(record("a")).await, AppendOutcome::Stored);
        assert_eq!(sink.record(record("a")).await, AppendOutcome::Duplicate);
        assert_eq!(sink.record(record("b")).await, AppendOutcome::Stored);

        assert_eq!(live.recv().await.unwrap().id.as_str(), "a");
        assert_eq!(live.recv().await.unwrap().id.as_str(), "b");
        assert!(live.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recorder_publishes_when_store_down() {
        let (sink, backend) = memory_recorder();
        backend.set_available(false);
        let mut live = sink.feeds().subscribe(Domain::ContainerEvents);
        assert_eq!(sink.record(record("x")).await, AppendOutcome::Unavailable);
        assert_eq!(live.recv().await.unwrap().id.as_str(), "x");
    }

    #[test]
    fn test_feed_hub_routes_by_domain() {
        let hub = FeedHub::new(8);
        let _a = hub.subscribe(Domain::AuthLog);
        let _b = hub.subscribe(Domain::AuthLog);
        assert_eq!(hub.subscriber_count(Domain::AuthLog), 2);
        assert_eq!(hub.subscriber_count(Domain::Metrics), 0);
        assert_eq!(hub.publish(Arc::new(record("r"))), 0);
    }
}
