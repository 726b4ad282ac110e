// ============================================================================
// SECTION 13: SUBSCRIPTION BRIDGE
// ============================================================================
// Per streaming request, "recent history + live present" without gaps and
// without duplicates:
//
//   1. attach to the domain's live feed (buffering starts here)
//   2. wait for the start gate (opened once the ack is queued)
//   3. read the store window and emit it oldest first
//   4. forward buffered and new live records, skipping ids already replayed
//
// Attaching before the store read closes the window in which a record could
// be stored after the read but published before the attach.
// ============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collectors::FeedHub;
use crate::error::ResourceError;
use crate::lifecycle::Resource;
use crate::protocol::StreamEmitter;
use crate::store::CacheStore;
use crate::types::{Domain, Record, RecordId};

pub const HISTORY_KIND: &str = "history";
pub const LIVE_KIND: &str = "live";
pub const SYNCED_KIND: &str = "synced";
pub const LAGGED_KIND: &str = "lagged";

// ----------------------------------------------------------------------------
// 13.1 Request
// ----------------------------------------------------------------------------

/// Only records whose payload `field` equals `value` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub field: &'static str,
    pub value: String,
}

impl RecordFilter {
    pub fn new(field: &'static str, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.payload_str(self.field) == Some(self.value.as_str())
    }
}

/// What one subscription replays and follows.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub domain: Domain,
    pub window: Duration,
    /// Entries read per day bucket, 0 for all
    pub per_bucket_limit: usize,
    pub filters: Vec<RecordFilter>,
}

impl BridgeRequest {
    pub fn new(domain: Domain, window: Duration) -> Self {
        Self {
            domain,
            window,
            per_bucket_limit: 0,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filters.push(filter);
        self
    }

    fn admits(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }
}

// ----------------------------------------------------------------------------
// 13.2 Subscription
// ----------------------------------------------------------------------------

/// A live subscription, owned by one request id.
#[derive(Debug)]
pub struct Subscription {
    gate: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Attach to the live feed now and prepare the replay. Nothing is
    /// emitted until `start`.
    pub fn attach(store: CacheStore, feeds: &FeedHub, request: BridgeRequest, emitter: StreamEmitter) -> Self {
        let live = feeds.subscribe(request.domain);
        let (gate_tx, gate_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(store, live, request, emitter, gate_rx, cancel.clone()));

        Self {
            gate: Some(gate_tx),
            cancel,
            task: Some(task),
        }
    }
}

impl Resource for Subscription {
    fn kind(&self) -> &'static str {
        "subscription"
    }

    fn start(&mut self) {
        if let Some(gate) = self.gate.take() {
            let _ = gate.send(());
        }
    }

    fn cleanup(&mut self) -> Result<(), ResourceError> {
        self.gate = None;
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

async fn run(
    store: CacheStore,
    mut live: broadcast::Receiver<Arc<Record>>,
    request: BridgeRequest,
    emitter: StreamEmitter,
    gate: oneshot::Receiver<()>,
    cancel: CancellationToken,
) {
    tokio::select! {
        opened = gate => {
            if opened.is_err() {
                return;
            }
        }
        _ = cancel.cancelled() => return,
    }

    tokio::select! {
        _ = stream(&store, &mut live, &request, &emitter) => {}
        _ = cancel.cancelled() => {}
    }
    debug!(target: "hostd::bridge", id = %emitter.id(), domain = %request.domain, "Subscription ended");
}

async fn stream(
    store: &CacheStore,
    live: &mut broadcast::Receiver<Arc<Record>>,
    request: &BridgeRequest,
    emitter: &StreamEmitter,
) {
    let prefix = request.domain.key_prefix();
    let entries = store
        .read_window(prefix, request.window, request.per_bucket_limit)
        .await;

    let mut replayed: HashSet<RecordId> = HashSet::with_capacity(entries.len());
    let mut sent = 0usize;
    for entry in entries {
        let record = entry.into_record(request.domain);
        replayed.insert(record.id.clone());
        if !request.admits(&record) {
            continue;
        }
        if !emitter.emit(HISTORY_KIND, json!({ "record": record })).await {
            return;
        }
        sent += 1;
    }

    if !emitter.emit(SYNCED_KIND, json!({ "replayed": sent })).await {
        return;
    }
    debug!(target: "hostd::bridge", id = %emitter.id(), domain = %request.domain, replayed = sent, "Replay complete, following live");

    loop {
        match live.recv().await {
            Ok(record) => {
                if replayed.contains(&record.id) || !request.admits(&record) {
                    continue;
                }
                if !emitter.emit(LIVE_KIND, json!({ "record": &*record })).await {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(target: "hostd::bridge", id = %emitter.id(), missed = missed, "Subscriber fell behind the live feed");
                if !emitter.emit(LAGGED_KIND, json!({ "missed": missed })).await {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testing::memory_recorder;
    use crate::protocol::Outbound;
    use crate::types::{RecordId, Timestamp};
    use pretty_assertions::assert_eq;
    use serde_json::Value as JsonValue;
    use tokio::sync::mpsc;

    fn record(id: &str, ago_secs: u64, container: &str) -> Record {
        Record {
            id: RecordId::new(id),
            timestamp: Timestamp::now().sub_duration(Duration::from_secs(ago_secs)),
            domain: Domain::ContainerEvents,
            kind: "DOCKER_CONTAINER_STARTED".into(),
            severity: None,
            payload: json!({ "container": container }),
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Outbound>) -> (String, JsonValue) {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Outbound::Stream { data, .. })) => {
                (data["kind"].as_str().unwrap_or_default().to_string(), data)
            }
            other => panic!("expected a stream chunk, got {:?}", other),
        }
    }

    fn record_id(data: &JsonValue) -> &str {
        data["record"]["id"].as_str().unwrap()
    }

    #[tokio::test]
    async fn test_replay_then_live_without_duplicates() {
        let (sink, _) = memory_recorder();
        sink.record(record("old-2", 20, "web")).await;
        sink.record(record("old-1", 30, "web")).await;

        let (tx, mut rx) = mpsc::channel(32);
        let emitter = StreamEmitter::new("r1", "docker.events", tx);
        let request = BridgeRequest::new(Domain::ContainerEvents, Duration::from_secs(3600));
        let mut sub = Subscription::attach(sink.store().clone(), sink.feeds(), request, emitter);

        // Stored and published between attach and the replay read.
        sink.record(record("mid", 10, "web")).await;
        // Nothing flows before the gate opens.
        assert!(rx.try_recv().is_err());

        sub.start();
        let mut history = Vec::new();
        loop {
            let (kind, data) = next(&mut rx).await;
            if kind == SYNCED_KIND {
                assert_eq!(data["replayed"], 3);
                break;
            }
            assert_eq!(kind, HISTORY_KIND);
            history.push(record_id(&data).to_string());
        }
        assert_eq!(history, vec!["old-1", "old-2", "mid"]);

        sink.record(record("new", 0, "web")).await;
        let (kind, data) = next(&mut rx).await;
        assert_eq!(kind, LIVE_KIND);
        // "mid" was buffered live but already replayed.
        assert_eq!(record_id(&data), "new");

        sub.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_empty_cache_replays_nothing_then_live() {
        let (sink, _) = memory_recorder();
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = StreamEmitter::new("r2", "docker.events", tx);
        let mut sub = Subscription::attach(
            sink.store().clone(),
            sink.feeds(),
            BridgeRequest::new(Domain::ContainerEvents, Duration::from_secs(3600)),
            emitter,
        );
        sub.start();

        let (kind, data) = next(&mut rx).await;
        assert_eq!(kind, SYNCED_KIND);
        assert_eq!(data["replayed"], 0);

        sink.record(record("first", 0, "web")).await;
        let (kind, data) = next(&mut rx).await;
        assert_eq!(kind, LIVE_KIND);
        assert_eq!(record_id(&data), "first");
        sub.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_filter_applies_to_replay_and_live() {
        let (sink, _) = memory_recorder();
        sink.record(record("a", 5, "web")).await;
        sink.record(record("b", 4, "db")).await;

        let (tx, mut rx) = mpsc::channel(8);
        let request = BridgeRequest::new(Domain::ContainerEvents, Duration::from_secs(3600))
            .with_filter(RecordFilter::new("container", "db"));
        let mut sub = Subscription::attach(sink.store().clone(), sink.feeds(), request, StreamEmitter::new("r3", "s", tx));
        sub.start();

        let (_, data) = next(&mut rx).await;
        assert_eq!(record_id(&data), "b");
        let (kind, data) = next(&mut rx).await;
        assert_eq!(kind, SYNCED_KIND);
        assert_eq!(data["replayed"], 1);

        sink.record(record("c", 0, "web")).await;
        sink.record(record("d", 0, "db")).await;
        let (_, data) = next(&mut rx).await;
        assert_eq!(record_id(&data), "d");
        sub.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_detaches_from_feed() {
        let (sink, _) = memory_recorder();
        let (tx, _rx) = mpsc::channel(8);
        let mut sub = Subscription::attach(
            sink.store().clone(),
            sink.feeds(),
            BridgeRequest::new(Domain::AuthLog, Duration::from_secs(60)),
            StreamEmitter::new("r4", "ssh.events", tx),
        );
        assert_eq!(sink.feeds().subscriber_count(Domain::AuthLog), 1);

        sub.cleanup().unwrap();
        sub.cleanup().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.feeds().subscriber_count(Domain::AuthLog), 0);
    }

    #[tokio::test]
    async fn test_store_down_still_streams_live() {
        let (sink, backend) = memory_recorder();
        backend.set_available(false);
        let (tx, mut rx) = mpsc::channel(8);
        let mut sub = Subscription::attach(
            sink.store().clone(),
            sink.feeds(),
            BridgeRequest::new(Domain::ContainerEvents, Duration::from_secs(60)),
            StreamEmitter::new("r5", "docker.events", tx),
        );
        sub.start();
        assert_eq!(next(&mut rx).await.0, SYNCED_KIND);
        sink.record(record("x", 0, "web")).await;
        assert_eq!(next(&mut rx).await.0, LIVE_KIND);
        sub.cleanup().unwrap();
    }
}
