//! Key-value backends for the cache store.
//!
//! The cache store only needs list, set and TTL primitives with Redis
//! semantics, so every backend speaks that vocabulary.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};

/// List/set/TTL primitives with Redis semantics. Negative list indices count
/// from the tail.
#[async_trait]
pub trait KvBackend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Add `member`, returning `true` when it was not already present.
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn srem(&self, key: &str, members: &[String]) -> StoreResult<()>;

    /// Insert at the head, returning the new length.
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<usize>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;
}

/// Resolve a Redis-style inclusive `[start, stop]` range against `len`.
pub(crate) fn resolve_range(start: isize, stop: isize, len: usize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

// ----------------------------------------------------------------------------
// In-process backend
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum MemValue {
    List(VecDeque<String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct MemEntry {
    value: MemValue,
    expires_at: Option<Instant>,
}

impl MemEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Default interval between full sweeps of expired keys.
const MEMORY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-process backend with lazy expiry. Used by tests and by single-host
/// deployments that do not run a Redis server.
///
/// Keys that are never touched again (yesterday's buckets) are reclaimed by a
/// periodic sweep piggybacked on writes.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: DashMap<String, MemEntry>,
    available: AtomicBool,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_sweep_interval(MEMORY_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Simulate an outage: every call fails until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::Release);
    }

    /// Remaining TTL of a key, if one is set.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn key_count(&self) -> usize {
        self.purge_expired();
        self.entries.len()
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(AtomicOrdering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Connection {
                endpoint: "memory".into(),
                message: "backend marked unavailable".into(),
            })
        }
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| !e.is_expired(now));
    }

    /// Purge every expired key once per sweep interval.
    fn maybe_sweep(&self) {
        let now = Instant::now();
        {
            let mut last = self.last_sweep.lock();
            if now.saturating_duration_since(*last) < self.sweep_interval {
                return;
            }
            *last = now;
        }
        self.purge_expired();
    }

    fn drop_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, e| e.is_expired(now));
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::Server {
            message: format!("WRONGTYPE key '{}' holds the wrong kind of value", key),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check()?;
        self.drop_if_expired(key);
        match self.entries.get(key).as_deref() {
            None => Ok(false),
            Some(MemEntry { value: MemValue::Set(set), .. }) => Ok(set.contains(member)),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check()?;
        self.drop_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| MemEntry {
            value: MemValue::Set(HashSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            MemValue::Set(set) => Ok(set.insert(member.to_string())),
            MemValue::List(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, members: &[String]) -> StoreResult<()> {
        self.check()?;
        if let Some(mut entry) = self.entries.get_mut(key) {
            match &mut entry.value {
                MemValue::Set(set) => {
                    for member in members {
                        set.remove(member);
                    }
                }
                MemValue::List(_) => return Err(Self::wrong_type(key)),
            }
        }
        self.entries.remove_if(key, |_, e| matches!(&e.value, MemValue::Set(s) if s.is_empty()));
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.check()?;
        self.maybe_sweep();
        self.drop_if_expired(key);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| MemEntry {
            value: MemValue::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            MemValue::List(list) => {
                list.push_front(value.to_string());
                Ok(list.len())
            }
            MemValue::Set(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.check()?;
        self.drop_if_expired(key);
        match self.entries.get(key).as_deref() {
            None => Ok(Vec::new()),
            Some(MemEntry { value: MemValue::List(list), .. }) => {
                Ok(match resolve_range(start, stop, list.len()) {
                    Some((from, to)) => list.range(from..=to).cloned().collect(),
                    None => Vec::new(),
                })
            }
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()> {
        self.check()?;
        if let Some(mut entry) = self.entries.get_mut(key) {
            match &mut entry.value {
                MemValue::List(list) => match resolve_range(start, stop, list.len()) {
                    Some((from, to)) => {
                        list.truncate(to + 1);
                        list.drain(..from);
                    }
                    None => list.clear(),
                },
                MemValue::Set(_) => return Err(Self::wrong_type(key)),
            }
        }
        self.entries.remove_if(key, |_, e| matches!(&e.value, MemValue::List(l) if l.is_empty()));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(0, -1, 5), Some((0, 4)));
        assert_eq!(resolve_range(0, 2, 5), Some((0, 2)));
        assert_eq!(resolve_range(3, -1, 5), Some((3, 4)));
        assert_eq!(resolve_range(0, 100, 5), Some((0, 4)));
        assert_eq!(resolve_range(5, -1, 5), None);
        assert_eq!(resolve_range(0, -1, 0), None);
        assert_eq!(resolve_range(-2, -1, 5), Some((3, 4)));
    }

    #[tokio::test]
    async fn test_list_semantics() {
        let backend = MemoryBackend::new();
        for v in ["a", "b", "c", "d"] {
            backend.lpush("k", v).await.unwrap();
        }
        assert_eq!(backend.lrange("k", 0, -1).await.unwrap(), vec!["d", "c", "b", "a"]);
        assert_eq!(backend.lrange("k", 2, -1).await.unwrap(), vec!["b", "a"]);
        backend.ltrim("k", 0, 1).await.unwrap();
        assert_eq!(backend.lrange("k", 0, -1).await.unwrap(), vec!["d", "c"]);
    }

    #[tokio::test]
    async fn test_set_semantics_and_wrong_type() {
        let backend = MemoryBackend::new();
        assert!(backend.sadd("s", "x").await.unwrap());
        assert!(!backend.sadd("s", "x").await.unwrap());
        assert!(backend.sismember("s", "x").await.unwrap());
        backend.srem("s", &["x".to_string()]).await.unwrap();
        assert!(!backend.sismember("s", "x").await.unwrap());
        backend.lpush("l", "v").await.unwrap();
        assert!(backend.sadd("l", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_expiry() {
        let backend = MemoryBackend::new();
        backend.lpush("k", "v").await.unwrap();
        backend.expire("k", Duration::from_millis(20)).await.unwrap();
        assert!(backend.ttl("k").is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(backend.lrange("k", 0, -1).await.unwrap().is_empty());
        assert_eq!(backend.key_count(), 0);
    }

    #[tokio::test]
    async fn test_writes_sweep_abandoned_buckets() {
        let backend = MemoryBackend::with_sweep_interval(Duration::from_millis(10));
        backend.lpush("activity:docker:2026-03-08", "old").await.unwrap();
        backend.sadd("activity:docker:2026-03-08:seen", "id-1").await.unwrap();
        backend.expire("activity:docker:2026-03-08", Duration::from_millis(10)).await.unwrap();
        backend
            .expire("activity:docker:2026-03-08:seen", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only today's bucket is written; yesterday's keys are never read again.
        backend.lpush("activity:docker:2026-03-09", "new").await.unwrap();
        assert_eq!(backend.entries.len(), 1);
        assert!(backend.entries.contains_key("activity:docker:2026-03-09"));
    }

    #[tokio::test]
    async fn test_sweep_waits_for_interval() {
        let backend = MemoryBackend::with_sweep_interval(Duration::from_secs(3600));
        backend.lpush("old", "v").await.unwrap();
        backend.expire("old", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.lpush("new", "v").await.unwrap();
        assert_eq!(backend.entries.len(), 2);
        assert_eq!(backend.key_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        assert!(backend.ping().await.is_err());
        assert!(backend.lpush("k", "v").await.is_err());
    }
}
