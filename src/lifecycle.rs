// ============================================================================
// SECTION 11: CONNECTION & RESOURCE LIFECYCLE
// ============================================================================
// Per connection, a map from request id to the one disposable resource that
// request owns (a subscription, a follower subprocess). Replacing or removing
// an entry cleans up the old resource first; closing the connection cleans up
// every entry. Cleanup failures are logged and never stop sibling cleanup.
//
// The map is owned by the connection task alone, so nothing here locks.
// ============================================================================

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ResourceError;

// ----------------------------------------------------------------------------
// 11.1 Resource
// ----------------------------------------------------------------------------

/// A disposable handle owned by exactly one request id.
pub trait Resource: Send + Sync + Debug {
    /// Short label for logs and status, e.g. `"subscription"`.
    fn kind(&self) -> &'static str;

    /// Begin producing. Called once, after the acknowledgement for the
    /// owning request has been queued.
    fn start(&mut self) {}

    /// Release everything. Must not block; must tolerate being called after
    /// the resource already finished on its own.
    fn cleanup(&mut self) -> Result<(), ResourceError>;
}

// ----------------------------------------------------------------------------
// 11.2 Connection Context
// ----------------------------------------------------------------------------

/// Listing entry for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveResource {
    pub request_id: String,
    pub kind: &'static str,
}

/// State of one control connection.
#[derive(Debug)]
pub struct ConnectionContext {
    pub connection_id: Uuid,
    pub user_id: Option<String>,
    pub company_id: Option<String>,
    active: HashMap<String, Box<dyn Resource>>,
    /// Agent-wide count of live resources across connections
    gauge: Option<Arc<AtomicUsize>>,
}

impl ConnectionContext {
    pub fn new(user_id: Option<String>, company_id: Option<String>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id,
            company_id,
            active: HashMap::new(),
            gauge: None,
        }
    }

    /// Mirror this connection's resource count into a shared gauge.
    pub fn with_gauge(mut self, gauge: Arc<AtomicUsize>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    fn gauge_add(&self, n: usize) {
        if let Some(gauge) = &self.gauge {
            gauge.fetch_add(n, AtomicOrdering::Relaxed);
        }
    }

    fn gauge_sub(&self, n: usize) {
        if let Some(gauge) = &self.gauge {
            gauge.fetch_sub(n, AtomicOrdering::Relaxed);
        }
    }

    fn cleanup_logged(&self, request_id: &str, mut resource: Box<dyn Resource>) {
        let kind = resource.kind();
        match resource.cleanup() {
            Ok(()) => debug!(
                target: "hostd::lifecycle",
                connection = %self.connection_id,
                request = %request_id,
                kind = kind,
                "Resource released"
            ),
            Err(e) => warn!(
                target: "hostd::lifecycle",
                connection = %self.connection_id,
                request = %request_id,
                kind = kind,
                error = %e,
                "Resource cleanup failed"
            ),
        }
    }

    /// Bind `resource` to `request_id`, cleaning up whatever was there
    /// first. `None` only removes.
    pub fn register(&mut self, request_id: &str, resource: Option<Box<dyn Resource>>) {
        if let Some(previous) = self.active.remove(request_id) {
            self.gauge_sub(1);
            self.cleanup_logged(request_id, previous);
        }
        if let Some(resource) = resource {
            self.active.insert(request_id.to_string(), resource);
            self.gauge_add(1);
        }
    }

    /// Register and start in one step.
    pub fn activate(&mut self, request_id: &str, resource: Box<dyn Resource>) {
        self.register(request_id, Some(resource));
        if let Some(resource) = self.active.get_mut(request_id) {
            resource.start();
        }
    }

    /// Clean up and forget the resource of `request_id`, if any.
    pub fn release(&mut self, request_id: &str) -> bool {
        let present = self.active.contains_key(request_id);
        self.register(request_id, None);
        present
    }

    /// Clean up every resource. Returns how many there were.
    pub fn close_all(&mut self) -> usize {
        let drained: Vec<(String, Box<dyn Resource>)> = self.active.drain().collect();
        let count = drained.len();
        self.gauge_sub(count);
        for (request_id, resource) in drained {
            self.cleanup_logged(&request_id, resource);
        }
        if count > 0 {
            debug!(target: "hostd::lifecycle", connection = %self.connection_id, released = count, "Connection resources reclaimed");
        }
        count
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.active.contains_key(request_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active(&self) -> Vec<ActiveResource> {
        let mut listed: Vec<ActiveResource> = self
            .active
            .iter()
            .map(|(id, r)| ActiveResource {
                request_id: id.clone(),
                kind: r.kind(),
            })
            .collect();
        listed.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        listed
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts starts and cleanups; optionally fails cleanup.
    #[derive(Debug, Clone, Default)]
    pub struct CountingResource {
        pub starts: Arc<AtomicUsize>,
        pub cleanups: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl CountingResource {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        pub fn cleanups(&self) -> usize {
            self.cleanups.load(Ordering::SeqCst)
        }
    }

    impl Resource for CountingResource {
        fn kind(&self) -> &'static str {
            "counting"
        }

        fn start(&mut self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn cleanup(&mut self) -> Result<(), ResourceError> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ResourceError::AlreadyReleased { kind: "counting" })
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingResource;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_register_replaces_and_cleans_previous() {
        let mut ctx = ConnectionContext::new(Some("u1".into()), None);
        let first = CountingResource::default();
        let second = CountingResource::default();

        ctx.activate("req-1", Box::new(first.clone()));
        ctx.activate("req-1", Box::new(second.clone()));

        assert_eq!(first.cleanups(), 1);
        assert_eq!(second.cleanups(), 0);
        assert_eq!(second.starts(), 1);
        assert_eq!(ctx.active_count(), 1);
    }

    #[test]
    fn test_register_none_removes() {
        let mut ctx = ConnectionContext::new(None, None);
        let res = CountingResource::default();
        ctx.register("a", Some(Box::new(res.clone())));
        assert_eq!(res.starts(), 0);

        ctx.register("a", None);
        assert_eq!(res.cleanups(), 1);
        assert!(!ctx.contains("a"));
        assert!(!ctx.release("a"));
    }

    #[test]
    fn test_close_all_is_exhaustive_despite_failures() {
        let mut ctx = ConnectionContext::new(None, None);
        let resources: Vec<CountingResource> = (0..5)
            .map(|i| if i == 2 { CountingResource::failing() } else { CountingResource::default() })
            .collect();
        for (i, r) in resources.iter().enumerate() {
            ctx.activate(&format!("req-{}", i), Box::new(r.clone()));
        }

        assert_eq!(ctx.close_all(), 5);
        assert!(resources.iter().all(|r| r.cleanups() == 1));
        assert_eq!(ctx.active_count(), 0);
        assert_eq!(ctx.close_all(), 0);
    }

    #[test]
    fn test_drop_reclaims() {
        let res = CountingResource::default();
        {
            let mut ctx = ConnectionContext::new(None, Some("c1".into()));
            ctx.activate("x", Box::new(res.clone()));
        }
        assert_eq!(res.cleanups(), 1);
    }

    #[test]
    fn test_gauge_tracks_resources() {
        let gauge = Arc::new(AtomicUsize::new(0));
        let mut a = ConnectionContext::new(None, None).with_gauge(gauge.clone());
        let mut b = ConnectionContext::new(None, None).with_gauge(gauge.clone());
        a.activate("1", Box::new(CountingResource::default()));
        a.activate("1", Box::new(CountingResource::default()));
        b.activate("1", Box::new(CountingResource::default()));
        assert_eq!(gauge.load(AtomicOrdering::Relaxed), 2);
        drop(a);
        assert_eq!(gauge.load(AtomicOrdering::Relaxed), 1);
        b.release("1");
        assert_eq!(gauge.load(AtomicOrdering::Relaxed), 0);
    }

    #[test]
    fn test_active_listing() {
        let mut ctx = ConnectionContext::new(None, None);
        ctx.activate("b", Box::new(CountingResource::default()));
        ctx.activate("a", Box::new(CountingResource::default()));
        let listed = ctx.active();
        assert_eq!(listed[0].request_id, "a");
        assert_eq!(listed[1].kind, "counting");
    }
}
