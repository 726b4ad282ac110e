// ============================================================================
// SECTION 15: ACTION CATALOGUE
// ============================================================================
// Operator actions grouped by domain:
// - agent   ping, status
// - docker  list, start, stop, restart, events, containerLogs, logs
// - ssh     keys, events
// - system  info, metrics, events, metricsLive
// - proxy   logs
//
// Streaming actions over a collector domain go through the subscription
// bridge; follower actions own a subprocess. Everything else is one-shot.
// ============================================================================

pub mod agent;
pub mod docker;
pub mod follow;
pub mod proxy;
pub mod ssh;
pub mod system;

use std::borrow::Cow;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use validator::{Validate, ValidationError};

use crate::bridge::{BridgeRequest, RecordFilter, Subscription};
use crate::collectors::{CollectorRegistry, FeedHub};
use crate::config::AgentConfig;
use crate::dispatcher::{handler, normalize_params, ActionContext, ActionOutput, ActionRegistry};
use crate::error::{HostdResult, ProtocolError};
use crate::host::HostExecutor;
use crate::store::{parse_window, CacheStore};
use crate::types::{Domain, Timestamp};


// ----------------------------------------------------------------------------
// 15.1 Services
// ----------------------------------------------------------------------------

/// Shared state every handler sees.
#[derive(Debug)]
pub struct Services {
    pub config: AgentConfig,
    pub store: CacheStore,
    pub feeds: FeedHub,
    pub executor: Arc<dyn HostExecutor>,
    pub collectors: Arc<CollectorRegistry>,
    pub hostname: String,
    pub started_at: Instant,
    /// Open control connections
    pub connections: Arc<AtomicUsize>,
    /// Live per-request resources across all connections
    pub active_resources: Arc<AtomicUsize>,
}

impl Services {
    pub fn new(
        config: AgentConfig,
        store: CacheStore,
        feeds: FeedHub,
        executor: Arc<dyn HostExecutor>,
        collectors: Arc<CollectorRegistry>,
        hostname: String,
    ) -> Self {
        Self {
            config,
            store,
            feeds,
            executor,
            collectors,
            hostname,
            started_at: Instant::now(),
            connections: Arc::new(AtomicUsize::new(0)),
            active_resources: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replay window for `domain`: the requested one, else the retention
    /// lookback, never longer than the retention TTL.
    pub fn window_for(&self, domain: Domain, requested: Option<&str>) -> HostdResult<Duration> {
        let policy = self.store.retention().policy(domain.retention_class());
        let window = match requested {
            Some(text) => parse_window(text)
                .map_err(|e| ProtocolError::invalid_params("window", e.to_string()))?,
            None => policy.lookback,
        };
        Ok(window.min(policy.ttl))
    }

    /// Attach a bridge subscription for this request.
    pub fn subscribe(
        &self,
        ctx: &ActionContext,
        domain: Domain,
        params: &StreamParams,
        filter: Option<RecordFilter>,
    ) -> HostdResult<ActionOutput> {
        let window = self.window_for(domain, params.window.as_deref())?;
        let mut request = BridgeRequest::new(domain, window);
        request.per_bucket_limit = params.limit.unwrap_or(0);
        if let Some(filter) = filter {
            request = request.with_filter(filter);
        }

        let since = Timestamp::now().sub_duration(window);
        let ack = json!({
            "stream": ctx.action,
            "domain": domain,
            "windowSecs": window.as_secs(),
            "since": since,
            "storeEnabled": self.store.is_enabled(),
        });
        let subscription = Subscription::attach(self.store.clone(), &self.feeds, request, ctx.emitter());
        Ok(ActionOutput::Stream {
            ack,
            resource: Box::new(subscription),
        })
    }
}

// ----------------------------------------------------------------------------
// 15.2 Shared Parameters
// ----------------------------------------------------------------------------

pub(crate) fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.message = Some(Cow::Borrowed(message));
    error
}

pub(crate) fn validate_window(value: &str) -> Result<(), ValidationError> {
    parse_window(value)
        .map(|_| ())
        .map_err(|_| invalid("window", "expected a duration such as 30m, 24h or 7d"))
}

/// Parameters of every bridge-backed stream.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    /// Replay window, e.g. `"24h"`
    #[validate(custom = "validate_window")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,

    /// Entries read per day bucket
    #[validate(range(min = 1, max = 100000))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Validator for domains whose streaming actions take [`StreamParams`] and
/// whose one-shot actions take nothing.
pub fn validate_streams(action: &str, params: JsonValue) -> Result<JsonValue, ProtocolError> {
    match action {
        "events" | "metricsLive" => normalize_params::<StreamParams>(action, params),
        _ => Ok(params),
    }
}

// ----------------------------------------------------------------------------
// 15.3 Registry
// ----------------------------------------------------------------------------

/// The full action table.
pub fn build_registry(services: Arc<Services>) -> ActionRegistry {
    let mut registry = ActionRegistry::new();

    registry.add_action("agent", "ping", handler(services.clone(), agent::ping));
    registry.add_action("agent", "status", handler(services.clone(), agent::status));

    registry.add_domain("docker", docker::validate);
    registry.add_action("docker", "list", handler(services.clone(), docker::list));
    registry.add_action("docker", "start", handler(services.clone(), docker::start));
    registry.add_action("docker", "stop", handler(services.clone(), docker::stop));
    registry.add_action("docker", "restart", handler(services.clone(), docker::restart));
    registry.add_action("docker", "events", handler(services.clone(), docker::events));
    registry.add_action("docker", "containerLogs", handler(services.clone(), docker::container_logs));
    registry.add_action("docker", "logs", handler(services.clone(), docker::logs));

    registry.add_domain("ssh", validate_streams);
    registry.add_action("ssh", "keys", handler(services.clone(), ssh::keys));
    registry.add_action("ssh", "events", handler(services.clone(), ssh::events));

    registry.add_domain("system", validate_streams);
    registry.add_action("system", "info", handler(services.clone(), system::info));
    registry.add_action("system", "metrics", handler(services.clone(), system::metrics));
    registry.add_action("system", "events", handler(services.clone(), system::events));
    registry.add_action("system", "metricsLive", handler(services.clone(), system::metrics_live));

    registry.add_domain("proxy", proxy::validate);
    registry.add_action("proxy", "logs", handler(services, proxy::logs));

    registry
}
