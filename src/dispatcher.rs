// ============================================================================
// SECTION 14: ACTION DISPATCHER
// ============================================================================
// Routes "domain.action" requests to handlers:
// - parse the name, resolve the domain, then the action
// - validate and normalize params with the domain's validator
// - run the handler detached; its outcome comes back to the connection task
//   as a Completion, so only that task ever touches the resource map
// - one-shot outcome -> response, clear the request id
// - streaming outcome -> ack, then register and start the resource
// ============================================================================

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use validator::Validate;

use crate::error::{HostdError, HostdResult, ProtocolError};
use crate::lifecycle::{ConnectionContext, Resource};
use crate::protocol::{parse_inbound, Outbound, OutboundSender, StreamEmitter};

// ----------------------------------------------------------------------------
// 14.1 Handler Types
// ----------------------------------------------------------------------------

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An action handler.
pub type ActionFn = Arc<dyn Fn(ActionContext) -> BoxFuture<'static, HostdResult<ActionOutput>> + Send + Sync>;

/// Per-domain parameter check. Receives the action name (without domain)
/// and returns the normalized params.
pub type ParamValidator = fn(&str, JsonValue) -> Result<JsonValue, ProtocolError>;

/// What a handler produced.
#[derive(Debug)]
pub enum ActionOutput {
    /// One-shot reply
    Response(JsonValue),
    /// Streaming: an acknowledgement plus the resource that will produce
    /// chunks once started
    Stream {
        ack: JsonValue,
        resource: Box<dyn Resource>,
    },
}

/// Everything a handler gets about its request.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub request_id: String,
    pub action: String,
    pub params: JsonValue,
    pub user_id: Option<String>,
    pub company_id: Option<String>,
    outbound: OutboundSender,
}

impl ActionContext {
    pub fn new(request_id: impl Into<String>, action: impl Into<String>, params: JsonValue, outbound: OutboundSender) -> Self {
        Self {
            request_id: request_id.into(),
            action: action.into(),
            params,
            user_id: None,
            company_id: None,
            outbound,
        }
    }

    /// Chunks for this request, on the channel named after the action.
    pub fn emitter(&self) -> StreamEmitter {
        StreamEmitter::new(&self.request_id, &self.action, self.outbound.clone())
    }

    /// Decode the (already validated) params.
    pub fn params<T: DeserializeOwned>(&self) -> HostdResult<T> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| ProtocolError::invalid_params(&self.action, e.to_string()).into())
    }
}

/// Wrap an async fn taking shared state into an [`ActionFn`].
pub fn handler<S, F, Fut>(state: Arc<S>, f: F) -> ActionFn
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HostdResult<ActionOutput>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(state.clone(), ctx)))
}

/// Decode `params` into `T`, run its `Validate` rules and re-encode it, so
/// handlers see defaults applied and unknown shapes rejected.
pub fn normalize_params<T>(action: &str, params: JsonValue) -> Result<JsonValue, ProtocolError>
where
    T: DeserializeOwned + Serialize + Validate,
{
    let typed: T = serde_json::from_value(params).map_err(|e| ProtocolError::invalid_params(action, e.to_string()))?;
    typed
        .validate()
        .map_err(|e| ProtocolError::invalid_params(action, e.to_string()))?;
    serde_json::to_value(&typed).map_err(|e| ProtocolError::invalid_params(action, e.to_string()))
}

/// Validator for domains whose actions take no params worth checking.
pub fn accept_any(_action: &str, params: JsonValue) -> Result<JsonValue, ProtocolError> {
    Ok(params)
}

// ----------------------------------------------------------------------------
// 14.2 Action Registry
// ----------------------------------------------------------------------------

/// Split `"docker.logs"` into `("docker", "logs")`.
pub fn split_action(full: &str) -> Result<(&str, &str), ProtocolError> {
    let invalid = || ProtocolError::InvalidActionName {
        action: full.to_string(),
    };
    let (domain, action) = full.split_once('.').ok_or_else(invalid)?;
    let well_formed = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !well_formed(domain) || !well_formed(action) {
        return Err(invalid());
    }
    Ok((domain, action))
}

struct DomainActions {
    validator: ParamValidator,
    actions: HashMap<&'static str, ActionFn>,
}

/// Static table of domains and their actions, built once at startup.
#[derive(Default)]
pub struct ActionRegistry {
    domains: HashMap<&'static str, DomainActions>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_domain(&mut self, domain: &'static str, validator: ParamValidator) {
        self.domains
            .entry(domain)
            .and_modify(|d| d.validator = validator)
            .or_insert_with(|| DomainActions {
                validator,
                actions: HashMap::new(),
            });
    }

    /// Add an action; a domain not added yet gets [`accept_any`].
    pub fn add_action(&mut self, domain: &'static str, action: &'static str, handler: ActionFn) {
        self.domains
            .entry(domain)
            .or_insert_with(|| DomainActions {
                validator: accept_any,
                actions: HashMap::new(),
            })
            .actions
            .insert(action, handler);
    }

    /// Resolve the handler and normalize params.
    pub fn prepare(&self, full: &str, params: JsonValue) -> Result<(ActionFn, JsonValue), ProtocolError> {
        let (domain, action) = split_action(full)?;
        let entry = self.domains.get(domain).ok_or_else(|| ProtocolError::UnknownDomain {
            domain: domain.to_string(),
        })?;
        let handler = entry.actions.get(action).ok_or_else(|| ProtocolError::UnknownAction {
            action: full.to_string(),
        })?;
        let params = (entry.validator)(action, params).map_err(|e| match e {
            ProtocolError::InvalidParams { message, .. } => ProtocolError::invalid_params(full, message),
            other => other,
        })?;
        Ok((handler.clone(), params))
    }

    /// All registered `domain.action` names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .domains
            .iter()
            .flat_map(|(domain, entry)| entry.actions.keys().map(move |a| format!("{}.{}", domain, a)))
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.domains.values().map(|d| d.actions.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for ActionRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry").field("actions", &self.names()).finish()
    }
}

// ----------------------------------------------------------------------------
// 14.3 Dispatcher
// ----------------------------------------------------------------------------

/// Outcome of one detached handler, delivered to the connection task.
#[derive(Debug)]
pub struct Completion {
    pub request_id: String,
    pub action: String,
    pub result: HostdResult<ActionOutput>,
}

impl Completion {
    /// Release whatever the outcome holds; used when nobody will take it.
    pub fn discard(self) {
        if let Ok(ActionOutput::Stream { mut resource, .. }) = self.result {
            if let Err(e) = resource.cleanup() {
                warn!(target: "hostd::dispatcher", request = %self.request_id, error = %e, "Orphaned resource cleanup failed");
            }
        }
    }
}

/// Per-connection front end to the registry.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<ActionRegistry>,
    outbound: OutboundSender,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ActionRegistry>, outbound: OutboundSender) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, rx) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                outbound,
                completions,
            },
            rx,
        )
    }

    async fn reply(&self, message: Outbound) -> bool {
        self.outbound.send(message).await.is_ok()
    }

    /// Decode one text frame and start its handler. Protocol failures are
    /// answered directly. Returns false once the connection is gone.
    pub async fn handle_text(&self, text: &str, connection: &ConnectionContext) -> bool {
        let request = match parse_inbound(text) {
            Ok(request) => request,
            Err((id, e)) => {
                warn!(target: "hostd::dispatcher", connection = %connection.connection_id, id = ?id, error = %e, "Rejected request");
                return self.reply(Outbound::error(id, e.to_string())).await;
            }
        };

        let (action_fn, params) = match self.registry.prepare(&request.action, request.params) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(target: "hostd::dispatcher", connection = %connection.connection_id, id = %request.id, action = %request.action, error = %e, "Rejected request");
                return self.reply(Outbound::error(Some(request.id), e.to_string())).await;
            }
        };

        let mut ctx = ActionContext::new(&request.id, &request.action, params, self.outbound.clone());
        ctx.user_id = connection.user_id.clone();
        ctx.company_id = connection.company_id.clone();

        debug!(target: "hostd::dispatcher", connection = %connection.connection_id, id = %request.id, action = %request.action, "Dispatching");

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = match AssertUnwindSafe(action_fn(ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(HostdError::Internal(format!("action '{}' panicked", request.action))),
            };
            debug!(
                target: "hostd::dispatcher",
                id = %request.id,
                action = %request.action,
                ok = result.is_ok(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Action finished"
            );
            let completion = Completion {
                request_id: request.id,
                action: request.action,
                result,
            };
            if let Err(mpsc::error::SendError(orphan)) = completions.send(completion) {
                orphan.discard();
            }
        });
        true
    }

    /// Apply a handler outcome to the connection. Returns false once the
    /// connection is gone.
    pub async fn complete(&self, completion: Completion, connection: &mut ConnectionContext) -> bool {
        let Completion {
            request_id,
            action,
            result,
        } = completion;

        match result {
            Ok(ActionOutput::Response(data)) => {
                connection.register(&request_id, None);
                self.reply(Outbound::ok(&request_id, data)).await
            }
            Ok(ActionOutput::Stream { ack, mut resource }) => {
                if self.reply(Outbound::ok(&request_id, ack)).await {
                    connection.activate(&request_id, resource);
                    true
                } else {
                    let _ = resource.cleanup();
                    false
                }
            }
            Err(e) => {
                warn!(
                    target: "hostd::dispatcher",
                    connection = %connection.connection_id,
                    id = %request_id,
                    action = %action,
                    category = e.category(),
                    error = %e,
                    "Action failed"
                );
                connection.register(&request_id, None);
                self.reply(Outbound::failed(&request_id, e.to_string())).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use crate::lifecycle::testing::CountingResource;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Deserialize, Serialize, Validate)]
    struct CountParams {
        #[validate(range(min = 1, max = 10))]
        #[serde(default = "default_count")]
        n: u32,
    }

    fn default_count() -> u32 {
        3
    }

    fn test_validator(action: &str, params: JsonValue) -> Result<JsonValue, ProtocolError> {
        match action {
            "count" => normalize_params::<CountParams>(action, params),
            _ => Ok(params),
        }
    }

    struct Fixture {
        resource: CountingResource,
    }

    fn registry(resource: CountingResource) -> Arc<ActionRegistry> {
        let state = Arc::new(Fixture { resource });
        let mut registry = ActionRegistry::new();
        registry.add_domain("test", test_validator);
        registry.add_action(
            "test",
            "echo",
            handler(state.clone(), |_, ctx| async move { Ok::<_, HostdError>(ActionOutput::Response(ctx.params)) }),
        );
        registry.add_action(
            "test",
            "count",
            handler(state.clone(), |_, ctx| async move {
                let p: CountParams = ctx.params()?;
                Ok::<_, HostdError>(ActionOutput::Response(json!({ "n": p.n })))
            }),
        );
        registry.add_action(
            "test",
            "fail",
            handler(state.clone(), |_, _| async move {
                Err::<ActionOutput, _>(HostdError::from(HostError::parse("docker", "boom")))
            }),
        );
        registry.add_action(
            "test",
            "stream",
            handler(state, |s, _| async move {
                Ok::<_, HostdError>(ActionOutput::Stream {
                    ack: json!({ "streaming": true }),
                    resource: Box::new(s.resource.clone()),
                })
            }),
        );
        Arc::new(registry)
    }

    async fn roundtrip(
        dispatcher: &Dispatcher,
        completions: &mut mpsc::UnboundedReceiver<Completion>,
        connection: &mut ConnectionContext,
        text: &str,
    ) {
        assert!(dispatcher.handle_text(text, connection).await);
        let completion = tokio::time::timeout(Duration::from_secs(2), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(dispatcher.complete(completion, connection).await);
    }

    #[test]
    fn test_split_action() {
        assert_eq!(split_action("docker.containerLogs").unwrap(), ("docker", "containerLogs"));
        for bad in ["docker", ".logs", "docker.", "a.b.c", "do cker.logs"] {
            assert!(matches!(split_action(bad), Err(ProtocolError::InvalidActionName { .. })), "{}", bad);
        }
    }

    #[test]
    fn test_prepare_resolution_errors() {
        let registry = registry(CountingResource::default());
        assert!(matches!(
            registry.prepare("nope.echo", json!({})),
            Err(ProtocolError::UnknownDomain { .. })
        ));
        assert!(matches!(
            registry.prepare("test.explode", json!({})),
            Err(ProtocolError::UnknownAction { .. })
        ));
        assert!(matches!(
            registry.prepare("test.count", json!({ "n": 50 })),
            Err(ProtocolError::InvalidParams { .. })
        ));
        let (_, params) = registry.prepare("test.count", json!({})).unwrap();
        assert_eq!(params, json!({ "n": 3 }));
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.names()[0], "test.count");
    }

    #[tokio::test]
    async fn test_one_shot_response() {
        let (tx, mut rx) = mpsc::channel(8);
        let (dispatcher, mut completions) = Dispatcher::new(registry(CountingResource::default()), tx);
        let mut connection = ConnectionContext::new(None, None);

        roundtrip(&dispatcher, &mut completions, &mut connection, r#"{"id":"1","action":"test.count","params":{"n":7}}"#).await;
        assert_eq!(rx.recv().await.unwrap(), Outbound::ok("1", json!({ "n": 7 })));
    }

    fn assert_sync<T: Sync>() {}

    #[tokio::test]
    async fn test_connection_handling_runs_on_spawned_task() {
        assert_sync::<ConnectionContext>();
        let resource = CountingResource::default();
        let (tx, mut rx) = mpsc::channel(8);
        let (dispatcher, mut completions) = Dispatcher::new(registry(resource.clone()), tx);

        // Connections are served on spawned tasks that hold their context,
        // live resources included, across awaits.
        let served = tokio::spawn(async move {
            let mut connection = ConnectionContext::new(Some("u1".into()), None);
            connection.activate("s", Box::new(resource));
            roundtrip(&dispatcher, &mut completions, &mut connection, r#"{"id":"1","action":"test.echo","params":{"a":1}}"#).await;
            connection.active_count()
        });
        assert_eq!(served.await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), Outbound::ok("1", json!({ "a": 1 })));
    }

    #[tokio::test]
    async fn test_protocol_errors_keep_connection() {
        let (tx, mut rx) = mpsc::channel(8);
        let (dispatcher, _completions) = Dispatcher::new(registry(CountingResource::default()), tx);
        let connection = ConnectionContext::new(None, None);

        assert!(dispatcher.handle_text(r#"{"action":"test.echo"}"#, &connection).await);
        assert!(matches!(rx.recv().await.unwrap(), Outbound::Error { id: None, .. }));

        assert!(dispatcher.handle_text(r#"{"id":"9","action":"docker.explode"}"#, &connection).await);
        match rx.recv().await.unwrap() {
            Outbound::Error { id, error, .. } => {
                assert_eq!(id.as_deref(), Some("9"));
                assert!(error.contains("docker"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_action_error_becomes_failed_response() {
        let (tx, mut rx) = mpsc::channel(8);
        let (dispatcher, mut completions) = Dispatcher::new(registry(CountingResource::default()), tx);
        let mut connection = ConnectionContext::new(None, None);

        roundtrip(&dispatcher, &mut completions, &mut connection, r#"{"id":"f","action":"test.fail"}"#).await;
        match rx.recv().await.unwrap() {
            Outbound::Response { success, error, .. } => {
                assert!(!success);
                assert!(error.unwrap().contains("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_then_one_shot_on_same_id_releases() {
        let resource = CountingResource::default();
        let (tx, mut rx) = mpsc::channel(8);
        let (dispatcher, mut completions) = Dispatcher::new(registry(resource.clone()), tx);
        let mut connection = ConnectionContext::new(None, None);

        roundtrip(&dispatcher, &mut completions, &mut connection, r#"{"id":"s","action":"test.stream"}"#).await;
        assert_eq!(rx.recv().await.unwrap(), Outbound::ok("s", json!({ "streaming": true })));
        assert_eq!(resource.starts(), 1);
        assert!(connection.contains("s"));

        roundtrip(&dispatcher, &mut completions, &mut connection, r#"{"id":"s","action":"test.echo"}"#).await;
        assert_eq!(resource.cleanups(), 1);
        assert!(!connection.contains("s"));
    }

    #[tokio::test]
    async fn test_orphaned_stream_is_cleaned_up() {
        let resource = CountingResource::default();
        let (tx, _rx) = mpsc::channel(8);
        let (dispatcher, completions) = Dispatcher::new(registry(resource.clone()), tx);
        let connection = ConnectionContext::new(None, None);

        drop(completions);
        assert!(dispatcher.handle_text(r#"{"id":"s","action":"test.stream"}"#, &connection).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(resource.starts(), 0);
        assert_eq!(resource.cleanups(), 1);
    }
}
