//! `agent.*`: liveness and self-reporting.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;

use super::Services;
use crate::constants::{AGENT_NAME, AGENT_VERSION};
use crate::dispatcher::{ActionContext, ActionOutput};
use crate::error::HostdResult;
use crate::types::Timestamp;

pub async fn ping(services: Arc<Services>, _ctx: ActionContext) -> HostdResult<ActionOutput> {
    Ok(ActionOutput::Response(json!({
        "pong": true,
        "hostname": services.hostname,
        "version": AGENT_VERSION,
        "time": Timestamp::now(),
    })))
}

/// Collector health, store reachability and resource counts.
pub async fn status(services: Arc<Services>, _ctx: ActionContext) -> HostdResult<ActionOutput> {
    let collectors = services.collectors.reports().await;
    let store_available = services.store.is_available().await;

    Ok(ActionOutput::Response(json!({
        "agent": {
            "name": services.config.agent.instance_name,
            "binary": AGENT_NAME,
            "version": AGENT_VERSION,
            "hostname": services.hostname,
            "uptimeSecs": services.started_at.elapsed().as_secs(),
        },
        "store": {
            "enabled": services.store.is_enabled(),
            "available": store_available,
            "backend": services.config.store.backend,
            "stats": services.store.stats(),
        },
        "collectors": collectors,
        "channel": {
            "connections": services.connections.load(Ordering::Relaxed),
            "activeResources": services.active_resources.load(Ordering::Relaxed),
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, response, services};
    use crate::host::scripted::ScriptedExecutor;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_ping() {
        let (services, _, _) = services(ScriptedExecutor::stdout(""));
        let (ctx, _rx) = context("agent.ping", json!({}));
        let data = response(ping(services, ctx).await.unwrap());
        assert_eq!(data["pong"], true);
        assert_eq!(data["hostname"], "test-host");
        assert_eq!(data["version"], AGENT_VERSION);
    }

    #[tokio::test]
    async fn test_status_reports_store_and_counts() {
        let (services, sink, backend) = services(ScriptedExecutor::stdout(""));
        services.active_resources.store(2, Ordering::Relaxed);
        sink.record(crate::types::Record {
            id: crate::types::RecordId::new("x"),
            timestamp: Timestamp::now(),
            domain: crate::types::Domain::AuthLog,
            kind: "SSH_LOGIN_SUCCESS".into(),
            severity: None,
            payload: json!({}),
        })
        .await;

        let (ctx, _rx) = context("agent.status", json!({}));
        let data = response(status(services.clone(), ctx).await.unwrap());
        assert_eq!(data["store"]["available"], true);
        assert_eq!(data["store"]["stats"]["stored"], 1);
        assert_eq!(data["channel"]["activeResources"], 2);
        assert_eq!(data["collectors"], json!([]));

        backend.set_available(false);
        let (ctx, _rx) = context("agent.status", json!({}));
        let data = response(status(services, ctx).await.unwrap());
        assert_eq!(data["store"]["available"], false);
    }
}
