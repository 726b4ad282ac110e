//! `docker.*`: container inventory and control, plus the container streams.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::info;
use validator::{Validate, ValidationError};

use super::follow::{FollowerStream, LineMapper, OutputStream, LINE_KIND};
use super::{invalid, validate_window, Services, StreamParams};
use crate::bridge::RecordFilter;
use crate::dispatcher::{normalize_params, ActionContext, ActionOutput};
use crate::error::{HostError, HostdResult, ProtocolError};
use crate::host::CommandSpec;
use crate::normalize::logs::split_timestamped_line;
use crate::types::Domain;

/// Upper bound on `tail` for followed logs
pub const MAX_TAIL_LINES: u32 = 10_000;

// ----------------------------------------------------------------------------
// Parameters
// ----------------------------------------------------------------------------

/// Container names and ids; never starts with `-` so it cannot become a flag.
static CONTAINER_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").unwrap_or_else(|e| panic!("bad container pattern: {}", e))
});

fn validate_container_ref(value: &str) -> Result<(), ValidationError> {
    if CONTAINER_REF.is_match(value) {
        Ok(())
    } else {
        Err(invalid("container", "expected a container name or id"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ContainerParams {
    #[validate(custom = "validate_container_ref")]
    pub container: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FollowLogsParams {
    #[validate(custom = "validate_container_ref")]
    pub container: String,

    #[validate(range(max = 10000))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ContainerLogsParams {
    #[validate(custom = "validate_window")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,

    #[validate(range(min = 1, max = 100000))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Only lines of this container (by name)
    #[validate(custom = "validate_container_ref")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

pub fn validate(action: &str, params: JsonValue) -> Result<JsonValue, ProtocolError> {
    match action {
        "start" | "stop" | "restart" => normalize_params::<ContainerParams>(action, params),
        "logs" => normalize_params::<FollowLogsParams>(action, params),
        "containerLogs" => normalize_params::<ContainerLogsParams>(action, params),
        "events" => normalize_params::<StreamParams>(action, params),
        _ => Ok(params),
    }
}

// ----------------------------------------------------------------------------
// One-shot
// ----------------------------------------------------------------------------

/// `docker ps -a` line, keys as Docker prints them
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    image: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    ports: String,
}

fn container_summary(line: &str) -> Option<JsonValue> {
    let ps: PsLine = serde_json::from_str(line).ok()?;
    Some(json!({
        "id": ps.id,
        "name": ps.names,
        "image": ps.image,
        "command": ps.command.trim_matches('"'),
        "createdAt": ps.created_at,
        "state": ps.state,
        "status": ps.status,
        "ports": ps.ports,
    }))
}

pub async fn list(services: Arc<Services>, _ctx: ActionContext) -> HostdResult<ActionOutput> {
    let host = &services.config.host;
    let spec = CommandSpec::new(&host.docker_bin, host.command_timeout).args(["ps", "-a", "--format", "{{json .}}"]);
    let output = services.executor.run(&spec).await?;

    let containers: Vec<JsonValue> = output.lines().filter_map(container_summary).collect();
    let skipped = output.lines().count() - containers.len();
    if skipped > 0 && containers.is_empty() {
        return Err(HostError::parse(&host.docker_bin, "no parsable lines in ps output").into());
    }

    Ok(ActionOutput::Response(json!({
        "count": containers.len(),
        "containers": containers,
    })))
}

async fn control(services: Arc<Services>, ctx: ActionContext, verb: &'static str) -> HostdResult<ActionOutput> {
    let params: ContainerParams = ctx.params()?;
    let host = &services.config.host;
    let spec = CommandSpec::new(&host.docker_bin, host.heavy_command_timeout).args([verb, params.container.as_str()]);
    let output = services.executor.run(&spec).await?;

    info!(
        target: "hostd::actions",
        action = verb,
        container = %params.container,
        user = ?ctx.user_id,
        "Container control"
    );
    Ok(ActionOutput::Response(json!({
        "container": params.container,
        "action": verb,
        "output": output.stdout.trim(),
    })))
}

pub async fn start(services: Arc<Services>, ctx: ActionContext) -> HostdResult<ActionOutput> {
    control(services, ctx, "start").await
}

pub async fn stop(services: Arc<Services>, ctx: ActionContext) -> HostdResult<ActionOutput> {
    control(services, ctx, "stop").await
}

pub async fn restart(services: Arc<Services>, ctx: ActionContext) -> HostdResult<ActionOutput> {
    control(services, ctx, "restart").await
}

// ----------------------------------------------------------------------------
// Streaming
// ----------------------------------------------------------------------------

pub async fn events(services: Arc<Services>, ctx: ActionContext) -> HostdResult<ActionOutput> {
    let params: StreamParams = ctx.params()?;
    services.subscribe(&ctx, Domain::ContainerEvents, &params, None)
}

pub async fn container_logs(services: Arc<Services>, ctx: ActionContext) -> HostdResult<ActionOutput> {
    let params: ContainerLogsParams = ctx.params()?;
    let filter = params.container.as_ref().map(|c| RecordFilter::new("container", c.as_str()));
    let stream = StreamParams {
        window: params.window,
        limit: params.limit,
    };
    services.subscribe(&ctx, Domain::ContainerLogs, &stream, filter)
}

fn docker_log_line(stream: OutputStream, line: &str) -> Option<(&'static str, JsonValue)> {
    let (timestamp, text) = split_timestamped_line(line);
    Some((
        LINE_KIND,
        json!({
            "stream": stream,
            "timestamp": timestamp,
            "line": text,
        }),
    ))
}

/// `docker logs -f` for one container, straight from the runtime.
pub async fn logs(services: Arc<Services>, ctx: ActionContext) -> HostdResult<ActionOutput> {
    let params: FollowLogsParams = ctx.params()?;
    let tail = params.tail.unwrap_or(services.config.actions.default_tail_lines).min(MAX_TAIL_LINES);
    let host = &services.config.host;
    let spec = CommandSpec::new(&host.docker_bin, host.command_timeout).args([
        "logs".to_string(),
        "-f".to_string(),
        "--tail".to_string(),
        tail.to_string(),
        "--timestamps".to_string(),
        params.container.clone(),
    ]);

    let mapper: LineMapper = Arc::new(docker_log_line);
    let follower = FollowerStream::spawn(&spec, ctx.emitter(), host.kill_grace, mapper)?;
    Ok(ActionOutput::Stream {
        ack: json!({
            "stream": ctx.action,
            "container": params.container,
            "tail": tail,
        }),
        resource: Box::new(follower),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, response, services};
    use crate::host::scripted::ScriptedExecutor;
    use crate::host::CommandOutput;
    use crate::types::Timestamp;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const PS: &str = concat!(
        r#"{"Command":"\"nginx -g…\"","CreatedAt":"2024-01-27 10:00:00 +0000 UTC","ID":"4f1c2b9e8d7a","Image":"nginx:1.25","Names":"web","Ports":"0.0.0.0:80->80/tcp","State":"running","Status":"Up 2 hours"}"#,
        "\n",
        r#"{"Command":"\"docker-entrypoint…\"","CreatedAt":"2024-01-26 09:00:00 +0000 UTC","ID":"9a8b7c6d5e4f","Image":"postgres:16","Names":"db","Ports":"","State":"exited","Status":"Exited (0) 3 hours ago"}"#,
        "\n"
    );

    #[rstest]
    #[case("web", true)]
    #[case("4f1c2b9e8d7a", true)]
    #[case("my_app.worker-1", true)]
    #[case("--privileged", false)]
    #[case("web; rm -rf /", false)]
    #[case("", false)]
    fn test_container_ref(#[case] value: &str, #[case] ok: bool) {
        assert_eq!(validate("stop", json!({ "container": value })).is_ok(), ok);
    }

    #[test]
    fn test_validate_shapes() {
        assert!(validate("stop", json!({})).is_err());
        assert!(validate("logs", json!({ "container": "web", "tail": 50000 })).is_err());
        assert_eq!(
            validate("containerLogs", json!({ "container": "web" })).unwrap(),
            json!({ "container": "web" })
        );
        assert!(validate("list", json!({})).is_ok());
    }

    #[tokio::test]
    async fn test_list_parses_ps() {
        let (services, _, _) = services(ScriptedExecutor::stdout(PS));
        let (ctx, _rx) = context("docker.list", json!({}));
        let data = response(list(services, ctx).await.unwrap());
        assert_eq!(data["count"], 2);
        assert_eq!(data["containers"][0]["name"], "web");
        assert_eq!(data["containers"][1]["state"], "exited");
    }

    #[tokio::test]
    async fn test_list_propagates_host_failure() {
        let executor = ScriptedExecutor::new(|spec| {
            Err(HostError::Failed {
                program: spec.program.clone(),
                code: Some(1),
                stderr: "Cannot connect to the Docker daemon".into(),
            })
        });
        let (services, _, _) = services(executor);
        let (ctx, _rx) = context("docker.list", json!({}));
        let err = list(services, ctx).await.unwrap_err();
        assert!(err.to_string().contains("Docker daemon"));
    }

    #[tokio::test]
    async fn test_restart_uses_heavy_timeout() {
        let executor = ScriptedExecutor::new(|spec| {
            assert_eq!(spec.timeout, std::time::Duration::from_secs(30));
            assert_eq!(spec.args, vec!["restart", "web"]);
            Ok(CommandOutput {
                stdout: "web\n".into(),
                ..Default::default()
            })
        });
        let (services, _, _) = services(executor);
        let (ctx, _rx) = context("docker.restart", json!({ "container": "web" }));
        let data = response(restart(services, ctx).await.unwrap());
        assert_eq!(data["action"], "restart");
        assert_eq!(data["output"], "web");
    }

    #[test]
    fn test_docker_log_line_splits_timestamp() {
        let (kind, body) = docker_log_line(OutputStream::Stderr, "2024-01-27T10:30:45.123456789Z boom").unwrap();
        assert_eq!(kind, LINE_KIND);
        assert_eq!(body["stream"], "stderr");
        assert_eq!(body["line"], "boom");
        assert_eq!(body["timestamp"], json!(Timestamp::parse_rfc3339("2024-01-27T10:30:45.123456789Z")));
    }

    #[tokio::test]
    async fn test_events_stream_replays_overlapping_polls_once() {
        use crate::bridge::{HISTORY_KIND, SYNCED_KIND};
        use crate::collectors::docker_events::EventPoller;
        use crate::collectors::CollectorMonitor;
        use crate::protocol::Outbound;
        use std::time::Duration;

        let seen_at = Timestamp::now().sub_duration(Duration::from_secs(60));
        let line = format!(
            r#"{{"Type":"container","Action":"start","Actor":{{"ID":"abc123def4567890","Attributes":{{"name":"web","image":"nginx"}}}},"time":{},"timeNano":{}}}"#,
            seen_at.as_secs(),
            seen_at.as_nanos()
        );
        let executor = ScriptedExecutor::new(move |_| {
            Ok(CommandOutput {
                stdout: format!("{}\n", line),
                ..Default::default()
            })
        });
        let (services, sink, _) = services(executor);
        let monitor = CollectorMonitor::new();
        let mut poller = EventPoller::new(
            services.executor.clone(),
            "docker",
            Duration::from_secs(5),
            seen_at.sub_duration(Duration::from_secs(30)),
        );

        // Two overlapping cycles both report the event.
        assert_eq!(poller.poll(Timestamp::now(), &monitor, &sink).await.unwrap(), 1);
        assert_eq!(poller.poll(Timestamp::now(), &monitor, &sink).await.unwrap(), 0);

        let (ctx, mut rx) = context("docker.events", json!({ "window": "1h" }));
        let mut resource = match events(services.clone(), ctx).await.unwrap() {
            ActionOutput::Stream { resource, .. } => resource,
            other => panic!("expected a stream, got {:?}", other),
        };
        resource.start();

        let mut kinds = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(Outbound::Stream { data, .. })) => {
                    let kind = data["kind"].as_str().unwrap_or_default().to_string();
                    if kind == SYNCED_KIND {
                        assert_eq!(data["replayed"], 1);
                        break;
                    }
                    kinds.push(kind);
                }
                other => panic!("expected a stream chunk, got {:?}", other),
            }
        }
        assert_eq!(kinds, vec![HISTORY_KIND.to_string()]);

        // A later overlapping cycle neither stores nor publishes it again.
        assert_eq!(poller.poll(Timestamp::now(), &monitor, &sink).await.unwrap(), 0);
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        assert_eq!(monitor.stats().duplicates_suppressed, 2);

        resource.cleanup().unwrap();
    }
}
