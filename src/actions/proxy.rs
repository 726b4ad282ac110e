//! `proxy.logs`: follow the reverse proxy access log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use validator::Validate;

use super::follow::{FollowerStream, LineMapper, OutputStream, LINE_KIND};
use super::Services;
use crate::dispatcher::{normalize_params, ActionContext, ActionOutput};
use crate::error::{HostdResult, ProtocolError};
use crate::host::CommandSpec;
use crate::normalize::logs::parse_access_line;

/// `tail` writes diagnostics such as rotation notices on stderr
pub const NOTICE_KIND: &str = "notice";

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TailParams {
    #[validate(range(max = 10000))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<u32>,
}

pub fn validate(action: &str, params: JsonValue) -> Result<JsonValue, ProtocolError> {
    match action {
        "logs" => normalize_params::<TailParams>(action, params),
        _ => Ok(params),
    }
}

/// Access lines come out parsed when they match the combined format and raw
/// otherwise.
fn access_line(stream: OutputStream, line: &str) -> Option<(&'static str, JsonValue)> {
    if line.trim().is_empty() {
        return None;
    }
    match stream {
        OutputStream::Stdout => Some((
            LINE_KIND,
            json!({
                "line": line,
                "entry": parse_access_line(line),
            }),
        )),
        OutputStream::Stderr => Some((NOTICE_KIND, json!({ "message": line }))),
    }
}

pub async fn logs(services: Arc<Services>, ctx: ActionContext) -> HostdResult<ActionOutput> {
    let params: TailParams = ctx.params()?;
    let actions = &services.config.actions;
    let tail = params.tail.unwrap_or(actions.default_tail_lines);
    let path = actions.proxy_access_log.display().to_string();

    let spec = CommandSpec::new("tail", services.config.host.command_timeout).args([
        "-n".to_string(),
        tail.to_string(),
        "-F".to_string(),
        path.clone(),
    ]);
    let mapper: LineMapper = Arc::new(access_line);
    let follower = FollowerStream::spawn(&spec, ctx.emitter(), services.config.host.kill_grace, mapper)?;

    Ok(ActionOutput::Stream {
        ack: json!({
            "stream": ctx.action,
            "path": path,
            "tail": tail,
        }),
        resource: Box::new(follower),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, services_with};
    use crate::config::AgentConfig;
    use crate::host::scripted::ScriptedExecutor;
    use crate::protocol::Outbound;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn test_follows_access_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("access.log");
        std::fs::write(
            &log,
            "10.0.0.1 - - [27/Jan/2024:10:30:45 +0000] \"GET / HTTP/1.1\" 200 5 \"-\" \"curl\"\n",
        )
        .unwrap();

        let mut config = AgentConfig::default();
        config.actions.proxy_access_log = log;
        let (services, _, _) = services_with(config, ScriptedExecutor::stdout(""));
        let (ctx, mut rx) = context("proxy.logs", json!({ "tail": 5 }));

        let (ack, mut resource) = match logs(services, ctx).await.unwrap() {
            ActionOutput::Stream { ack, resource } => (ack, resource),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(ack["tail"], 5);
        resource.start();

        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Outbound::Stream { stream, data, .. })) => {
                assert_eq!(stream, "proxy.logs");
                assert_eq!(data["kind"], LINE_KIND);
                assert_eq!(data["entry"]["method"], "GET");
            }
            other => panic!("unexpected {:?}", other),
        }
        resource.cleanup().unwrap();
    }

    #[test]
    fn test_access_line_parsed_or_raw() {
        let line = r#"203.0.113.7 - - [27/Jan/2024:10:30:45 +0000] "GET /health HTTP/1.1" 200 12 "-" "curl/8.0""#;
        let (kind, body) = access_line(OutputStream::Stdout, line).unwrap();
        assert_eq!(kind, LINE_KIND);
        assert_eq!(body["entry"]["status"], 200);
        assert_eq!(body["entry"]["path"], "/health");

        let (_, body) = access_line(OutputStream::Stdout, "garbage").unwrap();
        assert!(body["entry"].is_null());
        assert_eq!(body["line"], "garbage");

        let (kind, _) = access_line(OutputStream::Stderr, "tail: 'access.log' has been replaced").unwrap();
        assert_eq!(kind, NOTICE_KIND);
        assert!(access_line(OutputStream::Stdout, "  ").is_none());
    }

    #[test]
    fn test_tail_bounds() {
        assert!(validate("logs", json!({ "tail": 20 })).is_ok());
        assert!(validate("logs", json!({ "tail": 20000 })).is_err());
        assert!(validate("logs", json!({ "tail": -1 })).is_err());
    }
}
