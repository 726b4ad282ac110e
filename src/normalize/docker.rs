//! Container runtime events (`docker events --format '{{json .}}'`).

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;

use super::activity_identity;
use crate::types::{Domain, Record, Severity, Timestamp};

pub const EVENT_SOURCE: &str = "docker";

/// One line of `docker events --format '{{json .}}'`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDockerEvent {
    #[serde(rename = "Type", default)]
    pub event_type: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: DockerActor,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "timeNano", default)]
    pub time_nano: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

impl RawDockerEvent {
    pub fn timestamp(&self) -> Timestamp {
        if self.time_nano > 0 {
            Timestamp::from_nanos(self.time_nano)
        } else {
            Timestamp::from_secs(self.time)
        }
    }

    fn container_id(&self) -> &str {
        if !self.actor.id.is_empty() {
            &self.actor.id
        } else {
            self.id.as_deref().unwrap_or_default()
        }
    }

    fn container_name(&self) -> &str {
        self.actor
            .attributes
            .get("name")
            .map(String::as_str)
            .unwrap_or_else(|| short_id(self.container_id()))
    }
}

/// Maps a container action to its record kind. Other actions (exec, attach,
/// health checks, ...) are not lifecycle events and are dropped.
pub fn lifecycle_kind(action: &str) -> Option<&'static str> {
    // "health_status: healthy", "exec_start: sh" and similar carry a suffix
    let verb = action.split(':').next().unwrap_or_default().trim();
    let kind = match verb {
        "start" => "DOCKER_CONTAINER_STARTED",
        "stop" => "DOCKER_CONTAINER_STOPPED",
        "die" => "DOCKER_CONTAINER_DIED",
        "create" => "DOCKER_CONTAINER_CREATED",
        "destroy" => "DOCKER_CONTAINER_DESTROYED",
        "restart" => "DOCKER_CONTAINER_RESTARTED",
        "kill" => "DOCKER_CONTAINER_KILLED",
        "pause" => "DOCKER_CONTAINER_PAUSED",
        "unpause" => "DOCKER_CONTAINER_UNPAUSED",
        "oom" => "DOCKER_CONTAINER_OOM",
        _ => return None,
    };
    Some(kind)
}

fn severity_for(kind: &str, exit_code: Option<i64>) -> Severity {
    match kind {
        "DOCKER_CONTAINER_OOM" => Severity::Critical,
        "DOCKER_CONTAINER_DIED" if exit_code.unwrap_or(0) != 0 => Severity::High,
        "DOCKER_CONTAINER_DIED" | "DOCKER_CONTAINER_KILLED" => Severity::Medium,
        "DOCKER_CONTAINER_DESTROYED" | "DOCKER_CONTAINER_STOPPED" => Severity::Low,
        _ => Severity::Info,
    }
}

pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Normalize one raw event. `None` for non-container or non-lifecycle events.
pub fn normalize_event(event: &RawDockerEvent) -> Option<Record> {
    if !event.event_type.is_empty() && event.event_type != "container" {
        return None;
    }
    let kind = lifecycle_kind(&event.action)?;
    let timestamp = event.timestamp();
    let name = event.container_name().to_string();
    let attrs = &event.actor.attributes;
    let exit_code = attrs.get("exitCode").and_then(|c| c.parse::<i64>().ok());
    let image = attrs
        .get("image")
        .cloned()
        .or_else(|| event.from.clone())
        .unwrap_or_default();

    Some(Record {
        id: activity_identity(kind, EVENT_SOURCE, timestamp, &name),
        timestamp,
        domain: Domain::ContainerEvents,
        kind: kind.to_string(),
        severity: Some(severity_for(kind, exit_code)),
        payload: json!({
            "container": name,
            "containerId": event.container_id(),
            "image": image,
            "action": event.action,
            "exitCode": exit_code,
            "source": EVENT_SOURCE,
        }),
    })
}

/// Parse one output line. Blank or malformed lines yield `None`.
pub fn parse_event_line(line: &str) -> Option<Record> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let event: RawDockerEvent = serde_json::from_str(line).ok()?;
    normalize_event(&event)
}
