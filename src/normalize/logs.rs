//! Log line normalization: Docker `json-file` logs, `docker logs --timestamps`
//! output and reverse-proxy access logs in combined format.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::log_identity;
use crate::types::{Domain, Record, Severity, Timestamp};

pub const STDOUT_KIND: &str = "CONTAINER_STDOUT";
pub const STDERR_KIND: &str = "CONTAINER_STDERR";

// ----------------------------------------------------------------------------
// Docker json-file
// ----------------------------------------------------------------------------

/// One line of a Docker `json-file` log: `{"log":"...","stream":"stdout","time":"..."}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JsonFileLine {
    pub log: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default)]
    pub time: Option<String>,
}

fn default_stream() -> String {
    "stdout".into()
}

/// Where a container log line came from
#[derive(Debug, Clone, Copy)]
pub struct LogSource<'a> {
    pub container_id: &'a str,
    pub container_name: &'a str,
}

/// Normalize one raw line of a container's json-file log.
///
/// Lines that are not json-file objects are kept as plain stdout text stamped
/// with `fallback_time`. Empty lines yield `None`.
pub fn parse_json_file_line(source: LogSource<'_>, raw: &str, fallback_time: Timestamp) -> Option<Record> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (stream, text, timestamp) = match serde_json::from_str::<JsonFileLine>(trimmed) {
        Ok(line) => {
            let ts = line
                .time
                .as_deref()
                .and_then(Timestamp::parse_rfc3339)
                .unwrap_or(fallback_time);
            (line.stream, line.log.trim_end().to_string(), ts)
        }
        Err(_) => ("stdout".to_string(), trimmed.to_string(), fallback_time),
    };

    let is_stderr = stream == "stderr";
    Some(Record {
        id: log_identity(source.container_id, trimmed),
        timestamp,
        domain: Domain::ContainerLogs,
        kind: if is_stderr { STDERR_KIND } else { STDOUT_KIND }.to_string(),
        severity: is_stderr.then_some(Severity::High),
        payload: json!({
            "containerId": source.container_id,
            "container": source.container_name,
            "stream": stream,
            "line": text,
        }),
    })
}

// ----------------------------------------------------------------------------
// docker logs --timestamps
// ----------------------------------------------------------------------------

/// Split `2024-01-27T10:30:45.123456789Z message` into its timestamp and text.
pub fn split_timestamped_line(line: &str) -> (Option<Timestamp>, &str) {
    match line.split_once(' ') {
        Some((head, rest)) => match Timestamp::parse_rfc3339(head) {
            Some(ts) => (Some(ts), rest),
            None => (None, line),
        },
        None => match Timestamp::parse_rfc3339(line) {
            Some(ts) => (Some(ts), ""),
            None => (None, line),
        },
    }
}

// ----------------------------------------------------------------------------
// Combined access log
// ----------------------------------------------------------------------------

static COMBINED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?P<addr>\S+) \S+ (?P<user>\S+) \[(?P<time>[^\]]+)\] "(?P<method>[A-Z]+) (?P<path>\S+) (?P<proto>[^"]+)" (?P<status>\d{3}) (?P<bytes>\d+|-)(?: "(?P<referer>[^"]*)" "(?P<agent>[^"]*)")?"#,
    )
    .unwrap_or_else(|e| panic!("bad access log pattern: {}", e))
});

/// One parsed access log request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub remote_addr: String,
    pub remote_user: Option<String>,
    pub time: Option<Timestamp>,
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub status: u16,
    pub bytes: u64,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

fn dash_to_none(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty() && *v != "-").map(str::to_string)
}

/// Parse an nginx/apache combined (or common) log line.
pub fn parse_access_line(line: &str) -> Option<AccessLogEntry> {
    let caps = COMBINED.captures(line.trim())?;
    let time = DateTime::parse_from_str(&caps["time"], "%d/%b/%Y:%H:%M:%S %z")
        .ok()
        .map(|dt| Timestamp::from_datetime(dt.with_timezone(&Utc)));

    Some(AccessLogEntry {
        remote_addr: caps["addr"].to_string(),
        remote_user: dash_to_none(caps.name("user").map(|m| m.as_str())),
        time,
        method: caps["method"].to_string(),
        path: caps["path"].to_string(),
        protocol: caps["proto"].to_string(),
        status: caps["status"].parse().ok()?,
        bytes: caps["bytes"].parse().unwrap_or(0),
        referer: dash_to_none(caps.name("referer").map(|m| m.as_str())),
        user_agent: dash_to_none(caps.name("agent").map(|m| m.as_str())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SRC: LogSource<'static> = LogSource {
        container_id: "4f1c2b9e8d7a",
        container_name: "web",
    };

    #[test]
    fn test_json_file_stdout_line() {
        let raw = r#"{"log":"GET / 200\n","stream":"stdout","time":"2024-01-27T10:30:45.123456789Z"}"#;
        let record = parse_json_file_line(SRC, raw, Timestamp::EPOCH).unwrap();
        assert_eq!(record.kind, STDOUT_KIND);
        assert_eq!(record.payload_str("line"), Some("GET / 200"));
        assert_eq!(record.payload_str("container"), Some("web"));
        assert_eq!(record.severity, None);
        assert_eq!(record.timestamp.to_rfc3339(), "2024-01-27T10:30:45.123456789Z");
    }

    #[test]
    fn test_json_file_stderr_is_high() {
        let raw = r#"{"log":"panic: boom\n","stream":"stderr","time":"2024-01-27T10:30:45Z"}"#;
        let record = parse_json_file_line(SRC, raw, Timestamp::EPOCH).unwrap();
        assert_eq!(record.kind, STDERR_KIND);
        assert_eq!(record.severity, Some(Severity::High));
    }

    #[test]
    fn test_plain_text_falls_back() {
        let now = Timestamp::from_secs(42);
        let record = parse_json_file_line(SRC, "  plain text  \n", now).unwrap();
        assert_eq!(record.timestamp, now);
        assert_eq!(record.payload_str("line"), Some("plain text"));
        assert!(parse_json_file_line(SRC, "\n", now).is_none());
    }

    #[test]
    fn test_split_timestamped_line() {
        let (ts, text) = split_timestamped_line("2024-01-27T10:30:45.000000001Z hello world");
        assert_eq!(ts.unwrap().as_nanos() % 10, 1);
        assert_eq!(text, "hello world");
        let (ts, text) = split_timestamped_line("no timestamp here");
        assert!(ts.is_none());
        assert_eq!(text, "no timestamp here");
    }

    #[test]
    fn test_parse_combined_line() {
        let line = r#"203.0.113.9 - - [27/Jan/2024:10:30:45 +0100] "GET /api/health HTTP/1.1" 200 17 "-" "curl/8.4.0""#;
        let entry = parse_access_line(line).unwrap();
        assert_eq!(entry.remote_addr, "203.0.113.9");
        assert_eq!(entry.method, "GET");
        assert_eq!(entry.path, "/api/health");
        assert_eq!(entry.status, 200);
        assert_eq!(entry.bytes, 17);
        assert_eq!(entry.referer, None);
        assert_eq!(entry.user_agent.as_deref(), Some("curl/8.4.0"));
        assert_eq!(entry.time.unwrap().to_rfc3339(), "2024-01-27T09:30:45Z");
    }

    #[test]
    fn test_parse_common_line_without_agent() {
        let line = r#"10.0.0.1 - alice [27/Jan/2024:10:30:45 +0000] "POST /login HTTP/2.0" 302 -"#;
        let entry = parse_access_line(line).unwrap();
        assert_eq!(entry.remote_user.as_deref(), Some("alice"));
        assert_eq!(entry.bytes, 0);
        assert!(parse_access_line("garbage").is_none());
    }
}
