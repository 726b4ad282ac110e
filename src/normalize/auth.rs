//! sshd authentication lines from `/var/log/auth.log` or `/var/log/secure`.
//!
//! Lines are matched against an ordered rule list; the first rule that
//! matches decides the kind. Lines no rule matches are dropped.

use chrono::{Datelike, Local, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use super::{activity_identity, unstamped_identity};
use crate::types::{Domain, Record, Severity, Timestamp};

pub const EVENT_SOURCE: &str = "ssh";

/// Outcome of an authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Failed,
    Blocked,
}

impl AuthOutcome {
    pub const fn kind(&self) -> &'static str {
        match self {
            AuthOutcome::Success => "SSH_LOGIN_SUCCESS",
            AuthOutcome::Failed => "SSH_LOGIN_FAILED",
            AuthOutcome::Blocked => "SSH_CONNECTION_BLOCKED",
        }
    }

    pub const fn severity(&self) -> Severity {
        match self {
            AuthOutcome::Success => Severity::Info,
            AuthOutcome::Failed => Severity::Medium,
            AuthOutcome::Blocked => Severity::Low,
        }
    }
}

struct AuthRule {
    outcome: AuthOutcome,
    pattern: Regex,
}

// Rule order matters: "Failed password for invalid user" must hit the failed
// rule before the invalid-user rule, and accepted logins win over everything.
static RULES: Lazy<Vec<AuthRule>> = Lazy::new(|| {
    let rule = |outcome, pattern: &str| AuthRule {
        outcome,
        pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("bad auth rule {}: {}", pattern, e)),
    };
    vec![
        rule(
            AuthOutcome::Success,
            r"Accepted (?P<method>publickey|password|keyboard-interactive/pam) for (?P<user>\S+) from (?P<ip>\S+) port (?P<port>\d+)",
        ),
        rule(
            AuthOutcome::Failed,
            r"Failed (?P<method>password|publickey|keyboard-interactive/pam) for (?:invalid user )?(?P<user>\S+) from (?P<ip>\S+) port (?P<port>\d+)",
        ),
        rule(
            AuthOutcome::Failed,
            r"Invalid user (?P<user>\S*) from (?P<ip>\S+)(?: port (?P<port>\d+))?",
        ),
        rule(
            AuthOutcome::Blocked,
            r"Connection closed by (?:(?:authenticating|invalid) user (?P<user>\S+) )?(?P<ip>\S+) port (?P<port>\d+)(?: \[preauth\])?",
        ),
        rule(
            AuthOutcome::Blocked,
            r"(?:Disconnected from|Received disconnect from|Connection reset by) (?:(?:authenticating|invalid) user (?P<user>\S+) )?(?P<ip>\S+) port (?P<port>\d+).*\[preauth\]",
        ),
    ]
});

static SYSLOG_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<ts>[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(?P<host>\S+)\s+")
        .unwrap_or_else(|e| panic!("bad syslog prefix: {}", e))
});

static ISO_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2}))\s+(?P<host>\S+)\s+")
        .unwrap_or_else(|e| panic!("bad iso prefix: {}", e))
});

/// A classified auth line before it becomes a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub outcome: AuthOutcome,
    pub timestamp: Timestamp,
    pub host: Option<String>,
    pub user: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub method: Option<String>,
    pub message: String,
    /// False when the line carried no readable time and `timestamp` is the
    /// observation time.
    pub stamped: bool,
}

/// Parse the leading timestamp of a syslog or RFC 3339 line.
///
/// Classic syslog stamps carry neither year nor offset; they are read in the
/// host's local zone, which is what syslog wrote them in.
pub fn parse_line_timestamp(line: &str, now: Timestamp) -> Option<(Timestamp, Option<String>)> {
    parse_line_timestamp_in(line, now, &Local)
}

/// [`parse_line_timestamp`] with syslog stamps read in `zone`.
///
/// The year of `now` in `zone` is assumed, stepping back a year when that
/// would put the line more than a day in the future.
pub fn parse_line_timestamp_in<Tz: TimeZone>(
    line: &str,
    now: Timestamp,
    zone: &Tz,
) -> Option<(Timestamp, Option<String>)> {
    if let Some(caps) = ISO_PREFIX.captures(line) {
        let ts = Timestamp::parse_rfc3339(&caps["ts"])?;
        return Some((ts, Some(caps["host"].to_string())));
    }

    let caps = SYSLOG_PREFIX.captures(line)?;
    let collapsed = caps["ts"].split_whitespace().collect::<Vec<_>>().join(" ");
    let year = now.to_datetime().with_timezone(zone).year();
    let parse_in = |year: i32| {
        let naive = NaiveDateTime::parse_from_str(&format!("{} {}", year, collapsed), "%Y %b %d %H:%M:%S").ok()?;
        // Ambiguous wall times (DST fall-back) take the earlier instant.
        zone.from_local_datetime(&naive)
            .earliest()
            .map(|local| Timestamp::from_datetime(local.with_timezone(&Utc)))
    };

    let mut ts = parse_in(year)?;
    if ts > now.add_duration(std::time::Duration::from_secs(86_400)) {
        ts = parse_in(year - 1)?;
    }
    Some((ts, Some(caps["host"].to_string())))
}

/// Classify one auth log line. `None` when no rule matches.
pub fn classify_line(line: &str, now: Timestamp) -> Option<AuthEvent> {
    let (rule, caps) = RULES
        .iter()
        .find_map(|rule| rule.pattern.captures(line).map(|caps| (rule, caps)))?;

    let (timestamp, host, stamped) = match parse_line_timestamp(line, now) {
        Some((timestamp, host)) => (timestamp, host, true),
        None => (now, None, false),
    };
    let field = |name: &str| {
        caps.name(name)
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty())
    };

    Some(AuthEvent {
        outcome: rule.outcome,
        timestamp,
        host,
        user: field("user"),
        ip: field("ip"),
        port: field("port").and_then(|p| p.parse().ok()),
        method: field("method"),
        message: line.trim().to_string(),
        stamped,
    })
}

/// Build the stored record for a classified line.
pub fn to_record(event: &AuthEvent) -> Record {
    let kind = event.outcome.kind();
    let subject = event
        .user
        .as_deref()
        .or(event.ip.as_deref())
        .unwrap_or_default();

    let id = if event.stamped {
        activity_identity(kind, EVENT_SOURCE, event.timestamp, subject)
    } else {
        unstamped_identity(kind, EVENT_SOURCE, &event.message)
    };

    Record {
        id,
        timestamp: event.timestamp,
        domain: Domain::AuthLog,
        kind: kind.to_string(),
        severity: Some(event.outcome.severity()),
        payload: json!({
            "username": event.user,
            "ip": event.ip,
            "port": event.port,
            "method": event.method,
            "host": event.host,
            "message": event.message,
            "source": EVENT_SOURCE,
        }),
    }
}

/// Classify and normalize in one step.
pub fn parse_auth_line(line: &str, now: Timestamp) -> Option<Record> {
    classify_line(line, now).map(|event| to_record(&event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use pretty_assertions::{assert_eq, assert_ne};
    use rstest::rstest;

    fn now() -> Timestamp {
        Timestamp::from_datetime(Utc.with_ymd_and_hms(2026, 1, 27, 12, 0, 0).unwrap())
    }

    #[rstest]
    #[case("Jan 27 10:30:45 web1 sshd[1234]: Accepted publickey for root from 10.0.0.5 port 51234 ssh2: RSA SHA256:abc", AuthOutcome::Success, Some("root"))]
    #[case("Jan 27 10:30:45 web1 sshd[1234]: Accepted password for deploy from 10.0.0.5 port 51234 ssh2", AuthOutcome::Success, Some("deploy"))]
    #[case("Jan 27 10:30:45 web1 sshd[1234]: Failed password for root from 1.2.3.4 port 5555 ssh2", AuthOutcome::Failed, Some("root"))]
    #[case("Jan 27 10:30:45 web1 sshd[1234]: Failed password for invalid user admin from 1.2.3.4 port 5555 ssh2", AuthOutcome::Failed, Some("admin"))]
    #[case("Jan 27 10:30:45 web1 sshd[1234]: Invalid user oracle from 1.2.3.4 port 40000", AuthOutcome::Failed, Some("oracle"))]
    #[case("Jan 27 10:30:45 web1 sshd[1234]: Connection closed by 1.2.3.4 port 40000 [preauth]", AuthOutcome::Blocked, None)]
    #[case("Jan 27 10:30:45 web1 sshd[1234]: Connection closed by authenticating user root 1.2.3.4 port 40000 [preauth]", AuthOutcome::Blocked, Some("root"))]
    #[case("Jan 27 10:30:45 web1 sshd[1234]: Disconnected from invalid user test 1.2.3.4 port 40000 [preauth]", AuthOutcome::Blocked, Some("test"))]
    fn test_rule_classification(
        #[case] line: &str,
        #[case] outcome: AuthOutcome,
        #[case] user: Option<&str>,
    ) {
        let event = classify_line(line, now()).unwrap();
        assert_eq!(event.outcome, outcome);
        assert_eq!(event.user.as_deref(), user);
        assert_eq!(event.ip.as_deref(), Some(if outcome == AuthOutcome::Success { "10.0.0.5" } else { "1.2.3.4" }));
    }

    #[rstest]
    #[case("Jan 27 10:30:45 web1 CRON[99]: pam_unix(cron:session): session opened for user root")]
    #[case("Jan 27 10:30:45 web1 sshd[1234]: Server listening on 0.0.0.0 port 22.")]
    #[case("")]
    fn test_unmatched_lines_dropped(#[case] line: &str) {
        assert!(classify_line(line, now()).is_none());
    }

    #[test]
    fn test_syslog_timestamp_uses_current_year() {
        let (ts, host) = parse_line_timestamp_in("Jan  5 08:00:00 web1 sshd[1]: x", now(), &Utc).unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-01-05T08:00:00Z");
        assert_eq!(host.as_deref(), Some("web1"));
    }

    #[test]
    fn test_syslog_timestamp_rolls_back_a_year() {
        let (ts, _) = parse_line_timestamp_in("Dec 31 23:59:59 web1 sshd[1]: x", now(), &Utc).unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-12-31T23:59:59Z");
    }

    #[rstest]
    #[case::east(2, "2026-01-27T08:30:45Z")]
    #[case::west(-5, "2026-01-27T15:30:45Z")]
    fn test_syslog_timestamp_read_in_host_zone(#[case] hours: i32, #[case] expected: &str) {
        let zone = FixedOffset::east_opt(hours * 3600).unwrap();
        let (ts, _) = parse_line_timestamp_in("Jan 27 10:30:45 web1 sshd[1]: x", now(), &zone).unwrap();
        assert_eq!(ts.to_rfc3339(), expected);
    }

    #[test]
    fn test_syslog_timestamp_defaults_to_local_zone() {
        let line = "Jan 27 10:30:45 web1 sshd[1]: x";
        assert_eq!(
            parse_line_timestamp(line, now()),
            parse_line_timestamp_in(line, now(), &Local)
        );
    }

    #[test]
    fn test_unstamped_line_keeps_identity_across_reads() {
        let line = "sshd[1234]: Failed password for root from 1.2.3.4 port 5555 ssh2";
        let first = parse_auth_line(line, now()).unwrap();
        let later = parse_auth_line(line, now().add_duration(std::time::Duration::from_secs(90))).unwrap();
        assert_eq!(first.id, later.id);
        assert_eq!(first.timestamp, now());

        let other = parse_auth_line("sshd[1240]: Failed password for root from 1.2.3.4 port 5556 ssh2", now()).unwrap();
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn test_iso_timestamp() {
        let line = "2026-01-27T10:30:45.123456+00:00 web1 sshd[1]: Failed password for root from 1.2.3.4 port 22 ssh2";
        let record = parse_auth_line(line, now()).unwrap();
        assert_eq!(record.kind, "SSH_LOGIN_FAILED");
        assert_eq!(record.timestamp.to_rfc3339(), "2026-01-27T10:30:45.123456Z");
        assert_eq!(record.severity, Some(Severity::Medium));
    }

    #[test]
    fn test_same_line_same_identity() {
        let line = "Jan 27 10:30:45 web1 sshd[1234]: Accepted publickey for root from 10.0.0.5 port 51234 ssh2";
        assert_eq!(
            parse_auth_line(line, now()).unwrap().id,
            parse_auth_line(line, now()).unwrap().id
        );
    }
}
