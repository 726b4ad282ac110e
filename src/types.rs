// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The fundamental data types that flow from collectors into the cache store
// and out to subscribers:
// - Timestamp: nanosecond precision, day-bucket aware
// - Domain: which collector produced a record, and where it is stored
// - Record: one immutable, normalized observation with its dedup identity
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
///
/// Serialized as an RFC 3339 string for clients; deserialization also accepts
/// raw nanoseconds so stored entries stay compact if needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Get the current timestamp with nanosecond precision
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Calculate duration between two timestamps (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_nanos() as i64))
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Create from chrono DateTime<Utc>
    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }

    /// Parse an RFC 3339 / ISO 8601 timestamp such as Docker's
    /// `2024-01-27T10:30:45.123456789Z`.
    pub fn parse_rfc3339(s: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| Self::from_datetime(dt.with_timezone(&Utc)))
    }

    /// UTC calendar day of this timestamp, `YYYY-MM-DD`.
    pub fn day_key(&self) -> String {
        self.to_datetime().format("%Y-%m-%d").to_string()
    }

    /// RFC 3339 rendering used on the wire.
    pub fn to_rfc3339(&self) -> String {
        self.to_datetime()
            .to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Nanos(i64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Nanos(nanos) => Ok(Timestamp(nanos)),
            Repr::Text(text) => Timestamp::parse_rfc3339(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", text))),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.2 Severity Levels
// ----------------------------------------------------------------------------

/// Severity levels for records that carry one
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - no action needed
    Info = 0,
    /// Low severity - worth noticing
    Low = 1,
    /// Medium severity - should be looked at
    Medium = 2,
    /// High severity - needs attention
    High = 3,
    /// Critical severity - immediate action required
    Critical = 4,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Domains & Retention Classes
// ----------------------------------------------------------------------------

/// Retention class of a domain. Each class has its own TTL, per-bucket cap
/// and default replay lookback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionClass {
    Logs,
    Activity,
    Metrics,
}

/// A stream of host signals owned by exactly one collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Container lifecycle events from the container runtime
    ContainerEvents,
    /// SSH authentication activity from the auth log
    AuthLog,
    /// Threshold breaches on CPU, memory and disk
    ResourceSpikes,
    /// Container stdout/stderr lines
    ContainerLogs,
    /// Periodic host metric samples
    Metrics,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::ContainerEvents,
        Domain::AuthLog,
        Domain::ResourceSpikes,
        Domain::ContainerLogs,
        Domain::Metrics,
    ];

    /// Cache store key prefix. Buckets are `<prefix>:<YYYY-MM-DD>`.
    pub const fn key_prefix(&self) -> &'static str {
        match self {
            Domain::ContainerEvents => "activity:docker",
            Domain::AuthLog => "activity:ssh",
            Domain::ResourceSpikes => "activity:resources",
            Domain::ContainerLogs => "logs:containers",
            Domain::Metrics => "metrics:host",
        }
    }

    pub const fn retention_class(&self) -> RetentionClass {
        match self {
            Domain::ContainerEvents | Domain::AuthLog | Domain::ResourceSpikes => {
                RetentionClass::Activity
            }
            Domain::ContainerLogs => RetentionClass::Logs,
            Domain::Metrics => RetentionClass::Metrics,
        }
    }

    /// Channel name used in stream chunks for this domain.
    pub const fn stream_name(&self) -> &'static str {
        match self {
            Domain::ContainerEvents => "docker.events",
            Domain::AuthLog => "ssh.events",
            Domain::ResourceSpikes => "system.events",
            Domain::ContainerLogs => "docker.containerLogs",
            Domain::Metrics => "system.metricsLive",
        }
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Domain::ContainerEvents => "container_events",
            Domain::AuthLog => "auth_log",
            Domain::ResourceSpikes => "resource_spikes",
            Domain::ContainerLogs => "container_logs",
            Domain::Metrics => "metrics",
        };
        f.write_str(s)
    }
}

// ----------------------------------------------------------------------------
// 3.4 Records
// ----------------------------------------------------------------------------

/// Deterministic dedup identity of a record. Two records with the same id are
/// the same logical occurrence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One normalized observation: an event, a log line or a metric sample.
///
/// Records are built by the normalizer (which also derives `id`) and are
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub timestamp: Timestamp,
    pub domain: Domain,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub payload: JsonValue,
}

impl Record {
    /// Field lookup on the payload, for filters.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(JsonValue::as_str)
    }
}
