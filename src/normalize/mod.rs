// ============================================================================
// SECTION 6: EVENT NORMALIZATION & DEDUP IDENTITY
// ============================================================================
// Pure functions that turn raw host output into canonical records:
// - container runtime events     (docker.rs)
// - sshd auth log lines          (auth.rs)
// - container and proxy logs     (logs.rs)
// - host metric samples / spikes (metrics.rs)
//
// Every record carries a deterministic identity so that at-least-once
// collectors collapse to exactly one stored copy.
// ============================================================================

pub mod auth;
pub mod docker;
pub mod logs;
pub mod metrics;

use serde_json::Value as JsonValue;
use xxhash_rust::xxh3::Xxh3;

use crate::types::{RecordId, Timestamp};

/// Separates hashed fields so ("ab","c") and ("a","bc") differ.
const FIELD_SEPARATOR: &[u8] = &[0x1f];

fn digest<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> RecordId {
    let mut hasher = Xxh3::new();
    for part in parts {
        hasher.update(part);
        hasher.update(FIELD_SEPARATOR);
    }
    RecordId::new(format!("{:032x}", hasher.digest128()))
}

/// Identity of an activity event: `kind + source + timestamp + subject`,
/// where subject is the username, ip or container name.
pub fn activity_identity(kind: &str, source: &str, timestamp: Timestamp, subject: &str) -> RecordId {
    let ts = timestamp.as_nanos().to_be_bytes();
    digest([
        kind.as_bytes(),
        source.as_bytes(),
        &ts[..],
        subject.as_bytes(),
    ])
}

/// Identity of an activity event whose time could not be read, taken from
/// the text that reported it so a re-read line still collapses.
pub fn unstamped_identity(kind: &str, source: &str, text: &str) -> RecordId {
    digest([kind.as_bytes(), source.as_bytes(), text.trim().as_bytes()])
}

/// Identity of a log line scoped by its source.
///
/// Lines that carry a structured JSON object are identified by the canonical
/// form of that object (keys sorted, whitespace dropped), anything else by
/// the trimmed text.
pub fn log_identity(source: &str, line: &str) -> RecordId {
    let trimmed = line.trim();
    match serde_json::from_str::<JsonValue>(trimmed) {
        Ok(value @ JsonValue::Object(_)) => {
            let canonical = canonical_json(&value);
            digest([source.as_bytes(), canonical.as_bytes()])
        }
        _ => digest([source.as_bytes(), trimmed.as_bytes()]),
    }
}

/// Identity of a metric sample: `timestamp + hostname`.
pub fn metric_identity(timestamp: Timestamp, hostname: &str) -> RecordId {
    let ts = timestamp.as_nanos().to_be_bytes();
    digest([&ts[..], hostname.as_bytes()])
}

/// Compact JSON with object keys in sorted order.
pub fn canonical_json(value: &JsonValue) -> String {
    // serde_json's default map is ordered by key, so serialization is stable.
    serde_json::to_string(value).unwrap_or_default()
}
