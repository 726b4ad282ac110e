//! Host metric samples and resource threshold events.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{activity_identity, metric_identity};
use crate::types::{Domain, Record, Severity, Timestamp};

pub const SAMPLE_KIND: &str = "METRIC_SAMPLE";
pub const EVENT_SOURCE: &str = "resources";

/// One resource utilization sample. Rates are per second over the interval
/// since the previous sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub hostname: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_percent: f64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_read_bytes_per_sec: f64,
    pub disk_write_bytes_per_sec: f64,
    pub net_rx_bytes_per_sec: f64,
    pub net_tx_bytes_per_sec: f64,
    pub load_1m: f64,
}

/// Metric kinds that can raise a threshold event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpikeKind {
    Cpu,
    Memory,
    Disk,
}

impl SpikeKind {
    pub const ALL: [SpikeKind; 3] = [SpikeKind::Cpu, SpikeKind::Memory, SpikeKind::Disk];

    pub const fn event_kind(&self) -> &'static str {
        match self {
            SpikeKind::Cpu => "HIGH_CPU_USAGE",
            SpikeKind::Memory => "HIGH_MEMORY_USAGE",
            SpikeKind::Disk => "HIGH_DISK_USAGE",
        }
    }

    pub fn value_in(&self, sample: &MetricSample) -> f64 {
        match self {
            SpikeKind::Cpu => sample.cpu_percent,
            SpikeKind::Memory => sample.memory_percent,
            SpikeKind::Disk => sample.disk_percent,
        }
    }
}

pub fn sample_record(sample: &MetricSample, timestamp: Timestamp) -> Record {
    Record {
        id: metric_identity(timestamp, &sample.hostname),
        timestamp,
        domain: Domain::Metrics,
        kind: SAMPLE_KIND.to_string(),
        severity: None,
        payload: serde_json::to_value(sample).unwrap_or_default(),
    }
}

pub fn spike_record(
    kind: SpikeKind,
    value: f64,
    threshold: f64,
    hostname: &str,
    timestamp: Timestamp,
) -> Record {
    let event_kind = kind.event_kind();
    Record {
        id: activity_identity(event_kind, EVENT_SOURCE, timestamp, hostname),
        timestamp,
        domain: Domain::ResourceSpikes,
        kind: event_kind.to_string(),
        severity: Some(Severity::High),
        payload: json!({
            "metric": kind,
            "value": (value * 10.0).round() / 10.0,
            "threshold": threshold,
            "hostname": hostname,
            "source": EVENT_SOURCE,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_record_payload() {
        let sample = MetricSample {
            hostname: "web1".into(),
            cpu_percent: 12.5,
            ..Default::default()
        };
        let record = sample_record(&sample, Timestamp::from_secs(100));
        assert_eq!(record.kind, SAMPLE_KIND);
        assert_eq!(record.payload["cpuPercent"], 12.5);
        assert_eq!(record.payload_str("hostname"), Some("web1"));
    }

    #[test]
    fn test_spike_record() {
        let record = spike_record(SpikeKind::Cpu, 91.234, 85.0, "web1", Timestamp::from_secs(5));
        assert_eq!(record.kind, "HIGH_CPU_USAGE");
        assert_eq!(record.domain, Domain::ResourceSpikes);
        assert_eq!(record.payload["value"], 91.2);
        assert_eq!(record.payload["metric"], "cpu");
    }
}
