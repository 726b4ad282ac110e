// ============================================================================
// SECTION 10: RESOURCE UTILIZATION COLLECTOR
// ============================================================================
// Samples procfs on a fixed interval:
// - CPU, disk I/O and network from cumulative counters (delta over interval)
// - memory, filesystem usage and load average as instantaneous readings
//
// The first read only establishes the baseline. Every later read is stored
// as a METRIC_SAMPLE, and a usage above the threshold raises at most one
// HIGH_*_USAGE event per metric kind per cooldown window.
// ============================================================================

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::statvfs::statvfs;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::{BaseCollector, Collector, CollectorHealth, CollectorMonitor, CollectorStats, Recorder};
use crate::config::ResourcesConfig;
use crate::error::{CollectorError, CollectorResult, HostError};
use crate::log_collector;
use crate::normalize::metrics::{sample_record, spike_record, MetricSample, SpikeKind};
use crate::types::{Domain, Timestamp};

const NAME: &str = "resources";

// ----------------------------------------------------------------------------
// 10.1 CPU Snapshot
// ----------------------------------------------------------------------------

/// Aggregate CPU counters from the `cpu` line of /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuSnapshot {
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }

    /// Non-idle ticks.
    pub fn active(&self) -> u64 {
        self.total() - self.idle - self.iowait
    }

    /// Parse `cpu  12345 678 9012 34567 890 12 34 56`. Per-core lines are
    /// rejected.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        if parts.next()? != "cpu" {
            return None;
        }

        let mut next = || parts.next().and_then(|s| s.parse::<u64>().ok());
        let user = next()?;
        let nice = next()?;
        let system = next()?;
        let idle = next()?;
        Some(Self {
            user,
            nice,
            system,
            idle,
            iowait: next().unwrap_or(0),
            irq: next().unwrap_or(0),
            softirq: next().unwrap_or(0),
            steal: next().unwrap_or(0),
        })
    }

    /// Busy percentage between `prev` and `self`.
    pub fn usage_since(&self, prev: &CpuSnapshot) -> f64 {
        let total_delta = self.total().saturating_sub(prev.total());
        if total_delta == 0 {
            return 0.0;
        }
        (self.active().saturating_sub(prev.active()) as f64 / total_delta as f64) * 100.0
    }
}

// ----------------------------------------------------------------------------
// 10.2 Disk & Network Counters
// ----------------------------------------------------------------------------

/// Read/write sector counters of one block device from /proc/diskstats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskSnapshot {
    pub device: String,
    pub sectors_read: u64,
    pub sectors_written: u64,
}

impl DiskSnapshot {
    pub const SECTOR_SIZE: u64 = 512;

    /// Parse `   8       0 sda 12345 678 901234 5678 ...`. Loop, ram and
    /// device-mapper devices are skipped.
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            return None;
        }

        let device = parts[2];
        if device.starts_with("loop") || device.starts_with("ram") || device.starts_with("dm-") {
            return None;
        }

        Some(Self {
            device: device.to_string(),
            sectors_read: parts[5].parse().unwrap_or(0),
            sectors_written: parts[9].parse().unwrap_or(0),
        })
    }

    /// Whole disks (sda, vda, nvme0n1) as opposed to partitions (sda1,
    /// nvme0n1p1). Only whole disks are summed so partitions are not
    /// counted twice.
    pub fn is_whole_disk(&self) -> bool {
        let name = self.device.as_str();
        if let Some(rest) = name.strip_prefix("nvme").or_else(|| name.strip_prefix("mmcblk")) {
            !rest.contains('p')
        } else {
            !name.ends_with(|c: char| c.is_ascii_digit())
        }
    }
}

/// Byte counters of one interface from /proc/net/dev.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetIfSnapshot {
    pub interface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl NetIfSnapshot {
    /// Parse `  eth0: 12345 678 9 0 0 0 0 0 12345 678 9 0 0 0 0 0`. The
    /// loopback interface is skipped.
    pub fn parse(line: &str) -> Option<Self> {
        let (name, counters) = line.trim().split_once(':')?;
        let interface = name.trim();
        if interface == "lo" {
            return None;
        }

        let values: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect();
        if values.len() < 16 {
            return None;
        }

        Some(Self {
            interface: interface.to_string(),
            rx_bytes: values[0],
            tx_bytes: values[8],
        })
    }
}

// ----------------------------------------------------------------------------
// 10.3 Instantaneous Readings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemInfo {
    /// Parse /proc/meminfo. Kernels without `MemAvailable` fall back to
    /// free + buffers + cached.
    pub fn parse(content: &str) -> Option<Self> {
        let mut fields: HashMap<&str, u64> = HashMap::new();
        for line in content.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                fields.insert(key.trim(), kb * 1024);
            }
        }

        let total_bytes = *fields.get("MemTotal")?;
        let available_bytes = fields.get("MemAvailable").copied().unwrap_or_else(|| {
            ["MemFree", "Buffers", "Cached"]
                .iter()
                .filter_map(|k| fields.get(k))
                .sum()
        });
        Some(Self {
            total_bytes,
            available_bytes: available_bytes.min(total_bytes),
        })
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes - self.available_bytes
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes() as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

impl FsUsage {
    /// Usage as `df` reports it: blocks reserved for root count as neither
    /// used nor available.
    pub fn percent(&self) -> f64 {
        let visible = self.used_bytes + self.available_bytes;
        if visible == 0 {
            0.0
        } else {
            self.used_bytes as f64 / visible as f64 * 100.0
        }
    }
}

// ----------------------------------------------------------------------------
// 10.4 Counter Source
// ----------------------------------------------------------------------------

/// One raw read of every counter the sampler needs.
#[derive(Debug, Clone, Default)]
pub struct RawCounters {
    pub cpu: Option<CpuSnapshot>,
    pub disks: Vec<DiskSnapshot>,
    pub nets: Vec<NetIfSnapshot>,
    pub memory: MemInfo,
    pub filesystem: FsUsage,
    pub load_1m: f64,
}

/// Where counters come from.
pub trait CounterSource: Send + Sync + Debug {
    fn read(&self) -> CollectorResult<RawCounters>;
}

/// Reads counters from a procfs mount and `statvfs` of one filesystem.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
    disk_mount: PathBuf,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>, disk_mount: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            disk_mount: disk_mount.into(),
        }
    }

    fn read_file(&self, relative: &str) -> Result<String, HostError> {
        let path = self.root.join(relative);
        fs::read_to_string(&path).map_err(|e| HostError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    fn filesystem(path: &Path) -> Result<FsUsage, HostError> {
        let stats = statvfs(path).map_err(|e| HostError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let frsize = stats.fragment_size() as u64;
        let blocks = stats.blocks() as u64;
        let free = stats.blocks_free() as u64;
        let available = stats.blocks_available() as u64;
        Ok(FsUsage {
            total_bytes: blocks * frsize,
            used_bytes: blocks.saturating_sub(free) * frsize,
            available_bytes: available * frsize,
        })
    }
}

impl CounterSource for ProcFs {
    fn read(&self) -> CollectorResult<RawCounters> {
        let stat = self.read_file("stat")?;
        let meminfo = self.read_file("meminfo")?;

        let memory = MemInfo::parse(&meminfo)
            .ok_or_else(|| CollectorError::collection_failed(NAME, "meminfo has no MemTotal"))?;

        // Disk, network and load are best effort: containers and some
        // kernels hide them.
        let disks = self
            .read_file("diskstats")
            .map(|c| c.lines().filter_map(DiskSnapshot::parse).collect())
            .unwrap_or_default();
        let nets = self
            .read_file("net/dev")
            .map(|c| c.lines().skip(2).filter_map(NetIfSnapshot::parse).collect())
            .unwrap_or_default();
        let load_1m = self
            .read_file("loadavg")
            .ok()
            .and_then(|c| c.split_whitespace().next().and_then(|v| v.parse().ok()))
            .unwrap_or(0.0);
        let filesystem = Self::filesystem(&self.disk_mount).unwrap_or_default();

        Ok(RawCounters {
            cpu: stat.lines().find_map(CpuSnapshot::parse),
            disks,
            nets,
            memory,
            filesystem,
            load_1m,
        })
    }
}

// ----------------------------------------------------------------------------
// 10.5 Sampler
// ----------------------------------------------------------------------------

/// Turns successive counter reads into samples.
#[derive(Debug)]
pub struct Sampler {
    hostname: String,
    previous: Option<(RawCounters, Instant)>,
}

impl Sampler {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            previous: None,
        }
    }

    /// Sample from `current` read at `at`. `None` for the baseline read.
    pub fn sample(&mut self, current: RawCounters, at: Instant) -> Option<MetricSample> {
        let Some((previous, previous_at)) = self.previous.replace((current, at)) else {
            return None;
        };
        let (current, _) = self.previous.as_ref()?;

        let secs = at.saturating_duration_since(previous_at).as_secs_f64();
        let rate = |delta: u64| if secs > 0.0 { delta as f64 / secs } else { 0.0 };

        let cpu_percent = match (&current.cpu, &previous.cpu) {
            (Some(now), Some(before)) => now.usage_since(before),
            _ => 0.0,
        };

        let before_disks: HashMap<&str, &DiskSnapshot> = previous
            .disks
            .iter()
            .map(|d| (d.device.as_str(), d))
            .collect();
        let (mut read_sectors, mut written_sectors) = (0u64, 0u64);
        for disk in current.disks.iter().filter(|d| d.is_whole_disk()) {
            if let Some(before) = before_disks.get(disk.device.as_str()) {
                read_sectors += disk.sectors_read.saturating_sub(before.sectors_read);
                written_sectors += disk.sectors_written.saturating_sub(before.sectors_written);
            }
        }

        let before_nets: HashMap<&str, &NetIfSnapshot> = previous
            .nets
            .iter()
            .map(|n| (n.interface.as_str(), n))
            .collect();
        let (mut rx, mut tx) = (0u64, 0u64);
        for net in &current.nets {
            if let Some(before) = before_nets.get(net.interface.as_str()) {
                rx += net.rx_bytes.saturating_sub(before.rx_bytes);
                tx += net.tx_bytes.saturating_sub(before.tx_bytes);
            }
        }

        Some(MetricSample {
            hostname: self.hostname.clone(),
            cpu_percent,
            memory_percent: current.memory.percent(),
            memory_used_bytes: current.memory.used_bytes(),
            memory_total_bytes: current.memory.total_bytes,
            disk_percent: current.filesystem.percent(),
            disk_used_bytes: current.filesystem.used_bytes,
            disk_total_bytes: current.filesystem.total_bytes,
            disk_read_bytes_per_sec: rate(read_sectors * DiskSnapshot::SECTOR_SIZE),
            disk_write_bytes_per_sec: rate(written_sectors * DiskSnapshot::SECTOR_SIZE),
            net_rx_bytes_per_sec: rate(rx),
            net_tx_bytes_per_sec: rate(tx),
            load_1m: current.load_1m,
        })
    }
}

// ----------------------------------------------------------------------------
// 10.6 Threshold Gate
// ----------------------------------------------------------------------------

/// Rate-limits threshold events to one per metric kind per cooldown.
#[derive(Debug)]
pub struct ThresholdGate {
    threshold: f64,
    cooldown: Duration,
    last_fired: HashMap<SpikeKind, Instant>,
}

impl ThresholdGate {
    pub fn new(threshold: f64, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            last_fired: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Kinds above the threshold whose cooldown has elapsed, with their
    /// values. Firing restarts that kind's cooldown.
    pub fn check(&mut self, sample: &MetricSample, now: Instant) -> Vec<(SpikeKind, f64)> {
        let mut fired = Vec::new();
        for kind in SpikeKind::ALL {
            let value = kind.value_in(sample);
            if value <= self.threshold {
                continue;
            }
            let cooling = self
                .last_fired
                .get(&kind)
                .map_or(false, |at| now.saturating_duration_since(*at) < self.cooldown);
            if !cooling {
                self.last_fired.insert(kind, now);
                fired.push((kind, value));
            }
        }
        fired
    }
}

// ----------------------------------------------------------------------------
// 10.7 Resource Collector
// ----------------------------------------------------------------------------

/// One sampling cycle: read, sample, record, gate.
async fn sample_cycle(
    source: &dyn CounterSource,
    sampler: &mut Sampler,
    gate: &mut ThresholdGate,
    monitor: &CollectorMonitor,
    sink: &Recorder,
) -> CollectorResult<usize> {
    let counters = source.read()?;
    let now = Instant::now();
    let Some(sample) = sampler.sample(counters, now) else {
        return Ok(0);
    };

    let timestamp = Timestamp::now();
    let mut produced = 1;
    monitor.emit(sink, sample_record(&sample, timestamp)).await;

    for (kind, value) in gate.check(&sample, now) {
        log_collector!(NAME, "threshold", metric = ?kind, value = value);
        monitor
            .emit(sink, spike_record(kind, value, gate.threshold(), &sample.hostname, timestamp))
            .await;
        produced += 1;
    }
    Ok(produced)
}

/// Resource utilization collector.
#[derive(Debug)]
pub struct ResourceCollector {
    base: BaseCollector,
    config: ResourcesConfig,
    source: Arc<dyn CounterSource>,
    hostname: String,
}

impl ResourceCollector {
    pub fn new(config: ResourcesConfig, hostname: impl Into<String>) -> Self {
        let source = Arc::new(ProcFs::new(&config.proc_root, &config.disk_mount));
        Self::with_source(config, hostname, source)
    }

    pub fn with_source(
        config: ResourcesConfig,
        hostname: impl Into<String>,
        source: Arc<dyn CounterSource>,
    ) -> Self {
        Self {
            base: BaseCollector::new(NAME),
            config,
            source,
            hostname: hostname.into(),
        }
    }
}

#[async_trait]
impl Collector for ResourceCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn domains(&self) -> &'static [Domain] {
        &[Domain::Metrics, Domain::ResourceSpikes]
    }

    async fn start(&mut self, sink: Recorder) -> CollectorResult<()> {
        let Some(shutdown) = self.base.begin() else {
            return Ok(());
        };

        let monitor = self.base.monitor();
        let source = self.source.clone();
        let period = self.config.sample_interval;
        let mut sampler = Sampler::new(self.hostname.clone());
        let mut gate = ThresholdGate::new(self.config.threshold_percent, self.config.cooldown);

        let handle = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let started = Instant::now();
                        match sample_cycle(source.as_ref(), &mut sampler, &mut gate, &monitor, &sink).await {
                            Ok(_) => monitor.record_success(started.elapsed()),
                            Err(e) => {
                                monitor.record_error(&e.to_string());
                                debug!(target: "hostd::collector::resources", error = %e, "Sampling failed");
                            }
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        self.base.set_task(handle);
        info!(
            target: "hostd::collector::resources",
            interval_ms = period.as_millis() as u64,
            threshold = self.config.threshold_percent,
            "Resource collector started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> CollectorResult<()> {
        self.base.halt().await;
        info!(target: "hostd::collector::resources", "Resource collector stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    fn health(&self) -> CollectorHealth {
        self.base.health()
    }

    fn stats(&self) -> CollectorStats {
        self.base.stats()
    }
}
