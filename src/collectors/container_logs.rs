//! Container stdout/stderr collector.
//!
//! Discovers Docker `json-file` logs by glob, backfills the recent window of
//! each newly discovered file, then tails it by byte offset. An inode change
//! means the file was rotated and a shorter file means it was truncated;
//! both restart reading from the top. A trailing line without its newline is
//! left for the next cycle.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::{BaseCollector, Collector, CollectorHealth, CollectorMonitor, CollectorStats, Recorder};
use crate::config::{ContainerLogsConfig, HostConfig};
use crate::error::{CollectorError, CollectorResult};
use crate::host::{CommandSpec, HostExecutor};
use crate::log_collector;
use crate::normalize::docker::short_id;
use crate::normalize::logs::{parse_json_file_line, LogSource};
use crate::store::AppendOutcome;
use crate::types::{Domain, Timestamp};

const NAME: &str = "container_logs";

/// Bytes read from the end of a large file on discovery.
const BACKFILL_MAX_BYTES: u64 = 8 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Tracked file
// ----------------------------------------------------------------------------

fn inode_of(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.ino()).unwrap_or(0)
}

/// Container id of a json-file log path: `<id>-json.log` or its directory.
pub fn container_id_of(path: &Path) -> Option<String> {
    let from_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix("-json.log"))
        .filter(|id| !id.is_empty());
    let from_dir = || path.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str());
    from_name.or_else(from_dir).map(str::to_string)
}

/// Tail state of one container log file.
#[derive(Debug)]
pub struct TrackedLog {
    path: PathBuf,
    container_id: String,
    container_name: String,
    offset: u64,
    inode: u64,
    /// Lines older than this are dropped.
    since: Timestamp,
    /// Discard up to the first newline; the offset landed mid-line.
    skip_partial: bool,
}

impl TrackedLog {
    /// Start tracking at the tail of the file: at most the last
    /// `BACKFILL_MAX_BYTES`, keeping only lines newer than `since`.
    pub fn discover(path: PathBuf, container_id: String, container_name: String, since: Timestamp) -> Self {
        let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let offset = len.saturating_sub(BACKFILL_MAX_BYTES);
        Self {
            inode: inode_of(&path),
            path,
            container_id,
            container_name,
            offset,
            since,
            skip_partial: offset > 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Detect rotation by inode change and rewind.
    pub fn check_rotation(&mut self) -> bool {
        let current = inode_of(&self.path);
        if current != self.inode && current != 0 {
            self.inode = current;
            self.offset = 0;
            self.skip_partial = false;
            true
        } else {
            false
        }
    }

    /// Read up to `max_lines` complete lines past the offset.
    pub fn read_new_lines(&mut self, max_lines: usize) -> Vec<String> {
        let Ok(file) = File::open(&self.path) else {
            return Vec::new();
        };

        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if file_len < self.offset {
            // Truncated in place
            self.offset = 0;
            self.skip_partial = false;
        }

        let mut reader = BufReader::new(file);
        if self.offset > 0 && reader.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        while lines.len() < max_lines {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if buf.last() != Some(&b'\n') {
                        // Writer is mid-line; pick it up next cycle.
                        break;
                    }
                    self.offset += n as u64;
                    if std::mem::take(&mut self.skip_partial) {
                        continue;
                    }
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if !line.is_empty() {
                        lines.push(line.to_string());
                    }
                }
                Err(_) => break,
            }
        }
        lines
    }

    fn source(&self) -> LogSource<'_> {
        LogSource {
            container_id: &self.container_id,
            container_name: &self.container_name,
        }
    }
}

// ----------------------------------------------------------------------------
// Container names
// ----------------------------------------------------------------------------

/// Resolves container ids to names with `docker inspect`, caching hits.
#[derive(Debug)]
pub struct NameResolver {
    executor: Arc<dyn HostExecutor>,
    docker_bin: String,
    timeout: Duration,
    cache: HashMap<String, String>,
}

impl NameResolver {
    pub fn new(executor: Arc<dyn HostExecutor>, docker_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executor,
            docker_bin: docker_bin.into(),
            timeout,
            cache: HashMap::new(),
        }
    }

    /// Container name, or the short id when docker cannot tell.
    pub async fn resolve(&mut self, container_id: &str) -> String {
        if let Some(name) = self.cache.get(container_id) {
            return name.clone();
        }

        let spec = CommandSpec::new(&self.docker_bin, self.timeout)
            .args(["inspect", "--format", "{{.Name}}", container_id]);
        match self.executor.run(&spec).await {
            Ok(output) => {
                let name = output.stdout.trim().trim_start_matches('/').to_string();
                if name.is_empty() {
                    return short_id(container_id).to_string();
                }
                self.cache.insert(container_id.to_string(), name.clone());
                name
            }
            Err(e) => {
                trace!(target: "hostd::collector::logs", id = %container_id, error = %e, "Name lookup failed");
                short_id(container_id).to_string()
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tailer
// ----------------------------------------------------------------------------

/// Discovery plus per-file tail state for one collector loop.
#[derive(Debug)]
pub struct LogTailer {
    config: ContainerLogsConfig,
    resolver: NameResolver,
    files: HashMap<PathBuf, TrackedLog>,
}

impl LogTailer {
    pub fn new(config: ContainerLogsConfig, resolver: NameResolver) -> Self {
        Self {
            config,
            resolver,
            files: HashMap::new(),
        }
    }

    pub fn tracked(&self) -> usize {
        self.files.len()
    }

    fn discover(&self) -> CollectorResult<HashSet<PathBuf>> {
        let paths = glob::glob(&self.config.log_glob)
            .map_err(|e| CollectorError::collection_failed(NAME, format!("bad log glob: {}", e)))?;
        Ok(paths.flatten().filter(|p| p.is_file()).collect())
    }

    /// One scan: pick up new files, forget vanished ones, read every file.
    /// Returns how many lines were newly stored.
    pub async fn scan(&mut self, monitor: &CollectorMonitor, sink: &Recorder) -> CollectorResult<usize> {
        let present = self.discover()?;
        let now = Timestamp::now();

        self.files.retain(|path, _| present.contains(path));
        for path in present {
            if self.files.contains_key(&path) {
                continue;
            }
            let Some(container_id) = container_id_of(&path) else {
                continue;
            };
            let name = self.resolver.resolve(&container_id).await;
            debug!(target: "hostd::collector::logs", path = %path.display(), container = %name, "Tracking container log");
            let tracked = TrackedLog::discover(path.clone(), container_id, name, now.sub_duration(self.config.backfill));
            self.files.insert(path, tracked);
        }

        let mut stored = 0;
        for tracked in self.files.values_mut() {
            if tracked.check_rotation() {
                log_collector!(NAME, "rotated", path = %tracked.path.display());
            }
            for line in tracked.read_new_lines(self.config.max_lines_per_cycle) {
                let Some(record) = parse_json_file_line(tracked.source(), &line, now) else {
                    continue;
                };
                if record.timestamp < tracked.since {
                    continue;
                }
                if monitor.emit(sink, record).await == AppendOutcome::Stored {
                    stored += 1;
                }
            }
        }
        Ok(stored)
    }
}

// ----------------------------------------------------------------------------
// Collector
// ----------------------------------------------------------------------------

/// Container stdout/stderr collector.
#[derive(Debug)]
pub struct ContainerLogsCollector {
    base: BaseCollector,
    config: ContainerLogsConfig,
    host: HostConfig,
    executor: Arc<dyn HostExecutor>,
}

impl ContainerLogsCollector {
    pub fn new(config: ContainerLogsConfig, host: HostConfig, executor: Arc<dyn HostExecutor>) -> Self {
        Self {
            base: BaseCollector::new(NAME),
            config,
            host,
            executor,
        }
    }
}

#[async_trait]
impl Collector for ContainerLogsCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn domains(&self) -> &'static [Domain] {
        &[Domain::ContainerLogs]
    }

    async fn start(&mut self, sink: Recorder) -> CollectorResult<()> {
        let Some(shutdown) = self.base.begin() else {
            return Ok(());
        };

        let monitor = self.base.monitor();
        let period = self.config.scan_interval;
        let resolver = NameResolver::new(
            self.executor.clone(),
            self.host.docker_bin.clone(),
            self.host.command_timeout,
        );
        let mut tailer = LogTailer::new(self.config.clone(), resolver);

        let handle = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let started = Instant::now();
                        match tailer.scan(&monitor, &sink).await {
                            Ok(stored) => {
                                monitor.record_success(started.elapsed());
                                if stored > 0 {
                                    trace!(
                                        target: "hostd::collector::logs",
                                        files = tailer.tracked(),
                                        stored = stored,
                                        "Log scan complete"
                                    );
                                }
                            }
                            Err(e) => {
                                monitor.record_error(&e.to_string());
                                debug!(target: "hostd::collector::logs", error = %e, "Log scan failed");
                            }
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        self.base.set_task(handle);
        info!(
            target: "hostd::collector::logs",
            glob = %self.config.log_glob,
            interval_ms = period.as_millis() as u64,
            "Container log collector started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> CollectorResult<()> {
        self.base.halt().await;
        info!(target: "hostd::collector::logs", "Container log collector stopped");
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
