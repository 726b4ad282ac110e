//! Container lifecycle collector.
//!
//! Polls `docker events` over the half-open window since the last fully
//! processed cycle. The watermark only moves forward after a cycle succeeds,
//! so a failed cycle is retried with overlap and the store collapses the
//! repeats.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::{BaseCollector, Collector, CollectorHealth, CollectorMonitor, CollectorStats, Recorder};
use crate::config::{DockerEventsConfig, HostConfig};
use crate::error::CollectorResult;
use crate::host::{CommandSpec, HostExecutor};
use crate::log_collector;
use crate::normalize::docker::parse_event_line;
use crate::store::AppendOutcome;
use crate::types::{Domain, Timestamp};

const NAME: &str = "docker_events";

/// `seconds.nanoseconds`, the form `docker events --since/--until` accepts.
pub fn docker_time(ts: Timestamp) -> String {
    let nanos = ts.as_nanos();
    format!("{}.{:09}", nanos.div_euclid(1_000_000_000), nanos.rem_euclid(1_000_000_000))
}

/// One collector loop's polling state.
#[derive(Debug)]
pub struct EventPoller {
    executor: Arc<dyn HostExecutor>,
    docker_bin: String,
    timeout: Duration,
    watermark: Timestamp,
}

impl EventPoller {
    pub fn new(
        executor: Arc<dyn HostExecutor>,
        docker_bin: impl Into<String>,
        timeout: Duration,
        watermark: Timestamp,
    ) -> Self {
        Self {
            executor,
            docker_bin: docker_bin.into(),
            timeout,
            watermark,
        }
    }

    pub fn watermark(&self) -> Timestamp {
        self.watermark
    }

    fn command(&self, until: Timestamp) -> CommandSpec {
        CommandSpec::new(&self.docker_bin, self.timeout)
            .arg("events")
            .args(["--since", &docker_time(self.watermark)])
            .args(["--until", &docker_time(until)])
            .args(["--filter", "type=container"])
            .args(["--format", "{{json .}}"])
    }

    /// Process every event in `[watermark, until]`. Returns how many were
    /// newly stored.
    pub async fn poll(
        &mut self,
        until: Timestamp,
        monitor: &CollectorMonitor,
        sink: &Recorder,
    ) -> CollectorResult<usize> {
        let output = self.executor.run(&self.command(until)).await?;

        let mut stored = 0;
        for line in output.lines() {
            let Some(record) = parse_event_line(line) else {
                trace!(target: "hostd::collector::docker", line = %line, "Skipped event line");
                continue;
            };
            if monitor.emit(sink, record).await == AppendOutcome::Stored {
                stored += 1;
            }
        }

        self.watermark = until;
        Ok(stored)
    }
}

/// Container lifecycle events collector.
#[derive(Debug)]
pub struct DockerEventsCollector {
    base: BaseCollector,
    config: DockerEventsConfig,
    host: HostConfig,
    executor: Arc<dyn HostExecutor>,
}

impl DockerEventsCollector {
    pub fn new(config: DockerEventsConfig, host: HostConfig, executor: Arc<dyn HostExecutor>) -> Self {
        Self {
            base: BaseCollector::new(NAME),
            config,
            host,
            executor,
        }
    }
}

#[async_trait]
impl Collector for DockerEventsCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn domains(&self) -> &'static [Domain] {
        &[Domain::ContainerEvents]
    }

    async fn start(&mut self, sink: Recorder) -> CollectorResult<()> {
        let Some(shutdown) = self.base.begin() else {
            return Ok(());
        };

        let monitor = self.base.monitor();
        let period = self.config.poll_interval;
        let mut poller = EventPoller::new(
            self.executor.clone(),
            self.host.docker_bin.clone(),
            self.host.command_timeout,
            Timestamp::now().sub_duration(self.config.initial_lookback),
        );

        let handle = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let started = Instant::now();
                        match poller.poll(Timestamp::now(), &monitor, &sink).await {
                            Ok(stored) => {
                                monitor.record_success(started.elapsed());
                                if stored > 0 {
                                    log_collector!(NAME, "cycle", stored = stored, watermark = %poller.watermark());
                                }
                            }
                            Err(e) => {
                                monitor.record_error(&e.to_string());
                                debug!(
                                    target: "hostd::collector::docker",
                                    error = %e,
                                    watermark = %poller.watermark(),
                                    "Event poll failed, retrying from the same watermark"
                                );
                            }
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        self.base.set_task(handle);
        info!(
            target: "hostd::collector::docker",
            interval_ms = period.as_millis() as u64,
            "Docker events collector started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> CollectorResult<()> {
        self.base.halt().await;
        info!(target: "hostd::collector::docker", "Docker events collector stopped");
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
