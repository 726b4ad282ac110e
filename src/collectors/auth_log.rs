//! SSH authentication log collector.
//!
//! Follows the first existing auth log with `tail -n <backfill> -F`, which
//! reads the existing tail once and then keeps following across rotation.
//! If the follower dies it is respawned after a pause; the re-read backfill
//! collapses against the store.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BaseCollector, Collector, CollectorHealth, CollectorMonitor, CollectorStats, Recorder};
use crate::config::{AuthLogConfig, HostConfig};
use crate::error::{CollectorError, CollectorResult};
use crate::host::{spawn_follower, CommandSpec, Follower};
use crate::normalize::auth::parse_auth_line;
use crate::store::AppendOutcome;
use crate::types::{Domain, Timestamp};

const NAME: &str = "auth_log";

/// Pause before looking for the log again or respawning the follower.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// First candidate path that exists.
pub fn select_path(paths: &[PathBuf]) -> Option<&Path> {
    paths.iter().map(PathBuf::as_path).find(|p| p.is_file())
}

fn follow_command(path: &Path, backfill_lines: usize) -> CommandSpec {
    CommandSpec::new("tail", Duration::ZERO)
        .args(["-n", &backfill_lines.to_string(), "-F"])
        .arg(path.to_string_lossy())
}

/// Classify one line and record it. Returns whether it was newly stored.
pub async fn ingest_line(line: &str, monitor: &CollectorMonitor, sink: &Recorder) -> bool {
    let started = Instant::now();
    let Some(record) = parse_auth_line(line, Timestamp::now()) else {
        return false;
    };
    let outcome = monitor.emit(sink, record).await;
    monitor.record_success(started.elapsed());
    outcome == AppendOutcome::Stored
}

/// Run one follower until shutdown (`Ok`) or until it exits on its own
/// (`Err`).
async fn follow(
    path: &Path,
    config: &AuthLogConfig,
    kill_grace: Duration,
    shutdown: &CancellationToken,
    monitor: &CollectorMonitor,
    sink: &Recorder,
) -> CollectorResult<()> {
    let mut follower = spawn_follower(&follow_command(path, config.backfill_lines))?;
    let stdout = follower
        .child
        .stdout
        .take()
        .ok_or_else(|| CollectorError::collection_failed(NAME, "follower has no stdout"))?;
    let mut lines = BufReader::new(stdout).lines();

    info!(target: "hostd::collector::auth", path = %path.display(), "Following auth log");

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    ingest_line(&line, monitor, sink).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "hostd::collector::auth", error = %e, "Auth log read failed");
                    break;
                }
            },
            _ = shutdown.cancelled() => {
                let reaped = stop_follower(&mut follower, kill_grace).await;
                debug!(target: "hostd::collector::auth", reaped, "Auth log follower stopped");
                return Ok(());
            }
        }
    }

    let status = follower.child.wait().await.ok();
    follower.handle.mark_exited();
    Err(CollectorError::collection_failed(NAME, exit_message(status)))
}

/// Signal the follower and wait for it, so shutdown leaves no zombie behind.
/// Returns whether the process was reaped.
async fn stop_follower(follower: &mut Follower, kill_grace: Duration) -> bool {
    if let Err(e) = follower.handle.terminate(kill_grace) {
        warn!(target: "hostd::collector::auth", error = %e, "Follower termination failed");
    }
    let reaped = tokio::time::timeout(kill_grace * 2, follower.child.wait()).await;
    follower.handle.mark_exited();
    matches!(reaped, Ok(Ok(_)))
}

fn exit_message(status: Option<ExitStatus>) -> String {
    match status.and_then(|s| s.code()) {
        Some(code) => format!("tail exited with code {}", code),
        None => "tail exited".to_string(),
    }
}

/// SSH auth log collector.
#[derive(Debug)]
pub struct AuthLogCollector {
    base: BaseCollector,
    config: AuthLogConfig,
    host: HostConfig,
}

impl AuthLogCollector {
    pub fn new(config: AuthLogConfig, host: HostConfig) -> Self {
        Self {
            base: BaseCollector::new(NAME),
            config,
            host,
        }
    }
}

#[async_trait]
impl Collector for AuthLogCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn domains(&self) -> &'static [Domain] {
        &[Domain::AuthLog]
    }

    async fn start(&mut self, sink: Recorder) -> CollectorResult<()> {
        let Some(shutdown) = self.base.begin() else {
            return Ok(());
        };

        let monitor = self.base.monitor();
        let config = self.config.clone();
        let kill_grace = self.host.kill_grace;

        let handle = tokio::spawn(async move {
            while !shutdown.is_cancelled() {
                let result = match select_path(&config.paths) {
                    Some(path) => follow(path, &config, kill_grace, &shutdown, &monitor, &sink).await,
                    None => Err(CollectorError::SourceUnavailable {
                        name: NAME.to_string(),
                    }),
                };

                match result {
                    Ok(()) => break,
                    Err(e) => {
                        monitor.record_error(&e.to_string());
                        debug!(target: "hostd::collector::auth", error = %e, "Auth log follower down");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        self.base.set_task(handle);
        info!(
            target: "hostd::collector::auth",
            candidates = self.config.paths.len(),
            backfill_lines = self.config.backfill_lines,
            "Auth log collector started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> CollectorResult<()> {
        self.base.halt().await;
        info!(target: "hostd::collector::auth", "Auth log collector stopped");
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
