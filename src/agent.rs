// ============================================================================
// SECTION 17: AGENT
// ============================================================================
// Wires the pieces together and owns the process lifetime:
// - store (falls back to disabled when the backend cannot be built)
// - collectors, started once and kept running whether or not anyone watches
// - the control channel, served until SIGINT/SIGTERM or an explicit shutdown
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::actions::{build_registry, Services};
use crate::channel::ControlChannel;
use crate::collectors::auth_log::AuthLogCollector;
use crate::collectors::container_logs::ContainerLogsCollector;
use crate::collectors::docker_events::DockerEventsCollector;
use crate::collectors::resources::ResourceCollector;
use crate::collectors::{CollectorRegistry, FeedHub, Recorder};
use crate::config::AgentConfig;
use crate::constants::AGENT_VERSION;
use crate::error::HostdResult;
use crate::host::{self, HostExecutor, SystemExecutor};
use crate::store::CacheStore;

/// The running agent.
#[derive(Debug)]
pub struct Agent {
    services: Arc<Services>,
    channel: ControlChannel,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig) -> HostdResult<Self> {
        config.validate()?;
        let executor: Arc<dyn HostExecutor> = Arc::new(SystemExecutor);
        Ok(Self::with_executor(config, executor))
    }

    /// Build with a specific host executor.
    pub fn with_executor(config: AgentConfig, executor: Arc<dyn HostExecutor>) -> Self {
        let store = match CacheStore::from_config(&config.store, config.retention.clone()) {
            Ok(store) => store,
            Err(e) => {
                warn!(target: "hostd::agent", error = %e, "Store unavailable, running without history");
                CacheStore::disabled(config.retention.clone())
            }
        };
        let feeds = FeedHub::default();
        let recorder = Recorder::new(store.clone(), feeds.clone());

        let hostname = config.agent.hostname.clone().unwrap_or_else(host::hostname);

        let collectors = Arc::new(CollectorRegistry::new(recorder));
        let wanted = &config.collectors;
        if wanted.docker_events.enabled {
            collectors.register(DockerEventsCollector::new(
                wanted.docker_events.clone(),
                config.host.clone(),
                executor.clone(),
            ));
        }
        if wanted.auth_log.enabled {
            collectors.register(AuthLogCollector::new(wanted.auth_log.clone(), config.host.clone()));
        }
        if wanted.resources.enabled {
            collectors.register(ResourceCollector::new(wanted.resources.clone(), hostname.clone()));
        }
        if wanted.container_logs.enabled {
            collectors.register(ContainerLogsCollector::new(
                wanted.container_logs.clone(),
                config.host.clone(),
                executor.clone(),
            ));
        }

        let channel_config = config.channel.clone();
        let services = Arc::new(Services::new(config, store, feeds, executor, collectors, hostname));
        let registry = Arc::new(build_registry(services.clone()));
        let channel = ControlChannel::new(
            channel_config,
            registry,
            services.connections.clone(),
            services.active_resources.clone(),
        );

        Self {
            services,
            channel,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Cancelling this token stops [`Agent::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "hostd::agent", "Shutdown requested");
        self.shutdown.cancel();
    }

    /// Run until a termination signal or [`Agent::shutdown`].
    pub async fn run(&self) -> HostdResult<()> {
        let config = &self.services.config;
        info!(
            target: "hostd::agent",
            version = AGENT_VERSION,
            instance = %config.agent.instance_name,
            hostname = %self.services.hostname,
            store = self.services.store.is_enabled(),
            "Starting agent"
        );

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let shutdown = self.shutdown.clone();
        let signals = tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!(target: "hostd::agent", "Received SIGTERM"),
                _ = sigint.recv() => info!(target: "hostd::agent", "Received SIGINT"),
                _ = shutdown.cancelled() => return,
            }
            shutdown.cancel();
        });

        for (name, result) in self.services.collectors.start_all().await {
            if let Err(e) = result {
                error!(target: "hostd::agent", collector = %name, error = %e, "Collector failed to start");
            }
        }

        let served = match self.channel.bind().await {
            Ok(listener) => self.channel.serve(listener, self.shutdown.clone()).await,
            Err(e) => Err(e),
        };
        // Anything that ends serving ends the agent.
        self.shutdown.cancel();
        signals.abort();

        info!(target: "hostd::agent", "Starting graceful shutdown");
        let started = Instant::now();
        let timeout = config.agent.shutdown_timeout;
        if tokio::time::timeout(timeout, self.services.collectors.stop_all()).await.is_err() {
            warn!(
                target: "hostd::agent",
                timeout_ms = timeout.as_millis() as u64,
                "Collectors did not stop in time"
            );
        }
        info!(
            target: "hostd::agent",
            duration_ms = started.elapsed().as_millis() as u64,
            "Agent shutdown complete"
        );

        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackendKind;
    use crate::host::scripted::ScriptedExecutor;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn quiet_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.agent.hostname = Some("agent-test".into());
        config.channel.listen_addr = "127.0.0.1:0".into();
        config.channel.auth_token = Some("t".into());
        config.store.backend = StoreBackendKind::Memory;
        config.collectors.docker_events.enabled = false;
        config.collectors.auth_log.enabled = false;
        config.collectors.resources.enabled = false;
        config.collectors.container_logs.enabled = false;
        config
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = quiet_config();
        config.channel.auth_token = None;
        assert!(Agent::new(config).is_err());
    }

    #[tokio::test]
    async fn test_registers_enabled_collectors() {
        let mut config = quiet_config();
        config.collectors.resources.enabled = true;
        let agent = Agent::with_executor(config, Arc::new(ScriptedExecutor::stdout("")));
        assert_eq!(agent.services().collectors.len(), 1);
        assert_eq!(agent.services().hostname, "agent-test");
        assert!(agent.services().store.is_enabled());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let agent = Arc::new(Agent::new(quiet_config()).unwrap());
        let token = agent.shutdown_token();
        let running = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        tokio_test::assert_ok!(result);
    }

    #[tokio::test]
    async fn test_run_reports_bind_failure() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = quiet_config();
        config.channel.listen_addr = taken.local_addr().unwrap().to_string();
        let agent = Agent::new(config).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), agent.run()).await.unwrap().unwrap_err();
        assert_eq!(err.category(), "channel");
    }
}
