// ============================================================================
// SECTION 4: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (HOSTD_SECTION__FIELD)
// - Human readable durations ("10s", "24h", "7d")
// - Validation
// - Sensible defaults for every field
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;
use crate::types::RetentionClass;

// ----------------------------------------------------------------------------
// 4.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the host daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// General agent settings
    #[serde(default)]
    pub agent: GeneralConfig,

    /// Control channel (WebSocket listener)
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Backing key-value store
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-class retention policies
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Host command execution
    #[serde(default)]
    pub host: HostConfig,

    /// Background collectors
    #[serde(default)]
    pub collectors: CollectorsConfig,

    /// Action-specific settings
    #[serde(default)]
    pub actions: ActionsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(
            Figment::from(Serialized::defaults(AgentConfig::default()))
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Defaults plus environment overrides, for hosts without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(
            Figment::from(Serialized::defaults(AgentConfig::default()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "channel.listen_addr",
                format!("'{}' is not a socket address", self.channel.listen_addr),
            ));
        }

        if self.channel.require_auth
            && self.channel.auth_token.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::invalid_value(
                "channel.auth_token",
                "a bearer token is required when channel.require_auth is set",
            ));
        }

        if self.store.enabled
            && self.store.backend == StoreBackendKind::Redis
            && !self.store.url.starts_with("redis://")
        {
            return Err(ConfigError::invalid_value(
                "store.url",
                "must start with redis://",
            ));
        }

        for (name, policy) in [
            ("logs", &self.retention.logs),
            ("activity", &self.retention.activity),
            ("metrics", &self.retention.metrics),
        ] {
            if policy.max_per_bucket == 0 {
                return Err(ConfigError::invalid_value(
                    format!("retention.{}.max_per_bucket", name),
                    "must be greater than zero",
                ));
            }
            if policy.ttl < Duration::from_secs(60) {
                return Err(ConfigError::invalid_value(
                    format!("retention.{}.ttl", name),
                    "must be at least one minute",
                ));
            }
            if policy.lookback > policy.ttl {
                return Err(ConfigError::invalid_value(
                    format!("retention.{}.lookback", name),
                    "cannot exceed the retention ttl",
                ));
            }
        }

        let threshold = self.collectors.resources.threshold_percent;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(ConfigError::invalid_value(
                "collectors.resources.threshold_percent",
                "must be between 0 and 100",
            ));
        }

        if self.collectors.resources.sample_interval.is_zero()
            || self.collectors.docker_events.poll_interval.is_zero()
            || self.collectors.container_logs.scan_interval.is_zero()
        {
            return Err(ConfigError::invalid_value(
                "collectors",
                "intervals must be non-zero",
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 4.2 General Agent Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Hostname (auto-detected if empty)
    #[serde(default)]
    pub hostname: Option<String>,

    /// Graceful shutdown timeout
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            hostname: None,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    AGENT_NAME.into()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 4.3 Control Channel Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Listen address for the WebSocket control channel
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Shared bearer token expected in the Authorization header
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Reject connections without a valid token
    #[serde(default = "default_true")]
    pub require_auth: bool,

    /// Maximum inbound message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue depth per connection
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth_token: None,
            require_auth: true,
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.into()
}

fn default_max_message_size() -> usize {
    MAX_WEBSOCKET_MESSAGE_SIZE
}

fn default_outbound_queue() -> usize {
    OUTBOUND_QUEUE_CAPACITY
}

// ----------------------------------------------------------------------------
// 4.4 Store Configuration
// ----------------------------------------------------------------------------

/// Which backend the cache store talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// Remote Redis-protocol server
    Redis,
    /// In-process map, lost on restart
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// When false, nothing is persisted and replay is always empty
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_store_backend")]
    pub backend: StoreBackendKind,

    /// `redis://host:port/db`
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Per-command timeout, including connect
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: default_store_backend(),
            url: default_store_url(),
            timeout: default_store_timeout(),
        }
    }
}

fn default_store_backend() -> StoreBackendKind {
    StoreBackendKind::Redis
}

fn default_store_url() -> String {
    DEFAULT_STORE_URL.into()
}

fn default_store_timeout() -> Duration {
    Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS)
}

// ----------------------------------------------------------------------------
// 4.5 Retention Configuration
// ----------------------------------------------------------------------------

/// Retention for one class of records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// TTL applied to each day bucket and its seen-set
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum entries kept per day bucket
    pub max_per_bucket: usize,

    /// Default replay window for new subscribers
    #[serde(with = "humantime_serde")]
    pub lookback: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_logs_retention")]
    pub logs: RetentionPolicy,

    #[serde(default = "default_activity_retention")]
    pub activity: RetentionPolicy,

    #[serde(default = "default_metrics_retention")]
    pub metrics: RetentionPolicy,
}

impl RetentionConfig {
    pub fn policy(&self, class: RetentionClass) -> RetentionPolicy {
        match class {
            RetentionClass::Logs => self.logs,
            RetentionClass::Activity => self.activity,
            RetentionClass::Metrics => self.metrics,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            logs: default_logs_retention(),
            activity: default_activity_retention(),
            metrics: default_metrics_retention(),
        }
    }
}

fn default_logs_retention() -> RetentionPolicy {
    RetentionPolicy {
        ttl: Duration::from_secs(DEFAULT_LOG_RETENTION_SECS),
        max_per_bucket: DEFAULT_LOG_MAX_PER_BUCKET,
        lookback: Duration::from_secs(DEFAULT_LOG_RETENTION_SECS),
    }
}

fn default_activity_retention() -> RetentionPolicy {
    RetentionPolicy {
        ttl: Duration::from_secs(DEFAULT_ACTIVITY_RETENTION_SECS),
        max_per_bucket: DEFAULT_ACTIVITY_MAX_PER_BUCKET,
        lookback: Duration::from_secs(DEFAULT_ACTIVITY_RETENTION_SECS),
    }
}

fn default_metrics_retention() -> RetentionPolicy {
    RetentionPolicy {
        ttl: Duration::from_secs(DEFAULT_METRICS_RETENTION_SECS),
        max_per_bucket: DEFAULT_METRICS_MAX_PER_BUCKET,
        lookback: Duration::from_secs(DEFAULT_METRICS_RETENTION_SECS),
    }
}

// ----------------------------------------------------------------------------
// 4.6 Host Execution Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Container runtime CLI
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Timeout for light inspection commands
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Timeout for heavy commands (container restarts and the like)
    #[serde(default = "default_heavy_command_timeout", with = "humantime_serde")]
    pub heavy_command_timeout: Duration,

    /// Delay between SIGTERM and SIGKILL for follower processes
    #[serde(default = "default_kill_grace", with = "humantime_serde")]
    pub kill_grace: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            command_timeout: default_command_timeout(),
            heavy_command_timeout: default_heavy_command_timeout(),
            kill_grace: default_kill_grace(),
        }
    }
}

fn default_docker_bin() -> String {
    "docker".into()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS)
}

fn default_heavy_command_timeout() -> Duration {
    Duration::from_secs(HEAVY_COMMAND_TIMEOUT_SECS)
}

fn default_kill_grace() -> Duration {
    Duration::from_millis(DEFAULT_KILL_GRACE_MS)
}

// ----------------------------------------------------------------------------
// 4.7 Collectors Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorsConfig {
    #[serde(default)]
    pub docker_events: DockerEventsConfig,

    #[serde(default)]
    pub auth_log: AuthLogConfig,

    #[serde(default)]
    pub resources: ResourcesConfig,

    #[serde(default)]
    pub container_logs: ContainerLogsConfig,
}

/// Container lifecycle event collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerEventsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_docker_poll", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How far back the first poll reaches
    #[serde(default = "default_docker_initial_lookback", with = "humantime_serde")]
    pub initial_lookback: Duration,
}

impl Default for DockerEventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: default_docker_poll(),
            initial_lookback: default_docker_initial_lookback(),
        }
    }
}

fn default_docker_poll() -> Duration {
    Duration::from_secs(DEFAULT_DOCKER_POLL_SECS)
}

fn default_docker_initial_lookback() -> Duration {
    Duration::from_secs(DEFAULT_CONTAINER_LOG_BACKFILL_SECS)
}

/// SSH auth log collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Candidate auth log files; the first existing one is used
    #[serde(default = "default_auth_log_paths")]
    pub paths: Vec<PathBuf>,

    /// Lines read once at start
    #[serde(default = "default_auth_backfill_lines")]
    pub backfill_lines: usize,
}

impl Default for AuthLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: default_auth_log_paths(),
            backfill_lines: default_auth_backfill_lines(),
        }
    }
}

fn default_auth_log_paths() -> Vec<PathBuf> {
    DEFAULT_AUTH_LOG_PATHS.iter().map(PathBuf::from).collect()
}

fn default_auth_backfill_lines() -> usize {
    DEFAULT_AUTH_BACKFILL_LINES
}

/// Resource utilization collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_resource_sample", with = "humantime_serde")]
    pub sample_interval: Duration,

    /// Usage percentage that raises a HIGH_*_USAGE event
    #[serde(default = "default_spike_threshold")]
    pub threshold_percent: f64,

    /// Minimum gap between two events of the same kind
    #[serde(default = "default_spike_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    /// Procfs mount
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Filesystem whose usage is sampled
    #[serde(default = "default_disk_mount")]
    pub disk_mount: PathBuf,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval: default_resource_sample(),
            threshold_percent: default_spike_threshold(),
            cooldown: default_spike_cooldown(),
            proc_root: default_proc_root(),
            disk_mount: default_disk_mount(),
        }
    }
}

fn default_resource_sample() -> Duration {
    Duration::from_secs(DEFAULT_RESOURCE_SAMPLE_SECS)
}

fn default_spike_threshold() -> f64 {
    DEFAULT_SPIKE_THRESHOLD_PERCENT
}

fn default_spike_cooldown() -> Duration {
    Duration::from_secs(DEFAULT_SPIKE_COOLDOWN_SECS)
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_disk_mount() -> PathBuf {
    PathBuf::from("/")
}

/// Container stdout/stderr collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLogsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Glob matching json-file log paths
    #[serde(default = "default_docker_log_glob")]
    pub log_glob: String,

    #[serde(default = "default_container_log_scan", with = "humantime_serde")]
    pub scan_interval: Duration,

    /// Window read from a file the first time it is discovered
    #[serde(default = "default_container_log_backfill", with = "humantime_serde")]
    pub backfill: Duration,

    #[serde(default = "default_max_lines_per_cycle")]
    pub max_lines_per_cycle: usize,
}

impl Default for ContainerLogsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_glob: default_docker_log_glob(),
            scan_interval: default_container_log_scan(),
            backfill: default_container_log_backfill(),
            max_lines_per_cycle: default_max_lines_per_cycle(),
        }
    }
}

fn default_docker_log_glob() -> String {
    DEFAULT_DOCKER_LOG_GLOB.into()
}

fn default_container_log_scan() -> Duration {
    Duration::from_secs(DEFAULT_CONTAINER_LOG_SCAN_SECS)
}

fn default_container_log_backfill() -> Duration {
    Duration::from_secs(DEFAULT_CONTAINER_LOG_BACKFILL_SECS)
}

fn default_max_lines_per_cycle() -> usize {
    MAX_LOG_LINES_PER_CYCLE
}

// ----------------------------------------------------------------------------
// 4.8 Actions Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Reverse proxy access log followed by `proxy.logs`
    #[serde(default = "default_proxy_access_log")]
    pub proxy_access_log: PathBuf,

    /// Globs for authorized_keys files listed by `ssh.keys`
    #[serde(default = "default_authorized_keys")]
    pub authorized_keys: Vec<String>,

    /// Initial lines sent by follower streams when the request has none
    #[serde(default = "default_tail_lines")]
    pub default_tail_lines: u32,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            proxy_access_log: default_proxy_access_log(),
            authorized_keys: default_authorized_keys(),
            default_tail_lines: default_tail_lines(),
        }
    }
}

fn default_proxy_access_log() -> PathBuf {
    PathBuf::from(DEFAULT_PROXY_ACCESS_LOG)
}

fn default_authorized_keys() -> Vec<String> {
    DEFAULT_AUTHORIZED_KEYS_GLOBS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_tail_lines() -> u32 {
    100
}

// ----------------------------------------------------------------------------
// 4.9 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for daily rotated log files
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Log to stdout
    #[serde(default = "default_true")]
    pub stdout: bool,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
            stdout: true,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.channel.auth_token = Some("secret".into());
        config
    }

    #[test]
    fn test_defaults_match_retention_table() {
        let config = AgentConfig::default();
        assert_eq!(config.retention.logs.ttl, Duration::from_secs(86_400));
        assert_eq!(config.retention.logs.max_per_bucket, 5_000);
        assert_eq!(config.retention.activity.ttl, Duration::from_secs(7 * 86_400));
        assert_eq!(config.retention.metrics.max_per_bucket, 8_640);
        assert_eq!(
            config.retention.policy(RetentionClass::Activity).lookback,
            Duration::from_secs(7 * 86_400)
        );
    }

    #[test]
    fn test_validate_requires_token() {
        assert!(AgentConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());

        let mut open = AgentConfig::default();
        open.channel.require_auth = false;
        assert!(open.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_lookback_past_ttl() {
        let mut config = valid();
        config.retention.logs.lookback = Duration::from_secs(2 * 86_400);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retention.logs.lookback"));
    }

    #[test]
    fn test_from_toml_with_humantime() {
        let config = AgentConfig::from_toml_str(
            r#"
            [channel]
            auth_token = "abc"

            [store]
            backend = "memory"

            [retention.activity]
            ttl = "3d"
            max_per_bucket = 100
            lookback = "12h"

            [collectors.resources]
            cooldown = "5m"
            "#,
        )
        .unwrap();
        assert_eq!(config.store.backend, StoreBackendKind::Memory);
        assert_eq!(config.retention.activity.ttl, Duration::from_secs(3 * 86_400));
        assert_eq!(config.retention.activity.lookback, Duration::from_secs(12 * 3600));
        assert_eq!(config.collectors.resources.cooldown, Duration::from_secs(300));
        assert_eq!(config.collectors.resources.sample_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_generated_config_parses_back() {
        let text = AgentConfig::generate_default_config();
        assert!(text.contains("[retention.logs]"));
        let parsed: AgentConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.channel.listen_addr, DEFAULT_LISTEN_ADDR);
    }
}
