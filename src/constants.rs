// ============================================================================
// SECTION 1: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior and limits of the agent.
// Everything here can be overridden through configuration unless noted.
// ============================================================================

/// Agent version - follows semantic versioning
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AGENT_NAME: &str = "cerebro-hostd";
pub const AGENT_FULL_NAME: &str = "Cerebro Host Daemon";

// ----------------------------------------------------------------------------
// Retention Defaults
// ----------------------------------------------------------------------------

/// Log lines are kept for one day
pub const DEFAULT_LOG_RETENTION_SECS: u64 = 24 * 3600;

/// Maximum log lines stored per day bucket
pub const DEFAULT_LOG_MAX_PER_BUCKET: usize = 5_000;

/// Activity events (containers, ssh, resource spikes) are kept for a week
pub const DEFAULT_ACTIVITY_RETENTION_SECS: u64 = 7 * 24 * 3600;

/// Maximum activity events stored per day bucket
pub const DEFAULT_ACTIVITY_MAX_PER_BUCKET: usize = 5_000;

/// Metric samples are kept for one day
pub const DEFAULT_METRICS_RETENTION_SECS: u64 = 24 * 3600;

/// One sample every 10s for a full day
pub const DEFAULT_METRICS_MAX_PER_BUCKET: usize = 8_640;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Container runtime event poll interval (seconds)
pub const DEFAULT_DOCKER_POLL_SECS: u64 = 5;

/// Resource sampling interval (seconds)
pub const DEFAULT_RESOURCE_SAMPLE_SECS: u64 = 10;

/// Container log scan interval (seconds)
pub const DEFAULT_CONTAINER_LOG_SCAN_SECS: u64 = 2;

/// Default timeout for light host commands (seconds)
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 10;

/// Timeout for heavy host commands such as container restarts (seconds)
pub const HEAVY_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Grace period between SIGTERM and SIGKILL for follower processes (millis)
pub const DEFAULT_KILL_GRACE_MS: u64 = 1_000;

/// Cooldown between two threshold events of the same kind (seconds)
pub const DEFAULT_SPIKE_COOLDOWN_SECS: u64 = 600;

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

// ----------------------------------------------------------------------------
// Thresholds
// ----------------------------------------------------------------------------

/// Usage percentage above which a resource spike event is raised
pub const DEFAULT_SPIKE_THRESHOLD_PERCENT: f64 = 85.0;

// ----------------------------------------------------------------------------
// Buffer & Queue Sizes
// ----------------------------------------------------------------------------

/// Live fan-out buffer per collector domain
pub const LIVE_FEED_CAPACITY: usize = 4_096;

/// Outbound message queue per control connection
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1_024;

/// Lines read from one container log file in one scan cycle
pub const MAX_LOG_LINES_PER_CYCLE: usize = 10_000;

/// Auth log lines read once at collector start
pub const DEFAULT_AUTH_BACKFILL_LINES: usize = 500;

/// Container log backfill window on first discovery (seconds)
pub const DEFAULT_CONTAINER_LOG_BACKFILL_SECS: u64 = 3600;

// ----------------------------------------------------------------------------
// Network & Protocol
// ----------------------------------------------------------------------------

/// Default control channel listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8765";

/// Default backing store endpoint
pub const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379/0";

/// Maximum WebSocket message size (bytes)
pub const MAX_WEBSOCKET_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Store command timeout (millis)
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "HOSTD_";

// ----------------------------------------------------------------------------
// Host Paths
// ----------------------------------------------------------------------------

pub const DEFAULT_AUTH_LOG_PATHS: [&str; 2] = ["/var/log/auth.log", "/var/log/secure"];
pub const DEFAULT_DOCKER_LOG_GLOB: &str = "/var/lib/docker/containers/*/*-json.log";
pub const DEFAULT_PROXY_ACCESS_LOG: &str = "/var/log/nginx/access.log";
pub const DEFAULT_AUTHORIZED_KEYS_GLOBS: [&str; 2] =
    ["/root/.ssh/authorized_keys", "/home/*/.ssh/authorized_keys"];
