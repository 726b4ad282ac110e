// ============================================================================
// SECTION 2: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem in the agent.
// Inside the core almost everything degrades instead of failing:
// - protocol errors go back to the client, the connection stays open
// - store errors are absorbed by the cache store and logged at warn
// - collector and cleanup errors are logged and the loop continues
// Only configuration and bootstrap errors are fatal.
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// 2.1 Core Agent Errors
// ----------------------------------------------------------------------------

/// The main error type for the host daemon.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum HostdError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Control Protocol Errors ----
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // ---- Host Execution Errors ----
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    // ---- Store Errors ----
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // ---- Collection Errors ----
    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    // ---- Resource Errors ----
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    // ---- Channel Errors ----
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl HostdError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            HostdError::Config(_) => false,
            HostdError::Protocol(_) => true,
            HostdError::Host(e) => e.is_recoverable(),
            HostdError::Store(_) => true,
            HostdError::Collector(e) => e.is_recoverable(),
            HostdError::Resource(_) => true,
            HostdError::Channel(e) => e.is_recoverable(),
            HostdError::Io(_) => true,
            HostdError::Internal(_) => false,
            HostdError::ShuttingDown => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            HostdError::Config(_) => "config",
            HostdError::Protocol(_) => "protocol",
            HostdError::Host(_) => "host",
            HostdError::Store(_) => "store",
            HostdError::Collector(_) => "collector",
            HostdError::Resource(_) => "resource",
            HostdError::Channel(_) => "channel",
            HostdError::Io(_) => "io",
            HostdError::Internal(_) => "internal",
            HostdError::ShuttingDown => "shutdown",
        }
    }
}

// ----------------------------------------------------------------------------
// 2.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 2.3 Protocol Errors
// ----------------------------------------------------------------------------

/// Errors in a client request. Always reported back to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {message}")]
    Malformed { message: String },

    #[error("Message is missing an id")]
    MissingId,

    #[error("Action '{action}' is not of the form 'domain.action'")]
    InvalidActionName { action: String },

    #[error("Unknown domain '{domain}'")]
    UnknownDomain { domain: String },

    #[error("Unknown action '{action}'")]
    UnknownAction { action: String },

    #[error("Invalid parameters for '{action}': {message}")]
    InvalidParams { action: String, message: String },
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            message: message.into(),
        }
    }

    pub fn invalid_params(action: impl Into<String>, message: impl Into<String>) -> Self {
        ProtocolError::InvalidParams {
            action: action.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 2.4 Host Execution Errors
// ----------------------------------------------------------------------------

/// Errors from running commands or reading files on the host
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("'{program}' timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },

    #[error("'{program}' exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to read '{path}': {message}")]
    Read { path: String, message: String },

    #[error("Unexpected output from '{program}': {message}")]
    Parse { program: String, message: String },
}

impl HostError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, HostError::Spawn { .. })
    }

    pub fn parse(program: impl Into<String>, message: impl Into<String>) -> Self {
        HostError::Parse {
            program: program.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 2.5 Store Errors
// ----------------------------------------------------------------------------

/// Errors from the backing key-value store.
///
/// These never leave the cache store: every operation degrades to a no-op or
/// an empty read when one occurs.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store is disabled")]
    Disabled,

    #[error("Connection to '{endpoint}' failed: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Store protocol error: {message}")]
    Protocol { message: String },

    #[error("Store command '{command}' timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Server replied with error: {message}")]
    Server { message: String },

    #[error("Failed to encode entry: {message}")]
    Serialization { message: String },

    #[error("Invalid store url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

impl StoreError {
    pub fn protocol(message: impl Into<String>) -> Self {
        StoreError::Protocol {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 2.6 Collector Errors
// ----------------------------------------------------------------------------

/// Errors from collectors
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Collector '{name}' not found")]
    NotFound { name: String },

    #[error("Collection failed for '{origin}': {message}")]
    CollectionFailed { origin: String, message: String },

    #[error("No readable source for '{name}'")]
    SourceUnavailable { name: String },

    #[error(transparent)]
    Host(#[from] HostError),
}

impl CollectorError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            CollectorError::NotFound { .. } => false,
            CollectorError::Host(e) => e.is_recoverable(),
            _ => true,
        }
    }

    pub fn collection_failed(origin: impl Into<String>, message: impl Into<String>) -> Self {
        CollectorError::CollectionFailed {
            origin: origin.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 2.7 Resource Errors
// ----------------------------------------------------------------------------

/// Errors while releasing a per-request resource. Logged, never re-thrown.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Failed to signal pid {pid}: {message}")]
    Signal { pid: i32, message: String },

    #[error("Resource '{kind}' was already released")]
    AlreadyReleased { kind: &'static str },
}

// ----------------------------------------------------------------------------
// 2.8 Channel Errors
// ----------------------------------------------------------------------------

/// Errors from the control channel transport
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("WebSocket handshake failed: {message}")]
    Handshake { message: String },

    #[error("WebSocket error: {message}")]
    Transport { message: String },
}

impl ChannelError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ChannelError::Bind { .. })
    }
}

// ----------------------------------------------------------------------------
// 2.9 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for agent operations
pub type HostdResult<T> = Result<T, HostdError>;

/// Result type for host command execution
pub type HostResult<T> = Result<T, HostError>;

/// Result type for backing store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for collector operations
pub type CollectorResult<T> = Result<T, CollectorError>;
