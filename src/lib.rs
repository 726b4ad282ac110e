//! # Cerebro Host Daemon
//!
//! The host-resident half of the Cerebro AIOps platform. It sits on a managed
//! Linux host, accepts the operator console over an authenticated WebSocket
//! control channel, forwards operator commands to host mechanisms, and keeps a
//! bounded, deduplicated history of what the host has been doing so that any
//! operator who subscribes gets "recent past + live present" without gaps.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              CEREBRO HOSTD                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  HOST ─▶ COLLECTORS ─▶ CACHE STORE (day buckets, dedup, TTL)                │
//! │               │                     │                                       │
//! │               └──▶ LIVE FEEDS ──▶ SUBSCRIPTION BRIDGE ──▶ CONNECTION ──▶ UI │
//! │                                                                             │
//! │  UI ─▶ CONNECTION ─▶ DISPATCHER ─▶ ACTIONS ─▶ HOST                          │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Always Recording**: collectors run for the whole agent lifetime,
//!   whether or not anyone is watching
//! - **Idempotent Storage**: at-least-once collectors, exactly-one stored copy
//! - **Gap-Free Replay**: history and live feed stitched per subscription
//! - **Leak-Free Streams**: every request id owns at most one resource, and a
//!   disconnect reclaims all of them
//!
//! ## Author
//!
//! AIOps Team

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod actions;
pub mod agent;
pub mod bridge;
pub mod channel;
pub mod collectors;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod logging;
pub mod normalize;
pub mod protocol;
pub mod store;
pub mod types;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{HostdError, HostdResult};
pub use types::{Domain, Record, RecordId, RetentionClass, Severity, Timestamp};
