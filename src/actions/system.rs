//! `system.*`: host facts, the latest metric sample and the resource streams.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use sysinfo::{Disks, System};

use super::{Services, StreamParams};
use crate::dispatcher::{ActionContext, ActionOutput};
use crate::error::{HostdError, HostdResult};
use crate::types::{Domain, Timestamp};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfo {
    pub mount_point: String,
    pub file_system: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Static and slow-moving host facts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub hostname: String,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub kernel: Option<String>,
    pub arch: &'static str,
    pub cpu_model: Option<String>,
    pub cpu_count: usize,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub uptime_secs: u64,
    pub boot_time: Timestamp,
    pub load_average: [f64; 3],
    pub disks: Vec<DiskInfo>,
}

/// Gather [`HostInfo`]. Blocking; call from a blocking context.
pub fn gather(hostname: &str) -> HostInfo {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();

    let load = System::load_average();
    let disks = Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|d| DiskInfo {
            mount_point: d.mount_point().display().to_string(),
            file_system: d.file_system().to_string_lossy().into_owned(),
            total_bytes: d.total_space(),
            available_bytes: d.available_space(),
        })
        .collect();

    HostInfo {
        hostname: hostname.to_string(),
        os: System::long_os_version().or_else(System::name),
        os_version: System::os_version(),
        kernel: System::kernel_version(),
        arch: std::env::consts::ARCH,
        cpu_model: sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty()),
        cpu_count: sys.cpus().len(),
        memory_total_bytes: sys.total_memory(),
        memory_used_bytes: sys.used_memory(),
        swap_total_bytes: sys.total_swap(),
        swap_used_bytes: sys.used_swap(),
        uptime_secs: System::uptime(),
        boot_time: Timestamp::from_secs(System::boot_time() as i64),
        load_average: [load.one, load.five, load.fifteen],
        disks,
    }
}

pub async fn info(services: Arc<Services>, _ctx: ActionContext) -> HostdResult<ActionOutput> {
    let hostname = services.hostname.clone();
    let info = tokio::task::spawn_blocking(move || gather(&hostname))
        .await
        .map_err(|e| HostdError::Internal(format!("host info task failed: {}", e)))?;
    let data = serde_json::to_value(info).map_err(|e| HostdError::Internal(e.to_string()))?;
    Ok(ActionOutput::Response(data))
}

/// The most recent stored metric sample, `null` when none is cached.
pub async fn metrics(services: Arc<Services>, _ctx: ActionContext) -> HostdResult<ActionOutput> {
    let latest = services
        .store
        .latest(Domain::Metrics.key_prefix(), Timestamp::now())
        .await;
    let data = match latest {
        Some(entry) => json!({ "timestamp": entry.timestamp, "sample": entry.payload }),
        None => json!({ "timestamp": null, "sample": null }),
    };
    Ok(ActionOutput::Response(data))
}

pub async fn events(services: Arc<Services>, ctx: ActionContext) -> HostdResult<ActionOutput> {
    let params: StreamParams = ctx.params()?;
    services.subscribe(&ctx, Domain::ResourceSpikes, &params, None)
}

pub async fn metrics_live(services: Arc<Services>, ctx: ActionContext) -> HostdResult<ActionOutput> {
    let params: StreamParams = ctx.params()?;
    services.subscribe(&ctx, Domain::Metrics, &params, None)
}
