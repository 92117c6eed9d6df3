use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use common::Vitals;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::state;

#[async_trait]
pub trait VitalsService: Send + Sync {
    async fn get(&self) -> anyhow::Result<Vitals>;
}

/// Machine vitals sampled through `sysinfo`.
pub struct SysinfoVitals {
    sys: Mutex<System>,
}

impl SysinfoVitals {
    pub fn new() -> Self {
        Self { sys: Mutex::new(System::new()) }
    }
}

impl Default for SysinfoVitals {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> u64 {
    if total == 0 { 0 } else { ((used as f64 / total as f64) * 100.0) as u64 }
}

#[async_trait]
impl VitalsService for SysinfoVitals {
    async fn get(&self) -> anyhow::Result<Vitals> {
        let mut s = self.sys.lock().await;
        s.refresh_cpu();
        s.refresh_memory();
        let load = System::load_average();
        Ok(Vitals {
            cpu_percent: s.global_cpu_info().cpu_usage().clamp(0.0, 100.0),
            mem_percent: percent(s.used_memory(), s.total_memory()),
            mem_kb: s.used_memory() / 1024,
            swap_percent: percent(s.used_swap(), s.total_swap()),
            swap_kb: s.used_swap() / 1024,
            load: [load.one, load.five, load.fifteen],
            uptime_secs: System::uptime(),
        })
    }
}

/// Decides whether the agent may start on this boot.
#[async_trait]
pub trait CanRebooter: Send + Sync {
    async fn can_reboot(&self) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct BootRecord {
    boot_time: u64,
}

/// Remembers the boot the agent first started on in `boot.json`.
///
/// With reboot protection on, a different boot time means the machine restarted underneath the
/// deployment and the agent refuses to start until an operator removes the marker.
pub struct BootMarker {
    path: PathBuf,
    protection: bool,
    boot_time: fn() -> u64,
}

impl BootMarker {
    pub fn new(data_dir: &std::path::Path, protection: bool) -> Self {
        Self { path: state::boot_marker_path(data_dir), protection, boot_time: System::boot_time }
    }

    #[cfg(test)]
    fn with_boot_time(mut self, boot_time: fn() -> u64) -> Self {
        self.boot_time = boot_time;
        self
    }
}

#[async_trait]
impl CanRebooter for BootMarker {
    async fn can_reboot(&self) -> anyhow::Result<bool> {
        let current = BootRecord { boot_time: (self.boot_time)() };
        let recorded = state::read_json::<BootRecord>(&self.path).context("Reading boot marker")?;
        match recorded {
            None => {
                state::write_json(&self.path, &current).context("Writing boot marker")?;
                info!(boot_time = current.boot_time, "Recorded boot marker");
                Ok(true)
            }
            Some(prev) if prev == current => Ok(true),
            Some(prev) if self.protection => {
                warn!(recorded = prev.boot_time, current = current.boot_time, "Machine rebooted under the agent");
                Ok(false)
            }
            Some(_) => {
                state::write_json(&self.path, &current).context("Writing boot marker")?;
                Ok(true)
            }
        }
    }
}
