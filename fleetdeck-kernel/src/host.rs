/**
 * HOST SAMPLER - CPU / memory / disk of the machine running the dashboard
 *
 * CPU% is derived from two consecutive /proc/stat readings (idle vs total
 * jiffies); the previous reading is kept between ticks, so the first sample
 * after startup reports 0. Memory comes from sysinfo on every tick; disk
 * usage is refreshed at most every 10s.
 */

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cluster::quantity::{format_bytes, percent};
use crate::models::{ResourceUsage, SystemStats};

pub const DISK_REFRESH: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    pub idle: u64,
    pub total: u64,
}

/// Aggregate `cpu` line of /proc/stat. Idle includes iowait; guest time is
/// already counted in user and is left out of the total.
pub fn parse_proc_stat(text: &str) -> Option<CpuSample> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|f| f.parse().unwrap_or(0))
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().sum();
    Some(CpuSample { idle, total })
}

/// Busy share between two samples, 0 when no time elapsed.
pub fn cpu_percent(previous: CpuSample, current: CpuSample) -> f64 {
    let total = current.total.saturating_sub(previous.total);
    let idle = current.idle.saturating_sub(previous.idle);
    if total == 0 {
        return 0.0;
    }
    let busy = total.saturating_sub(idle);
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct DiskUsage {
    used: u64,
    total: u64,
}

pub struct HostSampler {
    stat_path: PathBuf,
    system: Arc<Mutex<System>>,
    disks: Arc<Mutex<Disks>>,
    previous_cpu: Mutex<Option<CpuSample>>,
    disk: Mutex<Option<(Instant, DiskUsage)>>,
    disk_interval: Duration,
}

impl HostSampler {
    pub fn new() -> Self {
        Self::with_stat_path("/proc/stat")
    }

    pub fn with_stat_path(path: impl Into<PathBuf>) -> Self {
        Self {
            stat_path: path.into(),
            system: Arc::new(Mutex::new(System::new())),
            disks: Arc::new(Mutex::new(Disks::new_with_refreshed_list())),
            previous_cpu: Mutex::new(None),
            disk: Mutex::new(None),
            disk_interval: DISK_REFRESH,
        }
    }

    pub async fn collect(&self) -> (ResourceUsage, SystemStats) {
        let cpu = self.sample_cpu().await;

        let system = Arc::clone(&self.system);
        let (memory_used, memory_total, cpu_count) =
            blocking("memory", move || read_memory(&system)).await.unwrap_or_default();

        let disk = self.disk_usage(Instant::now()).await;

        let usage = ResourceUsage {
            cpu,
            memory: percent(memory_used, memory_total),
            disk: percent(disk.used, disk.total),
        };
        let stats = SystemStats {
            cpu_percent: cpu,
            cpu_count,
            memory_used_bytes: memory_used,
            memory_total_bytes: memory_total,
            memory_used: format_bytes(memory_used),
            memory_total: format_bytes(memory_total),
            disk_used_bytes: disk.used,
            disk_total_bytes: disk.total,
            disk_used: format_bytes(disk.used),
            disk_total: format_bytes(disk.total),
            uptime_secs: System::uptime(),
        };
        (usage, stats)
    }

    async fn sample_cpu(&self) -> f64 {
        let current = match tokio::fs::read_to_string(&self.stat_path).await {
            Ok(text) => parse_proc_stat(&text),
            Err(e) => {
                debug!(path = %self.stat_path.display(), error = %e, "cpu counters unavailable");
                None
            }
        };

        match current {
            Some(current) => {
                let previous = self.previous_cpu.lock().replace(current);
                previous.map(|p| cpu_percent(p, current)).unwrap_or(0.0)
            }
            None => {
                let system = Arc::clone(&self.system);
                blocking("cpu", move || {
                    let mut sys = system.lock();
                    sys.refresh_cpu_usage();
                    sys.global_cpu_info().cpu_usage() as f64
                })
                .await
                .unwrap_or(0.0)
            }
        }
    }

    fn disk_due(&self, now: Instant) -> bool {
        match *self.disk.lock() {
            Some((at, _)) => now.duration_since(at) >= self.disk_interval,
            None => true,
        }
    }

    async fn disk_usage(&self, now: Instant) -> DiskUsage {
        if !self.disk_due(now) {
            if let Some((_, usage)) = *self.disk.lock() {
                return usage;
            }
        }

        let disks = Arc::clone(&self.disks);
        let usage = blocking("disk", move || read_disks(&disks))
            .await
            .unwrap_or_default();
        *self.disk.lock() = Some((now, usage));
        usage
    }
}

/// sysinfo refreshes read procfs synchronously; keep them off the runtime threads.
async fn blocking<T, F>(what: &'static str, read: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(read).await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(what, error = %e, "host read aborted");
            None
        }
    }
}

fn read_memory(system: &Mutex<System>) -> (u64, u64, usize) {
    let mut sys = system.lock();
    sys.refresh_memory();
    if sys.cpus().is_empty() {
        sys.refresh_cpu();
    }
    (sys.used_memory(), sys.total_memory(), sys.cpus().len())
}

/// Root filesystem when mounted, otherwise the sum of all disks.
fn read_disks(disks: &Mutex<Disks>) -> DiskUsage {
    let mut disks = disks.lock();
    disks.refresh();
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"));
    match root {
        Some(d) => DiskUsage {
            used: d.total_space().saturating_sub(d.available_space()),
            total: d.total_space(),
        },
        None => disks.list().iter().fold(DiskUsage::default(), |acc, d| DiskUsage {
            used: acc.used + d.total_space().saturating_sub(d.available_space()),
            total: acc.total + d.total_space(),
        }),
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of host-level usage for snapshots.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn sample(&self) -> (ResourceUsage, SystemStats);
}

#[async_trait]
impl HostProbe for HostSampler {
    async fn sample(&self) -> (ResourceUsage, SystemStats) {
        self.collect().await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const STAT_A: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
    const STAT_B: &str = "cpu  200 0 200 1300 300 0 0 0 0 0\ncpu0 100 0 100 650 150 0 0 0 0 0\n";

    #[test]
    fn parses_aggregate_line() {
        assert_eq!(
            parse_proc_stat(STAT_A),
            Some(CpuSample { idle: 800, total: 1000 })
        );
        assert_eq!(parse_proc_stat("intr 1 2 3"), None);
    }

    #[test]
    fn percent_from_deltas() {
        let a = parse_proc_stat(STAT_A).unwrap();
        let b = parse_proc_stat(STAT_B).unwrap();
        // 1000 jiffies elapsed, 800 of them idle
        assert!((cpu_percent(a, b) - 20.0).abs() < 1e-9);
        assert_eq!(cpu_percent(b, b), 0.0);
    }

    #[tokio::test]
    async fn first_sample_reads_zero_then_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        std::fs::write(&path, STAT_A).unwrap();
        let sampler = HostSampler::with_stat_path(&path);

        let (usage, _) = sampler.collect().await;
        assert_eq!(usage.cpu, 0.0);

        std::fs::write(&path, STAT_B).unwrap();
        let (usage, stats) = sampler.collect().await;
        assert!((usage.cpu - 20.0).abs() < 1e-9);
        assert_eq!(stats.cpu_percent, usage.cpu);
        assert!(stats.memory_total_bytes > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disk_is_refreshed_on_its_own_cadence() {
        let sampler = HostSampler::with_stat_path("/nonexistent/stat");
        let start = Instant::now();
        assert!(sampler.disk_due(start));

        let first = sampler.disk_usage(start).await;
        assert!(!sampler.disk_due(start + Duration::from_secs(9)));
        assert_eq!(sampler.disk_usage(start + Duration::from_secs(9)).await, first);
        assert!(sampler.disk_due(start + DISK_REFRESH));
    }
}
