//! Metric sources: host counters and container stat parsing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::container::ContainerStatsSample;

/// CPU tick counters from /proc/stat; percentages are deltas between two
/// readings.
#[derive(Debug, Clone)]
pub struct CpuTimes {
    total: u64,
    idle: u64,
}

/// One host-level sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_percent: f64,
    pub mem_total_bytes: u64,
    pub mem_used_bytes: u64,
    pub mem_percent: f64,
    pub disk_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_percent: f64,
}

#[derive(Debug, Clone)]
struct MemInfo {
    total_bytes: u64,
    available_bytes: u64,
}

/// Read host CPU/memory/disk. CPU percent is computed over the window since
/// `prev_cpu`; the first reading reports 0.
pub async fn read_host_metrics(
    prev_cpu: Option<CpuTimes>,
    disk_path: &str,
) -> Result<(HostMetrics, CpuTimes)> {
    let stat_contents = fs::read_to_string("/proc/stat")
        .await
        .context("reading /proc/stat")?;
    let mem_contents = fs::read_to_string("/proc/meminfo")
        .await
        .context("reading /proc/meminfo")?;

    let current_cpu = parse_cpu_times(&stat_contents)?;
    let mem_info = parse_meminfo(&mem_contents)?;
    let cpu_percent = compute_cpu_percent(prev_cpu.as_ref(), &current_cpu);

    let mem_used = mem_info.total_bytes.saturating_sub(mem_info.available_bytes);
    let mem_percent = percent(mem_used, mem_info.total_bytes);

    let (disk_total, disk_used) = read_disk_usage(disk_path)?;
    let disk_percent = percent(disk_used, disk_total);

    Ok((
        HostMetrics {
            cpu_percent,
            mem_total_bytes: mem_info.total_bytes,
            mem_used_bytes: mem_used,
            mem_percent,
            disk_total_bytes: disk_total,
            disk_used_bytes: disk_used,
            disk_percent,
        },
        current_cpu,
    ))
}

fn read_disk_usage(path: &str) -> Result<(u64, u64)> {
    let vfs = rustix::fs::statvfs(path).with_context(|| format!("statvfs on {path}"))?;
    let total = vfs.f_blocks.saturating_mul(vfs.f_frsize);
    let available = vfs.f_bavail.saturating_mul(vfs.f_frsize);
    Ok((total, total.saturating_sub(available)))
}

fn parse_cpu_times(contents: &str) -> Result<CpuTimes> {
    let line = contents
        .lines()
        .find(|line| line.starts_with("cpu "))
        .context("missing cpu line in /proc/stat")?;

    let mut parts = line.split_whitespace();
    let _ = parts.next();
    let values: Vec<u64> = parts
        .map(|value| value.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing cpu times")?;

    if values.len() < 4 {
        return Err(anyhow::anyhow!("cpu stats line missing expected fields"));
    }

    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total = values.iter().sum();

    Ok(CpuTimes { total, idle })
}

fn parse_meminfo(contents: &str) -> Result<MemInfo> {
    let mut total_kb = None;
    let mut available_kb = None;

    for line in contents.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = parse_meminfo_kb(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = parse_meminfo_kb(line);
        }
    }

    let total_kb = total_kb.context("missing MemTotal in /proc/meminfo")?;
    let available_kb = available_kb.context("missing MemAvailable in /proc/meminfo")?;

    Ok(MemInfo {
        total_bytes: total_kb.saturating_mul(1024),
        available_bytes: available_kb.saturating_mul(1024),
    })
}

fn parse_meminfo_kb(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse::<u64>().ok()
}

fn compute_cpu_percent(prev: Option<&CpuTimes>, current: &CpuTimes) -> f64 {
    let Some(prev) = prev else {
        return 0.0;
    };

    let total_delta = current.total.saturating_sub(prev.total);
    let idle_delta = current.idle.saturating_sub(prev.idle);
    if total_delta == 0 {
        return 0.0;
    }

    let busy_delta = total_delta.saturating_sub(idle_delta);
    (busy_delta as f64 / total_delta as f64) * 100.0
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64) * 100.0
}

// ============================================================================
// Container stat derivation
// ============================================================================

/// One container's derived metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub container_id: String,
    pub name: String,
    pub cpu_percent: f64,
    pub mem_used_bytes: u64,
    pub mem_limit_bytes: u64,
    pub mem_percent: f64,
}

/// Derived metrics aggregated across all containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMetricsAggregate {
    pub container_count: usize,
    pub total_cpu_percent: f64,
    pub total_mem_used_bytes: u64,
    pub containers: Vec<ContainerMetrics>,
}

/// Derive numeric metrics from the runtime's formatted stat samples.
/// Samples that fail to parse are skipped rather than failing the tick.
pub fn derive_container_metrics(samples: &[ContainerStatsSample]) -> ContainerMetricsAggregate {
    let mut containers = Vec::with_capacity(samples.len());
    for sample in samples {
        let cpu_percent = parse_percent(&sample.cpu_percent).unwrap_or(0.0);
        let (mem_used, mem_limit) = parse_mem_usage(&sample.mem_usage).unwrap_or((0, 0));
        let mem_percent = parse_percent(&sample.mem_percent)
            .unwrap_or_else(|| percent(mem_used, mem_limit));

        containers.push(ContainerMetrics {
            container_id: sample.container_id.clone(),
            name: sample.name.clone(),
            cpu_percent,
            mem_used_bytes: mem_used,
            mem_limit_bytes: mem_limit,
            mem_percent,
        });
    }

    ContainerMetricsAggregate {
        container_count: containers.len(),
        total_cpu_percent: containers.iter().map(|c| c.cpu_percent).sum(),
        total_mem_used_bytes: containers.iter().map(|c| c.mem_used_bytes).sum(),
        containers,
    }
}

/// Parse "12.34%" into 12.34.
fn parse_percent(value: &str) -> Option<f64> {
    value.trim().trim_end_matches('%').parse::<f64>().ok()
}

/// Parse "128MiB / 2GiB" into (used, limit) bytes.
fn parse_mem_usage(value: &str) -> Option<(u64, u64)> {
    let (used, limit) = value.split_once('/')?;
    Some((parse_size(used.trim())?, parse_size(limit.trim())?))
}

/// Parse a human size like "512KiB", "1.5GiB", "100MB" or "1024B" into bytes.
fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.trim().parse().ok()?;

    let multiplier: f64 = match unit.trim() {
        "B" => 1.0,
        "kB" | "KB" | "KiB" => 1024.0,
        "MB" | "MiB" => 1024.0 * 1024.0,
        "GB" | "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TB" | "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    Some((number * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_times() {
        let sample = "cpu  2255 34 2290 22625563 6290 127 456 0 0 0\ncpu0 1132 17 1441 11311771 3675 0 227 0 0 0\n";
        let parsed = parse_cpu_times(sample).unwrap();
        assert!(parsed.total > 0);
        assert!(parsed.idle > 0);
    }

    #[test]
    fn test_parse_meminfo() {
        let sample = "\
MemTotal:       16384256 kB
MemFree:         123456 kB
MemAvailable:    999999 kB
Buffers:          65432 kB
";
        let info = parse_meminfo(sample).unwrap();
        assert_eq!(info.total_bytes, 16384256 * 1024);
        assert_eq!(info.available_bytes, 999999 * 1024);
    }

    #[test]
    fn test_compute_cpu_percent() {
        let prev = CpuTimes {
            total: 100,
            idle: 40,
        };
        let current = CpuTimes {
            total: 200,
            idle: 60,
        };

        let percent = compute_cpu_percent(Some(&prev), &current);
        assert!((percent - 80.0).abs() < 0.01);

        // First reading has no window to compute over.
        assert_eq!(compute_cpu_percent(None, &current), 0.0);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024B"), Some(1024));
        assert_eq!(parse_size("1KiB"), Some(1024));
        assert_eq!(parse_size("1.5GiB"), Some(1610612736));
        assert_eq!(parse_size("100MB"), Some(104857600));
        assert_eq!(parse_size("garbage"), None);
    }

    #[test]
    fn test_derive_container_metrics() {
        let samples = vec![
            ContainerStatsSample {
                container_id: "a1".into(),
                name: "warren-1".into(),
                cpu_percent: "10.50%".into(),
                mem_usage: "256MiB / 1GiB".into(),
                mem_percent: "25.00%".into(),
                pids: "8".into(),
            },
            ContainerStatsSample {
                container_id: "b2".into(),
                name: "warren-2".into(),
                cpu_percent: "4.50%".into(),
                mem_usage: "512MiB / 1GiB".into(),
                mem_percent: "".into(),
                pids: "3".into(),
            },
        ];

        let agg = derive_container_metrics(&samples);
        assert_eq!(agg.container_count, 2);
        assert!((agg.total_cpu_percent - 15.0).abs() < 0.01);
        assert_eq!(agg.total_mem_used_bytes, (256 + 512) * 1024 * 1024);
        // Missing MemPerc falls back to the usage/limit ratio.
        assert!((agg.containers[1].mem_percent - 50.0).abs() < 0.01);
    }
}
