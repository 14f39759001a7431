//! Collectors for the host-wide stats: uptime, load average, memory and
//! disk usage. Parsing is split from IO so the formats are testable.

use crate::config::DiskConfig;
use crate::root::CommandRunner;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;

/// Rounds to `precision` decimals and prints without trailing zeros.
pub fn fmt_round(value: f64, precision: i32) -> String {
    let power = 10f64.powi(precision);
    format!("{}", (value * power).round() / power)
}

/// Renders a byte count with K/M/G steps of 1000 and one decimal,
/// optionally with a percentage of `total`.
pub fn fmt_human_readable(value: f64, total: Option<f64>) -> String {
    let percent = match total {
        Some(total) if total > 0.0 => format!(" ({}%)", fmt_round(value / total * 100.0, 0)),
        _ => String::new(),
    };
    let mut scaled = value;
    let mut unit = "";
    for next in ["K", "M", "G"] {
        if scaled < 1000.0 {
            break;
        }
        scaled /= 1000.0;
        unit = next;
    }
    format!("{}{unit}{percent}", fmt_round(scaled, 1))
}

pub async fn uptime() -> Result<String> {
    let raw = tokio::fs::read_to_string("/proc/uptime")
        .await
        .context("cannot read /proc/uptime")?;
    let secs: f64 = raw
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .context("unexpected /proc/uptime format")?;
    let now = chrono::Local::now().format("%a %b %-d %H:%M:%S %Y");
    Ok(format!("Current time: {now}\nUp time: {}", format_uptime_secs(secs)))
}

pub fn format_uptime_secs(secs: f64) -> String {
    let total = secs as u64;
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    format!("{days}d {hours}h {minutes}m")
}

pub async fn loadavg() -> Result<String> {
    let raw = tokio::fs::read_to_string("/proc/loadavg")
        .await
        .context("cannot read /proc/loadavg")?;
    format_loadavg(&raw)
}

fn format_loadavg(raw: &str) -> Result<String> {
    let mut parts = raw.split_whitespace();
    let one = parts.next().context("empty /proc/loadavg")?;
    let five = parts.next().context("truncated /proc/loadavg")?;
    let fifteen = parts.next().context("truncated /proc/loadavg")?;
    Ok(format!("1 min: {one}\n5 min: {five}\n15 min: {fifteen}"))
}

pub async fn meminfo() -> Result<String> {
    let raw = tokio::fs::read_to_string("/proc/meminfo")
        .await
        .context("cannot read /proc/meminfo")?;
    format_meminfo(&raw)
}

/// Picks the interesting rows out of /proc/meminfo. Values there are
/// KiB; everything below works in bytes.
fn format_meminfo(raw: &str) -> Result<String> {
    let mut values: HashMap<&str, f64> = HashMap::new();
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else { continue };
        if let Some(kib) = parts.next().and_then(|v| v.parse::<f64>().ok()) {
            values.insert(key.trim_end_matches(':'), kib * 1024.0);
        }
    }
    let total = values
        .get("MemTotal")
        .copied()
        .context("MemTotal missing from /proc/meminfo")?;

    let mut out = vec![format!("Total: {}", fmt_human_readable(total, None))];
    for (key, label) in [
        ("MemFree", "Free"),
        ("MemAvailable", "Available"),
        ("Active", "Active"),
    ] {
        if let Some(value) = values.get(key) {
            out.push(format!("{label}: {}", fmt_human_readable(*value, Some(total))));
        }
    }
    Ok(out.join("\n"))
}

/// Runs `df` through the unprivileged runner and keeps the rows whose
/// device or mount point matches the configured filters.
pub async fn diskinfo(runner: &dyn CommandRunner, disk: &DiskConfig) -> Result<String> {
    let out = runner
        .exec("df", &[], None)
        .await
        .map_err(|err| anyhow!("df failed: {err}"))?;
    format_df(&out.stdout, disk)
}

fn format_df(raw: &str, disk: &DiskConfig) -> Result<String> {
    let mut rows = Vec::new();
    for line in raw.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 6 {
            continue;
        }
        let (dev, mnt) = (cols[0], cols[5]);
        let matched = disk.devs.iter().any(|d| dev.starts_with(d.as_str()))
            || disk.mnts.iter().any(|m| m == mnt);
        if !matched {
            continue;
        }
        let used: f64 = cols[2].parse::<f64>().unwrap_or(0.0) * 1024.0;
        let avail: f64 = cols[3].parse::<f64>().unwrap_or(0.0) * 1024.0;
        let total = used + avail;
        rows.push(format!(
            "{dev} {} of {} ({mnt})",
            fmt_human_readable(used, Some(total)),
            fmt_human_readable(total, None)
        ));
    }
    if rows.is_empty() {
        bail!("no filesystems matched the disk filters");
    }
    Ok(rows.join("\n"))
}
