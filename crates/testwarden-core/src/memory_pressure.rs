//! System memory pressure probe.
//!
//! The cleanup scheduler only needs one number: percent of physical memory
//! in use. Platform backends:
//!
//! - **Linux**: `/proc/meminfo` (`MemTotal`, `MemAvailable`)
//! - **macOS**: `sysctl -n hw.memsize` and `vm_stat`
//! - **Other**: no reading

use serde::{Deserialize, Serialize};

/// One memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemorySample {
    /// Percent of memory in use (0-100), or `None` without a total.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn used_percent(&self) -> Option<f64> {
        if self.total_kb == 0 {
            return None;
        }
        let available = self.available_kb.min(self.total_kb);
        Some((self.total_kb - available) as f64 / self.total_kb as f64 * 100.0)
    }
}

/// Source of memory pressure readings.
pub trait MemoryProbe: Send + Sync {
    /// Percent of memory in use, or `None` when unavailable.
    fn used_percent(&self) -> Option<f64>;
}

/// Reads the host's memory counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemoryProbe;

impl SystemMemoryProbe {
    #[must_use]
    pub fn sample(&self) -> Option<MemorySample> {
        read_memory_sample()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn used_percent(&self) -> Option<f64> {
        self.sample().and_then(|s| s.used_percent())
    }
}

#[cfg(target_os = "linux")]
fn read_memory_sample() -> Option<MemorySample> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&contents)
}

#[cfg(target_os = "macos")]
fn read_memory_sample() -> Option<MemorySample> {
    let total_kb = std::process::Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|bytes| bytes / 1024)?;
    let vm_stat = std::process::Command::new("vm_stat")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())?;
    Some(MemorySample {
        total_kb,
        available_kb: parse_vm_stat_available_kb(&vm_stat),
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_memory_sample() -> Option<MemorySample> {
    None
}

fn parse_meminfo(contents: &str) -> Option<MemorySample> {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in contents.lines() {
        if let Some(val) = line.strip_prefix("MemTotal:") {
            total_kb = parse_kb(val);
        } else if let Some(val) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_kb(val);
        }
    }
    Some(MemorySample {
        total_kb: total_kb?,
        available_kb: available_kb?,
    })
}

fn parse_kb(value: &str) -> Option<u64> {
    value.trim().trim_end_matches("kB").trim().parse().ok()
}

/// Available = free + inactive + purgeable pages.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_vm_stat_available_kb(output: &str) -> u64 {
    let page_size = output
        .lines()
        .next()
        .and_then(|line| {
            let start = line.find("page size of ")? + "page size of ".len();
            let rest = &line[start..];
            rest[..rest.find(' ')?].parse::<u64>().ok()
        })
        .unwrap_or(16_384);

    let pages: u64 = output
        .lines()
        .filter_map(|line| {
            ["Pages free:", "Pages inactive:", "Pages purgeable:"]
                .iter()
                .find_map(|prefix| line.strip_prefix(prefix))
        })
        .filter_map(|val| val.trim().trim_end_matches('.').parse::<u64>().ok())
        .sum();
    pages * page_size / 1024
}
