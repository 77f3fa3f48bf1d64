//! OS process enumeration and termination.
//!
//! [`ProcessSource`] is the seam between the watchdog and the operating
//! system. [`SystemProcessSource`] is the real implementation:
//!
//! - **Linux**: `ps -eo pid=,ppid=,etimes=,args=`, plus `/proc/<pid>/environ`
//!   for the owning-test marker and `/proc/<pid>/stat` for zombie detection
//! - **macOS**: `ps -axo pid=,ppid=,etime=,command=`
//! - **Other**: enumeration returns [`Error::Unsupported`]
//!
//! Termination is a polite `SIGTERM`; liveness is probed with signal 0.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Read-only snapshot of one OS process at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub age: Duration,
    /// Command line, or process name when the command line is unavailable.
    pub signature: Option<String>,
    /// Value of the unit marker variable in the process environment.
    pub owning_test: Option<String>,
}

impl ProcessRecord {
    #[must_use]
    pub fn new(pid: u32, age: Duration) -> Self {
        let started_at = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        Self {
            pid,
            ppid: None,
            started_at,
            age,
            signature: None,
            owning_test: None,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, ppid: u32) -> Self {
        self.ppid = Some(ppid);
        self
    }

    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    #[must_use]
    pub fn with_owning_test(mut self, unit: impl Into<String>) -> Self {
        self.owning_test = Some(unit.into());
        self
    }
}

/// Immediate result of asking the OS to stop a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationRequest {
    /// Signal delivered.
    Sent,
    /// Process no longer exists.
    AlreadyGone,
    Failed(String),
}

/// Source of process snapshots and the ability to stop them.
pub trait ProcessSource: Send + Sync {
    /// Enumerate current processes.
    fn snapshot(&self) -> Result<Vec<ProcessRecord>>;

    /// Ask a process to exit. Must not block.
    fn terminate(&self, pid: u32) -> TerminationRequest;

    fn is_alive(&self, pid: u32) -> bool;

    /// Pid of the process running the tests.
    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

/// The real operating system.
#[derive(Debug, Clone)]
pub struct SystemProcessSource {
    unit_env_var: String,
}

impl SystemProcessSource {
    #[must_use]
    pub fn new(unit_env_var: impl Into<String>) -> Self {
        Self {
            unit_env_var: unit_env_var.into(),
        }
    }
}

impl ProcessSource for SystemProcessSource {
    fn snapshot(&self) -> Result<Vec<ProcessRecord>> {
        let mut records = list_processes()?;
        #[cfg(target_os = "linux")]
        for record in &mut records {
            record.owning_test = read_env_marker(record.pid, &self.unit_env_var);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = &self.unit_env_var;
        Ok(records)
    }

    fn terminate(&self, pid: u32) -> TerminationRequest {
        send_sigterm(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        probe_alive(pid)
    }
}

#[cfg(target_os = "linux")]
fn list_processes() -> Result<Vec<ProcessRecord>> {
    list_processes_via_ps(["-eo", "pid=,ppid=,etimes=,args="], parse_ps_age_secs_linux)
}

#[cfg(target_os = "macos")]
fn list_processes() -> Result<Vec<ProcessRecord>> {
    list_processes_via_ps(["-axo", "pid=,ppid=,etime=,command="], parse_etime)
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn list_processes() -> Result<Vec<ProcessRecord>> {
    Err(Error::Unsupported(
        "process enumeration is only implemented for Linux and macOS".to_string(),
    ))
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn list_processes_via_ps<const N: usize>(
    ps_args: [&str; N],
    parse_age_secs: fn(&str) -> std::result::Result<u64, String>,
) -> Result<Vec<ProcessRecord>> {
    use std::process::Command;

    let output = Command::new("ps")
        .args(ps_args)
        .output()
        .map_err(|e| Error::ProcessScan(format!("ps failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::ProcessScan(format!("ps returned non-zero: {stderr}")));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ps_output(&stdout, parse_age_secs).map_err(Error::ProcessScan)
}

/// Parse `pid ppid age command...` lines.
fn parse_ps_output(
    stdout: &str,
    parse_age_secs: fn(&str) -> std::result::Result<u64, String>,
) -> std::result::Result<Vec<ProcessRecord>, String> {
    let mut records = Vec::new();
    for line in stdout.lines() {
        let line = line.trim_start();
        if line.is_empty() {
            continue;
        }

        let (pid_str, rest) = split_first_token(line)
            .ok_or_else(|| format!("unexpected ps line (pid missing): {line}"))?;
        let pid: u32 = pid_str
            .parse()
            .map_err(|e| format!("parse pid {pid_str:?}: {e}"))?;

        let (ppid_str, rest) = split_first_token(rest)
            .ok_or_else(|| format!("unexpected ps line (ppid missing): {line}"))?;
        let ppid = ppid_str.parse::<u32>().ok().filter(|ppid| *ppid != 0);

        let (age_str, rest) = split_first_token(rest)
            .ok_or_else(|| format!("unexpected ps line (age missing): {line}"))?;
        let age_secs = parse_age_secs(age_str)?;

        let mut record = ProcessRecord::new(pid, Duration::from_secs(age_secs));
        record.ppid = ppid;
        let command = rest.trim();
        if !command.is_empty() {
            record.signature = Some(command.to_string());
        }
        records.push(record);
    }
    Ok(records)
}

fn split_first_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }

    match input.find(char::is_whitespace) {
        Some(idx) => Some((&input[..idx], &input[idx..])),
        None => Some((input, "")),
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ps_age_secs_linux(age: &str) -> std::result::Result<u64, String> {
    age.parse::<u64>()
        .map_err(|e| format!("parse etimes seconds: {e}"))
}

/// Parse the `etime` format from `ps -o etime=`.
///
/// Formats: `SS`, `MM:SS`, `HH:MM:SS`, `D-HH:MM:SS`
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_etime(etime: &str) -> std::result::Result<u64, String> {
    if etime.is_empty() {
        return Err("empty etime".to_string());
    }

    let (days, rest) = match etime.split_once('-') {
        Some((d, r)) => (d.parse::<u64>().map_err(|e| format!("parse days: {e}"))?, r),
        None => (0, etime),
    };

    let mut fields = [0u64; 3];
    let parts: Vec<&str> = rest.split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(format!("unexpected etime format: {etime}"));
    }
    let offset = 3 - parts.len();
    for (slot, part) in fields[offset..].iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|e| format!("parse etime field {part:?}: {e}"))?;
    }
    let [hours, minutes, seconds] = fields;

    Ok(days * 86_400 + hours * 3_600 + minutes * 60 + seconds)
}

/// Value of `var` in `/proc/<pid>/environ`, when readable.
#[cfg(target_os = "linux")]
fn read_env_marker(pid: u32, var: &str) -> Option<String> {
    let environ = std::fs::read(format!("/proc/{pid}/environ")).ok()?;
    find_env_value(&environ, var)
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn find_env_value(environ: &[u8], var: &str) -> Option<String> {
    environ
        .split(|b| *b == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .find_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            (key == var).then(|| value.to_string())
        })
}

#[cfg(unix)]
fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|pid| *pid > 0)
        .map(nix::unistd::Pid::from_raw)
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> TerminationRequest {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};

    let Some(target) = to_nix_pid(pid) else {
        return TerminationRequest::Failed(format!("pid {pid} out of range"));
    };
    match kill(target, Signal::SIGTERM) {
        Ok(()) => TerminationRequest::Sent,
        Err(Errno::ESRCH) => TerminationRequest::AlreadyGone,
        Err(err) => TerminationRequest::Failed(err.to_string()),
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> TerminationRequest {
    TerminationRequest::Failed("termination not supported on this platform".to_string())
}

#[cfg(unix)]
fn probe_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(target) = to_nix_pid(pid) else {
        return false;
    };
    let exists = match kill(target, None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    };
    exists && !is_zombie(pid)
}

#[cfg(not(unix))]
fn probe_alive(_pid: u32) -> bool {
    false
}

/// A zombie has exited and only awaits reaping by its parent.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // "pid (name) state ..."; name may contain spaces and parens.
    stat.rfind(')')
        .and_then(|end| stat.get(end + 2..))
        .and_then(|rest| rest.split_whitespace().next())
        == Some("Z")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}
