//! Process and runtime introspection shared by the metrics collectors and
//! the profiling endpoints.
//!
//! Reads `/proc/self` on Linux; elsewhere the process-level readers return
//! `None` and only runtime data is available.

use std::time::Duration;

/// Clock ticks per second used by `/proc/<pid>/stat` on Linux.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Memory and thread figures for the current process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessStatus {
    pub virtual_bytes: Option<u64>,
    pub resident_bytes: Option<u64>,
    pub peak_resident_bytes: Option<u64>,
    pub data_bytes: Option<u64>,
    pub threads: Option<u64>,
    pub voluntary_switches: Option<u64>,
    pub involuntary_switches: Option<u64>,
}

/// Current process status, if the platform exposes it.
pub fn status() -> Option<ProcessStatus> {
    let text = std::fs::read_to_string("/proc/self/status").ok()?;
    Some(parse_status(&text))
}

pub(crate) fn parse_status(text: &str) -> ProcessStatus {
    let mut status = ProcessStatus::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let mut fields = value.split_whitespace();
        let number = fields.next().and_then(|n| n.parse::<u64>().ok());
        let scaled = match fields.next() {
            Some("kB") => number.map(|n| n * 1024),
            _ => number,
        };
        match key {
            "VmSize" => status.virtual_bytes = scaled,
            "VmRSS" => status.resident_bytes = scaled,
            "VmHWM" => status.peak_resident_bytes = scaled,
            "VmData" => status.data_bytes = scaled,
            "Threads" => status.threads = scaled,
            "voluntary_ctxt_switches" => status.voluntary_switches = scaled,
            "nonvoluntary_ctxt_switches" => status.involuntary_switches = scaled,
            _ => {}
        }
    }
    status
}

/// User plus system CPU time consumed by the process so far.
pub fn cpu_time() -> Option<Duration> {
    let text = std::fs::read_to_string("/proc/self/stat").ok()?;
    parse_cpu_time(&text)
}

pub(crate) fn parse_cpu_time(stat: &str) -> Option<Duration> {
    // The command name is parenthesised and may contain spaces.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // utime and stime are fields 14 and 15 of the full line, 12 and 13 here.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(Duration::from_secs_f64((utime + stime) as f64 / CLOCK_TICKS_PER_SEC))
}

/// Names of the OS threads in the process, keyed by thread id.
pub fn thread_names() -> Option<Vec<(u64, String)>> {
    let mut threads = Vec::new();
    for entry in std::fs::read_dir("/proc/self/task").ok()? {
        let Ok(entry) = entry else { continue };
        let Some(tid) = entry.file_name().to_str().and_then(|t| t.parse().ok()) else {
            continue;
        };
        let name = std::fs::read_to_string(entry.path().join("comm"))
            .map(|n| n.trim().to_string())
            .unwrap_or_default();
        threads.push((tid, name));
    }
    threads.sort();
    Some(threads)
}

/// Point-in-time view of the async runtime driving the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub workers: usize,
    pub alive_tasks: usize,
    pub global_queue_depth: usize,
}

impl RuntimeSnapshot {
    /// Capture the current runtime's metrics; `None` outside a runtime.
    pub fn capture() -> Option<Self> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let metrics = handle.metrics();
        Some(Self {
            workers: metrics.num_workers(),
            alive_tasks: metrics.num_alive_tasks(),
            global_queue_depth: metrics.global_queue_depth(),
        })
    }
}
