//! Runtime profiling endpoints under `/debug/pprof/`.
//!
//! Profiles are plain-text reports of what the process can observe about
//! itself: async runtime metrics, `/proc/self` figures on Linux and the
//! configured contention sampling rate.
//!
//! Timed profiles end early when the endpoint is shutting down and report
//! the window they actually covered.

use std::fmt::Write as _;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::config::ProfilingConfig;
use crate::lifecycle::ShutdownSignal;
use crate::observability::process::{self, RuntimeSnapshot};

/// Upper bound on any `seconds` parameter.
pub const MAX_PROFILE_SECONDS: u64 = 60;

const DEFAULT_CPU_SECONDS: u64 = 30;
const DEFAULT_TRACE_SECONDS: u64 = 1;

const PROFILES: [(&str, &str); 9] = [
    ("block", "Runtime scheduling contention: global queue depth and sampling rate"),
    ("cmdline", "The command line invocation of the current program"),
    ("goroutine", "Async runtime tasks and OS threads"),
    ("heap", "Memory usage of the process"),
    ("mutex", "Lock contention sampling rate"),
    ("profile", "CPU time consumed over `seconds` (default 30)"),
    ("symbol", "Symbol lookup (not supported)"),
    ("threadcreate", "OS threads created by the process"),
    ("trace", "Runtime samples over `seconds` (default 1)"),
];

#[derive(Debug, Clone)]
struct ProfileState {
    debug: bool,
    contention_sample_rate: u32,
    shutdown: ShutdownSignal,
}

/// Query parameters shared by the timed profiles.
#[derive(Debug, Default, Deserialize)]
pub struct ProfileParams {
    pub seconds: Option<u64>,
}

impl ProfileParams {
    /// Requested duration: missing or zero means `default`, capped at
    /// [`MAX_PROFILE_SECONDS`].
    pub fn duration(&self, default: u64) -> Duration {
        let seconds = match self.seconds {
            Some(0) | None => default,
            Some(seconds) => seconds,
        };
        Duration::from_secs(seconds.min(MAX_PROFILE_SECONDS))
    }
}

/// Routes for every profile. Timed profiles stop once `shutdown` fires.
pub fn routes(config: &ProfilingConfig, shutdown: ShutdownSignal) -> Router {
    let state = ProfileState {
        debug: config.debug,
        contention_sample_rate: config.contention_sample_rate,
        shutdown,
    };
    Router::new()
        .route("/debug/pprof/", get(index))
        .route("/debug/pprof/cmdline", get(cmdline))
        .route("/debug/pprof/profile", get(cpu_profile))
        .route("/debug/pprof/symbol", get(symbol).post(symbol))
        .route("/debug/pprof/trace", get(trace))
        .route("/debug/pprof/block", get(contention))
        .route("/debug/pprof/mutex", get(contention))
        .route("/debug/pprof/goroutine", get(goroutine))
        .route("/debug/pprof/heap", get(heap))
        .route("/debug/pprof/threadcreate", get(threadcreate))
        .with_state(state)
}

fn text(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

async fn index() -> Response {
    let mut body = String::from("/debug/pprof/\n\nProfiles:\n");
    for (name, description) in PROFILES {
        let _ = writeln!(body, "  {name:<14} {description}");
    }
    text(body)
}

async fn cmdline() -> Response {
    let args: Vec<String> = std::env::args().collect();
    text(args.join("\0"))
}

/// Symbol lookup needs the binary's symbol table, which is not read here.
async fn symbol() -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "symbol lookup is not supported\n",
    )
        .into_response()
}

/// Sleep for `window`; false if shutdown cut it short.
async fn wait_out(window: Duration, shutdown: ShutdownSignal) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(window) => true,
        _ = shutdown.wait() => false,
    }
}

async fn cpu_profile(State(state): State<ProfileState>, Query(params): Query<ProfileParams>) -> Response {
    let window = params.duration(DEFAULT_CPU_SECONDS);
    let started = tokio::time::Instant::now();
    let before = process::cpu_time();
    let completed = wait_out(window, state.shutdown).await;
    let after = process::cpu_time();
    let covered = started.elapsed();

    let mut body = format!("window_seconds: {}\n", window.as_secs());
    if !completed {
        let _ = writeln!(body, "interrupted_after_ms: {}", covered.as_millis());
    }
    match (before, after) {
        (Some(before), Some(after)) => {
            let used = after.saturating_sub(before);
            let _ = writeln!(body, "cpu_seconds: {:.3}", used.as_secs_f64());
            if !covered.is_zero() {
                let _ = writeln!(body, "utilization: {:.3}", used.as_secs_f64() / covered.as_secs_f64());
            }
        }
        _ => body.push_str("cpu_seconds: unavailable\n"),
    }
    text(body)
}

async fn trace(State(state): State<ProfileState>, Query(params): Query<ProfileParams>) -> Response {
    let window = params.duration(DEFAULT_TRACE_SECONDS);
    let interval = if state.debug {
        Duration::from_millis(10)
    } else {
        Duration::from_millis(100)
    };

    let mut body = format!(
        "window_seconds: {}\nsample_interval_ms: {}\n",
        window.as_secs(),
        interval.as_millis()
    );
    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(interval);
    let stopping = state.shutdown.wait();
    tokio::pin!(stopping);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut stopping => {
                let _ = writeln!(body, "interrupted_after_ms: {}", started.elapsed().as_millis());
                break;
            }
        }
        let elapsed = started.elapsed();
        if let Some(snapshot) = RuntimeSnapshot::capture() {
            let _ = writeln!(
                body,
                "t={:>6}ms workers={} alive_tasks={} global_queue_depth={}",
                elapsed.as_millis(),
                snapshot.workers,
                snapshot.alive_tasks,
                snapshot.global_queue_depth
            );
        }
        if elapsed >= window {
            break;
        }
    }
    text(body)
}

async fn contention(State(state): State<ProfileState>) -> Response {
    let mut body = format!("sampling_rate: {}\n", state.contention_sample_rate);
    if let Some(snapshot) = RuntimeSnapshot::capture() {
        let _ = writeln!(body, "global_queue_depth: {}", snapshot.global_queue_depth);
    }
    if let Some(status) = process::status() {
        if let Some(switches) = status.involuntary_switches {
            let _ = writeln!(body, "involuntary_context_switches: {switches}");
        }
        if let Some(switches) = status.voluntary_switches {
            let _ = writeln!(body, "voluntary_context_switches: {switches}");
        }
    }
    text(body)
}

async fn goroutine() -> Response {
    let mut body = String::new();
    if let Some(snapshot) = RuntimeSnapshot::capture() {
        let _ = writeln!(body, "workers: {}", snapshot.workers);
        let _ = writeln!(body, "alive_tasks: {}", snapshot.alive_tasks);
        let _ = writeln!(body, "global_queue_depth: {}", snapshot.global_queue_depth);
    }
    if let Some(threads) = process::thread_names() {
        let _ = writeln!(body, "\nthreads: {}", threads.len());
        for (tid, name) in threads {
            let _ = writeln!(body, "  {tid} {name}");
        }
    }
    text(body)
}

async fn heap() -> Response {
    let Some(status) = process::status() else {
        return text("heap: unavailable on this platform\n".to_string());
    };
    let mut body = String::new();
    let fields = [
        ("virtual_bytes", status.virtual_bytes),
        ("resident_bytes", status.resident_bytes),
        ("peak_resident_bytes", status.peak_resident_bytes),
        ("data_bytes", status.data_bytes),
    ];
    for (name, value) in fields {
        if let Some(value) = value {
            let _ = writeln!(body, "{name}: {value}");
        }
    }
    text(body)
}

async fn threadcreate() -> Response {
    match process::status().and_then(|s| s.threads) {
        Some(threads) => text(format!("threads: {threads}\n")),
        None => text("threads: unavailable on this platform\n".to_string()),
    }
}
