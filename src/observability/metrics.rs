//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Own the process-wide metrics registry (constructed once in `main`,
//!   passed explicitly to every component that records metrics)
//! - Reject duplicate registration of a metric family
//! - Render the Prometheus text exposition format for `/metrics`
//! - Refresh process and runtime gauges at scrape time
//!
//! # Design Decisions
//! - No global recorder is installed; handles are obtained from the
//!   registry's own [`PrometheusRecorder`]
//! - Metric handles are atomic, so recording never takes a lock
//! - RPC latency buckets are fixed at registry construction

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Label, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use thiserror::Error;

use crate::observability::process;

/// Histogram boundaries, in seconds, for RPC handling time.
pub const RPC_LATENCY_BUCKETS: [f64; 10] = [0.001, 0.01, 0.05, 0.1, 0.2, 0.4, 0.8, 1.6, 3.2, 6.4];

/// Suffix shared by every RPC handling-time histogram.
pub const RPC_LATENCY_SUFFIX: &str = "_handling_seconds";

const BUILD_INFO: &str = "chronostore_build_info";
const PROCESS_START_TIME: &str = "process_start_time_seconds";
const PROCESS_RESIDENT_MEMORY: &str = "process_resident_memory_bytes";
const PROCESS_THREADS: &str = "process_threads";
const RUNTIME_WORKERS: &str = "tokio_runtime_workers";
const RUNTIME_ALIVE_TASKS: &str = "tokio_runtime_alive_tasks";

/// Errors raised while setting up metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric family with this name already exists in the registry.
    #[error("duplicate metrics collector registration attempted: {0}")]
    AlreadyRegistered(String),

    /// The underlying exporter rejected its configuration.
    #[error("metrics exporter configuration: {0}")]
    Build(#[from] BuildError),
}

/// Process-wide metrics registry.
///
/// Cheap to clone; clones share the same metric storage.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    families: Mutex<HashSet<String>>,
    collectors: OnceLock<Collectors>,
}

struct Collectors {
    resident_memory: Gauge,
    threads: Gauge,
    workers: Gauge,
    alive_tasks: Gauge,
}

impl Registry {
    /// Create a registry with the process and runtime collectors registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Self::bare()?;
        registry.register_gauge(BUILD_INFO, "A metric with a constant '1' value labeled by version.")?
            .with_labels(&[("version", env!("CARGO_PKG_VERSION").to_string())])
            .set(1.0);

        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        registry.register_gauge(PROCESS_START_TIME, "Start time of the process since unix epoch in seconds.")?
            .gauge()
            .set(start);

        let collectors = Collectors {
            resident_memory: registry
                .register_gauge(PROCESS_RESIDENT_MEMORY, "Resident memory size in bytes.")?
                .gauge(),
            threads: registry
                .register_gauge(PROCESS_THREADS, "Number of OS threads in the process.")?
                .gauge(),
            workers: registry
                .register_gauge(RUNTIME_WORKERS, "Number of async runtime worker threads.")?
                .gauge(),
            alive_tasks: registry
                .register_gauge(RUNTIME_ALIVE_TASKS, "Number of alive async runtime tasks.")?
                .gauge(),
        };
        let _ = registry.inner.collectors.set(collectors);

        Ok(registry)
    }

    /// Registry without process collectors.
    pub fn bare() -> Result<Self, MetricsError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Suffix(RPC_LATENCY_SUFFIX.to_string()), &RPC_LATENCY_BUCKETS)?
            .build_recorder();
        let handle = recorder.handle();
        Ok(Self {
            inner: Arc::new(RegistryInner {
                recorder,
                handle,
                families: Mutex::new(HashSet::new()),
                collectors: OnceLock::new(),
            }),
        })
    }

    fn claim(&self, name: &'static str) -> Result<(), MetricsError> {
        let mut families = self
            .inner
            .families
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !families.insert(name.to_string()) {
            return Err(MetricsError::AlreadyRegistered(name.to_string()));
        }
        Ok(())
    }

    /// Register a counter family.
    pub fn register_counter(
        &self,
        name: &'static str,
        help: &'static str,
    ) -> Result<CounterFamily, MetricsError> {
        self.claim(name)?;
        self.inner.recorder.describe_counter(KeyName::from(name), None, help.into());
        Ok(CounterFamily {
            family: Family::new(self, name),
        })
    }

    /// Register a gauge family.
    pub fn register_gauge(
        &self,
        name: &'static str,
        help: &'static str,
    ) -> Result<GaugeFamily, MetricsError> {
        self.claim(name)?;
        self.inner.recorder.describe_gauge(KeyName::from(name), None, help.into());
        Ok(GaugeFamily {
            family: Family::new(self, name),
        })
    }

    /// Register a histogram family.
    pub fn register_histogram(
        &self,
        name: &'static str,
        help: &'static str,
    ) -> Result<HistogramFamily, MetricsError> {
        self.claim(name)?;
        self.inner.recorder.describe_histogram(KeyName::from(name), None, help.into());
        Ok(HistogramFamily {
            family: Family::new(self, name),
        })
    }

    /// Whether a family with this name has been registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.inner
            .families
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name)
    }

    /// Render the current state in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        if let Some(collectors) = self.inner.collectors.get() {
            collectors.refresh();
        }
        self.inner.handle.render()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Collectors {
    fn refresh(&self) {
        if let Some(status) = process::status() {
            if let Some(rss) = status.resident_bytes {
                self.resident_memory.set(rss as f64);
            }
            if let Some(threads) = status.threads {
                self.threads.set(threads as f64);
            }
        }
        if let Some(runtime) = process::RuntimeSnapshot::capture() {
            self.workers.set(runtime.workers as f64);
            self.alive_tasks.set(runtime.alive_tasks as f64);
        }
    }
}

#[derive(Clone)]
struct Family {
    registry: Registry,
    name: &'static str,
}

impl Family {
    fn new(registry: &Registry, name: &'static str) -> Self {
        Self {
            registry: registry.clone(),
            name,
        }
    }

    fn key(&self, labels: &[(&'static str, String)]) -> Key {
        let labels: Vec<Label> = labels
            .iter()
            .map(|(k, v)| Label::new(*k, v.clone()))
            .collect();
        Key::from_parts(self.name, labels)
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// A registered counter name; hands out per-label-set counters.
#[derive(Clone)]
pub struct CounterFamily {
    family: Family,
}

impl CounterFamily {
    pub fn with_labels(&self, labels: &[(&'static str, String)]) -> Counter {
        self.family
            .registry
            .inner
            .recorder
            .register_counter(&self.family.key(labels), &metadata())
    }

    /// The unlabeled series of this family.
    pub fn counter(&self) -> Counter {
        self.with_labels(&[])
    }
}

/// A registered gauge name.
#[derive(Clone)]
pub struct GaugeFamily {
    family: Family,
}

impl GaugeFamily {
    pub fn with_labels(&self, labels: &[(&'static str, String)]) -> Gauge {
        self.family
            .registry
            .inner
            .recorder
            .register_gauge(&self.family.key(labels), &metadata())
    }

    pub fn gauge(&self) -> Gauge {
        self.with_labels(&[])
    }
}

/// A registered histogram name.
#[derive(Clone)]
pub struct HistogramFamily {
    family: Family,
}

impl HistogramFamily {
    pub fn with_labels(&self, labels: &[(&'static str, String)]) -> Histogram {
        self.family
            .registry
            .inner
            .recorder
            .register_histogram(&self.family.key(labels), &metadata())
    }
}

/// Value of the first sample line starting with `prefix` in a rendered
/// exposition, e.g. `grpc_server_handled_total{grpc_code="Internal"`.
pub fn sample_value(exposition: &str, prefix: &str) -> Option<f64> {
    exposition
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find(|line| line.starts_with(prefix))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}
