//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → tracing.rs (spans with W3C trace context)
//!
//! Consumers:
//!     → stderr log stream
//!     → /metrics (Prometheus scrape)
//!     → /debug/pprof (process.rs figures)
//! ```
//!
//! # Design Decisions
//! - The metrics registry is an explicit value, never a global
//! - Metrics are cheap (atomic increments)
//! - Tracing is optional; a no-op tracer still propagates context

pub mod logging;
pub mod metrics;
pub mod process;
pub mod tracing;
