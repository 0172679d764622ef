//! chronostore process runtime.
//!
//! Every service component of the storage platform runs as a set of actors
//! inside one lifecycle group: the tracer, the RPC server (for components
//! that have one), the metrics and profiling endpoint and the signal watcher.
//! The first actor to finish stops all the others.
//!
//! # Architecture Overview
//!
//! ```text
//!   main.rs ── cli.rs ── config ──┐
//!                                 ▼
//!                     lifecycle::startup
//!                                 │ registers
//!        ┌──────────────┬─────────┼──────────────┬───────────────┐
//!        ▼              ▼         ▼              ▼               ▼
//!     tracer        rpc::server   http::server   signals     (group.rs runs
//!  (observability)  + interceptor  /metrics                  them together)
//!                   + health       /debug/pprof
//! ```

pub mod cli;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod rpc;

pub use config::RuntimeConfig;
pub use lifecycle::{ActorError, Group, Outcome, Shutdown};
pub use observability::metrics::Registry;
