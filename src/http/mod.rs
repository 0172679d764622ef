//! Auxiliary HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! HTTP/1.1 request
//!     → server.rs (Axum router, request tracing)
//!     → /metrics (registry exposition)
//!     → /debug/pprof/* (profile.rs)
//! ```

pub mod profile;
pub mod server;

pub use server::AuxHttpServer;
