//! Configuration schema definitions.
//!
//! Every field has a default so an empty file, or no file at all, is a
//! valid configuration. Command-line flags are applied on top.

use serde::{Deserialize, Serialize};

use crate::rpc::server::DEFAULT_MAX_RECV_MESSAGE_BYTES;

/// Root runtime configuration shared by every service command.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Logging settings.
    pub log: LogConfig,

    /// Auxiliary HTTP endpoint (`/metrics`, `/debug/pprof`).
    pub http: HttpConfig,

    /// RPC server settings.
    pub grpc: GrpcConfig,

    /// Distributed tracing.
    pub tracing: TracingConfig,

    /// Shutdown diagnostics.
    pub shutdown: ShutdownConfig,

    /// Profiling endpoints.
    pub profiling: ProfilingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of error, warn, info, debug.
    pub level: String,

    /// Name attached to every log event, if set.
    pub debug_name: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug_name: None,
        }
    }
}

/// Auxiliary HTTP endpoint configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address (e.g., "0.0.0.0:10902").
    pub bind_address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:10902".to_string(),
        }
    }
}

/// RPC server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GrpcConfig {
    /// Bind address (e.g., "0.0.0.0:10901").
    pub bind_address: String,

    /// Largest message the server will send.
    pub max_send_message_bytes: usize,

    /// Largest message the server will accept.
    pub max_recv_message_bytes: usize,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:10901".to_string(),
            max_send_message_bytes: i32::MAX as usize,
            max_recv_message_bytes: DEFAULT_MAX_RECV_MESSAGE_BYTES,
        }
    }
}

/// Tracing configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Export spans. When false a no-op tracer is used.
    pub enabled: bool,

    /// Service name attached to exported spans.
    pub service_name: String,

    /// Fraction of new traces to sample, 0.0 to 1.0.
    pub sample_ratio: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: env!("CARGO_PKG_NAME").to_string(),
            sample_ratio: 1.0,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Period between warnings naming actors that have not stopped yet.
    /// Zero disables the warnings.
    pub warn_after_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { warn_after_secs: 30 }
    }
}

/// Profiling configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProfilingConfig {
    /// Raised sampling for contention and runtime traces.
    pub debug: bool,

    /// Contention sampling rate reported by the block and mutex profiles.
    pub contention_sample_rate: u32,
}

impl ProfilingConfig {
    /// Sampling rate used when debug profiling is switched on.
    pub const DEBUG_SAMPLE_RATE: u32 = 10;

    /// Switch on debug profiling.
    pub fn enable_debug(&mut self) {
        self.debug = true;
        self.contention_sample_rate = Self::DEBUG_SAMPLE_RATE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.grpc.max_send_message_bytes, i32::MAX as usize);
        assert_eq!(config.http.bind_address, "0.0.0.0:10902");
        assert_eq!(config.shutdown.warn_after_secs, 30);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [grpc]
            bind_address = "127.0.0.1:19091"

            [tracing]
            enabled = true
            sample_ratio = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(config.grpc.bind_address, "127.0.0.1:19091");
        assert_eq!(config.grpc.max_recv_message_bytes, DEFAULT_MAX_RECV_MESSAGE_BYTES);
        assert!(config.tracing.enabled);
        assert_eq!(config.tracing.service_name, "chronostore");
    }

    #[test]
    fn debug_profiling_raises_rate() {
        let mut profiling = ProfilingConfig::default();
        profiling.enable_debug();
        assert!(profiling.debug);
        assert_eq!(profiling.contention_sample_rate, 10);
    }
}
