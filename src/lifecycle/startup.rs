//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the process-wide metrics registry and tracer
//! - Register one actor per subsystem of the selected service command
//! - Bind every listener before the group runs
//! - Run the group and hand its trigger outcome back to `main`
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and nothing has started yet
//! - Subsystems initialize in order, not concurrently
//! - Actors start together; none depends on another having started

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::Instrument;

use crate::config::{ConfigError, RuntimeConfig};
use crate::http::AuxHttpServer;
use crate::lifecycle::{Group, Outcome, SignalWatcher};
use crate::net::{self, ListenerError};
use crate::observability::metrics::{MetricsError, Registry};
use crate::observability::tracing::Tracer;
use crate::rpc::{RpcServer, RpcServerError, ServerOptions};

/// Errors that abort the process before the actor group runs.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("initializing logging: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    #[error("setting up metrics: {0}")]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("setting up gRPC server: {0}")]
    Rpc(#[from] RpcServerError),

    #[error("installing signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("building async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// The deployable service components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Sidecar,
    Store,
    Query,
    Receiver,
    Rule,
    Compact,
    Bucket,
    Downsample,
}

impl ServiceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Sidecar => "sidecar",
            ServiceKind::Store => "store",
            ServiceKind::Query => "query",
            ServiceKind::Receiver => "receiver",
            ServiceKind::Rule => "rule",
            ServiceKind::Compact => "compact",
            ServiceKind::Bucket => "bucket",
            ServiceKind::Downsample => "downsample",
        }
    }

    /// Whether the component exposes an RPC server.
    pub fn serves_grpc(&self) -> bool {
        matches!(
            self,
            ServiceKind::Sidecar
                | ServiceKind::Store
                | ServiceKind::Query
                | ServiceKind::Receiver
                | ServiceKind::Rule
        )
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A group with every listener bound, ready to run.
#[derive(Debug)]
pub struct Assembled {
    pub group: Group,
    pub grpc_address: Option<std::net::SocketAddr>,
    pub http_address: std::net::SocketAddr,
}

/// Register the actors for `service`: tracer, RPC server (if any), the
/// auxiliary HTTP endpoint and the signal watcher.
pub async fn assemble(
    service: ServiceKind,
    config: &RuntimeConfig,
    registry: &Registry,
) -> Result<Assembled, StartupError> {
    let mut group = Group::new()
        .with_shutdown_warning(Duration::from_secs(config.shutdown.warn_after_secs));

    let tracer = Tracer::from_config(&config.tracing);
    tracer.register(&mut group);

    let grpc_address = if service.serves_grpc() {
        let options = ServerOptions::from(&config.grpc);
        let server = RpcServer::bootstrap(registry, tracer.clone(), options)?;
        let address = net::parse_address(&config.grpc.bind_address)?;
        let bound = server.bind(address).await?;
        let local = bound.local_addr();
        bound.register(&mut group);
        Some(local)
    } else {
        None
    };

    let address = net::parse_address(&config.http.bind_address)?;
    let http = AuxHttpServer::bind(address, registry.clone(), &config.profiling).await?;
    let http_address = http.local_addr();
    http.register(&mut group);

    SignalWatcher::install()
        .map_err(StartupError::Signals)?
        .register(&mut group);

    Ok(Assembled {
        group,
        grpc_address,
        http_address,
    })
}

/// Assemble and run `service` until its first actor finishes.
///
/// Returns `Err` only for startup failures; the run's own result is the
/// inner [`Outcome`].
pub async fn run(
    service: ServiceKind,
    config: RuntimeConfig,
    span: tracing::Span,
) -> Result<Outcome, StartupError> {
    let registry = Registry::new()?;
    let assembled = assemble(service, &config, &registry)
        .instrument(span.clone())
        .await?;

    span.in_scope(|| {
        tracing::info!(
            service = %service,
            grpc_address = ?assembled.grpc_address,
            http_address = %assembled.http_address,
            actors = assembled.group.len(),
            "Starting"
        );
    });
    Ok(assembled.group.run().instrument(span).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.grpc.bind_address = "127.0.0.1:0".into();
        config.http.bind_address = "127.0.0.1:0".into();
        config
    }

    #[test]
    fn grpc_components() {
        assert!(ServiceKind::Store.serves_grpc());
        assert!(!ServiceKind::Compact.serves_grpc());
        assert_eq!(ServiceKind::Downsample.to_string(), "downsample");
    }

    #[tokio::test]
    async fn store_registers_all_actors() {
        let registry = Registry::bare().unwrap();
        let assembled = assemble(ServiceKind::Store, &local_config(), &registry)
            .await
            .unwrap();
        // tracer, grpc, http, signal
        assert_eq!(assembled.group.len(), 4);
        assert!(assembled.grpc_address.is_some());
    }

    #[tokio::test]
    async fn compact_has_no_rpc_server() {
        let registry = Registry::bare().unwrap();
        let assembled = assemble(ServiceKind::Compact, &local_config(), &registry)
            .await
            .unwrap();
        assert_eq!(assembled.group.len(), 3);
        assert!(assembled.grpc_address.is_none());
    }

    #[tokio::test]
    async fn busy_port_is_startup_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = local_config();
        config.http.bind_address = taken.local_addr().unwrap().to_string();

        let registry = Registry::bare().unwrap();
        let err = assemble(ServiceKind::Bucket, &config, &registry).await.unwrap_err();
        assert!(matches!(err, StartupError::Listener(ListenerError::Bind { .. })));
    }

    #[tokio::test]
    async fn invalid_address_is_startup_error() {
        let mut config = local_config();
        config.grpc.bind_address = "not-an-address".into();
        let registry = Registry::bare().unwrap();
        let err = assemble(ServiceKind::Query, &config, &registry).await.unwrap_err();
        assert!(matches!(err, StartupError::Listener(ListenerError::Address { .. })));
    }
}
