//! Auxiliary HTTP endpoint.
//!
//! # Responsibilities
//! - Serve `/metrics` from the process registry
//! - Serve the profiling endpoints under `/debug/pprof/`
//! - Bind its listener before the run and stop gracefully on interrupt
//!
//! # Design Decisions
//! - One endpoint per process, shared by every service command
//! - A listener closed by interrupt is a clean outcome
//! - Timed profiles in flight at interrupt return early, so they do not hold
//!   up the graceful drain

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::ProfilingConfig;
use crate::http::profile;
use crate::lifecycle::{ActorError, Group, Outcome, Shutdown, ShutdownSignal};
use crate::net::{self, ListenerError};
use crate::observability::metrics::Registry;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Build the endpoint's router; timed profiles stop once `shutdown` fires.
pub fn router(registry: Registry, profiling: &ProfilingConfig, shutdown: ShutdownSignal) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry)
        .merge(profile::routes(profiling, shutdown))
        .layer(TraceLayer::new_for_http())
}

async fn metrics(State(registry): State<Registry>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], registry.render())
}

/// The auxiliary HTTP endpoint with its listener bound.
pub struct AuxHttpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Registry,
    profiling: ProfilingConfig,
}

impl AuxHttpServer {
    /// Bind `address` now; serving starts when the actor runs.
    pub async fn bind(
        address: SocketAddr,
        registry: Registry,
        profiling: &ProfilingConfig,
    ) -> Result<Self, ListenerError> {
        let listener = net::bind(address, "http").await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { address, source })?;
        Ok(Self {
            listener,
            local_addr,
            registry,
            profiling: profiling.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` fires, then finish in-flight requests.
    pub async fn serve(self, shutdown: ShutdownSignal) -> Outcome {
        tracing::info!(address = %self.local_addr, "Listening for metrics and profiles");
        let router = router(self.registry, &self.profiling, shutdown.clone());
        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown.wait())
            .await
            .map_err(|e| ActorError::failed("serve metrics", e))?;
        tracing::info!(address = %self.local_addr, "Metrics endpoint stopped");
        Ok(())
    }

    /// Register the endpoint as an actor named `http`.
    pub fn register(self, group: &mut Group) {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        group.add("http", self.serve(signal), move |_| shutdown.trigger());
    }
}

impl std::fmt::Debug for AuxHttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxHttpServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
