//! RPC server bootstrap.
//!
//! # Responsibilities
//! - Route each registered method to its handler through `tonic`'s framing
//! - Apply the interceptor chain to every call
//! - Bind the listener eagerly and expose the server as a lifecycle actor
//!
//! # Design Decisions
//! - Unknown methods get a trailers-only `Unimplemented` reply
//! - Registered methods refuse non-gRPC content types with HTTP 415
//! - The outbound message limit defaults to `i32::MAX` bytes
//! - On interrupt the health status flips to `NOT_SERVING` and open health
//!   watches end before the listener drains, so shutdown completes

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::Request;
use axum::http::{header, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;
use tonic::transport::Server;
use tonic::Status;
use tower::Service;

use crate::config::GrpcConfig;
use crate::lifecycle::{ActorError, Group, Outcome, Shutdown, ShutdownSignal};
use crate::net::{self, ListenerError};
use crate::observability::metrics::{MetricsError, Registry};
use crate::observability::tracing::Tracer;
use crate::rpc::call::{trailers_only, MessageStream, MethodInfo, MethodKind, MethodTable};
use crate::rpc::health::{self, HealthReporter};
use crate::rpc::interceptor::{ChainLayer, InterceptorChain};
use crate::rpc::method::{StreamingMethod, UnaryMethod};

/// Default inbound message limit, 4 MiB.
pub const DEFAULT_MAX_RECV_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Errors raised while assembling or binding an RPC server.
#[derive(Debug, Error)]
pub enum RpcServerError {
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("method {0} is already registered")]
    DuplicateMethod(String),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Transport options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub max_send_message_bytes: usize,
    pub max_recv_message_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_send_message_bytes: i32::MAX as usize,
            max_recv_message_bytes: DEFAULT_MAX_RECV_MESSAGE_BYTES,
        }
    }
}

impl From<&GrpcConfig> for ServerOptions {
    fn from(config: &GrpcConfig) -> Self {
        Self {
            max_send_message_bytes: config.max_send_message_bytes,
            max_recv_message_bytes: config.max_recv_message_bytes,
        }
    }
}

/// An RPC server under construction.
pub struct RpcServer {
    chain: InterceptorChain,
    options: ServerOptions,
    methods: HashMap<String, MethodInfo>,
    router: Router,
    health: HealthReporter,
}

impl RpcServer {
    /// Build a server whose methods all pass through the interceptor chain.
    ///
    /// Registers the chain's metrics with `registry`; bootstrapping a second
    /// server on the same registry fails with
    /// [`MetricsError::AlreadyRegistered`]. The health service is installed.
    pub fn bootstrap(
        registry: &Registry,
        tracer: Tracer,
        options: ServerOptions,
    ) -> Result<Self, RpcServerError> {
        let chain = InterceptorChain::new(registry, tracer)?;
        let (health, health_service) = HealthReporter::new();
        let health_service = health_service
            .max_decoding_message_size(options.max_recv_message_bytes)
            .max_encoding_message_size(options.max_send_message_bytes);

        let mut server = Self {
            chain,
            options,
            methods: HashMap::new(),
            router: Router::new(),
            health,
        };
        for (method, kind) in [("Check", MethodKind::Unary), ("Watch", MethodKind::ServerStreaming)] {
            let info = MethodInfo::new(health::SERVICE, method, kind);
            server.insert(info, health_service.clone())?;
        }
        Ok(server)
    }

    fn insert<T>(&mut self, info: MethodInfo, route: T) -> Result<(), RpcServerError>
    where
        T: Service<axum::extract::Request, Error = std::convert::Infallible> + Clone + Send + Sync + 'static,
        T::Response: axum::response::IntoResponse,
        T::Future: Send + 'static,
    {
        let path = info.path();
        if self.methods.contains_key(&path) {
            return Err(RpcServerError::DuplicateMethod(path));
        }
        tracing::debug!(method = %path, kind = info.kind.as_str(), "RPC method registered");
        self.router = std::mem::take(&mut self.router).route_service(&path, route);
        self.methods.insert(path, info);
        Ok(())
    }

    /// Register a unary method.
    pub fn add_unary<S>(&mut self, service: &str, method: &str, handler: S) -> Result<(), RpcServerError>
    where
        S: Service<tonic::Request<Bytes>, Response = tonic::Response<Bytes>, Error = Status>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let info = MethodInfo::new(service, method, MethodKind::Unary);
        let route = UnaryMethod::new(handler, self.options.clone());
        self.insert(info, route)
    }

    /// Register a server-streaming method.
    pub fn add_streaming<S>(&mut self, service: &str, method: &str, handler: S) -> Result<(), RpcServerError>
    where
        S: Service<tonic::Request<Bytes>, Response = tonic::Response<MessageStream>, Error = Status>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let info = MethodInfo::new(service, method, MethodKind::ServerStreaming);
        let route = StreamingMethod::new(handler, self.options.clone());
        self.insert(info, route)
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    /// Registered method paths, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.methods.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Bind the listener now; serving starts when the actor runs.
    pub async fn bind(self, address: SocketAddr) -> Result<BoundRpcServer, RpcServerError> {
        let listener = net::bind(address, "grpc").await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { address, source })?;
        self.health.publish().await;

        let layer = self.chain.layer(MethodTable::new(self.methods.into_values()));
        Ok(BoundRpcServer {
            listener,
            local_addr,
            health: self.health,
            routes: Routes::from(
                self.router
                    .route_layer(middleware::from_fn(require_grpc))
                    .fallback(unknown_method),
            ),
            layer,
        })
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("options", &self.options)
            .field("methods", &self.methods())
            .finish_non_exhaustive()
    }
}

async fn unknown_method(uri: Uri) -> Response {
    trailers_only(&Status::unimplemented(format!("unknown method {}", uri.path())))
}

async fn require_grpc(req: Request, next: Next) -> Response {
    let grpc = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/grpc"));
    if !grpc {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    next.run(req).await
}

/// An RPC server with its listener bound.
pub struct BoundRpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    health: HealthReporter,
    routes: Routes,
    layer: ChainLayer,
}

impl BoundRpcServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    /// Serve until `shutdown` fires, then drain in-flight calls.
    pub async fn serve(self, shutdown: ShutdownSignal) -> Outcome {
        tracing::info!(address = %self.local_addr, "Listening for gRPC");
        self.health.set_serving("").await;

        let health = self.health.clone();
        let stopping = async move {
            shutdown.wait().await;
            health.shutdown().await;
        };
        Server::builder()
            .layer(self.layer)
            .add_routes(self.routes)
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), stopping)
            .await
            .map_err(|e| ActorError::failed("serve gRPC", e))?;
        tracing::info!(address = %self.local_addr, "gRPC server stopped");
        Ok(())
    }

    /// Register the server as an actor named `grpc`.
    pub fn register(self, group: &mut Group) {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        group.add("grpc", self.serve(signal), move |_| shutdown.trigger());
    }
}
