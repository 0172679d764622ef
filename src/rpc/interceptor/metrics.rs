//! Server-side RPC metrics, the outermost interceptor stage.
//!
//! Calls are timed until their final status is sent, so a streaming call is
//! observed after its last message.

use std::task::{Context, Poll};
use std::time::Instant;

use axum::http::{Request, Response};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tonic::{Code, Status};
use tower::{Layer, Service};

use crate::observability::metrics::{CounterFamily, HistogramFamily, MetricsError, Registry};
use crate::rpc::call::{code_label, CompletionBody, MethodInfo, MethodTable};

pub const STARTED_TOTAL: &str = "grpc_server_started_total";
pub const HANDLED_TOTAL: &str = "grpc_server_handled_total";
pub const HANDLING_SECONDS: &str = "grpc_server_handling_seconds";

/// Metric families recorded for every call.
#[derive(Clone)]
pub struct ServerMetrics {
    started: CounterFamily,
    handled: CounterFamily,
    handling: HistogramFamily,
}

impl ServerMetrics {
    pub fn register(registry: &Registry) -> Result<Self, MetricsError> {
        Ok(Self {
            started: registry.register_counter(
                STARTED_TOTAL,
                "Total number of RPCs started on the server.",
            )?,
            handled: registry.register_counter(
                HANDLED_TOTAL,
                "Total number of RPCs completed on the server, regardless of success or failure.",
            )?,
            handling: registry.register_histogram(
                HANDLING_SECONDS,
                "Histogram of response latency (seconds) of gRPC that had been application-level handled by the server.",
            )?,
        })
    }

    fn labels(method: &MethodInfo) -> Vec<(&'static str, String)> {
        vec![
            ("grpc_type", method.kind.as_str().to_string()),
            ("grpc_service", method.service.clone()),
            ("grpc_method", method.method.clone()),
        ]
    }

    fn started(&self, method: &MethodInfo) {
        self.started.with_labels(&Self::labels(method)).increment(1);
    }

    fn handled(&self, method: &MethodInfo, code: Code, started_at: Instant) {
        let mut labels = Self::labels(method);
        labels.push(("grpc_code", code_label(code).to_string()));
        self.handled.with_labels(&labels).increment(1);
        self.handling
            .with_labels(&labels)
            .record(started_at.elapsed().as_secs_f64());
    }
}

impl std::fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMetrics").finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct MetricsLayer {
    metrics: ServerMetrics,
    methods: MethodTable,
}

impl MetricsLayer {
    pub fn new(metrics: ServerMetrics, methods: MethodTable) -> Self {
        Self { metrics, methods }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics.clone(),
            methods: self.methods.clone(),
        }
    }
}

/// Counts calls and times them until the final status is sent.
#[derive(Clone, Debug)]
pub struct MetricsService<S> {
    inner: S,
    metrics: ServerMetrics,
    methods: MethodTable,
}

impl<S, B, RB> Service<Request<B>> for MetricsService<S>
where
    S: Service<Request<B>, Response = Response<RB>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    RB: Send + 'static,
{
    type Response = Response<CompletionBody<RB>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let Some(method) = self.methods.get(req.uri().path()).cloned() else {
            let future = self.inner.call(req);
            return async move { Ok(future.await?.map(CompletionBody::untracked)) }.boxed();
        };

        let metrics = self.metrics.clone();
        let started_at = Instant::now();
        metrics.started(&method);

        let future = self.inner.call(req);
        async move {
            match future.await {
                Ok(response) => Ok(CompletionBody::wrap(
                    response,
                    Box::new(move |status: &Status| metrics.handled(&method, status.code(), started_at)),
                )),
                Err(e) => {
                    metrics.handled(&method, Code::Unknown, started_at);
                    Err(e)
                }
            }
        }
        .boxed()
    }
}
