//! Interceptor chain for RPC calls.
//!
//! # Responsibilities
//! - Register the per-call metrics and the panic counter with the registry
//! - Compose the stages in a fixed order as one tower layer for the server
//!
//! # Design Decisions
//! - Stage order is metrics → tracing → recovery → routes, so latency and
//!   the traced status both observe panics already converted to `Internal`
//! - Stages work on HTTP requests and responses; a call's final status is
//!   read from the response headers or trailers, so streaming calls are
//!   observed until their last message

pub mod metrics;
pub mod recovery;
pub mod trace;

use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;

use crate::observability::metrics::{MetricsError, Registry};
use crate::observability::tracing::Tracer;
use crate::rpc::call::MethodTable;

pub use self::metrics::{MetricsLayer, MetricsService, ServerMetrics};
pub use self::recovery::{PanicRecovery, RecoveredBody, RecoveryLayer, RecoveryService, PANICS_RECOVERED};
pub use self::trace::{TracingLayer, TracingService};

/// The stages stacked so that a service `s` becomes
/// `metrics(tracing(recovery(s)))`.
pub type ChainLayer = Stack<RecoveryLayer, Stack<TracingLayer, Stack<MetricsLayer, Identity>>>;

/// The interceptor stages shared by every method of one server.
#[derive(Clone, Debug)]
pub struct InterceptorChain {
    metrics: ServerMetrics,
    tracer: Tracer,
    recovery: PanicRecovery,
}

impl InterceptorChain {
    /// Register the chain's metrics with `registry`.
    ///
    /// Fails with [`MetricsError::AlreadyRegistered`] if a chain was already
    /// built on the same registry.
    pub fn new(registry: &Registry, tracer: Tracer) -> Result<Self, MetricsError> {
        Ok(Self {
            metrics: ServerMetrics::register(registry)?,
            tracer,
            recovery: PanicRecovery::register(registry)?,
        })
    }

    /// The stages as one layer, labelling calls from `methods`.
    pub fn layer(&self, methods: MethodTable) -> ChainLayer {
        ServiceBuilder::new()
            .layer(MetricsLayer::new(self.metrics.clone(), methods.clone()))
            .layer(TracingLayer::new(self.tracer.clone(), methods))
            .layer(RecoveryLayer::new(self.recovery.clone()))
            .into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::sample_value;
    use crate::rpc::call::{trailers_only, MethodInfo, MethodKind};
    use axum::body::Body;
    use axum::http::{Request, Response};
    use std::convert::Infallible;
    use tonic::{Code, Status};
    use tower::{Layer, ServiceExt};

    #[tokio::test]
    async fn panic_is_seen_as_internal_by_outer_stages() {
        let registry = Registry::bare().unwrap();
        let chain = InterceptorChain::new(&registry, Tracer::noop()).unwrap();
        let methods = MethodTable::new([MethodInfo::new("test.Svc", "Echo", MethodKind::Unary)]);
        let svc = chain.layer(methods).layer(tower::service_fn(|req: Request<Body>| async move {
            assert!(req.extensions().get::<opentelemetry::Context>().is_some());
            if req.headers().contains_key("x-explode") {
                panic!("asked to explode");
            }
            Ok::<_, Infallible>(trailers_only::<Body>(&Status::ok("")))
        }));

        let exploding = Request::post("/test.Svc/Echo")
            .header("x-explode", "1")
            .body(Body::empty())
            .unwrap();
        let response: Response<_> = svc.clone().oneshot(exploding).await.unwrap();
        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "asked to explode");
        drop(response);

        let calm = Request::post("/test.Svc/Echo").body(Body::empty()).unwrap();
        let response = svc.oneshot(calm).await.unwrap();
        assert_eq!(Status::from_header_map(response.headers()).unwrap().code(), Code::Ok);

        let text = registry.render();
        assert_eq!(sample_value(&text, PANICS_RECOVERED), Some(1.0));
        let internal = text
            .lines()
            .find(|l| l.starts_with("grpc_server_handled_total") && l.contains("grpc_code=\"Internal\""))
            .unwrap_or_default();
        assert!(internal.ends_with(" 1"), "{text}");
    }

    #[test]
    fn second_chain_on_same_registry_fails() {
        let registry = Registry::bare().unwrap();
        InterceptorChain::new(&registry, Tracer::noop()).unwrap();
        assert!(matches!(
            InterceptorChain::new(&registry, Tracer::noop()),
            Err(MetricsError::AlreadyRegistered(_))
        ));
    }
}
