//! Per-call tracing stage.
//!
//! Opens one server span per call, continuing the caller's trace when a
//! `traceparent` is present. The span's context is placed in the request
//! extensions, where handlers read it through `tonic::Request::extensions`.
//! The span ends once the final status has been sent.

use std::task::{Context, Poll};

use axum::http::{Request, Response};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use opentelemetry::trace::TraceContextExt;
use tonic::{Code, Status};
use tower::{Layer, Service};
use tracing::Instrument;

use crate::observability::tracing::Tracer;
use crate::rpc::call::{code_label, CompletionBody, MethodTable};

#[derive(Clone, Debug)]
pub struct TracingLayer {
    tracer: Tracer,
    methods: MethodTable,
}

impl TracingLayer {
    pub fn new(tracer: Tracer, methods: MethodTable) -> Self {
        Self { tracer, methods }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            tracer: self.tracer.clone(),
            methods: self.methods.clone(),
        }
    }
}

/// Wraps each call in a span and ends it with the call's status.
#[derive(Clone, Debug)]
pub struct TracingService<S> {
    inner: S,
    tracer: Tracer,
    methods: MethodTable,
}

impl<S, B, RB> Service<Request<B>> for TracingService<S>
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

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let Some(method) = self.methods.get(req.uri().path()).cloned() else {
            let future = self.inner.call(req);
            return async move { Ok(future.await?.map(CompletionBody::untracked)) }.boxed();
        };

        let operation = method.to_string();
        let cx = self.tracer.start(&operation, req.headers());
        let span = {
            let otel_span = cx.span();
            let ids = otel_span.span_context();
            tracing::info_span!(
                "rpc",
                rpc.method = %operation,
                rpc.kind = method.kind.as_str(),
                trace_id = %ids.trace_id(),
                span_id = %ids.span_id(),
                rpc.code = tracing::field::Empty,
            )
        };
        req.extensions_mut().insert(cx.clone());

        let future = span.in_scope(|| self.inner.call(req));
        let tracer = self.tracer.clone();
        let call_span = span.clone();
        let finish = move |status: &Status| {
            call_span.record("rpc.code", code_label(status.code()));
            if status.code() != Code::Ok {
                call_span.in_scope(|| {
                    tracing::debug!(code = ?status.code(), message = %status.message(), "Call failed");
                });
            }
            tracer.finish(&cx, status.code(), status.message());
        };

        async move {
            match future.await {
                Ok(response) => Ok(CompletionBody::wrap(response, Box::new(finish))),
                Err(e) => {
                    finish(&Status::unknown("transport error"));
                    Err(e)
                }
            }
        }
        .instrument(span)
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracingConfig;
    use crate::observability::tracing::{trace_id, TRACEPARENT};
    use crate::rpc::call::{status_headers, trailers_only, MethodInfo, MethodKind};
    use axum::body::Body;
    use bytes::Bytes;
    use hyper::body::Frame;
    use std::convert::Infallible;
    use tower::ServiceExt;

    fn tracer() -> Tracer {
        Tracer::from_config(&TracingConfig {
            enabled: true,
            service_name: "test".into(),
            sample_ratio: 1.0,
        })
    }

    fn table() -> MethodTable {
        MethodTable::new([
            MethodInfo::new("test.Svc", "Do", MethodKind::Unary),
            MethodInfo::new("test.Svc", "Watch", MethodKind::ServerStreaming),
        ])
    }

    #[tokio::test]
    async fn handler_sees_callers_trace() {
        let svc = TracingLayer::new(tracer(), table()).layer(tower::service_fn(|req: Request<Body>| async move {
            let id = req
                .extensions()
                .get::<opentelemetry::Context>()
                .and_then(trace_id)
                .unwrap_or_default();
            let mut response = trailers_only::<Body>(&Status::ok(""));
            response.headers_mut().insert("x-trace-id", id.parse().unwrap());
            Ok::<_, Infallible>(response)
        }));

        let req = Request::post("/test.Svc/Do")
            .header(TRACEPARENT, "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
            .body(Body::empty())
            .unwrap();
        let response = svc.oneshot(req).await.unwrap();
        assert_eq!(response.headers()["x-trace-id"], "0af7651916cd43dd8448eb211c80319c");
    }

    #[tokio::test]
    async fn noop_tracer_still_injects_context() {
        let svc = TracingLayer::new(Tracer::noop(), table()).layer(tower::service_fn(|req: Request<Body>| async move {
            assert!(req.extensions().get::<opentelemetry::Context>().and_then(trace_id).is_some());
            Ok::<_, Infallible>(trailers_only::<Body>(&Status::ok("")))
        }));
        let req = Request::post("/test.Svc/Do").body(Body::empty()).unwrap();
        assert!(svc.oneshot(req).await.is_ok());
    }

    #[tokio::test]
    async fn stream_span_ends_with_trailers() {
        let tracer = tracer();
        let svc = TracingLayer::new(tracer.clone(), table()).layer(tower::service_fn(|_req: Request<Body>| async {
            let frames = futures_util::stream::iter(vec![
                Ok::<_, Infallible>(Frame::data(Bytes::from_static(b"a"))),
                Ok(Frame::trailers(status_headers(&Status::ok("")))),
            ]);
            Ok::<_, Infallible>(Response::new(Body::new(http_body_stream(frames))))
        }));
        let req = Request::post("/test.Svc/Watch").body(Body::empty()).unwrap();

        let response = svc.oneshot(req).await.unwrap();
        assert_eq!(tracer.exported(), 0);
        axum::body::to_bytes(Body::new(response.into_body()), usize::MAX)
            .await
            .unwrap();
        assert_eq!(tracer.exported(), 1);
    }

    #[tokio::test]
    async fn untracked_paths_open_no_span() {
        let tracer = tracer();
        let svc = TracingLayer::new(tracer.clone(), table()).layer(tower::service_fn(|req: Request<Body>| async move {
            assert!(req.extensions().get::<opentelemetry::Context>().is_none());
            Ok::<_, Infallible>(trailers_only::<Body>(&Status::unimplemented("")))
        }));
        let req = Request::post("/other.Svc/Do").body(Body::empty()).unwrap();
        svc.oneshot(req).await.unwrap();
        assert_eq!(tracer.exported(), 0);
    }

    /// Body built from a stream of frames.
    fn http_body_stream<S>(frames: S) -> impl hyper::body::Body<Data = Bytes, Error = Infallible> + Send + 'static
    where
        S: futures_util::Stream<Item = Result<Frame<Bytes>, Infallible>> + Send + Unpin + 'static,
    {
        struct FrameStream<S>(S);

        impl<S> hyper::body::Body for FrameStream<S>
        where
            S: futures_util::Stream<Item = Result<Frame<Bytes>, Infallible>> + Unpin,
        {
            type Data = Bytes;
            type Error = Infallible;

            fn poll_frame(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
                futures_util::StreamExt::poll_next_unpin(&mut self.0, cx)
            }
        }

        FrameStream(frames)
    }
}
