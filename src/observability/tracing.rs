//! Distributed tracing support.
//!
//! # Responsibilities
//! - Extract W3C trace context (`traceparent`) from incoming call metadata
//! - Start one server span per call, sampled by trace-id ratio
//! - Hand finished spans to the bundled exporter
//! - Expose the tracer's lifecycle (flush and close) as an actor
//!
//! # Design Decisions
//! - A disabled tracer is an SDK provider that samples nothing; span contexts
//!   are still created and propagated so handlers always see a trace id
//! - The bundled exporter writes finished spans as structured log events;
//!   shipping them to a collector is left to the log pipeline

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::HeaderMap;
use futures_util::future::BoxFuture;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::{
    SpanKind, Status as SpanStatus, TraceContextExt, Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self as sdktrace, RandomIdGenerator, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use tonic::Code;

use crate::config::TracingConfig;
use crate::lifecycle::{ActorError, Group, Shutdown};

/// Metadata key carrying the W3C trace context.
pub const TRACEPARENT: &str = "traceparent";

const INSTRUMENTATION: &str = "chronostore";

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|key| key.as_str()).collect()
    }
}

/// Writes finished spans as `debug` log events.
#[derive(Debug)]
struct LogExporter {
    exported: Arc<AtomicU64>,
    stopped: bool,
}

impl SpanExporter for LogExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        if self.stopped {
            return Box::pin(std::future::ready(Ok(())));
        }
        for span in &batch {
            let duration = span
                .end_time
                .duration_since(span.start_time)
                .unwrap_or_default();
            tracing::debug!(
                target: "chronostore::trace",
                operation = %span.name,
                trace_id = %span.span_context.trace_id(),
                span_id = %span.span_context.span_id(),
                parent_span_id = %span.parent_span_id,
                duration_ms = duration.as_secs_f64() * 1000.0,
                status = ?span.status,
                "span finished"
            );
        }
        self.exported.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Box::pin(std::future::ready(Ok(())))
    }

    fn shutdown(&mut self) {
        self.stopped = true;
    }
}

/// Process tracer. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Tracer {
    provider: TracerProvider,
    tracer: sdktrace::Tracer,
    propagator: TraceContextPropagator,
    exported: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl Tracer {
    fn with_provider(provider: TracerProvider, exported: Arc<AtomicU64>) -> Self {
        let tracer = provider.tracer(INSTRUMENTATION);
        Self {
            provider,
            tracer,
            propagator: TraceContextPropagator::new(),
            exported,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Tracer that exports nothing; span contexts are still created.
    pub fn noop() -> Self {
        let provider = TracerProvider::builder()
            .with_config(sdktrace::Config::default().with_sampler(Sampler::AlwaysOff))
            .build();
        Self::with_provider(provider, Arc::new(AtomicU64::new(0)))
    }

    pub fn from_config(config: &TracingConfig) -> Self {
        if !config.enabled {
            return Self::noop();
        }
        tracing::info!(
            service = %config.service_name,
            sample_ratio = config.sample_ratio,
            "Tracing enabled"
        );

        let exported = Arc::new(AtomicU64::new(0));
        let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            config.sample_ratio.clamp(0.0, 1.0),
        )));
        let provider = TracerProvider::builder()
            .with_config(
                sdktrace::Config::default()
                    .with_sampler(sampler)
                    .with_id_generator(RandomIdGenerator::default())
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        config.service_name.clone(),
                    )])),
            )
            .with_simple_exporter(LogExporter {
                exported: exported.clone(),
                stopped: false,
            })
            .build();
        Self::with_provider(provider, exported)
    }

    /// Start the server span for a call to `operation`, continuing the
    /// caller's trace when `metadata` carries a valid `traceparent`.
    pub fn start(&self, operation: &str, metadata: &HeaderMap) -> Context {
        let parent = self.propagator.extract(&HeaderExtractor(metadata));
        let span = self
            .tracer
            .span_builder(operation.to_string())
            .with_kind(SpanKind::Server)
            .with_attributes(vec![KeyValue::new("rpc.system", "grpc")])
            .start_with_context(&self.tracer, &parent);
        parent.with_span(span)
    }

    /// End the span in `cx` with the call's final status.
    pub fn finish(&self, cx: &Context, code: Code, message: &str) {
        let span = cx.span();
        span.set_attribute(KeyValue::new("rpc.grpc.status_code", code as i64));
        if code != Code::Ok {
            span.set_status(SpanStatus::error(message.to_string()));
        }
        span.end();
    }

    /// Number of spans exported so far.
    pub fn exported(&self) -> u64 {
        self.exported.load(Ordering::Relaxed)
    }

    /// Flush and stop exporting. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.provider.shutdown() {
            tracing::warn!(error = %e, "Tracer provider shutdown failed");
        }
        tracing::info!(spans = self.exported(), "Tracer closed");
    }

    /// Register the tracer's lifecycle: execute waits for shutdown, interrupt
    /// closes the tracer.
    pub fn register(&self, group: &mut Group) {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        let tracer = self.clone();
        group.add(
            "tracer",
            async move {
                signal.wait().await;
                Err(ActorError::Canceled)
            },
            move |_| {
                tracer.close();
                shutdown.trigger();
            },
        );
    }
}

/// Hex trace id of the span in `cx`, or `None` when it carries no valid span.
pub fn trace_id(cx: &Context) -> Option<String> {
    let span = cx.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    fn enabled(sample_ratio: f64) -> Tracer {
        Tracer::from_config(&TracingConfig {
            enabled: true,
            service_name: "test".into(),
            sample_ratio,
        })
    }

    fn with_parent(value: &str) -> HeaderMap {
        let mut metadata = HeaderMap::new();
        metadata.insert(TRACEPARENT, value.parse().unwrap());
        metadata
    }

    #[test]
    fn continues_the_callers_trace() {
        let tracer = enabled(1.0);
        let cx = tracer.start("/svc/Method", &with_parent(SAMPLE));
        let span = cx.span();
        assert_eq!(trace_id(&cx).as_deref(), Some("0af7651916cd43dd8448eb211c80319c"));
        assert_ne!(span.span_context().span_id().to_string(), "b7ad6b7169203331");
        assert!(span.span_context().is_sampled());
    }

    #[test]
    fn malformed_parent_starts_a_new_trace() {
        let tracer = enabled(1.0);
        for value in [
            "invalid",
            "00-00000000000000000000000000000000-b7ad6b7169203331-01",
            "ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        ] {
            let cx = tracer.start("/svc/Method", &with_parent(value));
            let id = trace_id(&cx).expect("fresh trace");
            assert_eq!(id.len(), 32);
            assert_ne!(id, "0af7651916cd43dd8448eb211c80319c", "{value}");
        }
    }

    #[test]
    fn noop_tracer_still_creates_contexts() {
        let tracer = Tracer::noop();
        let cx = tracer.start("/svc/Method", &HeaderMap::new());
        assert!(trace_id(&cx).is_some());
        assert!(!cx.span().span_context().is_sampled());
        tracer.finish(&cx, Code::Ok, "");

        let cx = tracer.start("/svc/Method", &with_parent(SAMPLE));
        assert_eq!(trace_id(&cx).as_deref(), Some("0af7651916cd43dd8448eb211c80319c"));
        assert_eq!(tracer.exported(), 0);
    }

    #[test]
    fn zero_ratio_drops_new_traces() {
        let tracer = enabled(0.0);
        let cx = tracer.start("/svc/Method", &HeaderMap::new());
        assert!(!cx.span().span_context().is_sampled());
        tracer.finish(&cx, Code::Ok, "");
        assert_eq!(tracer.exported(), 0);
    }

    #[test]
    fn enabled_tracer_exports_until_closed() {
        let tracer = enabled(1.0);
        let cx = tracer.start("/svc/Method", &HeaderMap::new());
        assert!(cx.span().span_context().is_sampled());
        tracer.finish(&cx, Code::Internal, "boom");
        assert_eq!(tracer.exported(), 1);

        tracer.close();
        tracer.close();
        let cx = tracer.start("/svc/Method", &HeaderMap::new());
        tracer.finish(&cx, Code::Ok, "");
        assert_eq!(tracer.exported(), 1);
    }
}
