//! Panic containment, the innermost interceptor stage.
//!
//! A handler panic raised during the call, while its future is polled, or
//! while its response body is polled is caught here and turned into an
//! `Internal` status carrying the panic text. The panic is counted and logged
//! with its backtrace; it never reaches the transport.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use axum::http::{Request, Response};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hyper::body::{Body, Frame, SizeHint};
use metrics::Counter;
use tonic::Status;
use tower::{Layer, Service};

use crate::lifecycle::actor::panic_message;
use crate::observability::metrics::{MetricsError, Registry};
use crate::rpc::call::{status_headers, trailers_only};

/// Name of the recovered-panic counter.
pub const PANICS_RECOVERED: &str = "chronostore_grpc_req_panics_recovered_total";

thread_local! {
    static RECOVERY_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chain a panic hook that, inside a recovery scope, captures the backtrace
/// for the log record instead of printing the default panic message.
fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if RECOVERY_DEPTH.with(|depth| depth.get()) > 0 {
                LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            } else {
                previous(info);
            }
        }));
    });
}

struct ScopeGuard;

impl ScopeGuard {
    fn enter() -> Self {
        RECOVERY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        ScopeGuard
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        RECOVERY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Shared panic handling: the counter plus the conversion to a status.
#[derive(Clone)]
pub struct PanicRecovery {
    panics: Counter,
}

impl PanicRecovery {
    /// Register the panic counter with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, MetricsError> {
        install_hook();
        let panics = registry
            .register_counter(
                PANICS_RECOVERED,
                "Total number of gRPC requests recovered from internal panic.",
            )?
            .counter();
        Ok(Self { panics })
    }

    /// Run `f`, catching any panic it raises.
    pub fn guard<T>(&self, f: impl FnOnce() -> T) -> Result<T, Box<dyn Any + Send>> {
        let _scope = ScopeGuard::enter();
        panic::catch_unwind(AssertUnwindSafe(f))
    }

    /// Count, log and convert a caught panic.
    pub fn recover(&self, path: &str, payload: Box<dyn Any + Send>) -> Status {
        let message = panic_message(payload.as_ref());
        let backtrace = LAST_BACKTRACE
            .with(|slot| slot.borrow_mut().take())
            .map(|bt| bt.to_string())
            .unwrap_or_default();
        self.panics.increment(1);
        tracing::error!(
            method = %path,
            panic = %message,
            backtrace = %backtrace,
            "Recovered from panic in RPC handler"
        );
        Status::internal(message)
    }
}

impl std::fmt::Debug for PanicRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanicRecovery").finish_non_exhaustive()
    }
}

/// Future that converts a panic while polling into a status.
struct GuardedFuture<T> {
    inner: Option<BoxFuture<'static, T>>,
    recovery: PanicRecovery,
    path: String,
}

impl<T> Future for GuardedFuture<T> {
    type Output = Result<T, Status>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Err(Status::internal("polled after completion")));
        };
        match this.recovery.guard(|| inner.as_mut().poll(cx)) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => {
                this.inner = None;
                Poll::Ready(Ok(output))
            }
            Err(payload) => {
                // A panicked future must not be polled again.
                this.inner = None;
                Poll::Ready(Err(this.recovery.recover(&this.path, payload)))
            }
        }
    }
}

/// Response body whose panics end the call with an `Internal` trailer.
pub struct RecoveredBody<B> {
    inner: Option<Pin<Box<B>>>,
    guard: Option<(PanicRecovery, String)>,
}

impl<B> RecoveredBody<B> {
    fn new(inner: B, recovery: PanicRecovery, path: String) -> Self {
        Self {
            inner: Some(Box::pin(inner)),
            guard: Some((recovery, path)),
        }
    }
}

impl<B> Default for RecoveredBody<B> {
    fn default() -> Self {
        Self {
            inner: None,
            guard: None,
        }
    }
}

impl<B> Body for RecoveredBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let this = self.get_mut();
        let (Some(inner), Some((recovery, path))) = (this.inner.as_mut(), this.guard.as_ref()) else {
            return Poll::Ready(None);
        };
        match recovery.guard(|| inner.as_mut().poll_frame(cx)) {
            Ok(Poll::Ready(None)) => {
                this.inner = None;
                Poll::Ready(None)
            }
            Ok(polled) => polled,
            Err(payload) => {
                let status = recovery.recover(path, payload);
                this.inner = None;
                Poll::Ready(Some(Ok(Frame::trailers(status_headers(&status)))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.as_ref().map_or(true, |inner| inner.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        self.inner
            .as_ref()
            .map_or_else(|| SizeHint::with_exact(0), |inner| inner.size_hint())
    }
}

/// Layer applying [`RecoveryService`].
#[derive(Clone, Debug)]
pub struct RecoveryLayer {
    recovery: PanicRecovery,
}

impl RecoveryLayer {
    pub fn new(recovery: PanicRecovery) -> Self {
        Self { recovery }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService {
            inner,
            recovery: self.recovery.clone(),
        }
    }
}

/// Runs the handler with panics contained.
#[derive(Clone, Debug)]
pub struct RecoveryService<S> {
    inner: S,
    recovery: PanicRecovery,
}

impl<S, B, RB> Service<Request<B>> for RecoveryService<S>
where
    S: Service<Request<B>, Response = Response<RB>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    RB: Send + 'static,
{
    type Response = Response<RecoveredBody<RB>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let path = req.uri().path().to_string();
        let recovery = self.recovery.clone();
        let inner = &mut self.inner;

        let future = match recovery.guard(|| inner.call(req)) {
            Ok(future) => future,
            Err(payload) => {
                let status = recovery.recover(&path, payload);
                return std::future::ready(Ok(trailers_only(&status))).boxed();
            }
        };

        let guarded = GuardedFuture {
            inner: Some(future.boxed()),
            recovery: recovery.clone(),
            path: path.clone(),
        };
        async move {
            match guarded.await {
                Ok(Ok(response)) => Ok(response.map(|body| RecoveredBody::new(body, recovery, path))),
                Ok(Err(e)) => Err(e),
                Err(status) => Ok(trailers_only(&status)),
            }
        }
        .boxed()
    }
}
