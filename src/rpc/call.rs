//! Method identity and the response-body plumbing shared by the
//! interceptor stages.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::{header, HeaderValue, Response};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use hyper::body::{Body, Frame, SizeHint};
use tonic::{Code, Status};

/// Reply stream returned by a server-streaming handler.
pub type MessageStream = BoxStream<'static, Result<Bytes, Status>>;

/// Shape of a method's call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Unary,
    ServerStreaming,
}

impl MethodKind {
    /// Value of the `grpc_type` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodKind::Unary => "unary",
            MethodKind::ServerStreaming => "server_stream",
        }
    }
}

/// Identity of the method being called.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodInfo {
    pub service: String,
    pub method: String,
    pub kind: MethodKind,
}

impl MethodInfo {
    pub fn new(service: impl Into<String>, method: impl Into<String>, kind: MethodKind) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind,
        }
    }

    /// Request path, `/package.Service/Method`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

impl fmt::Display for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.service, self.method)
    }
}

/// Registered methods keyed by request path.
///
/// The interceptor stages look calls up here; paths that are not in the
/// table pass through untracked.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: Arc<HashMap<String, MethodInfo>>,
}

impl MethodTable {
    pub fn new(methods: impl IntoIterator<Item = MethodInfo>) -> Self {
        let methods = methods.into_iter().map(|info| (info.path(), info)).collect();
        Self {
            methods: Arc::new(methods),
        }
    }

    pub fn get(&self, path: &str) -> Option<&MethodInfo> {
        self.methods.get(path)
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.methods.keys().cloned().collect();
        paths.sort();
        paths
    }
}

/// Value of the `grpc_code` metric label.
pub fn code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// `grpc-status` and `grpc-message` headers for `status`.
pub(crate) fn status_headers(status: &Status) -> axum::http::HeaderMap {
    let to_header_map = |status: &Status| -> Result<axum::http::HeaderMap, Status> {
        let mut header_map = axum::http::HeaderMap::new();
        status.add_header(&mut header_map)?;
        Ok(header_map)
    };
    to_header_map(status).unwrap_or_else(|_| {
        to_header_map(&Status::internal("unencodable status")).unwrap_or_default()
    })
}

/// A trailers-only response: headers carry the status, the body is empty.
pub fn trailers_only<B: Default>(status: &Status) -> Response<B> {
    let mut response = Response::new(B::default());
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.extend(status_headers(status));
    response
}

/// Callback invoked once with a call's final status.
pub type Completion = Box<dyn FnOnce(&Status) + Send>;

/// Response body that reports the call's final status once it is known.
///
/// The status is read from the response headers of a trailers-only reply,
/// otherwise from the trailers frame. A body that fails or ends without a
/// status reports `Unknown`; one dropped before completion (the client went
/// away) reports `Cancelled`.
pub struct CompletionBody<B> {
    inner: Pin<Box<B>>,
    on_complete: Option<Completion>,
}

impl<B> CompletionBody<B> {
    /// A body that reports nothing, for calls outside the method table.
    pub fn untracked(inner: B) -> Self {
        Self {
            inner: Box::pin(inner),
            on_complete: None,
        }
    }

    /// Wrap `response` so `on_complete` runs when its status is known.
    pub fn wrap(response: Response<B>, on_complete: Completion) -> Response<Self> {
        match Status::from_header_map(response.headers()) {
            Some(status) => {
                on_complete(&status);
                response.map(Self::untracked)
            }
            None => response.map(|inner| Self {
                inner: Box::pin(inner),
                on_complete: Some(on_complete),
            }),
        }
    }

    fn complete(&mut self, status: &Status) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(status);
        }
    }
}

impl<B> Body for CompletionBody<B>
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
        let polled = this.inner.as_mut().poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(trailers) = frame.trailers_ref() {
                    let status = Status::from_header_map(trailers)
                        .unwrap_or_else(|| Status::unknown("trailers without grpc-status"));
                    this.complete(&status);
                }
            }
            Poll::Ready(Some(Err(_))) => this.complete(&Status::unknown("response body failed")),
            Poll::Ready(None) => this.complete(&Status::unknown("response ended without grpc-status")),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for CompletionBody<B> {
    fn drop(&mut self) {
        self.complete(&Status::cancelled("call ended before its status was sent"));
    }
}
