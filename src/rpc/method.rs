//! Per-method services that run a handler through `tonic`'s server-side
//! framing.
//!
//! Messages are passed to handlers as raw bytes; decoding them into typed
//! messages is the handler's concern. Size limits are enforced by the codec
//! so that oversized messages fail with `ResourceExhausted`.

use std::convert::Infallible;
use std::task::{Context, Poll};

use axum::extract::Request;
use bytes::{Buf, BufMut, Bytes};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::server::Grpc;
use tonic::Status;
use tower::Service;

use crate::rpc::call::MessageStream;
use crate::rpc::server::ServerOptions;

/// Codec that hands message bytes through unchanged.
///
/// The default codec accepts messages of any size.
#[derive(Debug, Clone, Copy)]
pub struct PassthroughCodec {
    max_send: usize,
    max_recv: usize,
}

impl PassthroughCodec {
    /// A codec enforcing the server's message limits.
    pub fn limited(options: &ServerOptions) -> Self {
        Self {
            max_send: options.max_send_message_bytes,
            max_recv: options.max_recv_message_bytes,
        }
    }
}

impl Default for PassthroughCodec {
    fn default() -> Self {
        Self {
            max_send: usize::MAX,
            max_recv: usize::MAX,
        }
    }
}

impl Codec for PassthroughCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = PassthroughCodec;
    type Decoder = PassthroughCodec;

    fn encoder(&mut self) -> Self::Encoder {
        *self
    }

    fn decoder(&mut self) -> Self::Decoder {
        *self
    }
}

impl Encoder for PassthroughCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        if item.len() > self.max_send {
            return Err(Status::resource_exhausted(format!(
                "sent message larger than max ({} vs. {})",
                item.len(),
                self.max_send
            )));
        }
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for PassthroughCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        let len = src.remaining();
        if len > self.max_recv {
            return Err(Status::resource_exhausted(format!(
                "received message larger than max ({len} vs. {})",
                self.max_recv
            )));
        }
        Ok(Some(src.copy_to_bytes(len)))
    }
}

// tonic's own limits answer `OutOfRange`; the codec checks first.
fn grpc(options: &ServerOptions) -> Grpc<PassthroughCodec> {
    Grpc::new(PassthroughCodec::limited(options))
        .max_decoding_message_size(usize::MAX)
        .max_encoding_message_size(usize::MAX)
}

/// Routes one unary method to its handler.
#[derive(Clone)]
pub struct UnaryMethod<S> {
    handler: S,
    options: ServerOptions,
}

impl<S> UnaryMethod<S> {
    pub fn new(handler: S, options: ServerOptions) -> Self {
        Self { handler, options }
    }
}

impl<S> Service<Request> for UnaryMethod<S>
where
    S: Service<tonic::Request<Bytes>, Response = tonic::Response<Bytes>, Error = Status>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = axum::http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let handler = self.handler.clone();
        let mut grpc = grpc(&self.options);
        async move { Ok(grpc.unary(handler, req).await) }.boxed()
    }
}

/// Routes one server-streaming method to its handler.
#[derive(Clone)]
pub struct StreamingMethod<S> {
    handler: S,
    options: ServerOptions,
}

impl<S> StreamingMethod<S> {
    pub fn new(handler: S, options: ServerOptions) -> Self {
        Self { handler, options }
    }
}

impl<S> Service<Request> for StreamingMethod<S>
where
    S: Service<tonic::Request<Bytes>, Response = tonic::Response<MessageStream>, Error = Status>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = axum::http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let handler = self.handler.clone();
        let mut grpc = grpc(&self.options);
        async move { Ok(grpc.server_streaming(handler, req).await) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(send: usize, recv: usize) -> ServerOptions {
        ServerOptions {
            max_send_message_bytes: send,
            max_recv_message_bytes: recv,
        }
    }

    #[test]
    fn default_codec_is_unlimited() {
        let codec = PassthroughCodec::default();
        assert_eq!(codec.max_send, usize::MAX);
        assert_eq!(codec.max_recv, usize::MAX);
    }

    #[test]
    fn limited_codec_takes_server_limits() {
        let mut codec = PassthroughCodec::limited(&options(8, 4));
        let encoder = codec.encoder();
        let decoder = codec.decoder();
        assert_eq!((encoder.max_send, encoder.max_recv), (8, 4));
        assert_eq!((decoder.max_send, decoder.max_recv), (8, 4));
    }
}
