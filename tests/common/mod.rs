//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::uri::PathAndQuery;
use bytes::Bytes;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;

use chronostore::lifecycle::{ActorError, Group};
use chronostore::observability::tracing::Tracer;
use chronostore::rpc::{PassthroughCodec, RpcServer, ServerOptions, Status};
use chronostore::Registry;

/// Loopback address with an OS-assigned port.
#[allow(dead_code)]
pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// A server on a fresh registry with a no-op tracer.
#[allow(dead_code)]
pub fn rpc_server() -> (RpcServer, Registry) {
    rpc_server_with(ServerOptions::default())
}

/// Like [`rpc_server`], with explicit transport options.
#[allow(dead_code)]
pub fn rpc_server_with(options: ServerOptions) -> (RpcServer, Registry) {
    let registry = Registry::bare().unwrap();
    let server = RpcServer::bootstrap(&registry, Tracer::noop(), options).unwrap();
    (server, registry)
}

/// Open a client channel to `addr`.
#[allow(dead_code)]
pub async fn channel(addr: SocketAddr) -> Channel {
    Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

/// Reply to one gRPC call: received messages plus the final status.
#[allow(dead_code)]
#[derive(Debug)]
pub struct GrpcReply {
    pub messages: Vec<Bytes>,
    pub status: Status,
}

/// Call `path` on `addr` with one message.
#[allow(dead_code)]
pub async fn grpc_call(addr: SocketAddr, path: &str, message: &[u8]) -> GrpcReply {
    grpc_call_with(addr, path, message, MetadataMap::new()).await
}

/// Like [`grpc_call`], with request metadata.
///
/// Every call is made as a server stream, which also reads unary replies.
#[allow(dead_code)]
pub async fn grpc_call_with(
    addr: SocketAddr,
    path: &str,
    message: &[u8],
    metadata: MetadataMap,
) -> GrpcReply {
    let mut client = tonic::client::Grpc::new(channel(addr).await);
    client.ready().await.unwrap();

    let mut request = tonic::Request::new(Bytes::copy_from_slice(message));
    *request.metadata_mut() = metadata;
    let path = PathAndQuery::try_from(path).unwrap();

    let mut stream = match client.server_streaming(request, path, PassthroughCodec::default()).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            return GrpcReply {
                messages: Vec::new(),
                status,
            }
        }
    };

    let mut messages = Vec::new();
    let status = loop {
        match stream.message().await {
            Ok(Some(message)) => messages.push(message),
            Ok(None) => break Status::ok(""),
            Err(status) => break status,
        }
    };
    GrpcReply { messages, status }
}

/// Add an actor that blocks until interrupted and then reports canceled.
#[allow(dead_code)]
pub fn add_blocking_actor(group: &mut Group, name: &str) {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    group.add(
        name,
        async move {
            let _ = rx.await;
            Err(ActorError::Canceled)
        },
        move |_| drop(tx),
    );
}

/// Run `fut` with a generous deadline so a hang fails the test instead of
/// stalling the suite.
#[allow(dead_code)]
pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}
