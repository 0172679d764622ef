//! TCP listener binding.
//!
//! # Responsibilities
//! - Parse and bind configured listen addresses before the process starts
//!   running, so a busy port is a startup error rather than a runtime one
//! - Report the address actually bound (port 0 resolves to a real port)

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpListener;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The configured address is not a valid socket address.
    #[error("invalid listen address {address:?}: {source}")]
    Address {
        address: String,
        source: std::net::AddrParseError,
    },

    /// Failed to bind to address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
}

/// Parse a `host:port` listen address.
pub fn parse_address(address: &str) -> Result<SocketAddr, ListenerError> {
    address.parse().map_err(|source| ListenerError::Address {
        address: address.to_string(),
        source,
    })
}

/// Bind a TCP listener on `address`.
pub async fn bind(address: SocketAddr, purpose: &str) -> Result<TcpListener, ListenerError> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| ListenerError::Bind { address, source })?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ListenerError::Bind { address, source })?;

    tracing::info!(address = %local_addr, purpose, "Listener bound");
    Ok(listener)
}
