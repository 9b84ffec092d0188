//! Seams between the session and the secure datagram transport.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tradfri_discovery::GatewayAddress;

use crate::error::ConnectError;

/// An established, encrypted datagram association with the gateway.
///
/// Each `send` is one CoAP message and each `recv` yields one.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Best-effort teardown. Pending `recv` calls fail afterwards.
    async fn close(&self) -> io::Result<()>;
}

/// Performs the PSK handshake that yields a [`DatagramChannel`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &GatewayAddress,
        identity: &str,
        psk: &[u8],
    ) -> Result<Arc<dyn DatagramChannel>, ConnectError>;
}
