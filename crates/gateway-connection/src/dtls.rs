//! DTLS-PSK transport to the gateway.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;
use tradfri_discovery::GatewayAddress;
use webrtc_dtls::cipher_suite::CipherSuiteId;
use webrtc_dtls::config::Config;
use webrtc_dtls::conn::DTLSConn;
use webrtc_util::conn::Conn;

use crate::error::ConnectError;
use crate::transport::{Connector, DatagramChannel};

/// Connects to the gateway with `TLS_PSK_WITH_AES_128_CCM_8`, the only
/// suite the gateway firmware offers.
#[derive(Debug, Clone, Default)]
pub struct DtlsConnector;

impl DtlsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for DtlsConnector {
    async fn connect(
        &self,
        address: &GatewayAddress,
        identity: &str,
        psk: &[u8],
    ) -> Result<Arc<dyn DatagramChannel>, ConnectError> {
        let target = address.socket_addr();
        let local = match target.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        socket
            .connect(target)
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        let key = psk.to_vec();
        let config = Config {
            psk: Some(Arc::new(move |_hint: &[u8]| {
                Ok::<Vec<u8>, webrtc_dtls::Error>(key.clone())
            })),
            psk_identity_hint: Some(identity.as_bytes().to_vec()),
            cipher_suites: vec![CipherSuiteId::Tls_Psk_With_Aes_128_Ccm_8],
            ..Default::default()
        };

        debug!(gateway = %address, identity, "starting DTLS handshake");
        let conn = DTLSConn::new(Arc::new(socket), config, true, None)
            .await
            .map_err(|e| classify_handshake_error(&e.to_string()))?;

        Ok(Arc::new(DtlsChannel { conn }))
    }
}

/// Maps a failed handshake to a connect error.
///
/// The gateway answers a wrong identity or key with a fatal alert; anything
/// else means the datagrams never made it.
fn classify_handshake_error(message: &str) -> ConnectError {
    if message.to_ascii_lowercase().contains("alert") {
        ConnectError::AuthRejected
    } else {
        ConnectError::Unreachable(message.to_string())
    }
}

struct DtlsChannel {
    conn: DTLSConn,
}

#[async_trait]
impl DatagramChannel for DtlsChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.conn
            .send(datagram)
            .await
            .map(|_| ())
            .map_err(io::Error::other)
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.recv(buf).await.map_err(io::Error::other)
    }

    async fn close(&self) -> io::Result<()> {
        self.conn.close().await.map_err(io::Error::other)
    }
}
