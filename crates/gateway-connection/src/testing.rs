//! In-memory transport for unit tests.

use std::io;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tradfri_protocol::Packet;

use crate::transport::DatagramChannel;

/// One end of an in-memory datagram link.
pub(crate) struct MemoryChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: CancellationToken,
}

impl MemoryChannel {
    pub(crate) fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
                closed: closed.clone(),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
                closed,
            },
        )
    }

    pub(crate) async fn recv_packet(&self) -> Packet {
        let datagram = self.rx.lock().await.recv().await.expect("link open");
        Packet::decode(&datagram).expect("valid packet")
    }

    pub(crate) fn try_recv_packet(&self) -> Option<Packet> {
        let datagram = self.rx.try_lock().ok()?.try_recv().ok()?;
        Packet::decode(&datagram).ok()
    }

    pub(crate) async fn send_packet(&self, packet: &Packet) {
        let _ = self.tx.send(packet.encode());
    }

    /// Breaks the link for both ends.
    pub(crate) fn disconnect(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl DatagramChannel for MemoryChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        // Datagrams sent before the link broke are still delivered.
        let datagram = tokio::select! {
            biased;
            datagram = rx.recv() => datagram,
            _ = self.closed.cancelled() => None,
        };
        let datagram = datagram.ok_or(io::Error::from(io::ErrorKind::ConnectionReset))?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(len)
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        Ok(())
    }
}
