//! Read pump: routes incoming messages to the waiting request or observer.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tradfri_protocol::constants::MAX_DATAGRAM_SIZE;
use tradfri_protocol::{MessageKind, Packet};

use crate::pumps::Routes;
use crate::transport::DatagramChannel;

/// Reads datagrams until the channel fails or the session is cancelled.
///
/// On exit the session is cancelled and every route dropped, which ends all
/// observations and fails the request in flight.
pub(crate) async fn read_pump(
    channel: Arc<dyn DatagramChannel>,
    routes: Arc<Routes>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = channel.recv(&mut buf) => received,
        };
        let len = match received {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "gateway read failed");
                break;
            }
        };

        let packet = match Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, len, "dropping malformed datagram");
                continue;
            }
        };

        if let Some(reply) = route(packet, &routes)
            && let Err(e) = channel.send(&reply.encode()).await
        {
            warn!(error = %e, "gateway write failed");
            break;
        }
    }

    cancel.cancel();
    routes.clear();
}

/// Delivers one message and returns the ACK or RST it calls for, if any.
pub(crate) fn route(packet: Packet, routes: &Routes) -> Option<Packet> {
    let message_id = packet.message_id;
    let confirmable = packet.kind == MessageKind::Confirmable;

    if packet.is_empty() {
        match packet.kind {
            MessageKind::Acknowledgement | MessageKind::Reset => {
                if let Ok(mut guard) = routes.in_flight.lock()
                    && let Some(in_flight) = guard.as_mut()
                    && in_flight.message_id == message_id
                {
                    if packet.kind == MessageKind::Reset {
                        if let Some(reply) = in_flight.reply.take() {
                            let _ = reply.send(packet);
                        }
                    } else {
                        trace!(message_id, "request acknowledged");
                        in_flight.acked = true;
                    }
                }
                return None;
            }
            // Empty confirmable is a CoAP ping.
            _ => return confirmable.then(|| Packet::reset(message_id)),
        }
    }

    if let Ok(mut guard) = routes.in_flight.lock()
        && let Some(in_flight) = guard.as_mut()
        && in_flight.token == packet.token
    {
        if let Some(reply) = in_flight.reply.take() {
            let _ = reply.send(packet);
        }
        return confirmable.then(|| Packet::empty_ack(message_id));
    }

    let observer = routes
        .observers
        .lock()
        .ok()
        .and_then(|observers| observers.get(&packet.token).cloned());
    if let Some(observer) = observer {
        let token = packet.token.clone();
        match observer.tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(token = ?token, "observer lagging, dropping notification");
                observer.lagged.store(true, Ordering::SeqCst);
            }
            Err(TrySendError::Closed(_)) => {
                routes.remove_observer(&token);
                return Some(Packet::reset(message_id));
            }
        }
        return confirmable.then(|| Packet::empty_ack(message_id));
    }

    // Nobody is interested; a reset also cancels a stale observation.
    trace!(message_id, token = ?packet.token, "rejecting message with unknown token");
    Some(Packet::reset(message_id))
}
