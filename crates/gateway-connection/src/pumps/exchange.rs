//! Exchange pump: puts queued requests on the wire one at a time.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tradfri_protocol::{MessageKind, Packet};

use crate::error::SessionError;
use crate::pumps::{Exchange, InFlight, Routes};
use crate::transport::DatagramChannel;
use crate::types::SessionConfig;

/// Sends queued requests in FIFO order, each one only after the previous
/// exchange completed, and no faster than `min_request_interval`.
///
/// A timeout or transport failure ends the session: the pump cancels it and
/// fails every request still queued.
pub(crate) async fn exchange_pump(
    channel: Arc<dyn DatagramChannel>,
    mut queue: mpsc::Receiver<Exchange>,
    routes: Arc<Routes>,
    config: SessionConfig,
    cancel: CancellationToken,
) {
    let mut message_id: u16 = rand::random();
    let mut last_sent: Option<Instant> = None;

    loop {
        let exchange = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(exchange) => exchange,
                None => break,
            },
        };

        if let Some(at) = last_sent {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = exchange.reply.send(Err(SessionError::Closed));
                    break;
                }
                _ = sleep_until(at + config.min_request_interval) => {}
            }
        }

        message_id = message_id.wrapping_add(1);
        let mut request = exchange.request;
        request.message_id = message_id;
        last_sent = Some(Instant::now());

        let result = run_exchange(channel.as_ref(), &routes, &config, &cancel, request).await;
        let fatal = matches!(
            result,
            Err(SessionError::Timeout | SessionError::Transport(_) | SessionError::Closed)
        );
        if let Err(e) = &result {
            debug!(message_id, error = %e, "exchange failed");
        }
        let _ = exchange.reply.send(result);
        if fatal {
            cancel.cancel();
            break;
        }
    }

    queue.close();
    while let Ok(exchange) = queue.try_recv() {
        let _ = exchange.reply.send(Err(SessionError::Closed));
    }
}

/// Sends one confirmable request and waits for its response, retransmitting
/// every `ack_timeout` until the gateway acknowledges it.
async fn run_exchange(
    channel: &dyn DatagramChannel,
    routes: &Routes,
    config: &SessionConfig,
    cancel: &CancellationToken,
    request: Packet,
) -> Result<Packet, SessionError> {
    let (tx, mut rx) = oneshot::channel();
    if let Ok(mut in_flight) = routes.in_flight.lock() {
        *in_flight = Some(InFlight {
            token: request.token.clone(),
            message_id: request.message_id,
            acked: false,
            reply: Some(tx),
        });
    }

    let bytes = request.encode();
    let deadline = Instant::now() + config.request_timeout;
    trace!(message_id = request.message_id, code = %request.code, path = ?request.uri_path(), "sending request");

    let result = loop {
        if let Err(e) = channel.send(&bytes).await {
            warn!(error = %e, "gateway write failed");
            break Err(SessionError::Transport(e.to_string()));
        }

        let wait_until = if is_acked(routes) {
            deadline
        } else {
            (Instant::now() + config.ack_timeout).min(deadline)
        };
        // A reply that already arrived wins over a link that dropped after it.
        tokio::select! {
            biased;
            reply = &mut rx => break reply.map_err(|_| SessionError::Closed),
            _ = cancel.cancelled() => break Err(SessionError::Closed),
            _ = sleep_until(wait_until) => {}
        }

        if Instant::now() >= deadline {
            break Err(SessionError::Timeout);
        }
        if is_acked(routes) {
            // Separate response on its way; only wait for it.
            tokio::select! {
                biased;
                reply = &mut rx => break reply.map_err(|_| SessionError::Closed),
                _ = cancel.cancelled() => break Err(SessionError::Closed),
                _ = sleep_until(deadline) => break Err(SessionError::Timeout),
            }
        }
        debug!(message_id = request.message_id, "retransmitting request");
    };

    if let Ok(mut in_flight) = routes.in_flight.lock() {
        in_flight.take();
    }

    match result {
        Ok(reply) if reply.kind == MessageKind::Reset => {
            Err(SessionError::Transport("request reset by gateway".into()))
        }
        other => other,
    }
}

fn is_acked(routes: &Routes) -> bool {
    routes
        .in_flight
        .lock()
        .map(|in_flight| in_flight.as_ref().is_some_and(|f| f.acked))
        .unwrap_or(false)
}
