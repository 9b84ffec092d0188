//! Background tasks of a session and the routing table they share.

pub(crate) mod exchange;
pub(crate) mod read;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tradfri_protocol::Packet;

use crate::error::SessionError;

pub(crate) type Token = Vec<u8>;

/// Reply slot of a queued request.
pub(crate) type ReplySender = oneshot::Sender<Result<Packet, SessionError>>;

/// A request waiting in the exchange queue.
pub(crate) struct Exchange {
    pub(crate) request: Packet,
    pub(crate) reply: ReplySender,
}

/// The one request currently on the wire.
pub(crate) struct InFlight {
    pub(crate) token: Token,
    pub(crate) message_id: u16,
    /// Set once an empty ACK arrived; retransmission stops.
    pub(crate) acked: bool,
    pub(crate) reply: Option<oneshot::Sender<Packet>>,
}

/// Delivery side of an observation.
#[derive(Clone)]
pub(crate) struct Observer {
    pub(crate) tx: mpsc::Sender<Packet>,
    /// Set when a notification was dropped on a full buffer.
    pub(crate) lagged: Arc<AtomicBool>,
}

/// Where incoming messages go, keyed by token.
#[derive(Default)]
pub(crate) struct Routes {
    pub(crate) in_flight: Mutex<Option<InFlight>>,
    pub(crate) observers: Mutex<HashMap<Token, Observer>>,
}

impl Routes {
    pub(crate) fn add_observer(&self, token: Token, observer: Observer) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.insert(token, observer);
        }
    }

    pub(crate) fn remove_observer(&self, token: &[u8]) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.remove(token);
        }
    }

    pub(crate) fn has_observer(&self, token: &[u8]) -> bool {
        self.observers
            .lock()
            .map(|observers| observers.contains_key(token))
            .unwrap_or(false)
    }

    /// Drops every route so waiting callers and observers see the end.
    pub(crate) fn clear(&self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.take();
        }
        if let Ok(mut observers) = self.observers.lock() {
            observers.clear();
        }
    }
}
