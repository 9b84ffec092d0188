//! Public types for the gateway connection core.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tradfri_protocol::Device;

/// Connection state of the sync loop, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No address, no session. Idle until asked to reconnect.
    Disconnected,
    /// Looking for the gateway on the network.
    Discovering,
    /// Loading the credential and opening a session.
    Authenticating,
    /// Waiting for the user's security code.
    Pairing,
    /// Session open, initial device fetch in progress.
    Syncing,
    /// Session open and devices mirrored.
    Connected,
    /// Session lost, waiting out the backoff before rediscovering.
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    /// True when commands can be forwarded to the gateway.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Discovering => write!(f, "discovering"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Pairing => write!(f, "pairing"),
            ConnectionState::Syncing => write!(f, "syncing"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

/// Events emitted by the sync loop for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The device snapshot changed; carries the full list ordered by id.
    DevicesChanged(Vec<Device>),
    /// No usable credential. The UI should ask for the gateway's security code.
    PairingRequired { gateway_id: String },
    /// A pairing attempt failed. A new code is needed.
    PairingFailed { reason: String },
    /// Connection state changed.
    StateChanged(ConnectionState),
}

/// Configuration for reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = rand::random::<f64>() * 2.0 - 1.0; // [-1.0, 1.0)
        Duration::from_secs_f64((capped + jitter * offset).max(0.001))
    }
}

/// Timing of a single gateway session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on the DTLS handshake.
    pub open_timeout: Duration,
    /// Bound on one request/response exchange, retransmissions included.
    pub request_timeout: Duration,
    /// Retransmission interval for unacknowledged requests.
    pub ack_timeout: Duration,
    /// Minimum spacing between two requests (the gateway throttles clients).
    pub min_request_interval: Duration,
    /// Requests that may wait behind the one in flight.
    pub queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(2),
            min_request_interval: Duration::from_millis(500),
            queue_depth: 32,
        }
    }
}

/// How device state changes reach the indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserveMode {
    /// CoAP observe registrations; the gateway pushes every change.
    #[default]
    Push,
    /// Periodic GET of each device.
    Poll,
}

impl fmt::Display for ObserveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObserveMode::Push => write!(f, "push"),
            ObserveMode::Poll => write!(f, "poll"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObserveConfig {
    pub mode: ObserveMode,
    /// Push: lifetime of one observe registration before it is renewed.
    pub renew_after: Duration,
    /// Push: pause between dropping a registration and renewing it.
    pub restart_delay: Duration,
    /// Poll: interval between two reads of a device.
    pub poll_interval: Duration,
    /// Poll: an unchanged value is re-emitted after this long.
    pub heartbeat: Duration,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            mode: ObserveMode::Push,
            renew_after: Duration::from_secs(300),
            restart_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            heartbeat: Duration::from_secs(60),
        }
    }
}

/// Everything the sync loop needs to know about timing.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub reconnect: ReconnectConfig,
    pub session: SessionConfig,
    pub observe: ObserveConfig,
}
