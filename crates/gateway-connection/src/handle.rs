//! UI-side handle to a running sync loop.

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tradfri_protocol::{Command, DeviceId};

use crate::error::{CommandError, SessionError};
use crate::pairing::SecurityCode;
use crate::types::ConnectionState;

/// Requests from the UI to the sync loop.
pub(crate) enum Request {
    Command {
        device_id: DeviceId,
        command: Command,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    SecurityCode(SecurityCode),
    CancelPairing,
    Reconnect,
}

/// Cloneable handle used by the UI to drive the sync loop.
#[derive(Clone)]
pub struct GatewayHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl GatewayHandle {
    pub(crate) fn new(
        requests: mpsc::Sender<Request>,
        state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            requests,
            state,
            cancel,
        }
    }

    /// Flips a light or plug on or off.
    pub async fn toggle(&self, device_id: DeviceId) -> Result<(), CommandError> {
        self.command(device_id, Command::Toggle).await
    }

    /// Sets a light's brightness, in percent.
    pub async fn set_brightness(&self, device_id: DeviceId, value: u8) -> Result<(), CommandError> {
        self.command(device_id, Command::SetBrightness(value)).await
    }

    /// Commands are refused right away while offline; they are never queued
    /// for a later session.
    async fn command(&self, device_id: DeviceId, command: Command) -> Result<(), CommandError> {
        if !self.state.borrow().is_connected() {
            return Err(SessionError::NotConnected.into());
        }
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Command {
                device_id,
                command,
                reply,
            })
            .await
            .map_err(|_| CommandError::Transport(SessionError::Closed))?;
        rx.await
            .map_err(|_| CommandError::Transport(SessionError::Closed))?
    }

    /// Hands the security code to a pending pairing.
    pub async fn submit_security_code(&self, code: SecurityCode) {
        let _ = self.requests.send(Request::SecurityCode(code)).await;
    }

    /// Abandons a pending pairing; the loop goes idle until [`reconnect`](Self::reconnect).
    pub async fn cancel_pairing(&self) {
        let _ = self.requests.send(Request::CancelPairing).await;
    }

    /// Restarts from discovery right away, skipping any backoff.
    pub async fn reconnect(&self) {
        let _ = self.requests.send(Request::Reconnect).await;
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stops the loop; the open session is closed before it returns.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
