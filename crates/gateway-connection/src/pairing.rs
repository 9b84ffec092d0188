//! Exchange of the gateway's security code for a durable credential.
//!
//! The code printed on the gateway is the PSK of a short-lived session under
//! the well-known pairing identity. Over that session the client registers a
//! fresh identity of its own and receives the key that goes with it.

use std::fmt;
use std::str::FromStr;

use tracing::{info, warn};
use tradfri_discovery::GatewayAddress;
use tradfri_protocol::constants::{GATEWAY, GATEWAY_AUTH, PAIRING_IDENTITY};
use tradfri_protocol::{Code, Packet, PairingRequest, PairingResponse};

use crate::credentials::Credential;
use crate::error::{ConnectError, PairingError, SessionError};
use crate::session::Session;
use crate::transport::Connector;
use crate::types::SessionConfig;

/// Length of the code printed on the gateway's label.
pub const SECURITY_CODE_LEN: usize = 16;

/// One-time code printed on the gateway. Never stored or logged.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SecurityCode(String);

impl SecurityCode {
    /// Validates user input: surrounding whitespace is ignored, the rest must
    /// be exactly [`SECURITY_CODE_LEN`] ASCII letters and digits.
    pub fn parse(input: &str) -> Result<Self, PairingError> {
        let code = input.trim();
        if code.is_empty() {
            return Err(PairingError::InvalidCode("security code is empty".into()));
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(PairingError::InvalidCode(
                "security code must be letters and digits".into(),
            ));
        }
        if code.len() != SECURITY_CODE_LEN {
            return Err(PairingError::InvalidCode(format!(
                "security code must be {SECURITY_CODE_LEN} characters, got {}",
                code.len()
            )));
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SecurityCode {
    type Err = PairingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for SecurityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecurityCode(<redacted>)")
    }
}

/// Pairs with the gateway. Nothing is persisted here; the caller saves the
/// returned credential.
pub async fn pair(
    connector: &dyn Connector,
    address: &GatewayAddress,
    code: &SecurityCode,
    config: &SessionConfig,
) -> Result<Credential, PairingError> {
    let session = Session::handshake(
        connector,
        address,
        PAIRING_IDENTITY,
        code.as_str().as_bytes(),
        config,
    )
    .await
    .map_err(|e| match e {
        ConnectError::AuthRejected => {
            PairingError::InvalidCode("gateway rejected the security code".into())
        }
        ConnectError::Unreachable(reason) => PairingError::Unreachable(reason),
        ConnectError::Timeout => PairingError::Timeout,
    })?;

    let identity = uuid::Uuid::new_v4().simple().to_string();
    let result = register(&session, &identity).await;
    session.close().await;

    let response = result.inspect_err(|e| warn!(gateway = %address, error = %e, "pairing failed"))?;
    info!(
        gateway = %address,
        firmware = response.firmware_version.as_deref().unwrap_or("unknown"),
        "paired with gateway"
    );
    Ok(Credential {
        gateway_id: address.id.clone(),
        identity,
        psk: response.psk.into_bytes(),
    })
}

/// Registers `identity` and returns the key the gateway issued for it.
async fn register(session: &Session, identity: &str) -> Result<PairingResponse, PairingError> {
    let request = Packet::request(Code::POST, &[GATEWAY, GATEWAY_AUTH])
        .with_json(&PairingRequest {
            identity: identity.to_string(),
        })
        .map_err(|e| PairingError::Protocol(e.to_string()))?;

    let reply = session.request(request).await.map_err(|e| match e {
        SessionError::Timeout => PairingError::Timeout,
        SessionError::Status(code) => PairingError::Rejected(code),
        SessionError::Closed | SessionError::Transport(_) => {
            PairingError::Unreachable(e.to_string())
        }
        other => PairingError::Protocol(other.to_string()),
    })?;
    if reply.code != Code::CREATED {
        return Err(PairingError::Protocol(format!(
            "expected 2.01 Created, got {}",
            reply.code
        )));
    }

    let response: PairingResponse = serde_json::from_slice(&reply.payload)
        .map_err(|e| PairingError::Protocol(e.to_string()))?;
    if response.psk.is_empty() {
        return Err(PairingError::Protocol("gateway issued an empty key".into()));
    }
    Ok(response)
}
