//! Request and response bodies exchanged with the gateway.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::constants::{DIMMER, LIGHT_CONTROL, ON_OFF, SOCKET_CONTROL};
use crate::device::{Device, DeviceState, brightness_to_dimmer};

/// Body of `POST /15011/9063`, registering a new client identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRequest {
    #[serde(rename = "9090")]
    pub identity: String,
}

/// Gateway reply to a pairing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingResponse {
    #[serde(rename = "9091")]
    pub psk: String,
    #[serde(rename = "9029", default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// User-issued device command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Flip the power state.
    Toggle,
    /// Set brightness as a percentage (`0..=100`).
    SetBrightness(u8),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Toggle => write!(f, "toggle"),
            Command::SetBrightness(pct) => write!(f, "set brightness {pct}%"),
        }
    }
}

/// The command does not apply to the device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Unsupported(pub String);

/// Builds the `PUT /15001/<id>` body carrying `command` for `device`.
pub fn command_payload(device: &Device, command: Command) -> Result<Value, Unsupported> {
    match (&device.state, command) {
        (DeviceState::Light(light), Command::Toggle) => {
            Ok(json!({ LIGHT_CONTROL: [{ ON_OFF: u8::from(!light.on) }] }))
        }
        (DeviceState::Light(_), Command::SetBrightness(pct)) => {
            if pct > 100 {
                return Err(Unsupported(format!("brightness {pct} is outside 0..=100")));
            }
            Ok(json!({ LIGHT_CONTROL: [{ DIMMER: brightness_to_dimmer(pct) }] }))
        }
        (DeviceState::Plug(plug), Command::Toggle) => {
            Ok(json!({ SOCKET_CONTROL: [{ ON_OFF: u8::from(!plug.on) }] }))
        }
        (DeviceState::Blind(_), _) => Err(Unsupported(format!(
            "{} is a blind; {command} is not supported",
            device.name
        ))),
        (_, command) => Err(Unsupported(format!(
            "{} ({}) does not support {command}",
            device.name, device.kind
        ))),
    }
}
