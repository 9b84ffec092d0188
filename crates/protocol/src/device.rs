//! Device model as exposed to the indicator, decoded from gateway JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_DIMMER;

/// Gateway-assigned device identifier.
pub type DeviceId = u32;

/// Errors from decoding a device resource.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid device payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Device capability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Light,
    Plug,
    Blind,
    /// Remotes, sensors, repeaters: nothing to control.
    Other,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Light => write!(f, "light"),
            DeviceKind::Plug => write!(f, "plug"),
            DeviceKind::Blind => write!(f, "blind"),
            DeviceKind::Other => write!(f, "other"),
        }
    }
}

/// Light state; brightness is a percentage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightState {
    pub on: bool,
    pub brightness: u8,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlugState {
    pub on: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindState {
    /// Percent closed.
    pub position: u8,
}

/// Capability-specific state, one variant per device kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceState {
    Light(LightState),
    Plug(PlugState),
    Blind(BlindState),
    None,
}

impl DeviceState {
    /// The kind implied by this state.
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceState::Light(_) => DeviceKind::Light,
            DeviceState::Plug(_) => DeviceKind::Plug,
            DeviceState::Blind(_) => DeviceKind::Blind,
            DeviceState::None => DeviceKind::Other,
        }
    }
}

/// A device known to the gateway with its last reported state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    pub reachable: bool,
    pub state: DeviceState,
}

impl Device {
    /// Builds a device, deriving `kind` from the state.
    pub fn new(id: DeviceId, name: impl Into<String>, state: DeviceState) -> Self {
        Self {
            id,
            name: name.into(),
            kind: state.kind(),
            reachable: true,
            state,
        }
    }

    /// Decodes a `/15001/<id>` resource.
    pub fn from_json(payload: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawDevice = serde_json::from_slice(payload)?;
        Ok(raw.into())
    }

    /// Power state for switchable devices.
    pub fn is_on(&self) -> Option<bool> {
        match &self.state {
            DeviceState::Light(light) => Some(light.on),
            DeviceState::Plug(plug) => Some(plug.on),
            DeviceState::Blind(_) | DeviceState::None => None,
        }
    }
}

/// Converts the gateway's `0..=254` dimmer into a percentage.
pub fn dimmer_to_brightness(dimmer: u16) -> u8 {
    let dimmer = u32::from(dimmer.min(MAX_DIMMER));
    let max = u32::from(MAX_DIMMER);
    ((dimmer * 100 + max / 2) / max) as u8
}

/// Converts a percentage into the gateway's `0..=254` dimmer.
pub fn brightness_to_dimmer(brightness: u8) -> u16 {
    let brightness = u32::from(brightness.min(100));
    ((brightness * u32::from(MAX_DIMMER) + 50) / 100) as u16
}

#[derive(Deserialize)]
struct RawDevice {
    #[serde(rename = "9003")]
    id: DeviceId,
    #[serde(rename = "9001", default)]
    name: String,
    #[serde(rename = "9019", default)]
    reachable: Option<u8>,
    #[serde(rename = "3311", default)]
    light_control: Vec<RawSwitch>,
    #[serde(rename = "3312", default)]
    socket_control: Vec<RawSwitch>,
    #[serde(rename = "15015", default)]
    blind_control: Vec<RawBlind>,
}

#[derive(Deserialize)]
struct RawSwitch {
    #[serde(rename = "5850", default)]
    on: Option<u8>,
    #[serde(rename = "5851", default)]
    dimmer: Option<u16>,
    #[serde(rename = "5706", default)]
    color: Option<String>,
}

#[derive(Deserialize)]
struct RawBlind {
    #[serde(rename = "5536", default)]
    position: Option<f32>,
}

impl From<RawDevice> for Device {
    fn from(raw: RawDevice) -> Self {
        // Multi-channel devices report one entry per channel; the indicator
        // follows the first, as the gateway app does.
        let state = if let Some(light) = raw.light_control.first() {
            DeviceState::Light(LightState {
                on: light.on.unwrap_or(0) != 0,
                brightness: light.dimmer.map(dimmer_to_brightness).unwrap_or(0),
                color: light.color.clone(),
            })
        } else if let Some(socket) = raw.socket_control.first() {
            DeviceState::Plug(PlugState {
                on: socket.on.unwrap_or(0) != 0,
            })
        } else if let Some(blind) = raw.blind_control.first() {
            DeviceState::Blind(BlindState {
                position: blind.position.unwrap_or(0.0).clamp(0.0, 100.0).round() as u8,
            })
        } else {
            DeviceState::None
        };

        Self {
            id: raw.id,
            name: raw.name,
            kind: state.kind(),
            reachable: raw.reachable.is_none_or(|r| r != 0),
            state,
        }
    }
}
