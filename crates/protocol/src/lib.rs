pub mod coap;
pub mod constants;
pub mod device;
pub mod messages;

// Re-export primary types for convenience.
pub use coap::{Code, CoapError, MessageKind, Packet};
pub use device::{
    BlindState, DecodeError, Device, DeviceId, DeviceKind, DeviceState, LightState, PlugState,
};
pub use messages::{Command, PairingRequest, PairingResponse, Unsupported, command_payload};
