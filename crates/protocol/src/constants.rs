//! Gateway resource paths and attribute keys.
//!
//! The gateway speaks CoAP over DTLS and models every resource as a JSON
//! object keyed by numeric LWM2M-style attribute ids. These must match the
//! gateway firmware exactly.

/// UDP port of the gateway's CoAP-over-DTLS endpoint.
pub const COAP_DTLS_PORT: u16 = 5684;

/// Maximum size of a single datagram we expect from the gateway.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// PSK identity used for the pairing handshake (the security code is the key).
pub const PAIRING_IDENTITY: &str = "Client_identity";

// Resource paths.

/// Device collection (`/15001`, `/15001/<id>`).
pub const DEVICES: &str = "15001";
/// Gateway resource root.
pub const GATEWAY: &str = "15011";
/// Client registration below [`GATEWAY`] (`/15011/9063`).
pub const GATEWAY_AUTH: &str = "9063";

// Attribute keys of command payloads. Keys read from the gateway are the
// `#[serde(rename)]` names in `device` and `messages`.

pub const LIGHT_CONTROL: &str = "3311";
pub const SOCKET_CONTROL: &str = "3312";
pub const ON_OFF: &str = "5850";
pub const DIMMER: &str = "5851";

/// Upper bound of the gateway's dimmer scale (`0..=254`).
pub const MAX_DIMMER: u16 = 254;

/// Path segments of a single device resource.
pub fn device_path(id: u32) -> [String; 2] {
    [DEVICES.to_string(), id.to_string()]
}
