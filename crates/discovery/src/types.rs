use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// mDNS service type advertised by the gateway.
pub const SERVICE_NAME: &str = "_coap._udp";

/// Instance-name prefix of gateways (`gw-<mac>`).
pub const GATEWAY_PREFIX: &str = "gw-";

/// Default bound on a single lookup.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the gateway can be reached right now.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GatewayAddress {
    /// Stable gateway identifier: the mDNS instance name, or the configured
    /// host for a static address.
    pub id: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl GatewayAddress {
    /// Address of a gateway known only by IP; the IP doubles as its id.
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            id: ip.to_string(),
            ip,
            port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for GatewayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.socket_addr())
    }
}
