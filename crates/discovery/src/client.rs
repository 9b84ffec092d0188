use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tracing::{debug, info};
use tradfri_protocol::constants::COAP_DTLS_PORT;

use crate::types::{DEFAULT_TIMEOUT, GATEWAY_PREFIX, GatewayAddress, SERVICE_NAME};
use crate::{DiscoveryError, GatewayLocator};

/// Finds the gateway on the local network via mDNS/DNS-SD.
#[derive(Debug, Clone)]
pub struct Client {
    timeout: Duration,
}

impl Client {
    /// Creates a client whose lookups give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Performs one mDNS browse and returns the first gateway that resolves.
    ///
    /// A fresh daemon is created per call so the answer always reflects the
    /// network as it is now.
    pub async fn discover(&self) -> Result<GatewayAddress, DiscoveryError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::Mdns(format!("failed to create mDNS daemon: {e}")))?;

        let service_type = format!("{SERVICE_NAME}.local.");
        let receiver = match daemon.browse(&service_type) {
            Ok(rx) => rx,
            Err(e) => {
                let _ = daemon.shutdown();
                return Err(DiscoveryError::Mdns(format!("failed to browse mDNS: {e}")));
            }
        };

        let deadline = Instant::now() + self.timeout;
        let mut found = None;

        while found.is_none() && Instant::now() < deadline {
            let result = tokio::time::timeout(
                deadline.saturating_duration_since(Instant::now()),
                tokio::task::spawn_blocking({
                    let receiver = receiver.clone();
                    move || receiver.recv_timeout(Duration::from_millis(100))
                }),
            )
            .await;

            if let Ok(Ok(Ok(event))) = result {
                found = process_event(&event, &service_type);
            }
        }

        let _ = daemon.shutdown();

        match found {
            Some(address) => {
                info!(gateway = %address, "gateway discovered");
                Ok(address)
            }
            None => Err(DiscoveryError::NotFound(self.timeout)),
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl GatewayLocator for Client {
    async fn find_gateway(&self) -> Result<GatewayAddress, DiscoveryError> {
        self.discover().await
    }
}

/// Turns a resolved mDNS service into a gateway address, if it is one.
fn process_event(event: &ServiceEvent, service_type: &str) -> Option<GatewayAddress> {
    let ServiceEvent::ServiceResolved(info) = event else {
        return None;
    };

    let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    let address = gateway_from_parts(info.get_fullname(), service_type, &addresses);
    match &address {
        Some(gateway) => debug!(gateway = %gateway, advertised_port = info.get_port(), "gateway resolved"),
        None => debug!(service = info.get_fullname(), "ignoring non-gateway service"),
    }
    address
}

/// Applies the gateway filter to the parts of a resolved service.
///
/// The advertised port is plain CoAP; the secure endpoint is always the
/// DTLS port.
fn gateway_from_parts(
    fullname: &str,
    service_type: &str,
    addresses: &[IpAddr],
) -> Option<GatewayAddress> {
    let instance = fullname
        .strip_suffix(service_type)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname);
    if !instance.starts_with(GATEWAY_PREFIX) {
        return None;
    }

    // Loopback and link-local addresses are never the gateway's LAN address.
    let ip = addresses.iter().find_map(|ip| match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() => Some(IpAddr::V4(*v4)),
        _ => None,
    })?;

    Some(GatewayAddress {
        id: instance.to_string(),
        ip,
        port: COAP_DTLS_PORT,
    })
}
