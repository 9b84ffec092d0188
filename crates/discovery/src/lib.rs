pub mod client;
pub mod types;

use async_trait::async_trait;

// Re-export primary types.
pub use client::Client;
pub use types::{DEFAULT_TIMEOUT, GATEWAY_PREFIX, GatewayAddress, SERVICE_NAME};

/// Errors for discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no gateway answered within {0:?}")]
    NotFound(std::time::Duration),

    #[error("mDNS error: {0}")]
    Mdns(String),
}

/// Resolves the address of the gateway to talk to.
///
/// Implementations never cache: each call returns the best current answer,
/// since the gateway may have moved to a new DHCP lease.
#[async_trait]
pub trait GatewayLocator: Send + Sync {
    async fn find_gateway(&self) -> Result<GatewayAddress, DiscoveryError>;
}

/// Locator for a gateway configured by address instead of discovered.
#[derive(Debug, Clone)]
pub struct StaticLocator {
    address: GatewayAddress,
}

impl StaticLocator {
    pub fn new(address: GatewayAddress) -> Self {
        Self { address }
    }
}

#[async_trait]
impl GatewayLocator for StaticLocator {
    async fn find_gateway(&self) -> Result<GatewayAddress, DiscoveryError> {
        Ok(self.address.clone())
    }
}
