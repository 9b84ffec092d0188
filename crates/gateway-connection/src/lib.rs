//! Gateway connection core for the TRADFRI indicator.
//!
//! Discovers the gateway, pairs with it once, keeps a DTLS session open and
//! mirrors the gateway's devices into a local registry, reconnecting with
//! backoff whenever the session fails.

pub mod credentials;
pub mod dtls;
pub mod error;
pub mod handle;
pub mod observe;
pub mod pairing;
pub(crate) mod pumps;
pub mod registry;
pub mod session;
pub mod sync_loop;
pub mod transport;
pub mod types;

pub use credentials::{Credential, CredentialStore, default_credential_path};
pub use dtls::DtlsConnector;
pub use error::{CommandError, ConnectError, CredentialError, PairingError, SessionError};
pub use handle::GatewayHandle;
pub use observe::{Observation, ObserveStrategy, PollObserve, PushObserve};
pub use pairing::{SECURITY_CODE_LEN, SecurityCode, pair};
pub use registry::DeviceRegistry;
pub use session::{PendingReply, Session, Subscription};
pub use sync_loop::SyncLoop;
pub use transport::{Connector, DatagramChannel};
pub use types::{
    ConnectionState, ObserveConfig, ObserveMode, ReconnectConfig, SessionConfig, SyncConfig,
    SyncEvent,
};

#[cfg(test)]
pub(crate) mod testing;
