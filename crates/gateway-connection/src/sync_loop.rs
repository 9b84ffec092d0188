//! Connection state machine that keeps the device registry in sync.
//!
//! One task owns the session, the registry and the credential store. It
//! walks Discovering, Authenticating, Pairing (when needed), Syncing and
//! Connected, and falls back to Reconnecting with backoff on any failure.
//! No error escapes [`SyncLoop::run`]; everything is retried or surfaced to
//! the UI as a [`SyncEvent`].

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::{FuturesUnordered, select_all};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tradfri_discovery::{GatewayAddress, GatewayLocator};

use crate::credentials::CredentialStore;
use crate::error::{CommandError, ConnectError, SessionError};
use crate::handle::{GatewayHandle, Request};
use crate::observe::{ObserveStrategy, strategy_for};
use crate::pairing::{self, SecurityCode};
use crate::registry::DeviceRegistry;
use crate::session::Session;
use crate::transport::Connector;
use crate::types::{ConnectionState, SyncConfig, SyncEvent};

const REQUEST_CHANNEL_SIZE: usize = 16;
const EVENT_CHANNEL_SIZE: usize = 64;

enum Phase {
    /// Waiting for an explicit reconnect.
    Idle,
    Discover,
    Authenticate(GatewayAddress),
    Pair(GatewayAddress),
    Connected(Session),
    Backoff,
}

/// Reasons a wait point ends before its future completes.
enum Interrupt {
    Shutdown,
    Reconnect,
}

/// UI requests. Once every handle is gone the inbox goes quiet instead of
/// reporting end-of-stream on each poll.
struct Inbox {
    rx: mpsc::Receiver<Request>,
    open: bool,
}

impl Inbox {
    async fn recv(&mut self) -> Request {
        if self.open {
            if let Some(request) = self.rx.recv().await {
                return request;
            }
            self.open = false;
            debug!("all gateway handles dropped");
        }
        std::future::pending().await
    }
}

/// Background task that owns the gateway connection.
pub struct SyncLoop {
    locator: Arc<dyn GatewayLocator>,
    connector: Arc<dyn Connector>,
    store: CredentialStore,
    config: SyncConfig,
    observe: Arc<dyn ObserveStrategy>,
    registry: DeviceRegistry,
    inbox: Inbox,
    events: mpsc::Sender<SyncEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    failures: u32,
    tried_codes: HashSet<SecurityCode>,
}

impl SyncLoop {
    /// Creates the loop with its handle and event receiver. Nothing happens
    /// until [`run`](Self::run) is awaited.
    pub fn new(
        locator: Arc<dyn GatewayLocator>,
        connector: Arc<dyn Connector>,
        store: CredentialStore,
        config: SyncConfig,
    ) -> (Self, GatewayHandle, mpsc::Receiver<SyncEvent>) {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let handle = GatewayHandle::new(requests_tx, state_rx, cancel.clone());
        let sync_loop = Self {
            locator,
            connector,
            store,
            observe: strategy_for(&config.observe),
            config,
            registry: DeviceRegistry::new(),
            inbox: Inbox {
                rx: requests_rx,
                open: true,
            },
            events: events_tx,
            state: state_tx,
            cancel,
            failures: 0,
            tried_codes: HashSet::new(),
        };
        (sync_loop, handle, events_rx)
    }

    /// Replaces the observe strategy picked from the config.
    pub fn with_observe_strategy(mut self, strategy: Arc<dyn ObserveStrategy>) -> Self {
        self.observe = strategy;
        self
    }

    /// Runs until the handle shuts the loop down.
    pub async fn run(mut self) {
        info!("sync loop started");
        let mut phase = Phase::Discover;
        loop {
            let next = match phase {
                Phase::Idle => self.idle().await,
                Phase::Discover => self.discover().await,
                Phase::Authenticate(address) => self.authenticate(address).await,
                Phase::Pair(address) => self.pair(address).await,
                Phase::Connected(session) => self.connected(session).await,
                Phase::Backoff => self.backoff().await,
            };
            match next {
                Some(next) => phase = next,
                None => break,
            }
        }
        self.set_state(ConnectionState::Disconnected).await;
        info!("sync loop stopped");
    }

    async fn idle(&mut self) -> Option<Phase> {
        self.set_state(ConnectionState::Disconnected).await;
        match serve_while(&mut self.inbox, &self.cancel, std::future::pending::<()>()).await {
            Err(Interrupt::Reconnect) => {
                self.failures = 0;
                Some(Phase::Discover)
            }
            _ => None,
        }
    }

    async fn discover(&mut self) -> Option<Phase> {
        self.set_state(ConnectionState::Discovering).await;
        let locator = self.locator.clone();
        match serve_while(&mut self.inbox, &self.cancel, locator.find_gateway()).await {
            Err(Interrupt::Shutdown) => None,
            Err(Interrupt::Reconnect) => Some(Phase::Discover),
            Ok(Ok(address)) => {
                info!(gateway = %address, "gateway located");
                Some(Phase::Authenticate(address))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "gateway discovery failed");
                Some(Phase::Backoff)
            }
        }
    }

    async fn authenticate(&mut self, address: GatewayAddress) -> Option<Phase> {
        self.set_state(ConnectionState::Authenticating).await;
        let credential = match self.store.load() {
            Ok(Some(credential)) if credential.gateway_id == address.id => credential,
            Ok(Some(credential)) => {
                info!(
                    stored = %credential.gateway_id,
                    gateway = %address.id,
                    "stored credential belongs to another gateway"
                );
                return Some(Phase::Pair(address));
            }
            Ok(None) => {
                info!(gateway = %address.id, "no stored credential");
                return Some(Phase::Pair(address));
            }
            Err(e) => {
                error!(path = ?self.store.path(), error = %e, "failed to load credential");
                return Some(Phase::Backoff);
            }
        };

        let connector = self.connector.clone();
        let session_config = self.config.session.clone();
        let open = Session::open(connector.as_ref(), &address, &credential, &session_config);
        match serve_while(&mut self.inbox, &self.cancel, open).await {
            Err(Interrupt::Shutdown) => None,
            Err(Interrupt::Reconnect) => Some(Phase::Discover),
            Ok(Ok(session)) => Some(Phase::Connected(session)),
            Ok(Err(ConnectError::AuthRejected)) => {
                warn!(gateway = %address, "gateway rejected the stored credential");
                if let Err(e) = self.store.clear() {
                    error!(path = ?self.store.path(), error = %e, "failed to clear credential");
                    return Some(Phase::Backoff);
                }
                Some(Phase::Pair(address))
            }
            Ok(Err(e)) => {
                warn!(gateway = %address, error = %e, "failed to open session");
                Some(Phase::Backoff)
            }
        }
    }

    async fn pair(&mut self, address: GatewayAddress) -> Option<Phase> {
        self.set_state(ConnectionState::Pairing).await;
        self.emit(SyncEvent::PairingRequired {
            gateway_id: address.id.clone(),
        })
        .await;

        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                request = self.inbox.recv() => request,
            };
            let code = match request {
                Request::SecurityCode(code) => code,
                Request::Command { reply, .. } => {
                    let _ = reply.send(Err(SessionError::NotConnected.into()));
                    continue;
                }
                Request::CancelPairing => {
                    info!("pairing cancelled");
                    return Some(Phase::Idle);
                }
                Request::Reconnect => return Some(Phase::Discover),
            };

            if !self.tried_codes.insert(code.clone()) {
                self.emit(SyncEvent::PairingFailed {
                    reason: "this security code was already tried".into(),
                })
                .await;
                continue;
            }

            let result = {
                let connector = self.connector.clone();
                let session_config = self.config.session.clone();
                let attempt = pairing::pair(connector.as_ref(), &address, &code, &session_config);
                tokio::pin!(attempt);
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        result = &mut attempt => break result,
                        request = self.inbox.recv() => match request {
                            Request::Command { reply, .. } => {
                                let _ = reply.send(Err(SessionError::NotConnected.into()));
                            }
                            Request::CancelPairing => {
                                info!("pairing cancelled during handshake");
                                // The attempt never finished, so the code may be entered again.
                                self.tried_codes.remove(&code);
                                return Some(Phase::Idle);
                            }
                            Request::Reconnect => return Some(Phase::Discover),
                            Request::SecurityCode(_) => {
                                debug!("pairing attempt in progress, ignoring code");
                            }
                        },
                    }
                }
            };

            match result {
                Ok(credential) => {
                    if let Err(e) = self.store.save(&credential) {
                        error!(path = ?self.store.path(), error = %e, "failed to save credential");
                        self.emit(SyncEvent::PairingFailed {
                            reason: format!("could not save credential: {e}"),
                        })
                        .await;
                        return Some(Phase::Backoff);
                    }
                    self.tried_codes.clear();
                    return Some(Phase::Authenticate(address));
                }
                Err(e) => {
                    self.emit(SyncEvent::PairingFailed {
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    async fn connected(&mut self, session: Session) -> Option<Phase> {
        let session = Arc::new(session);
        self.set_state(ConnectionState::Syncing).await;

        let fetched = match serve_while(&mut self.inbox, &self.cancel, session.fetch_devices()).await
        {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                warn!(gateway = %session.gateway(), error = %e, "device sync failed");
                session.close().await;
                return Some(Phase::Backoff);
            }
            Err(interrupt) => {
                session.close().await;
                return match interrupt {
                    Interrupt::Shutdown => None,
                    Interrupt::Reconnect => Some(Phase::Discover),
                };
            }
        };
        if self.registry.reconcile(fetched) {
            self.notify_devices().await;
        }
        self.failures = 0;
        self.set_state(ConnectionState::Connected).await;
        info!(gateway = %session.gateway(), devices = self.registry.len(), "connected");

        let mut observations = select_all(
            self.registry
                .all()
                .iter()
                .map(|device| self.observe.observe(session.clone(), device.id)),
        );
        let mut commands = FuturesUnordered::new();

        let next = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break None,
                () = session.closed() => {
                    warn!(gateway = %session.gateway(), "session lost");
                    break Some(Phase::Backoff);
                }
                Some(update) = observations.next(), if !observations.is_empty() => match update {
                    Ok(device) => {
                        if self.registry.upsert(device) {
                            self.notify_devices().await;
                        }
                    }
                    Err(e) => {
                        warn!(gateway = %session.gateway(), error = %e, "observation failed");
                        break Some(Phase::Backoff);
                    }
                },
                Some(()) = commands.next(), if !commands.is_empty() => {}
                request = self.inbox.recv() => match request {
                    Request::Command { device_id, command, reply } => {
                        let Some(device) = self.registry.get(device_id) else {
                            let _ = reply.send(Err(CommandError::UnknownDevice(device_id)));
                            continue;
                        };
                        match session.send_command(device, command) {
                            Ok(pending) => commands.push(async move {
                                let result = pending.command_result().await;
                                if let Err(e) = &result {
                                    warn!(device = device_id, %command, error = %e, "command failed");
                                }
                                let _ = reply.send(result);
                            }),
                            Err(e) => {
                                debug!(device = device_id, %command, error = %e, "command refused");
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    Request::Reconnect => {
                        info!("reconnect requested");
                        break Some(Phase::Discover);
                    }
                    Request::SecurityCode(_) | Request::CancelPairing => {
                        debug!("no pairing pending, ignoring request");
                    }
                },
            }
        };

        drop(observations);
        drop(commands);
        session.close().await;
        next
    }

    async fn backoff(&mut self) -> Option<Phase> {
        self.failures = self.failures.saturating_add(1);
        let attempt = self.failures;
        let delay = self.config.reconnect.delay_for_attempt(attempt);
        self.set_state(ConnectionState::Reconnecting { attempt }).await;
        info!(
            attempt,
            delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
            "reconnecting"
        );

        match serve_while(&mut self.inbox, &self.cancel, tokio::time::sleep(delay)).await {
            Err(Interrupt::Shutdown) => None,
            Err(Interrupt::Reconnect) | Ok(()) => Some(Phase::Discover),
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() == state {
            return;
        }
        debug!(%state, "state changed");
        self.state.send_replace(state.clone());
        self.emit(SyncEvent::StateChanged(state)).await;
    }

    async fn notify_devices(&self) {
        self.emit(SyncEvent::DevicesChanged(self.registry.all())).await;
    }

    /// Delivers an event unless the receiver is gone or the loop is shutting
    /// down with a full event queue.
    async fn emit(&self, event: SyncEvent) {
        tokio::select! {
            biased;
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!("event receiver dropped");
                }
            }
            _ = self.cancel.cancelled() => {}
        }
    }
}

/// Drives `fut` while answering UI requests: commands are refused as not
/// connected, pairing requests are ignored.
async fn serve_while<F: Future>(
    inbox: &mut Inbox,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, Interrupt> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Interrupt::Shutdown),
            output = &mut fut => return Ok(output),
            request = inbox.recv() => match request {
                Request::Command { reply, .. } => {
                    let _ = reply.send(Err(SessionError::NotConnected.into()));
                }
                Request::Reconnect => return Err(Interrupt::Reconnect),
                Request::SecurityCode(_) | Request::CancelPairing => {
                    debug!("no pairing pending, ignoring request");
                }
            },
        }
    }
}
