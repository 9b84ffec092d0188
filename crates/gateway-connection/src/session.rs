//! Secure session with the gateway.
//!
//! A session owns the DTLS channel and two tasks: the exchange pump, which
//! puts queued requests on the wire strictly one after another, and the read
//! pump, which routes responses and observe notifications back by token.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tradfri_discovery::GatewayAddress;
use tradfri_protocol::coap::OBSERVE_REGISTER;
use tradfri_protocol::constants::{DEVICES, device_path};
use tradfri_protocol::{Code, Command, Device, DeviceId, Packet, command_payload};

use crate::credentials::Credential;
use crate::error::{CommandError, ConnectError, SessionError};
use crate::pumps::{Exchange, Observer, Routes, Token};
use crate::transport::{Connector, DatagramChannel};
use crate::types::SessionConfig;

/// Notifications buffered per observed device.
const OBSERVER_BUFFER: usize = 16;

/// An open, authenticated session. At most one exists at a time.
pub struct Session {
    gateway: GatewayAddress,
    channel: Arc<dyn DatagramChannel>,
    queue_tx: mpsc::Sender<Exchange>,
    routes: Arc<Routes>,
    cancel: CancellationToken,
    closed: AtomicBool,
    _read_handle: JoinHandle<()>,
    _exchange_handle: JoinHandle<()>,
}

impl Session {
    /// Opens a session authenticated with a paired credential.
    pub async fn open(
        connector: &dyn Connector,
        address: &GatewayAddress,
        credential: &Credential,
        config: &SessionConfig,
    ) -> Result<Self, ConnectError> {
        Self::handshake(connector, address, &credential.identity, &credential.psk, config).await
    }

    /// Opens a session with an explicit identity and key.
    pub(crate) async fn handshake(
        connector: &dyn Connector,
        address: &GatewayAddress,
        identity: &str,
        psk: &[u8],
        config: &SessionConfig,
    ) -> Result<Self, ConnectError> {
        let channel = match tokio::time::timeout(
            config.open_timeout,
            connector.connect(address, identity, psk),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ConnectError::Timeout),
        };
        info!(gateway = %address, "session open");
        Ok(Self::establish(address.clone(), channel, config.clone()))
    }

    /// Starts the pumps on an established channel.
    pub(crate) fn establish(
        gateway: GatewayAddress,
        channel: Arc<dyn DatagramChannel>,
        config: SessionConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth.max(1));
        let routes = Arc::new(Routes::default());
        let cancel = CancellationToken::new();

        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            channel.clone(),
            routes.clone(),
            cancel.clone(),
        ));
        let exchange_handle = tokio::spawn(crate::pumps::exchange::exchange_pump(
            channel.clone(),
            queue_rx,
            routes.clone(),
            config,
            cancel.clone(),
        ));

        Self {
            gateway,
            channel,
            queue_tx,
            routes,
            cancel,
            closed: AtomicBool::new(false),
            _read_handle: read_handle,
            _exchange_handle: exchange_handle,
        }
    }

    pub fn gateway(&self) -> &GatewayAddress {
        &self.gateway
    }

    /// Queues a request without waiting for its turn.
    ///
    /// Requests complete in the order they were queued.
    pub fn enqueue(&self, request: Packet) -> Result<PendingReply, SessionError> {
        let (exchange, pending) = self.prepare(request)?;
        self.queue_tx.try_send(exchange).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })?;
        Ok(pending)
    }

    /// Sends a request and waits for a successful response. Unlike
    /// [`enqueue`](Self::enqueue) this waits for room in a full queue.
    pub async fn request(&self, request: Packet) -> Result<Packet, SessionError> {
        let (exchange, pending) = self.prepare(request)?;
        self.queue_tx
            .send(exchange)
            .await
            .map_err(|_| SessionError::Closed)?;
        pending.response().await
    }

    fn prepare(&self, mut request: Packet) -> Result<(Exchange, PendingReply), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        if request.token.is_empty() {
            request.token = self.new_token();
        }
        let (reply, rx) = oneshot::channel();
        Ok((Exchange { request, reply }, PendingReply { rx }))
    }

    /// Lists every device with its current state, ordered by id.
    pub async fn fetch_devices(&self) -> Result<Vec<Device>, SessionError> {
        let reply = self.request(Packet::request(Code::GET, &[DEVICES])).await?;
        let ids: Vec<DeviceId> = serde_json::from_slice(&reply.payload)
            .map_err(|e| SessionError::Decode(e.to_string()))?;

        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            devices.push(self.fetch_device(id).await?);
        }
        devices.sort_by_key(|d| d.id);
        debug!(gateway = %self.gateway, count = devices.len(), "fetched devices");
        Ok(devices)
    }

    pub async fn fetch_device(&self, id: DeviceId) -> Result<Device, SessionError> {
        let reply = self.request(Packet::request(Code::GET, &device_path(id))).await?;
        decode_device(&reply.payload)
    }

    /// Registers an observation of one device.
    ///
    /// Returns the device's current state and the subscription that yields
    /// every later notification.
    pub async fn subscribe(&self, id: DeviceId) -> Result<(Device, Subscription), SessionError> {
        let mut request = Packet::request(Code::GET, &device_path(id));
        request.set_observe(OBSERVE_REGISTER);
        request.token = self.new_token();

        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        let lagged = Arc::new(AtomicBool::new(false));
        self.routes.add_observer(
            request.token.clone(),
            Observer {
                tx,
                lagged: lagged.clone(),
            },
        );
        let mut subscription = Subscription {
            device_id: id,
            token: request.token.clone(),
            rx,
            routes: self.routes.clone(),
            last: None,
            lagged,
        };

        let reply = self.request(request).await?;
        let device = decode_device(&reply.payload)?;
        match reply.observe() {
            Some(seq) => subscription.last = Some((seq, Instant::now())),
            None => warn!(device = id, "gateway did not register the observation"),
        }
        Ok((device, subscription))
    }

    /// Queues a device command. Capability mismatches are refused locally
    /// without touching the network.
    pub fn send_command(
        &self,
        device: &Device,
        command: Command,
    ) -> Result<PendingReply, CommandError> {
        let payload =
            command_payload(device, command).map_err(|e| CommandError::Rejected(e.0))?;
        let request = Packet::request(Code::PUT, &device_path(device.id))
            .with_json(&payload)
            .map_err(|e| CommandError::Rejected(e.to_string()))?;
        debug!(device = device.id, %command, "queueing command");
        Ok(self.enqueue(request)?)
    }

    /// Closes the session. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.routes.clear();
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "error closing channel");
        }
        info!(gateway = %self.gateway, "session closed");
    }

    /// True once the session failed or was closed.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the session fails or is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    fn new_token(&self) -> Token {
        loop {
            let token = rand::random::<[u8; 4]>().to_vec();
            if !self.routes.has_observer(&token) {
                return token;
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._exchange_handle.abort();
    }
}

/// Reply to a queued request.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Packet, SessionError>>,
}

impl PendingReply {
    /// Waits for the response; error codes become [`SessionError::Status`].
    pub async fn response(self) -> Result<Packet, SessionError> {
        let packet = self.rx.await.map_err(|_| SessionError::Closed)??;
        if packet.code.is_success() {
            Ok(packet)
        } else {
            Err(SessionError::Status(packet.code))
        }
    }

    /// Waits for the outcome of a command.
    pub async fn command_result(self) -> Result<(), CommandError> {
        match self.response().await {
            Ok(_) => Ok(()),
            Err(SessionError::Status(code)) => {
                Err(CommandError::Rejected(format!("gateway answered {code}")))
            }
            Err(e) => Err(CommandError::Transport(e)),
        }
    }
}

/// Notifications of one observed device.
///
/// Dropping the subscription forgets its token; the gateway's next
/// notification is answered with a reset, which ends the observation.
pub struct Subscription {
    device_id: DeviceId,
    token: Token,
    rx: mpsc::Receiver<Packet>,
    routes: Arc<Routes>,
    last: Option<(u32, Instant)>,
    lagged: Arc<AtomicBool>,
}

impl Subscription {
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Reports, once, that notifications were dropped because this
    /// subscription fell behind. The device must then be read again.
    pub fn take_lagged(&self) -> bool {
        self.lagged.swap(false, Ordering::SeqCst)
    }

    /// Waits for the next fresh notification. `None` once the session ended.
    pub async fn next(&mut self) -> Option<Result<Device, SessionError>> {
        loop {
            let packet = self.rx.recv().await?;
            if !packet.code.is_success() {
                return Some(Err(SessionError::Status(packet.code)));
            }
            if let Some(seq) = packet.observe() {
                let now = Instant::now();
                if let Some((prev, at)) = self.last
                    && !is_fresher(prev, at, seq, now)
                {
                    trace!(device = self.device_id, seq, prev, "dropping stale notification");
                    continue;
                }
                self.last = Some((seq, now));
            }
            return Some(decode_device(&packet.payload));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.routes.remove_observer(&self.token);
    }
}

/// Notification ordering of RFC 7641 §3.4 on 24-bit sequence numbers.
fn is_fresher(prev: u32, prev_at: Instant, next: u32, now: Instant) -> bool {
    const HALF: u32 = 1 << 23;
    (prev < next && next - prev < HALF)
        || (prev > next && prev - next > HALF)
        || now > prev_at + Duration::from_secs(128)
}

fn decode_device(payload: &[u8]) -> Result<Device, SessionError> {
    Device::from_json(payload).map_err(|e| SessionError::Decode(e.to_string()))
}
