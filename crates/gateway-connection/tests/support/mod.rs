//! In-memory gateway used by the sync loop tests.
//!
//! Speaks CoAP over unbounded channels in place of DTLS and keeps just
//! enough state to answer pairing, device listing, observe and PUT.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tradfri_discovery::{GatewayAddress, StaticLocator};
use tradfri_gateway_connection::{
    ConnectError, Connector, CredentialStore, DatagramChannel, GatewayHandle, ObserveConfig,
    ReconnectConfig, SessionConfig, SyncConfig, SyncEvent, SyncLoop,
};
use tradfri_protocol::constants::PAIRING_IDENTITY;
use tradfri_protocol::{Code, Device, DeviceId, MessageKind, Packet};

pub const GATEWAY_IP: &str = "10.0.0.5";
pub const SECURITY_CODE: &str = "Gw7kR2pQ9xLm4TzA";
const WAIT: Duration = Duration::from_secs(5);

pub fn address() -> GatewayAddress {
    GatewayAddress::from_ip(GATEWAY_IP.parse().unwrap(), 5684)
}

pub fn light(id: DeviceId, name: &str, on: bool, dimmer: u16) -> Value {
    json!({
        "9003": id,
        "9001": name,
        "9019": 1,
        "3311": [{"5850": u8::from(on), "5851": dimmer}],
    })
}

pub fn plug(id: DeviceId, name: &str, on: bool) -> Value {
    json!({"9003": id, "9001": name, "9019": 1, "3312": [{"5850": u8::from(on)}]})
}

/// Cloneable fake gateway; every clone shares the same state.
#[derive(Clone)]
pub struct FakeGateway {
    inner: Arc<Inner>,
}

struct Inner {
    code: String,
    devices: Mutex<BTreeMap<DeviceId, Value>>,
    keys: Mutex<HashMap<String, Vec<u8>>>,
    links: Mutex<Vec<Arc<Link>>>,
    observers: Mutex<Vec<Observer>>,
    reachable: AtomicBool,
    handshakes: AtomicUsize,
    pairing_handshakes: AtomicUsize,
    puts: Mutex<Vec<(DeviceId, Value)>>,
    observe_seq: AtomicU32,
    message_id: AtomicU16,
}

struct Link {
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
}

struct Observer {
    token: Vec<u8>,
    device: DeviceId,
    link: Arc<Link>,
    last_message_id: Option<u16>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                code: SECURITY_CODE.into(),
                devices: Mutex::new(BTreeMap::new()),
                keys: Mutex::new(HashMap::new()),
                links: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
                reachable: AtomicBool::new(true),
                handshakes: AtomicUsize::new(0),
                pairing_handshakes: AtomicUsize::new(0),
                puts: Mutex::new(Vec::new()),
                observe_seq: AtomicU32::new(1),
                message_id: AtomicU16::new(0x4000),
            }),
        }
    }

    pub fn with_device(self, device: Value) -> Self {
        self.put_device(device);
        self
    }

    /// Installs a device without notifying anyone.
    pub fn put_device(&self, device: Value) {
        let id = device["9003"].as_u64().unwrap() as DeviceId;
        self.inner.devices.lock().unwrap().insert(id, device);
    }

    /// Replaces a device's state, as a wall switch would, and notifies
    /// its observers.
    pub fn change_device(&self, device: Value) {
        let id = device["9003"].as_u64().unwrap() as DeviceId;
        self.put_device(device);
        self.inner.notify(id);
    }

    pub fn remove_device(&self, id: DeviceId) {
        self.inner.devices.lock().unwrap().remove(&id);
    }

    /// Sends the device's unchanged state to its observers.
    pub fn renotify(&self, id: DeviceId) {
        self.inner.notify(id);
    }

    pub fn device(&self, id: DeviceId) -> Value {
        self.inner.devices.lock().unwrap()[&id].clone()
    }

    /// Accepts `identity` without pairing.
    pub fn authorize(&self, identity: &str, psk: &[u8]) {
        self.inner
            .keys
            .lock()
            .unwrap()
            .insert(identity.into(), psk.to_vec());
    }

    /// Forgets every issued key, as a factory reset does.
    pub fn revoke_all(&self) {
        self.inner.keys.lock().unwrap().clear();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Breaks every open session.
    pub fn drop_connections(&self) {
        for link in self.inner.links.lock().unwrap().drain(..) {
            link.closed.cancel();
        }
        self.inner.observers.lock().unwrap().clear();
    }

    pub fn open_links(&self) -> usize {
        self.inner
            .links
            .lock()
            .unwrap()
            .iter()
            .filter(|l| !l.closed.is_cancelled())
            .count()
    }

    pub fn handshakes(&self) -> usize {
        self.inner.handshakes.load(Ordering::SeqCst)
    }

    pub fn pairing_handshakes(&self) -> usize {
        self.inner.pairing_handshakes.load(Ordering::SeqCst)
    }

    pub fn observers(&self) -> usize {
        self.inner.observers.lock().unwrap().len()
    }

    pub fn puts(&self) -> Vec<(DeviceId, Value)> {
        self.inner.puts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeGateway {
    async fn connect(
        &self,
        _address: &GatewayAddress,
        identity: &str,
        psk: &[u8],
    ) -> Result<Arc<dyn DatagramChannel>, ConnectError> {
        self.inner.handshakes.fetch_add(1, Ordering::SeqCst);
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(ConnectError::Unreachable("handshake timed out".into()));
        }

        let pairing = identity == PAIRING_IDENTITY;
        let accepted = if pairing {
            self.inner.pairing_handshakes.fetch_add(1, Ordering::SeqCst);
            psk == self.inner.code.as_bytes()
        } else {
            self.inner.keys.lock().unwrap().get(identity).map(Vec::as_slice) == Some(psk)
        };
        if !accepted {
            return Err(ConnectError::AuthRejected);
        }

        let (to_gateway, from_client) = mpsc::unbounded_channel();
        let (to_client, from_gateway) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let link = Arc::new(Link {
            to_client,
            closed: closed.clone(),
        });
        self.inner.links.lock().unwrap().push(link.clone());
        tokio::spawn(serve(self.inner.clone(), link, from_client, pairing));

        Ok(Arc::new(ClientEnd {
            to_gateway,
            from_gateway: tokio::sync::Mutex::new(from_gateway),
            closed,
        }))
    }
}

async fn serve(
    inner: Arc<Inner>,
    link: Arc<Link>,
    mut from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    pairing: bool,
) {
    loop {
        let datagram = tokio::select! {
            _ = link.closed.cancelled() => break,
            datagram = from_client.recv() => match datagram {
                Some(datagram) => datagram,
                None => break,
            },
        };
        let Ok(request) = Packet::decode(&datagram) else {
            continue;
        };
        if request.kind == MessageKind::Reset {
            inner
                .observers
                .lock()
                .unwrap()
                .retain(|o| o.last_message_id != Some(request.message_id));
            continue;
        }
        if request.is_empty() || request.kind != MessageKind::Confirmable {
            continue;
        }

        let (code, payload, observe, changed) = if pairing {
            let (code, payload) = inner.pair(&request);
            (code, payload, None, None)
        } else {
            inner.handle(&request, &link)
        };
        let mut response = Packet::empty_ack(request.message_id);
        response.code = code;
        response.token = request.token.clone();
        response.payload = payload;
        if let Some(seq) = observe {
            response.set_observe(seq);
        }
        let _ = link.to_client.send(response.encode());

        if let Some(id) = changed {
            inner.notify(id);
        }
    }
    link.closed.cancel();
}

impl Inner {
    fn pair(&self, request: &Packet) -> (Code, Vec<u8>) {
        if request.code != Code::POST || request.uri_path() != ["15011", "9063"] {
            return (Code::UNAUTHORIZED, Vec::new());
        }
        let Ok(body) = serde_json::from_slice::<Value>(&request.payload) else {
            return (Code::BAD_REQUEST, Vec::new());
        };
        let Some(identity) = body["9090"].as_str() else {
            return (Code::BAD_REQUEST, Vec::new());
        };
        let psk = format!("key-for-{identity}");
        self.keys
            .lock()
            .unwrap()
            .insert(identity.into(), psk.clone().into_bytes());
        let reply = json!({"9091": psk, "9029": "1.2.42"});
        (Code::CREATED, serde_json::to_vec(&reply).unwrap())
    }

    fn handle(
        &self,
        request: &Packet,
        link: &Arc<Link>,
    ) -> (Code, Vec<u8>, Option<u32>, Option<DeviceId>) {
        let path = request.uri_path();
        match (request.code, path.as_slice()) {
            (Code::GET, [root]) if root == "15001" => {
                let ids: Vec<DeviceId> = self.devices.lock().unwrap().keys().copied().collect();
                (Code::CONTENT, serde_json::to_vec(&ids).unwrap(), None, None)
            }
            (Code::GET, [root, id]) if root == "15001" => {
                let Some((id, device)) = self.lookup(id) else {
                    return (Code::NOT_FOUND, Vec::new(), None, None);
                };
                let observe = (request.observe() == Some(0)).then(|| {
                    self.observers.lock().unwrap().push(Observer {
                        token: request.token.clone(),
                        device: id,
                        link: link.clone(),
                        last_message_id: None,
                    });
                    self.observe_seq.fetch_add(1, Ordering::SeqCst)
                });
                (Code::CONTENT, serde_json::to_vec(&device).unwrap(), observe, None)
            }
            (Code::PUT, [root, id]) if root == "15001" => {
                let Some((id, _)) = self.lookup(id) else {
                    return (Code::NOT_FOUND, Vec::new(), None, None);
                };
                let Ok(update) = serde_json::from_slice::<Value>(&request.payload) else {
                    return (Code::BAD_REQUEST, Vec::new(), None, None);
                };
                self.puts.lock().unwrap().push((id, update.clone()));
                if let Some(device) = self.devices.lock().unwrap().get_mut(&id) {
                    merge(device, &update);
                }
                (Code::CHANGED, Vec::new(), None, Some(id))
            }
            _ => (Code::NOT_FOUND, Vec::new(), None, None),
        }
    }

    fn lookup(&self, id: &str) -> Option<(DeviceId, Value)> {
        let id: DeviceId = id.parse().ok()?;
        let device = self.devices.lock().unwrap().get(&id)?.clone();
        Some((id, device))
    }

    fn notify(&self, id: DeviceId) {
        let Some(device) = self.devices.lock().unwrap().get(&id).cloned() else {
            return;
        };
        let payload = serde_json::to_vec(&device).unwrap();
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|o| !o.link.closed.is_cancelled());
        for observer in observers.iter_mut().filter(|o| o.device == id) {
            let message_id = self.message_id.fetch_add(1, Ordering::SeqCst);
            let mut notification = Packet::empty_ack(message_id);
            notification.kind = MessageKind::NonConfirmable;
            notification.code = Code::CONTENT;
            notification.token = observer.token.clone();
            notification.set_observe(self.observe_seq.fetch_add(1, Ordering::SeqCst));
            notification.payload = payload.clone();
            observer.last_message_id = Some(message_id);
            let _ = observer.link.to_client.send(notification.encode());
        }
    }
}

/// Applies a PUT body: each control list's first entry is merged field by
/// field. A non-zero dimmer also switches the light on.
fn merge(device: &mut Value, update: &Value) {
    let Some(update) = update.as_object() else {
        return;
    };
    for (control, entries) in update {
        let (Some(target), Some(source)) = (
            device
                .get_mut(control.as_str())
                .and_then(|c| c.get_mut(0))
                .and_then(Value::as_object_mut),
            entries.get(0).and_then(Value::as_object),
        ) else {
            continue;
        };
        for (field, value) in source {
            target.insert(field.clone(), value.clone());
        }
        if source.get("5851").and_then(Value::as_u64).is_some_and(|d| d > 0) {
            target.insert("5850".into(), json!(1));
        }
    }
}

struct ClientEnd {
    to_gateway: mpsc::UnboundedSender<Vec<u8>>,
    from_gateway: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: CancellationToken,
}

#[async_trait]
impl DatagramChannel for ClientEnd {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.to_gateway
            .send(datagram.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.from_gateway.lock().await;
        let datagram = tokio::select! {
            biased;
            datagram = rx.recv() => datagram,
            _ = self.closed.cancelled() => None,
        };
        let datagram = datagram.ok_or(io::Error::from(io::ErrorKind::ConnectionReset))?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(len)
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    polled.unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// A running sync loop wired to a [`FakeGateway`].
pub struct Harness {
    pub gateway: FakeGateway,
    pub handle: GatewayHandle,
    pub events: mpsc::Receiver<SyncEvent>,
    pub store: CredentialStore,
    task: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        },
        session: SessionConfig {
            open_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(200),
            min_request_interval: Duration::from_millis(1),
            queue_depth: 32,
        },
        observe: ObserveConfig::default(),
    }
}

impl Harness {
    pub fn start(gateway: FakeGateway) -> Self {
        Self::start_with(gateway, fast_config(), |_| {})
    }

    /// Starts the loop after `prepare` had a chance to seed the store.
    pub fn start_with(
        gateway: FakeGateway,
        config: SyncConfig,
        prepare: impl FnOnce(&CredentialStore),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        prepare(&store);
        let (sync_loop, handle, events) = SyncLoop::new(
            Arc::new(StaticLocator::new(address())),
            Arc::new(gateway.clone()),
            store.clone(),
            config,
        );
        let task = tokio::spawn(sync_loop.run());
        Self {
            gateway,
            handle,
            events,
            store,
            task,
            _dir: dir,
        }
    }

    /// Next event matching `want`; earlier events are skipped.
    pub async fn expect(&mut self, what: &str, want: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
        let found = tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if want(&event) => return event,
                    Some(_) => {}
                    None => panic!("event stream ended while waiting for {what}"),
                }
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    pub async fn expect_devices(&mut self, want: impl Fn(&[Device]) -> bool) -> Vec<Device> {
        match self
            .expect("devices", |e| matches!(e, SyncEvent::DevicesChanged(d) if want(d)))
            .await
        {
            SyncEvent::DevicesChanged(devices) => devices,
            _ => unreachable!(),
        }
    }

    pub async fn expect_pairing_required(&mut self) {
        self.expect("pairing request", |e| matches!(e, SyncEvent::PairingRequired { .. }))
            .await;
    }

    pub async fn expect_pairing_failed(&mut self) -> String {
        match self
            .expect("pairing failure", |e| matches!(e, SyncEvent::PairingFailed { .. }))
            .await
        {
            SyncEvent::PairingFailed { reason } => reason,
            _ => unreachable!(),
        }
    }

    /// Waits until the loop reports `Connected`.
    pub async fn connected(&mut self) {
        let mut state = self.handle.watch_state();
        tokio::time::timeout(WAIT, state.wait_for(|s| s.is_connected()))
            .await
            .expect("timed out waiting for connection")
            .expect("sync loop gone");
    }

    /// Drains events that are already queued.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub async fn shutdown(self) {
        self.handle.shutdown();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("sync loop did not stop")
            .expect("sync loop panicked");
    }
}
