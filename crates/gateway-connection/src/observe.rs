//! Strategies that turn a session into a stream of device updates.
//!
//! The gateway supports CoAP observe, so [`PushObserve`] is the default.
//! [`PollObserve`] reads the device periodically instead, for networks that
//! drop the gateway's unsolicited datagrams.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};
use tradfri_protocol::{Device, DeviceId};

use crate::error::SessionError;
use crate::session::Session;
use crate::types::{ObserveConfig, ObserveMode};

/// Produces the update stream of one device on a session.
pub trait ObserveStrategy: Send + Sync {
    /// Starts observing. The stream is infinite while the session lives and
    /// ends with one error item when it fails.
    fn observe(&self, session: Arc<Session>, device_id: DeviceId) -> Observation;
}

/// Picks the strategy configured by `config.mode`.
pub fn strategy_for(config: &ObserveConfig) -> Arc<dyn ObserveStrategy> {
    match config.mode {
        ObserveMode::Push => Arc::new(PushObserve::new(config.clone())),
        ObserveMode::Poll => Arc::new(PollObserve::new(config.clone())),
    }
}

/// Live update stream of one device. Dropping it stops the observation.
pub struct Observation {
    device_id: DeviceId,
    rx: mpsc::Receiver<Result<Device, SessionError>>,
    task: JoinHandle<()>,
}

impl Observation {
    fn spawn<F, Fut>(device_id: DeviceId, run: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<Device, SessionError>>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run(tx));
        Self { device_id, rx, task }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }
}

impl Stream for Observation {
    type Item = Result<Device, SessionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Observe registrations, renewed periodically.
///
/// Each registration lives for `renew_after`; it is then dropped and, after
/// `restart_delay`, replaced. The registration reply carries the current
/// state, so every renewal also re-emits the device as a heartbeat.
#[derive(Debug, Clone)]
pub struct PushObserve {
    config: ObserveConfig,
}

impl PushObserve {
    pub fn new(config: ObserveConfig) -> Self {
        Self { config }
    }
}

impl ObserveStrategy for PushObserve {
    fn observe(&self, session: Arc<Session>, device_id: DeviceId) -> Observation {
        let config = self.config.clone();
        Observation::spawn(device_id, move |tx| async move {
            loop {
                let (device, mut subscription) = match session.subscribe(device_id).await {
                    Ok(subscribed) => subscribed,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                debug!(device = device_id, "observation registered");
                if tx.send(Ok(device)).await.is_err() {
                    return;
                }

                let renew = tokio::time::sleep(config.renew_after);
                tokio::pin!(renew);
                loop {
                    if subscription.take_lagged() {
                        debug!(device = device_id, "notifications dropped, reading device");
                        let current = session.fetch_device(device_id).await;
                        let failed = current.is_err();
                        if tx.send(current).await.is_err() || failed {
                            return;
                        }
                    }
                    tokio::select! {
                        () = &mut renew => break,
                        item = subscription.next() => {
                            let item = item.unwrap_or(Err(SessionError::Closed));
                            let failed = item.is_err();
                            if tx.send(item).await.is_err() || failed {
                                return;
                            }
                        }
                    }
                }

                drop(subscription);
                trace!(device = device_id, "renewing observation");
                tokio::select! {
                    () = session.closed() => {
                        let _ = tx.send(Err(SessionError::Closed)).await;
                        return;
                    }
                    () = tokio::time::sleep(config.restart_delay) => {}
                }
            }
        })
    }
}

/// Periodic reads, emitting on change or when the heartbeat is due.
#[derive(Debug, Clone)]
pub struct PollObserve {
    config: ObserveConfig,
}

impl PollObserve {
    pub fn new(config: ObserveConfig) -> Self {
        Self { config }
    }
}

impl ObserveStrategy for PollObserve {
    fn observe(&self, session: Arc<Session>, device_id: DeviceId) -> Observation {
        let config = self.config.clone();
        Observation::spawn(device_id, move |tx| async move {
            let mut ticker = tokio::time::interval(config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<(Device, Instant)> = None;

            loop {
                ticker.tick().await;
                let device = match session.fetch_device(device_id).await {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                let due = match &last {
                    Some((previous, at)) => {
                        *previous != device || at.elapsed() >= config.heartbeat
                    }
                    None => true,
                };
                if due {
                    last = Some((device.clone(), Instant::now()));
                    if tx.send(Ok(device)).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::time::Duration;

    use futures_util::StreamExt;
    use serde_json::json;
    use tradfri_discovery::GatewayAddress;
    use tradfri_protocol::{Code, MessageKind, Packet};

    use super::*;
    use crate::testing::MemoryChannel;
    use crate::types::SessionConfig;

    fn open() -> (Arc<Session>, Arc<MemoryChannel>) {
        let (client, gateway) = MemoryChannel::pair();
        let config = SessionConfig {
            min_request_interval: Duration::from_millis(1),
            ..SessionConfig::default()
        };
        let address = GatewayAddress::from_ip("10.0.0.5".parse().unwrap(), 5684);
        (
            Arc::new(Session::establish(address, Arc::new(client), config)),
            Arc::new(gateway),
        )
    }

    fn lamp(on: u8) -> Vec<u8> {
        serde_json::to_vec(&json!({"9003": 1, "9001": "Lamp", "3311": [{"5850": on, "5851": 127}]}))
            .unwrap()
    }

    fn poll_config() -> ObserveConfig {
        ObserveConfig {
            mode: ObserveMode::Poll,
            poll_interval: Duration::from_secs(10),
            heartbeat: Duration::from_secs(60),
            ..ObserveConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_emits_changes_and_heartbeats() {
        let (session, gateway) = open();
        let state = Arc::new(AtomicU8::new(0));
        let reads = Arc::new(AtomicU8::new(0));
        {
            let state = state.clone();
            let reads = reads.clone();
            tokio::spawn(async move {
                loop {
                    let request = gateway.recv_packet().await;
                    reads.fetch_add(1, Ordering::SeqCst);
                    let mut response = Packet::empty_ack(request.message_id);
                    response.code = Code::CONTENT;
                    response.token = request.token;
                    response.payload = lamp(state.load(Ordering::SeqCst));
                    gateway.send_packet(&response).await;
                }
            });
        }

        let strategy = strategy_for(&poll_config());
        let mut observation = strategy.observe(session, 1);
        assert_eq!(observation.device_id(), 1);

        let first = observation.next().await.unwrap().unwrap();
        assert_eq!(first.is_on(), Some(false));

        state.store(1, Ordering::SeqCst);
        let changed = observation.next().await.unwrap().unwrap();
        assert_eq!(changed.is_on(), Some(true));
        assert_eq!(reads.load(Ordering::SeqCst), 2);

        // Unchanged reads stay silent until the heartbeat is due.
        let before = Instant::now();
        let heartbeat = observation.next().await.unwrap().unwrap();
        assert_eq!(heartbeat.is_on(), Some(true));
        assert!(before.elapsed() >= Duration::from_secs(50));
        assert!(reads.load(Ordering::SeqCst) >= 7);
    }

    #[tokio::test(start_paused = true)]
    async fn push_renews_registration() {
        let (session, gateway) = open();
        let config = ObserveConfig {
            renew_after: Duration::from_secs(300),
            restart_delay: Duration::from_secs(5),
            ..ObserveConfig::default()
        };

        let strategy = PushObserve::new(config);
        let mut observation = strategy.observe(session, 1);

        let register = |request: &Packet, seq: u32, on: u8| {
            assert_eq!(request.observe(), Some(0));
            let mut response = Packet::empty_ack(request.message_id);
            response.code = Code::CONTENT;
            response.token = request.token.clone();
            response.set_observe(seq);
            response.payload = lamp(on);
            response
        };

        let first = gateway.recv_packet().await;
        gateway.send_packet(&register(&first, 1, 0)).await;
        assert_eq!(observation.next().await.unwrap().unwrap().is_on(), Some(false));

        // A pushed notification.
        let mut notification = register(&first, 2, 1);
        notification.kind = MessageKind::NonConfirmable;
        notification.message_id = 4000;
        gateway.send_packet(&notification).await;
        assert_eq!(observation.next().await.unwrap().unwrap().is_on(), Some(true));

        // After the registration lifetime and the pause, a new registration.
        let started = Instant::now();
        let second = gateway.recv_packet().await;
        assert!(started.elapsed() >= Duration::from_secs(305) - Duration::from_millis(1));
        assert_ne!(second.token, first.token);
        gateway.send_packet(&register(&second, 1, 1)).await;
        assert_eq!(observation.next().await.unwrap().unwrap().is_on(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_notifications_trigger_a_read() {
        let (session, gateway) = open();
        let mut observation = PushObserve::new(ObserveConfig::default()).observe(session, 1);

        let registration = gateway.recv_packet().await;
        let notification = |seq: u32, on: u8| {
            let mut packet = Packet::empty_ack(registration.message_id);
            packet.code = Code::CONTENT;
            packet.token = registration.token.clone();
            packet.set_observe(seq);
            packet.payload = lamp(on);
            packet
        };
        gateway.send_packet(&notification(1, 0)).await;
        assert!(observation.next().await.unwrap().is_ok());

        // The observation is not read while the gateway floods it.
        for seq in 2..60 {
            let mut packet = notification(seq, 0);
            packet.kind = MessageKind::NonConfirmable;
            packet.message_id = 4000 + seq as u16;
            gateway.send_packet(&packet).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reads = gateway.clone();
        tokio::spawn(async move {
            let request = reads.recv_packet().await;
            assert_eq!(request.observe(), None);
            let mut response = Packet::empty_ack(request.message_id);
            response.code = Code::CONTENT;
            response.token = request.token;
            response.payload = lamp(1);
            reads.send_packet(&response).await;
        });

        let current = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let device = observation.next().await.unwrap().unwrap();
                if device.is_on() == Some(true) {
                    return device;
                }
            }
        })
        .await
        .expect("device was not read again");
        assert_eq!(current.id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observation_ends_with_error_when_session_fails() {
        let (session, gateway) = open();
        let mut observation = PushObserve::new(ObserveConfig::default()).observe(session, 1);

        let request = gateway.recv_packet().await;
        let mut response = Packet::empty_ack(request.message_id);
        response.code = Code::CONTENT;
        response.token = request.token;
        response.set_observe(1);
        response.payload = lamp(0);
        gateway.send_packet(&response).await;
        assert!(observation.next().await.unwrap().is_ok());

        gateway.disconnect();
        assert!(observation.next().await.unwrap().is_err());
        assert!(observation.next().await.is_none());
    }
}
