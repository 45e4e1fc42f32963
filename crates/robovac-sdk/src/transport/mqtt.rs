//! MQTT over TLS transport built on rumqttc.
//!
//! The robot acts as the broker. It pushes reported-state publishes without
//! any subscription, and accepts publishes on the `cmd` and `delta` topics.
//! Connection errors are fatal: once the event loop fails the transport stops
//! polling, fails every publish still waiting for its write, and reports
//! `Error` followed by `Closed`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, TlsConfiguration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{tls, Channel, Transport, TransportEvent};
use crate::config::LocalConfig;
use crate::error::{SdkError, SdkResult};

/// Largest packet accepted in either direction.
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Capacity of the client request queue and the inbound event channel.
const CHANNEL_CAPACITY: usize = 64;

/// Publishes waiting for their outgoing write, oldest first.
///
/// An entry is queued in the same critical section that hands the publish to
/// the client, so queue order is write order and a publish the client refused
/// never leaves an entry behind.
#[derive(Clone, Default)]
struct AckQueue {
    pending: Arc<Mutex<VecDeque<oneshot::Sender<SdkResult<()>>>>>,
}

impl AckQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<oneshot::Sender<SdkResult<()>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `write` and, if it succeeds, queue an ack for it.
    fn enqueue<F>(&self, write: F) -> SdkResult<oneshot::Receiver<SdkResult<()>>>
    where
        F: FnOnce() -> SdkResult<()>,
    {
        let mut pending = self.lock();
        write()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        pending.push_back(ack_tx);
        Ok(ack_rx)
    }

    /// The oldest queued publish was written.
    fn complete_next(&self) {
        let next = self.lock().pop_front();
        if let Some(ack) = next {
            let _ = ack.send(Ok(()));
        }
    }

    fn fail_all(&self, reason: &str) {
        let waiting: Vec<_> = self.lock().drain(..).collect();
        for ack in waiting {
            let _ = ack.send(Err(SdkError::Publish(reason.to_string())));
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Live MQTT connection to one robot.
pub struct MqttTransport {
    client: AsyncClient,
    acks: AckQueue,
}

impl MqttTransport {
    /// Connect and wait for the robot's CONNACK.
    ///
    /// Returns the transport and the receiver for its events; the first event
    /// is always `Connected`.
    pub async fn connect(
        config: &LocalConfig,
    ) -> SdkResult<(Self, mpsc::Receiver<TransportEvent>)> {
        config.validate()?;

        let mut options = MqttOptions::new(&config.blid, &config.host, config.port);
        options.set_credentials(&config.blid, &config.password);
        options.set_clean_session(false);
        options.set_keep_alive(config.keep_alive());
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let tls_config = tls::client_config(&config.ciphers)?;
        options.set_transport(rumqttc::Transport::tls_with_config(
            TlsConfiguration::Rustls(Arc::new(tls_config)),
        ));

        let (client, mut eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);

        info!("Connecting to robot at {}", config.full_addr());
        let limit = config.connect_timeout();
        match tokio::time::timeout(limit, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(SdkError::Connection(format!(
                    "No CONNACK from {} within {:?}",
                    config.full_addr(),
                    limit
                )))
            }
        }
        info!("Connected to robot {}", config.blid);

        let acks = AckQueue::default();
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let _ = events_tx.send(TransportEvent::Connected).await;

        tokio::spawn(run_event_loop(eventloop, events_tx, acks.clone()));

        Ok((Self { client, acks }, events_rx))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> SdkResult<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(SdkError::Connection(format!(
                        "Robot refused the connection: {:?}",
                        code
                    ))),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(SdkError::Connection(e.to_string())),
        }
    }
}

/// What the event loop does after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopStep {
    Continue,
    Stop,
}

async fn handle_event(
    event: Result<Event, ConnectionError>,
    events: &mpsc::Sender<TransportEvent>,
    acks: &AckQueue,
) -> LoopStep {
    match event {
        Ok(Event::Incoming(Packet::Publish(publish))) => {
            debug!(
                "Received {} bytes on topic {}",
                publish.payload.len(),
                publish.topic
            );
            if events
                .send(TransportEvent::Frame(publish.payload.to_vec()))
                .await
                .is_err()
            {
                debug!("Session dropped, stopping MQTT event loop");
                return LoopStep::Stop;
            }
            LoopStep::Continue
        }
        Ok(Event::Outgoing(Outgoing::Publish(_))) => {
            acks.complete_next();
            LoopStep::Continue
        }
        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
            info!("Disconnected from robot");
            LoopStep::Stop
        }
        Ok(Event::Incoming(Packet::Disconnect)) => {
            warn!("Robot closed the MQTT session");
            LoopStep::Stop
        }
        Ok(_) => LoopStep::Continue,
        Err(e) => {
            error!("MQTT connection error: {}", e);
            let _ = events.send(TransportEvent::Error(e.to_string())).await;
            LoopStep::Stop
        }
    }
}

async fn finish(events: &mpsc::Sender<TransportEvent>, acks: &AckQueue) {
    acks.fail_all("connection closed before the publish was written");
    let _ = events.send(TransportEvent::Closed).await;
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    acks: AckQueue,
) {
    while handle_event(eventloop.poll().await, &events, &acks).await == LoopStep::Continue {}
    // Dropping the event loop makes later publishes fail fast
    drop(eventloop);
    finish(&events, &acks).await;
}

#[async_trait]
impl Transport for MqttTransport {
    /// Hands the publish to the client without waiting for queue space; a
    /// full request queue fails the call with `Publish`.
    async fn publish(&self, channel: Channel, payload: Vec<u8>) -> SdkResult<()> {
        let ack = self.acks.enqueue(|| {
            self.client
                .try_publish(channel.as_str(), QoS::AtMostOnce, false, payload)
                .map_err(|e| SdkError::Publish(e.to_string()))
        })?;

        ack.await.map_err(|_| SdkError::Closed)?
    }

    async fn disconnect(&self) -> SdkResult<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| SdkError::Connection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::Publish;
    use std::io;

    fn accepted() -> SdkResult<()> {
        Ok(())
    }

    #[tokio::test]
    async fn test_ack_completes_on_outgoing_publish() {
        let acks = AckQueue::default();
        let (events, _rx) = mpsc::channel(4);

        let mut ack = acks.enqueue(accepted).unwrap();
        assert!(ack.try_recv().is_err());

        let step = handle_event(Ok(Event::Outgoing(Outgoing::Publish(1))), &events, &acks).await;
        assert_eq!(step, LoopStep::Continue);
        assert!(matches!(ack.await, Ok(Ok(()))));
        assert_eq!(acks.len(), 0);
    }

    #[tokio::test]
    async fn test_acks_complete_in_write_order() {
        let acks = AckQueue::default();
        let (events, _rx) = mpsc::channel(4);

        let first = acks.enqueue(accepted).unwrap();
        let mut second = acks.enqueue(accepted).unwrap();

        handle_event(Ok(Event::Outgoing(Outgoing::Publish(1))), &events, &acks).await;
        assert!(matches!(first.await, Ok(Ok(()))));
        assert!(second.try_recv().is_err());

        handle_event(Ok(Event::Outgoing(Outgoing::Publish(2))), &events, &acks).await;
        assert!(matches!(second.await, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_refused_write_queues_nothing() {
        let acks = AckQueue::default();
        let (events, _rx) = mpsc::channel(4);

        let refused = acks.enqueue(|| Err(SdkError::Publish("request queue full".to_string())));
        assert!(matches!(refused, Err(SdkError::Publish(_))));
        assert_eq!(acks.len(), 0);

        // The next write must not be resolved by a stale entry
        let mut ack = acks.enqueue(accepted).unwrap();
        assert!(ack.try_recv().is_err());
        handle_event(Ok(Event::Outgoing(Outgoing::Publish(1))), &events, &acks).await;
        assert!(matches!(ack.await, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_cancelled_publish_keeps_its_slot() {
        let acks = AckQueue::default();
        let (events, _rx) = mpsc::channel(4);

        let cancelled = acks.enqueue(accepted).unwrap();
        drop(cancelled);
        let mut ack = acks.enqueue(accepted).unwrap();

        // The first write belongs to the cancelled caller
        handle_event(Ok(Event::Outgoing(Outgoing::Publish(1))), &events, &acks).await;
        assert!(ack.try_recv().is_err());

        handle_event(Ok(Event::Outgoing(Outgoing::Publish(2))), &events, &acks).await;
        assert!(matches!(ack.await, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_incoming_publish_is_forwarded_as_frame() {
        let acks = AckQueue::default();
        let (events, mut rx) = mpsc::channel(4);
        let payload = br#"{"state":{"reported":{"batPct":80}}}"#.to_vec();

        let publish = Publish::new("state", QoS::AtMostOnce, payload.clone());
        let event = Ok(Event::Incoming(Packet::Publish(publish)));
        let step = handle_event(event, &events, &acks).await;

        assert_eq!(step, LoopStep::Continue);
        match rx.recv().await {
            Some(TransportEvent::Frame(frame)) => assert_eq!(frame, payload),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incoming_publish_stops_when_session_dropped() {
        let acks = AckQueue::default();
        let (events, rx) = mpsc::channel(4);
        drop(rx);

        let publish = Publish::new("state", QoS::AtMostOnce, b"{}".to_vec());
        let event = Ok(Event::Incoming(Packet::Publish(publish)));
        let step = handle_event(event, &events, &acks).await;
        assert_eq!(step, LoopStep::Stop);
    }

    #[tokio::test]
    async fn test_connection_error_fails_pending_publishes() {
        let acks = AckQueue::default();
        let (events, mut rx) = mpsc::channel(4);

        let first = acks.enqueue(accepted).unwrap();
        let second = acks.enqueue(accepted).unwrap();

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let step = handle_event(Err(ConnectionError::Io(reset)), &events, &acks).await;
        assert_eq!(step, LoopStep::Stop);
        assert!(matches!(rx.recv().await, Some(TransportEvent::Error(_))));

        finish(&events, &acks).await;
        assert!(matches!(first.await, Ok(Err(SdkError::Publish(_)))));
        assert!(matches!(second.await, Ok(Err(SdkError::Publish(_)))));
        assert_eq!(acks.len(), 0);
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed)));
    }

    #[tokio::test]
    async fn test_disconnect_stops_the_loop() {
        let acks = AckQueue::default();
        let (events, _rx) = mpsc::channel(4);

        let ours = handle_event(Ok(Event::Outgoing(Outgoing::Disconnect)), &events, &acks).await;
        let theirs = handle_event(Ok(Event::Incoming(Packet::Disconnect)), &events, &acks).await;
        assert_eq!(ours, LoopStep::Stop);
        assert_eq!(theirs, LoopStep::Stop);
    }
}
