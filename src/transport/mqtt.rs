//! MQTT transport over rumqttc.
//!
//! A background task drives the rumqttc event loop: it dispatches inbound
//! publishes to subscription handlers, resolves subscribe calls when their
//! SUBACK arrives, reports interruptions and resumptions, and re-issues all
//! subscriptions when the broker comes back without our session.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode, TlsConfiguration,
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ConnectionEvent, Message, MessageHandler, QoS, Transport, handlers_for};
use crate::error::{Error, Result};

/// Certificate files for mutual TLS.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Connection settings for [`MqttTransport::connect`].
#[derive(Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub tls: Option<TlsFiles>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

type SubAckSender = oneshot::Sender<Result<()>>;

#[derive(Default)]
struct SubAckTracker {
    /// Subscribe requests handed to the client, not yet assigned a packet id.
    /// `None` marks a resubscription nobody waits on.
    queued: VecDeque<(String, Option<SubAckSender>)>,
    /// Packet id -> waiter, once the SUBSCRIBE has gone out.
    in_flight: HashMap<u16, (String, Option<SubAckSender>)>,
}

impl SubAckTracker {
    fn fail_all(&mut self, reason: &str) {
        let waiters = self
            .queued
            .drain(..)
            .chain(self.in_flight.drain().map(|(_, w)| w));
        for (filter, tx) in waiters {
            if let Some(tx) = tx {
                let _ = tx.send(Err(Error::SubscribeFailed {
                    filter,
                    reason: reason.to_string(),
                }));
            }
        }
    }
}

struct Shared {
    subscriptions: Mutex<Vec<(String, MessageHandler)>>,
    qos: Mutex<HashMap<String, QoS>>,
    acks: Mutex<SubAckTracker>,
    closing: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MqttTransport {
    client: AsyncClient,
    shared: Arc<Shared>,
    events: broadcast::Sender<ConnectionEvent>,
    event_loop: JoinHandle<()>,
}

impl MqttTransport {
    /// Connect and wait for the broker's CONNACK.
    pub async fn connect(settings: MqttSettings) -> Result<Self> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);

        if let Some(ref files) = settings.tls {
            let ca = tokio::fs::read(&files.ca).await?;
            let cert = tokio::fs::read(&files.cert).await?;
            let key = tokio::fs::read(&files.key).await?;
            options.set_transport(rumqttc::Transport::tls_with_config(
                TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: Some((cert, key)),
                },
            ));
        }
        if let Some(ref username) = settings.username {
            let password = settings
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_string())
                .unwrap_or_default();
            options.set_credentials(username.clone(), password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        info!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            "connecting"
        );
        let ack = tokio::time::timeout(settings.connect_timeout, wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| Error::Timeout("connection acknowledgement".to_string()))??;
        if ack.code != ConnectReturnCode::Success {
            return Err(Error::Transport(format!(
                "connection refused: {:?}",
                ack.code
            )));
        }
        info!("connected");

        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(Vec::new()),
            qos: Mutex::new(HashMap::new()),
            acks: Mutex::new(SubAckTracker::default()),
            closing: AtomicBool::new(false),
        });
        let (events, _) = broadcast::channel(16);

        let event_loop = tokio::spawn(drive(
            event_loop,
            client.clone(),
            Arc::clone(&shared),
            events.clone(),
        ));

        Ok(Self {
            client,
            shared,
            events,
            event_loop,
        })
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<ConnAck> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
            Ok(_) => {}
            Err(e) => return Err(Error::Transport(e.to_string())),
        }
    }
}

async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    events: broadcast::Sender<ConnectionEvent>,
) {
    let mut interrupted = false;
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let handlers: Vec<MessageHandler> = {
                    let subs = lock(&shared.subscriptions);
                    let found: Vec<MessageHandler> = handlers_for(&subs, &publish.topic).collect();
                    found
                };
                if handlers.is_empty() {
                    debug!(topic = %publish.topic, "no handler for inbound message");
                }
                for handler in handlers {
                    handler(Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    });
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                let mut acks = lock(&shared.acks);
                if let Some(waiter) = acks.queued.pop_front() {
                    acks.in_flight.insert(pkid, waiter);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let waiter = lock(&shared.acks).in_flight.remove(&suback.pkid);
                if let Some((filter, tx)) = waiter {
                    let refused = suback
                        .return_codes
                        .iter()
                        .any(|c| matches!(c, SubscribeReasonCode::Failure));
                    let outcome = if refused {
                        warn!(%filter, "subscription refused by broker");
                        Err(Error::SubscribeFailed {
                            filter,
                            reason: "refused by broker".to_string(),
                        })
                    } else {
                        Ok(())
                    };
                    if let Some(tx) = tx {
                        let _ = tx.send(outcome);
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if interrupted && ack.code == ConnectReturnCode::Success {
                    interrupted = false;
                    info!(session_present = ack.session_present, "connection resumed");
                    if !ack.session_present {
                        resubscribe(&client, &shared);
                    }
                    let _ = events.send(ConnectionEvent::Resumed {
                        session_present: ack.session_present,
                    });
                }
            }
            Ok(_) => {}
            Err(e) => {
                if shared.closing.load(Ordering::Acquire) {
                    debug!("event loop stopped after disconnect");
                    break;
                }
                lock(&shared.acks).fail_all("connection lost");
                if !interrupted {
                    interrupted = true;
                    warn!(error = %e, "connection interrupted");
                    let _ = events.send(ConnectionEvent::Interrupted {
                        reason: e.to_string(),
                    });
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn resubscribe(client: &AsyncClient, shared: &Shared) {
    let filters: Vec<String> = lock(&shared.subscriptions)
        .iter()
        .map(|(f, _)| f.clone())
        .collect();
    let qos = lock(&shared.qos).clone();
    let mut acks = lock(&shared.acks);
    for filter in filters {
        let level = qos.get(&filter).copied().unwrap_or(QoS::AtLeastOnce);
        match client.try_subscribe(filter.clone(), to_rumqttc(level)) {
            Ok(()) => acks.queued.push_back((filter, None)),
            Err(e) => warn!(%filter, error = %e, "resubscribe failed"),
        }
    }
}

impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()> {
        self.client
            .publish(topic, to_rumqttc(qos), false, payload)
            .await
            .map_err(|e| Error::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> Result<()> {
        lock(&self.shared.subscriptions).push((filter.to_string(), handler));
        lock(&self.shared.qos).insert(filter.to_string(), qos);

        let (tx, rx) = oneshot::channel();
        {
            // Queue order must match the order requests reach the client.
            let mut acks = lock(&self.shared.acks);
            self.client
                .try_subscribe(filter, to_rumqttc(qos))
                .map_err(|e| Error::SubscribeFailed {
                    filter: filter.to_string(),
                    reason: e.to_string(),
                })?;
            acks.queued.push_back((filter.to_string(), Some(tx)));
        }

        let outcome = rx.await.unwrap_or_else(|_| {
            Err(Error::SubscribeFailed {
                filter: filter.to_string(),
                reason: "event loop stopped".to_string(),
            })
        });
        if outcome.is_err() {
            lock(&self.shared.subscriptions).retain(|(f, _)| f != filter);
            lock(&self.shared.qos).remove(filter);
        }
        outcome
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::Release);
        self.client
            .disconnect()
            .await
            .map_err(|e| Error::Transport(format!("disconnect failed: {e}")))
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}
