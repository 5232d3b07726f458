//! In-process loopback broker.
//!
//! Every [`MemoryTransport`] is one client session on a shared
//! [`MemoryBroker`]. Publishes are routed to all connected sessions whose
//! filters match; each session has its own delivery task, so handlers for one
//! connection run one at a time and in publish order. The broker keeps a
//! journal of subscribe/publish/disconnect operations that tests use to check
//! sequencing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{ConnectionEvent, Message, MessageHandler, QoS, Transport, handlers_for};
use crate::error::{Error, Result};

/// One recorded broker operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Subscribed { client_id: String, filter: String },
    Published { client_id: String, topic: String },
    Disconnected { client_id: String },
}

struct Session {
    client_id: String,
    connected: bool,
    subscriptions: Vec<(String, MessageHandler)>,
    inbox: mpsc::UnboundedSender<(MessageHandler, Message)>,
    events: broadcast::Sender<ConnectionEvent>,
}

#[derive(Default)]
struct BrokerInner {
    next_session: u64,
    sessions: HashMap<u64, Session>,
    journal: Vec<JournalEntry>,
}

/// Shared loopback broker. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new client session. Must be called inside a Tokio runtime.
    pub fn connect(&self, client_id: &str) -> MemoryTransport {
        let (inbox, mut rx) = mpsc::unbounded_channel::<(MessageHandler, Message)>();
        let (events, _) = broadcast::channel(16);

        tokio::spawn(async move {
            while let Some((handler, message)) = rx.recv().await {
                handler(message);
            }
        });

        let mut inner = self.lock();
        inner.next_session += 1;
        let session = inner.next_session;
        inner.sessions.insert(
            session,
            Session {
                client_id: client_id.to_string(),
                connected: true,
                subscriptions: Vec::new(),
                inbox,
                events: events.clone(),
            },
        );
        debug!(client_id, "memory session connected");

        MemoryTransport {
            broker: self.clone(),
            session,
            client_id: client_id.to_string(),
            events,
        }
    }

    /// Snapshot of all operations so far.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    /// Simulate losing the connection of `client_id`. Messages routed to it
    /// while interrupted are dropped.
    pub fn interrupt(&self, client_id: &str, reason: &str) {
        let mut inner = self.lock();
        for session in inner
            .sessions
            .values_mut()
            .filter(|s| s.client_id == client_id)
        {
            session.connected = false;
            let _ = session.events.send(ConnectionEvent::Interrupted {
                reason: reason.to_string(),
            });
        }
    }

    /// Simulate the connection of `client_id` coming back. Subscriptions are
    /// kept either way: without a session the transport re-issues them.
    pub fn resume(&self, client_id: &str, session_present: bool) {
        let mut inner = self.lock();
        for session in inner
            .sessions
            .values_mut()
            .filter(|s| s.client_id == client_id)
        {
            session.connected = true;
            let _ = session
                .events
                .send(ConnectionEvent::Resumed { session_present });
        }
    }
}

/// One client session on a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    session: u64,
    client_id: String,
    events: broadcast::Sender<ConnectionEvent>,
}

impl MemoryTransport {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn route(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut inner = self.broker.lock();
        match inner.sessions.get(&self.session) {
            Some(session) if session.connected => {}
            _ => {
                return Err(Error::PublishFailed {
                    topic: topic.to_string(),
                    reason: "not connected".to_string(),
                });
            }
        }

        for session in inner.sessions.values().filter(|s| s.connected) {
            for handler in handlers_for(&session.subscriptions, topic) {
                let message = Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                // Receiver only goes away with the session itself.
                let _ = session.inbox.send((handler, message));
            }
        }

        inner.journal.push(JournalEntry::Published {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn add_subscription(&self, filter: &str, handler: MessageHandler) -> Result<()> {
        let mut inner = self.broker.lock();
        let Some(session) = inner.sessions.get_mut(&self.session) else {
            return Err(Error::SubscribeFailed {
                filter: filter.to_string(),
                reason: "session closed".to_string(),
            });
        };
        if !session.connected {
            return Err(Error::SubscribeFailed {
                filter: filter.to_string(),
                reason: "not connected".to_string(),
            });
        }
        session.subscriptions.push((filter.to_string(), handler));
        inner.journal.push(JournalEntry::Subscribed {
            client_id: self.client_id.clone(),
            filter: filter.to_string(),
        });
        Ok(())
    }
}

impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<()> {
        self.route(topic, payload)
    }

    async fn subscribe(&self, filter: &str, _qos: QoS, handler: MessageHandler) -> Result<()> {
        self.add_subscription(filter, handler)
    }

    async fn disconnect(&self) -> Result<()> {
        let mut inner = self.broker.lock();
        if inner.sessions.remove(&self.session).is_none() {
            return Err(Error::Transport("already disconnected".to_string()));
        }
        inner.journal.push(JournalEntry::Disconnected {
            client_id: self.client_id.clone(),
        });
        debug!(client_id = %self.client_id, "memory session disconnected");
        Ok(())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
