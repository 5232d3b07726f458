//! Pub/sub transport boundary.
//!
//! The agent treats the transport as a black box offering publish, subscribe
//! (resolving once the subscription is acknowledged) and disconnect, plus a
//! stream of connection events. Inbound messages are delivered to the handler
//! registered with the matching subscription, in order per connection.
//!
//! Two implementations ship with the crate: [`memory`] (in-process loopback
//! broker, used by the simulator and tests) and [`mqtt`] (rumqttc).

pub mod memory;
pub mod mqtt;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::Result;

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// An inbound message.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Callback invoked on the transport's delivery context for each inbound message.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Interrupted { reason: String },
    /// Connection re-established. When `session_present` is false the broker
    /// forgot our subscriptions and the transport has re-issued them.
    Resumed { session_present: bool },
}

pub trait Transport: Send + Sync + 'static {
    /// Publish a payload. Resolves once the transport has taken the message.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Subscribe `handler` to `filter`. Resolves once the subscription is acknowledged.
    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> impl Future<Output = Result<()>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Find every handler whose filter matches `topic`.
pub(crate) fn handlers_for<'a>(
    subscriptions: &'a [(String, MessageHandler)],
    topic: &'a str,
) -> impl Iterator<Item = MessageHandler> + 'a {
    subscriptions
        .iter()
        .filter(move |(filter, _)| crate::topics::matches(filter, topic))
        .map(|(_, handler)| Arc::clone(handler))
}
