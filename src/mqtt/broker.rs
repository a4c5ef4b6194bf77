use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::MessageHandler;
use crate::error::BrokerError;

/// Pause between reconnect attempts after the event loop reports an error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Publish side of an MQTT broker as the bridge sees it.
#[async_trait]
pub trait LocalBroker: Send + Sync {
    /// Replace the retained value of `topic`. Publishing the same payload
    /// twice leaves the broker in the same state.
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Fire-and-forget message, not retained.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
}

// ---------------------------------------------------------------------------
// In-memory latest-value store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

#[derive(Debug, Default)]
struct RetainedInner {
    latest: BTreeMap<String, Vec<u8>>,
    history: Vec<Published>,
    subscriptions: BTreeSet<String>,
}

/// Broker that keeps the latest retained value per topic in memory and logs
/// every publish. Used wherever a real connection is not wanted.
#[derive(Debug, Clone, Default)]
pub struct RetainedStore {
    inner: Arc<Mutex<RetainedInner>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RetainedInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Latest retained payload for `topic`.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.lock().latest.get(topic).cloned()
    }

    /// Latest retained payload for `topic`, decoded as JSON.
    pub fn retained_json(&self, topic: &str) -> Option<serde_json::Value> {
        self.retained(topic)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    /// Every publish in order, retained or not.
    pub fn history(&self) -> Vec<Published> {
        self.lock().history.clone()
    }

    /// Payloads published to `topic`, oldest first.
    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock()
            .history
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.iter().cloned().collect()
    }
}

#[async_trait]
impl LocalBroker for RetainedStore {
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        inner.latest.insert(topic.to_owned(), payload.clone());
        inner.history.push(Published {
            topic: topic.to_owned(),
            payload,
            retained: true,
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.lock().history.push(Published {
            topic: topic.to_owned(),
            payload,
            retained: false,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.lock().subscriptions.insert(topic.to_owned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// rumqttc-backed broker connection
// ---------------------------------------------------------------------------

/// One MQTT connection. Remembers its subscriptions so they can be replayed
/// after every reconnect.
pub struct MqttBroker {
    name: String,
    client: AsyncClient,
    subscriptions: Mutex<BTreeSet<String>>,
    connected: watch::Sender<bool>,
}

impl MqttBroker {
    /// Create the client. Nothing is sent until [`MqttBroker::run`] polls the
    /// returned event loop.
    pub fn new(name: impl Into<String>, options: MqttOptions) -> (Arc<Self>, EventLoop) {
        let (client, eventloop) = AsyncClient::new(options, 100);
        let (connected, _) = watch::channel(false);
        let broker = Arc::new(Self {
            name: name.into(),
            client,
            subscriptions: Mutex::new(BTreeSet::new()),
            connected,
        });
        (broker, eventloop)
    }

    /// Wait until the first CONNACK, or fail after `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), BrokerError> {
        let mut rx = self.connected.subscribe();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|up| *up)).await,
            Ok(Ok(_))
        );
        if connected {
            Ok(())
        } else {
            Err(BrokerError::ConnectTimeout)
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(broker = %self.name, error = %e, "Disconnect request failed");
        }
    }

    fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn resubscribe(&self) {
        for topic in self.subscribed_topics() {
            if let Err(e) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
                warn!(broker = %self.name, topic = %topic, error = %e, "Resubscribe failed");
            }
        }
    }

    /// Drive the connection until `shutdown` fires, handing every incoming
    /// publish to `handler`. Connection errors are logged and retried.
    pub async fn run(
        self: Arc<Self>,
        mut eventloop: EventLoop,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) {
        info!(broker = %self.name, "MQTT event loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(broker = %self.name, "shutdown signal received");
                    self.disconnect().await;
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        spawn_handler(&handler, publish.topic, publish.payload.to_vec());
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(broker = %self.name, "Connected to MQTT broker");
                        self.connected.send_replace(true);
                        self.resubscribe().await;
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!(broker = %self.name, "subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.connected.send_replace(false);
                        error!(broker = %self.name, error = %e, "MQTT connection error");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
        }

        info!(broker = %self.name, "MQTT event loop stopped");
    }
}

/// Run `handler` on its own task so slow cloud round-trips never stall the
/// event loop's keep-alive.
fn spawn_handler(
    handler: &Arc<dyn MessageHandler>,
    topic: String,
    payload: Vec<u8>,
) -> JoinHandle<()> {
    let handler = handler.clone();
    tokio::spawn(async move { handler.handle(&topic, &payload).await })
}

#[async_trait]
impl LocalBroker for MqttBroker {
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.insert(topic.to_owned());
        }
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        debug!(broker = %self.name, topic = %topic, "Subscribed");
        Ok(())
    }
}
