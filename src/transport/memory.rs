//! In-process pub/sub broker.
//!
//! Messages cross the broker as JSON bytes, the same shape a networked
//! broker would carry. Each subscription owns one delivery task, so order is
//! preserved per stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connector::{ReceptionCallback, TransportConnector, TransportParams};
use super::message::TransportMessage;
use crate::error::{TunnelError, TunnelResult};

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Topic fan-out shared by every connector attached to it.
#[derive(Default)]
pub struct MemoryBroker {
    topics: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver `payload` to every current subscriber of `topic`.
    /// Returns how many subscribers received it.
    pub fn publish(&self, topic: &str, payload: Bytes) -> usize {
        match self.topics.get_mut(topic) {
            Some(mut subscribers) => {
                subscribers.retain(|s| s.tx.send(payload.clone()).is_ok());
                subscribers.len()
            }
            None => 0,
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    fn subscribe(&self, topic: &str) -> (u64, mpsc::UnboundedReceiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    fn remove(&self, topic: &str, id: u64) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|s| s.id != id);
        }
        self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
    }
}

struct Subscription {
    id: u64,
    cancel: CancellationToken,
}

/// `TransportConnector` over a `MemoryBroker`.
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
    connected: AtomicBool,
    subscriptions: DashMap<String, Subscription>,
    tracker: TaskTracker,
}

impl MemoryConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
            subscriptions: DashMap::new(),
            tracker: TaskTracker::new(),
        }
    }

    #[cfg(test)]
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    #[cfg(test)]
    pub fn is_subscribed(&self, stream: &str) -> bool {
        self.subscriptions.contains_key(stream)
    }

    #[cfg(test)]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn ensure_connected(&self) -> TunnelResult<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TunnelError::TransportFailure("not connected".into()))
        }
    }

    fn drop_subscription(&self, stream: &str, stop: bool) -> bool {
        match self.subscriptions.remove(stream) {
            Some((_, sub)) => {
                self.broker.remove(stream, sub.id);
                if stop {
                    sub.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, params: &TransportParams) -> TunnelResult<()> {
        self.connected.store(true, Ordering::Release);
        self.tracker.reopen();
        tracing::info!(
            address = %params.address,
            application_id = %params.application_id,
            namespace = %params.namespace,
            "Transport connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> TunnelResult<()> {
        self.connected.store(false, Ordering::Release);
        let streams: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for stream in streams {
            self.drop_subscription(&stream, true);
        }
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Transport disconnected");
        Ok(())
    }

    async fn set_reception_callback(
        &self,
        stream: &str,
        callback: Arc<dyn ReceptionCallback>,
    ) -> TunnelResult<()> {
        self.ensure_connected()?;
        self.drop_subscription(stream, true);

        let (id, mut rx) = self.broker.subscribe(stream);
        let cancel = CancellationToken::new();
        self.subscriptions.insert(
            stream.to_string(),
            Subscription {
                id,
                cancel: cancel.clone(),
            },
        );

        let name = stream.to_string();
        self.tracker.spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = rx.recv() => next,
                };
                let Some(bytes) = next else { break };
                match TransportMessage::from_json(&bytes) {
                    Ok(message) => callback.received(message),
                    Err(e) => tracing::warn!(stream = %name, error = %e, "Dropping undecodable message"),
                }
            }
            tracing::trace!(stream = %name, "Delivery task finished");
        });
        Ok(())
    }

    async fn unsubscribe(&self, stream: &str, stop: bool) -> TunnelResult<()> {
        if !self.drop_subscription(stream, stop) {
            tracing::debug!(stream, "Unsubscribe for unknown stream");
        }
        Ok(())
    }

    async fn sync_send(&self, stream: &str, message: &TransportMessage) -> TunnelResult<()> {
        self.ensure_connected()?;
        let payload = Bytes::from(message.to_json()?);
        let reached = self.broker.publish(stream, payload);
        if reached == 0 {
            tracing::debug!(stream, stream_id = %message.stream_id, "Published with no subscribers");
        }
        Ok(())
    }

    async fn async_send(&self, stream: &str, message: &TransportMessage) -> TunnelResult<()> {
        if let Err(e) = self.sync_send(stream, message).await {
            tracing::warn!(stream, stream_id = %message.stream_id, error = %e, "Asynchronous publish failed");
        }
        Ok(())
    }
}
