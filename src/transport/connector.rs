//! Pub/sub transport seam.
//!
//! The tunnel only needs topic-style publish and per-stream subscription.
//! A networked broker client implements `TransportConnector`; the crate ships
//! the in-process `MemoryConnector`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::message::TransportMessage;
use crate::config::TransportConfig;
use crate::error::TunnelResult;

/// Connection parameters handed to `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    pub address: String,
    pub application_id: String,
    pub namespace: String,
}

impl From<&TransportConfig> for TransportParams {
    fn from(config: &TransportConfig) -> Self {
        Self {
            address: config.address.clone(),
            application_id: config.application_id.clone(),
            namespace: config.namespace.clone(),
        }
    }
}

/// Receives every message delivered on one subscribed stream, in order.
pub trait ReceptionCallback: Send + Sync {
    fn received(&self, message: TransportMessage);
}

impl ReceptionCallback for mpsc::UnboundedSender<TransportMessage> {
    fn received(&self, message: TransportMessage) {
        if let Err(e) = self.send(message) {
            tracing::debug!(stream_id = %e.0.stream_id, "Receiver gone, message dropped");
        }
    }
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, params: &TransportParams) -> TunnelResult<()>;

    /// Drop every subscription and refuse further sends.
    async fn disconnect(&self) -> TunnelResult<()>;

    /// Full stream name for a local name within `namespace`.
    fn compose_stream_name(&self, namespace: &str, local: &str) -> String {
        compose_stream_name(namespace, local)
    }

    /// Subscribe `stream`, replacing any earlier callback for it.
    async fn set_reception_callback(
        &self,
        stream: &str,
        callback: Arc<dyn ReceptionCallback>,
    ) -> TunnelResult<()>;

    /// Stop delivery on `stream`. With `stop` set, messages already queued
    /// for the callback are discarded too.
    async fn unsubscribe(&self, stream: &str, stop: bool) -> TunnelResult<()>;

    /// Publish and return once the broker has accepted the message.
    async fn sync_send(&self, stream: &str, message: &TransportMessage) -> TunnelResult<()>;

    /// Publish without reporting delivery failures to the caller.
    async fn async_send(&self, stream: &str, message: &TransportMessage) -> TunnelResult<()>;
}

pub fn compose_stream_name(namespace: &str, local: &str) -> String {
    if namespace.is_empty() {
        local.to_string()
    } else {
        format!("{namespace}/{local}")
    }
}
