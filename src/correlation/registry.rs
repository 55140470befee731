//! Stream id to pending-exchange registry.
//!
//! # Responsibilities
//! - Hand out one ordered reply queue per outstanding stream id
//! - Route messages from transport callbacks into the matching queue
//! - Drop the queue on every exit path of the waiting exchange
//!
//! # Design Decisions
//! - Registration goes through the `DashMap` entry API so a duplicate id is
//!   rejected atomically
//! - `CorrelationEntry` releases itself on drop; callers never deregister by hand
//! - Unmatched replies are counted and logged, never buffered

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::{TunnelError, TunnelResult};
use crate::observability::metrics;
use crate::transport::{ReceptionCallback, TransportMessage};

#[derive(Default)]
pub struct CorrelationRegistry {
    pending: DashMap<String, mpsc::UnboundedSender<TransportMessage>>,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a reply queue for `stream_id`.
    pub fn register(self: &Arc<Self>, stream_id: &str) -> TunnelResult<CorrelationEntry> {
        match self.pending.entry(stream_id.to_string()) {
            Entry::Occupied(_) => Err(TunnelError::DuplicateStream(stream_id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(tx);
                Ok(CorrelationEntry {
                    stream_id: stream_id.to_string(),
                    rx,
                    registry: Arc::clone(self),
                })
            }
        }
    }

    /// Queue `message` for whoever registered its stream id.
    pub fn deliver(&self, message: TransportMessage) -> TunnelResult<()> {
        let Some(tx) = self.pending.get(&message.stream_id) else {
            metrics::record_correlation_miss();
            return Err(TunnelError::CorrelationMiss(message.stream_id));
        };
        tx.send(message).map_err(|e| {
            metrics::record_correlation_miss();
            TunnelError::CorrelationMiss(e.0.stream_id)
        })
    }

    /// Forget `stream_id`. Returns whether it was registered.
    pub fn release(&self, stream_id: &str) -> bool {
        self.pending.remove(stream_id).is_some()
    }

    #[cfg(test)]
    pub fn contains(&self, stream_id: &str) -> bool {
        self.pending.contains_key(stream_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl ReceptionCallback for CorrelationRegistry {
    fn received(&self, message: TransportMessage) {
        if let Err(e) = self.deliver(message) {
            tracing::debug!(error = %e, "Dropping unmatched reply");
        }
    }
}

/// The receiving half of one outstanding exchange.
pub struct CorrelationEntry {
    stream_id: String,
    rx: mpsc::UnboundedReceiver<TransportMessage>,
    registry: Arc<CorrelationRegistry>,
}

impl CorrelationEntry {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Wait for the next message, polling in `poll` slices.
    ///
    /// Gives up with `Timeout` after `max_polls` consecutive empty slices.
    pub async fn recv_with_liveness(
        &mut self,
        poll: Duration,
        max_polls: u32,
    ) -> TunnelResult<TransportMessage> {
        for _ in 0..max_polls {
            match tokio::time::timeout(poll, self.rx.recv()).await {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => {
                    return Err(TunnelError::TransportFailure(format!(
                        "reply queue for {} closed",
                        self.stream_id
                    )))
                }
                Err(_) => continue,
            }
        }
        Err(TunnelError::Timeout(max_polls))
    }
}

impl Drop for CorrelationEntry {
    fn drop(&mut self) {
        self.registry.release(&self.stream_id);
    }
}
