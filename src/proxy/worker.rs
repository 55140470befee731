//! Worker side of the tunnel.
//!
//! # Responsibilities
//! - Accept local API clients (plain TCP or TLS)
//! - Publish each request on the request or watch-request stream
//! - Write replies back verbatim, keeping plain connections alive and
//!   closing watch connections once the chunked body completes
//!
//! # Connection States
//! ```text
//! AwaitRequest → RequestSent → AwaitReply ─┬─ plain ──→ AwaitRequest
//!                                          └─ watch ──→ Relaying → Closed
//! ```
//!
//! # Design Decisions
//! - One outstanding request per connection
//! - The reply stream is subscribed before the request is published and is
//!   always unsubscribed, on every exit path
//! - Liveness is counted in empty poll cycles, separately for the first
//!   reply and for gaps between watch payloads

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::chunk::{ChunkDecoder, DecodeProgress, TERMINAL_CHUNK};
use crate::codec::{read_request, ApiRequest, RequestLimits};
use crate::config::TunnelConfig;
use crate::correlation::CorrelationRegistry;
use crate::error::{TunnelError, TunnelResult};
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionId, ConnectionTracker};
use crate::net::listener::{Listener, ListenerError};
use crate::observability::metrics::{self, ActiveSession};
use crate::transport::{ReceptionCallback, TransportConnector, TransportMessage};

/// Per-connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    AwaitRequest,
    RequestSent,
    AwaitReply,
    Relaying,
    Closed,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub namespace: String,
    pub request_stream: String,
    pub watch_request_stream: String,
    pub poll_interval: Duration,
    pub first_reply_max_polls: u32,
    pub watch_idle_max_polls: u32,
    pub limits: RequestLimits,
}

impl WorkerSettings {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            namespace: config.transport.namespace.clone(),
            request_stream: config.transport.request_stream.clone(),
            watch_request_stream: config.transport.watch_request_stream.clone(),
            poll_interval: config.relay.poll_interval(),
            first_reply_max_polls: config.relay.first_reply_max_polls,
            watch_idle_max_polls: config.relay.watch_idle_max_polls,
            limits: config.listener.request_limits(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&TunnelConfig::default())
    }
}

pub struct WorkerProxy {
    connector: Arc<dyn TransportConnector>,
    registry: Arc<CorrelationRegistry>,
    settings: WorkerSettings,
    connections: ConnectionTracker,
}

impl WorkerProxy {
    pub fn new(connector: Arc<dyn TransportConnector>, settings: WorkerSettings) -> Self {
        Self {
            connector,
            registry: CorrelationRegistry::new(),
            settings,
            connections: ConnectionTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    pub fn active_connections(&self) -> u64 {
        self.connections.active_count()
    }

    /// Accept connections until shutdown, one supervised task per connection.
    pub async fn serve(
        self: Arc<Self>,
        listener: Listener,
        tls: Option<TlsAcceptor>,
        shutdown: Shutdown,
    ) -> Result<(), ListenerError> {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let worker = Arc::clone(&self);
            let tls = tls.clone();
            let cancel = shutdown.child_token();
            shutdown.spawn(async move {
                let _permit = permit;
                let guard = worker.connections.track();
                let id = guard.id();
                tracing::debug!(connection_id = %id, peer_addr = %peer, "Client connected");

                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => worker.handle_connection(tls_stream, id, cancel).await,
                        Err(e) => {
                            tracing::warn!(connection_id = %id, error = %e, "TLS handshake failed")
                        }
                    },
                    None => worker.handle_connection(stream, id, cancel).await,
                }
            });
        }

        tracing::info!(
            open_connections = self.active_connections(),
            "Worker stopped accepting connections"
        );
        Ok(())
    }

    /// Drive one client connection until it closes.
    pub async fn handle_connection<S>(&self, stream: S, id: ConnectionId, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut state = WorkerState::AwaitRequest;

        while state == WorkerState::AwaitRequest {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = read_request(&mut reader, &self.settings.limits) => read,
            };

            let request = match read {
                Ok(Some(request)) => request,
                Ok(None) => {
                    tracing::debug!(connection_id = %id, "Client closed connection");
                    break;
                }
                Err(e) if e.is_disconnect() => break,
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "Unreadable request");
                    metrics::record_request("worker", "unknown", "malformed");
                    break;
                }
            };

            state = match self.exchange(&request, &mut writer, id, &cancel).await {
                Ok(next) => next,
                Err(e) if e.is_disconnect() => {
                    tracing::debug!(connection_id = %id, "Client went away mid-exchange");
                    WorkerState::Closed
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %id,
                        method = %request.method,
                        path = %request.path,
                        error = %e,
                        "Exchange failed"
                    );
                    WorkerState::Closed
                }
            };
        }

        let _ = writer.shutdown().await;
        tracing::trace!(connection_id = %id, "Connection closed");
    }

    /// Run one request through the tunnel and write its reply.
    ///
    /// Returns the state the connection moves to afterwards.
    async fn exchange<W>(
        &self,
        request: &ApiRequest,
        writer: &mut W,
        id: ConnectionId,
        cancel: &CancellationToken,
    ) -> TunnelResult<WorkerState>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let watch = request.is_watch();
        let kind = if watch { "watch" } else { "plain" };
        let _active = ActiveSession::start("worker");

        let message = TransportMessage::for_request(request);
        let stream_id = message.stream_id.clone();
        let mut entry = self.registry.register(&stream_id)?;

        let reply_stream = self
            .connector
            .compose_stream_name(&self.settings.namespace, &message.reply_stream_local());
        let callback: Arc<dyn ReceptionCallback> = self.registry.clone();
        self.connector
            .set_reception_callback(&reply_stream, callback)
            .await?;
        let subscription = ReplySubscription::new(Arc::clone(&self.connector), reply_stream);

        let target = if watch {
            &self.settings.watch_request_stream
        } else {
            &self.settings.request_stream
        };
        let target = self
            .connector
            .compose_stream_name(&self.settings.namespace, target);
        self.connector.sync_send(&target, &message).await?;

        tracing::debug!(
            connection_id = %id,
            stream_id = %stream_id,
            method = %request.method,
            path = %request.path,
            state = ?WorkerState::RequestSent,
            "Request published"
        );

        let poll = self.settings.poll_interval;
        let first = tokio::select! {
            _ = cancel.cancelled() => {
                subscription.close().await;
                return Ok(WorkerState::Closed);
            }
            first = entry.recv_with_liveness(poll, self.settings.first_reply_max_polls) => first,
        };
        let first = match first {
            Ok(message) => message,
            Err(TunnelError::Timeout(polls)) => {
                tracing::warn!(
                    connection_id = %id,
                    stream_id = %stream_id,
                    polls,
                    state = ?WorkerState::AwaitReply,
                    "No reply before liveness guard expired"
                );
                metrics::record_request("worker", kind, "timeout");
                subscription.close().await;
                return Ok(WorkerState::Closed);
            }
            Err(e) => return Err(e),
        };

        let payload = first.payload()?;
        if payload == TERMINAL_CHUNK {
            // Master failed before producing a response head.
            tracing::debug!(stream_id = %stream_id, "Empty reply, closing connection");
            metrics::record_request("worker", kind, "upstream_error");
            subscription.close().await;
            return Ok(WorkerState::Closed);
        }

        if !watch {
            writer.write_all(&payload).await?;
            writer.flush().await?;
            metrics::record_request("worker", kind, "ok");
            subscription.close().await;

            let close_requested = request
                .header("connection")
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false);
            return Ok(if close_requested {
                WorkerState::Closed
            } else {
                WorkerState::AwaitRequest
            });
        }

        tracing::debug!(stream_id = %stream_id, state = ?WorkerState::Relaying, "Relaying watch");
        let mut decoder = ChunkDecoder::with_head();
        let mut payload = payload;
        loop {
            writer.write_all(&payload).await?;
            writer.flush().await?;

            match decoder.feed(&payload) {
                Ok(DecodeProgress::Complete) => {
                    tracing::debug!(
                        stream_id = %stream_id,
                        chunks = decoder.chunks(),
                        "Watch relay complete"
                    );
                    metrics::record_request("worker", kind, "ok");
                    break;
                }
                Ok(DecodeProgress::Partial) => {}
                Err(e) => {
                    tracing::warn!(stream_id = %stream_id, error = %e, "Malformed chunk stream");
                    metrics::record_request("worker", kind, "malformed");
                    break;
                }
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    end_watch(writer, &decoder).await;
                    break;
                }
                next = entry.recv_with_liveness(poll, self.settings.watch_idle_max_polls) => next,
            };
            match next {
                Ok(message) => payload = message.payload()?,
                Err(TunnelError::Timeout(polls)) => {
                    tracing::info!(
                        stream_id = %stream_id,
                        polls,
                        "Watch idle guard expired"
                    );
                    metrics::record_request("worker", kind, "timeout");
                    end_watch(writer, &decoder).await;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        subscription.close().await;
        Ok(WorkerState::Closed)
    }
}

/// Best-effort terminal chunk so the client sees a complete body.
async fn end_watch<W>(writer: &mut W, decoder: &ChunkDecoder)
where
    W: AsyncWrite + Unpin + Send,
{
    if decoder.head_pending() {
        tracing::debug!("No response head written, closing without terminal chunk");
        return;
    }
    if decoder.at_chunk_boundary() {
        if writer.write_all(TERMINAL_CHUNK).await.is_ok() {
            let _ = writer.flush().await;
        }
    }
}

/// Reply-stream subscription that is dropped with the exchange.
struct ReplySubscription {
    connector: Arc<dyn TransportConnector>,
    stream: String,
    closed: bool,
}

impl ReplySubscription {
    fn new(connector: Arc<dyn TransportConnector>, stream: String) -> Self {
        Self {
            connector,
            stream,
            closed: false,
        }
    }

    async fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.connector.unsubscribe(&self.stream, true).await {
            tracing::warn!(stream = %self.stream, error = %e, "Unsubscribe failed");
        }
    }
}

impl Drop for ReplySubscription {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let connector = Arc::clone(&self.connector);
        let stream = std::mem::take(&mut self.stream);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = connector.unsubscribe(&stream, true).await {
                    tracing::warn!(stream = %stream, error = %e, "Unsubscribe failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, MemoryConnector, RequestWatch, TransportParams};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::mpsc;

    struct Harness {
        worker: Arc<WorkerProxy>,
        master_side: Arc<MemoryConnector>,
        requests: mpsc::UnboundedReceiver<TransportMessage>,
        watches: mpsc::UnboundedReceiver<TransportMessage>,
    }

    fn params() -> TransportParams {
        TransportParams {
            address: "memory://test".into(),
            application_id: "test".into(),
            namespace: String::new(),
        }
    }

    async fn harness(settings: WorkerSettings) -> Harness {
        let broker = MemoryBroker::new();
        let worker_side = Arc::new(MemoryConnector::new(broker.clone()));
        worker_side.connect(&params()).await.unwrap();
        let master_side = Arc::new(MemoryConnector::new(broker));
        master_side.connect(&params()).await.unwrap();

        let (tx, requests) = mpsc::unbounded_channel();
        master_side
            .set_reception_callback("request", Arc::new(tx))
            .await
            .unwrap();
        let (tx, watches) = mpsc::unbounded_channel();
        master_side
            .set_reception_callback("watchRequest", Arc::new(tx))
            .await
            .unwrap();

        Harness {
            worker: Arc::new(WorkerProxy::new(worker_side, settings)),
            master_side,
            requests,
            watches,
        }
    }

    fn fast_settings() -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(10),
            first_reply_max_polls: 50,
            watch_idle_max_polls: 50,
            ..Default::default()
        }
    }

    fn spawn_connection(worker: &Arc<WorkerProxy>) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let worker = Arc::clone(worker);
        tokio::spawn(async move {
            worker
                .handle_connection(server, ConnectionId::new(), CancellationToken::new())
                .await
        });
        client
    }

    async fn reply(h: &Harness, to: &TransportMessage, payload: &[u8], watch: RequestWatch) {
        h.master_side
            .sync_send(
                &to.reply_stream_local(),
                &TransportMessage::reply(&to.stream_id, payload, watch),
            )
            .await
            .unwrap();
    }

    async fn read_exactly(client: &mut DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_plain_reply_keeps_connection() {
        let mut h = harness(fast_settings()).await;
        let mut client = spawn_connection(&h.worker);

        client
            .write_all(b"GET /api/v1/namespaces HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let published = h.requests.recv().await.unwrap();
        assert_eq!(published.request_watch, RequestWatch::No);

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}";
        reply(&h, &published, response, RequestWatch::No).await;
        assert_eq!(read_exactly(&mut client, response.len()).await, response);

        // second request on the same connection
        client
            .write_all(b"GET /version HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let second = h.requests.recv().await.unwrap();
        assert_ne!(second.stream_id, published.stream_id);
        reply(&h, &second, response, RequestWatch::No).await;
        assert_eq!(read_exactly(&mut client, response.len()).await, response);
    }

    #[tokio::test]
    async fn test_watch_relay_until_terminal() {
        let mut h = harness(fast_settings()).await;
        let mut client = spawn_connection(&h.worker);

        client
            .write_all(b"GET /api/v1/pods?watch=true HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let published = h.watches.recv().await.unwrap();
        assert!(published.is_watch());

        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        let mut first = head.clone();
        first.extend_from_slice(b"5\r\n0\r\n\r\n\r\n");
        reply(&h, &published, &first, RequestWatch::Yes).await;
        reply(&h, &published, b"3\r\nabc\r\n", RequestWatch::Yes).await;
        reply(&h, &published, TERMINAL_CHUNK, RequestWatch::Yes).await;

        let mut all = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut all))
            .await
            .unwrap()
            .unwrap();
        let mut expected = first;
        expected.extend_from_slice(b"3\r\nabc\r\n");
        expected.extend_from_slice(TERMINAL_CHUNK);
        assert_eq!(all, expected);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.worker.registry().is_empty());
        assert_eq!(h.master_side.broker().subscriber_count(&published.reply_stream_local()), 0);
    }

    #[tokio::test]
    async fn test_bare_terminal_closes_without_writing() {
        let mut h = harness(fast_settings()).await;
        let mut client = spawn_connection(&h.worker);

        client
            .write_all(b"GET /api/v1/pods HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let published = h.requests.recv().await.unwrap();
        reply(&h, &published, TERMINAL_CHUNK, RequestWatch::No).await;

        let mut all = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut all))
            .await
            .unwrap()
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_first_reply_guard_closes() {
        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(5),
            first_reply_max_polls: 3,
            ..Default::default()
        };
        let h = harness(settings).await;
        let mut client = spawn_connection(&h.worker);

        client
            .write_all(b"GET /api/v1/pods HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut all = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut all))
            .await
            .unwrap()
            .unwrap();
        assert!(all.is_empty());
        assert!(h.worker.registry().is_empty());
    }

    #[tokio::test]
    async fn test_watch_idle_guard_writes_terminal() {
        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(5),
            first_reply_max_polls: 200,
            watch_idle_max_polls: 4,
            ..Default::default()
        };
        let mut h = harness(settings).await;
        let mut client = spawn_connection(&h.worker);

        client
            .write_all(b"GET /api/v1/pods?watch=true HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let published = h.watches.recv().await.unwrap();
        let first = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\n{}\r\n";
        reply(&h, &published, first, RequestWatch::Yes).await;

        let mut all = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut all))
            .await
            .unwrap()
            .unwrap();
        assert!(all.ends_with(b"2\r\n{}\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_oversized_body_closes_without_publishing() {
        let mut h = harness(fast_settings()).await;
        let mut client = spawn_connection(&h.worker);
        client
            .write_all(b"POST /api/v1/namespaces HTTP/1.1\r\nContent-Length: 100000000000000\r\n\r\nabc")
            .await
            .unwrap();

        let mut all = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut all))
            .await
            .unwrap()
            .unwrap();
        assert!(all.is_empty());
        assert!(h.requests.try_recv().is_err());

        // The worker keeps serving other connections.
        let mut next = spawn_connection(&h.worker);
        next.write_all(b"GET /version HTTP/1.1\r\n\r\n").await.unwrap();
        let published = h.requests.recv().await.unwrap();
        assert!(published.stream_id.starts_with("k8s-"));
    }

    #[tokio::test]
    async fn test_malformed_request_closes() {
        let h = harness(fast_settings()).await;
        let mut client = spawn_connection(&h.worker);
        client.write_all(b"this is not http\r\n\r\n").await.unwrap();

        let mut all = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut all))
            .await
            .unwrap()
            .unwrap();
        assert!(all.is_empty());
    }
}
