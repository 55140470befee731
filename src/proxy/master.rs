//! Master side of the tunnel.
//!
//! # Responsibilities
//! - Subscribe to the request and watch-request streams
//! - Run one supervised session per request against the upstream API server
//! - Publish the reply on `reply-<streamId>`: one message for plain calls,
//!   one per chunk plus a terminal message for watches
//!
//! # Design Decisions
//! - Every session ends with a message the worker can act on; failures
//!   publish the bare terminal chunk
//! - Delivery is at-least-once, so a stream id with a live session is ignored
//! - Sessions hold child tokens of the shutdown token and still publish their
//!   terminal message when cancelled

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::upstream::{collect_body, Upstream, UpstreamError, UpstreamResponse};
use crate::chunk::{frame_body, ChunkReassembler, ReassemblyStep, Termination, TERMINAL_CHUNK};
use crate::codec::{decode_with, ApiRequest, RequestLimits, ResponseHead};
use crate::config::TunnelConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::lifecycle::Shutdown;
use crate::observability::metrics::{self, ActiveSession};
use crate::transport::{ReceptionCallback, RequestWatch, TransportConnector, TransportMessage};

#[derive(Debug, Clone)]
pub struct MasterSettings {
    pub namespace: String,
    pub request_stream: String,
    pub watch_request_stream: String,
    pub watch_read_timeout: Duration,
    pub limits: RequestLimits,
}

impl MasterSettings {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            namespace: config.transport.namespace.clone(),
            request_stream: config.transport.request_stream.clone(),
            watch_request_stream: config.transport.watch_request_stream.clone(),
            watch_read_timeout: config.upstream.watch_read_timeout(),
            limits: config.listener.request_limits(),
        }
    }
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self::from_config(&TunnelConfig::default())
    }
}

/// Live sessions keyed by stream id.
#[derive(Default)]
pub struct SessionRegistry {
    live: DashMap<String, CancellationToken>,
}

impl SessionRegistry {
    /// Claim `stream_id`. `None` if a session for it is already running.
    pub fn try_start(
        self: &Arc<Self>,
        stream_id: &str,
        parent: &CancellationToken,
    ) -> Option<SessionHandle> {
        match self.live.entry(stream_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = parent.child_token();
                slot.insert(token.clone());
                Some(SessionHandle {
                    stream_id: stream_id.to_string(),
                    token,
                    registry: Arc::clone(self),
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Claim on one stream id, released on drop.
pub struct SessionHandle {
    stream_id: String,
    token: CancellationToken,
    registry: Arc<SessionRegistry>,
}

impl SessionHandle {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.live.remove(&self.stream_id);
    }
}

pub struct MasterProxy {
    connector: Arc<dyn TransportConnector>,
    upstream: Arc<dyn Upstream>,
    settings: MasterSettings,
    sessions: Arc<SessionRegistry>,
}

impl MasterProxy {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        upstream: Arc<dyn Upstream>,
        settings: MasterSettings,
    ) -> Self {
        Self {
            connector,
            upstream,
            settings,
            sessions: Arc::new(SessionRegistry::default()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    fn stream_name(&self, local: &str) -> String {
        self.connector
            .compose_stream_name(&self.settings.namespace, local)
    }

    /// Subscribe both request streams into one dispatch queue.
    pub async fn subscribe(&self) -> TunnelResult<mpsc::UnboundedReceiver<TransportMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: Arc<dyn ReceptionCallback> = Arc::new(tx);
        for local in [&self.settings.request_stream, &self.settings.watch_request_stream] {
            let stream = self.stream_name(local);
            self.connector
                .set_reception_callback(&stream, Arc::clone(&callback))
                .await?;
            tracing::info!(stream = %stream, "Subscribed");
        }
        Ok(rx)
    }

    /// Dispatch requests until shutdown or until the queue closes.
    pub async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<TransportMessage>,
        shutdown: Shutdown,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = inbox.recv() => next,
            };
            let Some(message) = next else { break };
            self.dispatch(message, &shutdown);
        }

        for local in [&self.settings.request_stream, &self.settings.watch_request_stream] {
            let stream = self.stream_name(local);
            if let Err(e) = self.connector.unsubscribe(&stream, false).await {
                tracing::warn!(stream = %stream, error = %e, "Unsubscribe failed");
            }
        }
        tracing::info!("Master dispatch loop stopped");
    }

    /// Start a session for `message` unless one is already running for it.
    pub fn dispatch(self: &Arc<Self>, message: TransportMessage, shutdown: &Shutdown) {
        if message.request_watch == RequestWatch::Empty && message.message_txt.is_empty() {
            tracing::debug!(stream_id = %message.stream_id, "Ignoring bootstrap message");
            return;
        }

        let Some(session) = self.sessions.try_start(&message.stream_id, shutdown.token()) else {
            tracing::warn!(stream_id = %message.stream_id, "Duplicate delivery ignored");
            return;
        };

        let master = Arc::clone(self);
        shutdown.spawn(async move { master.handle_session(message, session).await });
    }

    async fn handle_session(&self, message: TransportMessage, session: SessionHandle) {
        let _active = ActiveSession::start("master");
        let reply_stream = self.stream_name(&message.reply_stream_local());
        let stream_id = message.stream_id.as_str();
        let cancel = session.token();

        let request = match message
            .payload()
            .and_then(|raw| decode_with(&raw, &self.settings.limits)) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(stream_id, error = %e, "Undecodable request");
                metrics::record_request("master", "unknown", "malformed");
                self.publish_terminal(&reply_stream, stream_id, message.request_watch)
                    .await;
                return;
            }
        };

        let watch = message.is_watch() || request.is_watch();
        tracing::info!(
            stream_id,
            method = %request.method,
            path = %request.path,
            watch,
            "Session started"
        );

        if watch {
            let termination = self
                .relay_watch(&request, &reply_stream, stream_id, cancel)
                .await;
            metrics::record_watch_end(termination.as_str());
            metrics::record_request(
                "master",
                "watch",
                if termination.is_expected() { "ok" } else { "error" },
            );
            match &termination {
                Termination::Failed(cause) => {
                    tracing::warn!(stream_id, cause = %cause, "Watch ended with failure")
                }
                other => tracing::info!(stream_id, termination = other.as_str(), "Watch ended"),
            }
            return;
        }

        match self.relay_plain(&request, &reply_stream, stream_id, cancel).await {
            Ok(()) => {
                metrics::record_request("master", "plain", "ok");
                tracing::debug!(stream_id, "Session complete");
            }
            Err(e) => {
                let outcome = match &e {
                    TunnelError::UpstreamFailure(UpstreamError::Timeout) => {
                        "timeout"
                    }
                    TunnelError::Cancelled => "cancelled",
                    _ => "error",
                };
                metrics::record_request("master", "plain", outcome);
                tracing::warn!(stream_id, error = %e, "Plain request failed");
                self.publish_terminal(&reply_stream, stream_id, RequestWatch::No)
                    .await;
            }
        }
    }

    async fn relay_plain(
        &self,
        request: &ApiRequest,
        reply_stream: &str,
        stream_id: &str,
        cancel: &CancellationToken,
    ) -> TunnelResult<()> {
        let exchange = async {
            let UpstreamResponse { head, body } = self.upstream.execute(request, false).await?;
            let body = collect_body(body).await?;
            Ok::<_, TunnelError>(plain_reply(head, &request.method, &body))
        };

        let payload = tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            payload = exchange => payload?,
        };

        self.connector
            .sync_send(
                reply_stream,
                &TransportMessage::reply(stream_id, &payload, RequestWatch::No),
            )
            .await
    }

    async fn relay_watch(
        &self,
        request: &ApiRequest,
        reply_stream: &str,
        stream_id: &str,
        cancel: &CancellationToken,
    ) -> Termination {
        // The read timeout also bounds the wait for the response head.
        let response = tokio::select! {
            _ = cancel.cancelled() => None,
            response = tokio::time::timeout(
                self.settings.watch_read_timeout,
                self.upstream.execute(request, true),
            ) => Some(response.unwrap_or(Err(UpstreamError::Timeout))),
        };
        let UpstreamResponse { mut head, body } = match response {
            None => {
                self.publish_terminal(reply_stream, stream_id, RequestWatch::Yes)
                    .await;
                return Termination::Cancelled;
            }
            Some(Err(e)) => {
                self.publish_terminal(reply_stream, stream_id, RequestWatch::Yes)
                    .await;
                return match e {
                    UpstreamError::Timeout => Termination::Timeout,
                    UpstreamError::Gone => Termination::Gone,
                    other => Termination::Failed(other.to_string()),
                };
            }
            Some(Ok(response)) => response,
        };

        strip_hop_by_hop(&mut head);
        head.remove_header("content-length");
        if !head.is_chunked() {
            head.set_header("Transfer-Encoding", "chunked");
        }

        let mut reassembler =
            ChunkReassembler::new(&head, body, self.settings.watch_read_timeout);
        tracing::debug!(stream_id, status = head.status, mode = ?reassembler.mode(), "Relaying watch body");
        let termination = loop {
            match reassembler.next_step(cancel).await {
                ReassemblyStep::Chunk(frame) => {
                    let message = TransportMessage::reply(stream_id, &frame, RequestWatch::Yes);
                    if let Err(e) = self.connector.sync_send(reply_stream, &message).await {
                        break Termination::Failed(format!("publish: {e}"));
                    }
                    metrics::record_chunk_relayed();
                }
                ReassemblyStep::End(termination) => break termination,
            }
        };

        tracing::debug!(stream_id, frames = reassembler.frames(), "Watch body finished");
        let terminal = reassembler.terminal_payload();
        let message = TransportMessage::reply(stream_id, &terminal, RequestWatch::Yes);
        if let Err(e) = self.connector.sync_send(reply_stream, &message).await {
            tracing::warn!(stream_id, error = %e, "Failed to publish terminal chunk");
        }
        termination
    }

    async fn publish_terminal(&self, reply_stream: &str, stream_id: &str, watch: RequestWatch) {
        let message = TransportMessage::reply(stream_id, TERMINAL_CHUNK, watch);
        if let Err(e) = self.connector.sync_send(reply_stream, &message).await {
            tracing::warn!(stream_id, error = %e, "Failed to publish terminal chunk");
        }
    }
}

/// Upstream response headers that describe the master's own connection.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "trailer",
    "upgrade",
];

fn strip_hop_by_hop(head: &mut ResponseHead) {
    for name in HOP_BY_HOP_HEADERS {
        head.remove_header(name);
    }
}

/// Render a complete plain response the client can delimit on a
/// keep-alive connection.
pub fn plain_reply(mut head: ResponseHead, method: &str, body: &[u8]) -> Vec<u8> {
    strip_hop_by_hop(&mut head);
    let bodiless = method.eq_ignore_ascii_case("HEAD")
        || head.status < 200
        || head.status == 204
        || head.status == 304;

    if bodiless {
        head.remove_header("transfer-encoding");
        return head.to_bytes();
    }

    if head.header("content-length").is_some() {
        head.remove_header("transfer-encoding");
        let mut out = head.to_bytes();
        out.extend_from_slice(body);
        return out;
    }

    head.set_header("Transfer-Encoding", "chunked");
    let mut out = head.to_bytes();
    out.extend_from_slice(&frame_body(body));
    out
}
