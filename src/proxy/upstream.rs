//! Upstream API server client.
//!
//! # Responsibilities
//! - Forward a decoded `ApiRequest` to the real API server
//! - Hand back the response head and a body stream that the master either
//!   collects (plain) or relays incrementally (watch)
//!
//! # Design Decisions
//! - `Upstream` is the seam: tests and alternative backends implement it
//! - Plain calls carry a whole-exchange timeout; watch calls do not, the
//!   reassembler applies a per-read timeout instead
//! - HTTP/1.1 only, so watch bodies arrive with chunked framing semantics

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use thiserror::Error;

use crate::codec::{ApiRequest, ResponseHead};
use crate::config::UpstreamConfig;

/// Client headers that never travel upstream.
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream timed out")]
    Timeout,

    #[error("resource version gone (410)")]
    Gone,

    #[error("request failed: {0}")]
    Request(String),

    #[error("body read failed: {0}")]
    Body(String),

    #[error("client misconfigured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_body() || e.is_decode() {
            UpstreamError::Body(e.to_string())
        } else {
            UpstreamError::Request(e.to_string())
        }
    }
}

/// Response body as a stream of raw byte blocks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

pub struct UpstreamResponse {
    pub head: ResponseHead,
    pub body: BodyStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Issue `request`. When `watch` is set the body is left open for streaming.
    async fn execute(
        &self,
        request: &ApiRequest,
        watch: bool,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

/// `reqwest` client bound to one API server.
#[derive(Debug, Clone)]
pub struct ApiServerClient {
    base: String,
    bearer_token: Option<String>,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl ApiServerClient {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        url::Url::parse(&config.server_address).map_err(|e| {
            UpstreamError::Config(format!(
                "invalid server address {}: {e}",
                config.server_address
            ))
        })?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .http1_only()
            .connect_timeout(config.connect_timeout())
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                UpstreamError::Config(format!("reading CA bundle {}: {e}", path.display()))
            })?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| UpstreamError::Config(format!("parsing CA bundle: {e}")))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        if let (Some(cert_path), Some(key_path)) =
            (&config.client_cert_path, &config.client_key_path)
        {
            let mut pem = std::fs::read(cert_path).map_err(|e| {
                UpstreamError::Config(format!("reading client cert {}: {e}", cert_path.display()))
            })?;
            let key = std::fs::read(key_path).map_err(|e| {
                UpstreamError::Config(format!("reading client key {}: {e}", key_path.display()))
            })?;
            pem.push(b'\n');
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| UpstreamError::Config(format!("parsing client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        if config.insecure_skip_verify {
            tracing::warn!(
                server = %config.server_address,
                "TLS verification of the API server is disabled"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| UpstreamError::Config(e.to_string()))?;

        Ok(Self {
            base: config.server_address.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            request_timeout: config.request_timeout(),
            client,
        })
    }

    /// Full URL for a request target; any path prefix on the base is kept.
    pub fn url_for(&self, path: &str) -> Result<url::Url, UpstreamError> {
        let target = if path.starts_with('/') {
            format!("{}{}", self.base, path)
        } else {
            format!("{}/{}", self.base, path)
        };
        url::Url::parse(&target)
            .map_err(|e| UpstreamError::Request(format!("invalid target {target}: {e}")))
    }
}

#[async_trait]
impl Upstream for ApiServerClient {
    async fn execute(
        &self,
        request: &ApiRequest,
        watch: bool,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| UpstreamError::Request(format!("unsupported method {}", request.method)))?;
        let url = self.url_for(&request.path)?;

        let mut builder = self.client.request(method, url);
        for (name, value) in forwardable_headers(&request.headers, self.bearer_token.is_some()) {
            builder = builder.header(name, value);
        }
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        if !watch {
            builder = builder.timeout(self.request_timeout);
        }

        let response = builder.send().await?;

        let status = response.status();
        let mut head = ResponseHead::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
        );
        head.protocol = request.protocol.clone();
        for (name, value) in response.headers() {
            head.headers.push((
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(UpstreamError::from));

        Ok(UpstreamResponse {
            head,
            body: Box::pin(body),
        })
    }
}

/// Client headers that may be forwarded upstream.
pub fn forwardable_headers<'a>(
    headers: &'a [(String, String)],
    replace_authorization: bool,
) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    headers.iter().filter_map(move |(name, value)| {
        let lower = name.to_ascii_lowercase();
        if SKIPPED_HEADERS.contains(&lower.as_str())
            || (replace_authorization && lower == "authorization")
        {
            None
        } else {
            Some((name.as_str(), value.as_str()))
        }
    })
}

/// Collect a whole body into memory.
pub async fn collect_body(mut body: BodyStream) -> Result<Vec<u8>, UpstreamError> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config_for(address: &str) -> UpstreamConfig {
        UpstreamConfig {
            server_address: address.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_header_filtering() {
        let headers = vec![
            ("Host".to_string(), "localhost:8091".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
            ("Content-Length".to_string(), "2".to_string()),
            ("Authorization".to_string(), "Bearer client".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
        ];

        let kept: Vec<_> = forwardable_headers(&headers, false).map(|(k, _)| k).collect();
        assert_eq!(kept, vec!["Accept", "Authorization"]);

        let kept: Vec<_> = forwardable_headers(&headers, true).map(|(k, _)| k).collect();
        assert_eq!(kept, vec!["Accept"]);
    }

    #[test]
    fn test_url_keeps_base_prefix() {
        let client =
            ApiServerClient::from_config(&config_for("https://rancher.local/k8s/clusters/c-1/"))
                .unwrap();
        let url = client.url_for("/api/v1/pods?watch=true").unwrap();
        assert_eq!(
            url.as_str(),
            "https://rancher.local/k8s/clusters/c-1/api/v1/pods?watch=true"
        );
    }

    #[test]
    fn test_invalid_base() {
        let err = ApiServerClient::from_config(&config_for("not a url")).unwrap_err();
        assert!(matches!(err, UpstreamError::Config(_)));
    }

    #[test]
    fn test_missing_ca_bundle() {
        let mut config = config_for("https://127.0.0.1:6443");
        config.ca_cert_path = Some("/nonexistent/ca.pem".into());
        let err = ApiServerClient::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("CA bundle"));
    }

    #[tokio::test]
    async fn test_execute_against_raw_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("GET /api/v1/namespaces HTTP/1.1\r\n"));
            assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}")
                .await
                .unwrap();
        });

        let mut config = config_for(&format!("http://{addr}"));
        config.bearer_token = Some("secret".into());
        let client = ApiServerClient::from_config(&config).unwrap();

        let request = ApiRequest::new("GET", "/api/v1/namespaces")
            .with_header("Authorization", "Bearer client")
            .with_header("Host", "localhost");
        let response = client.execute(&request, false).await.unwrap();
        assert_eq!(response.head.status, 200);
        assert_eq!(response.head.reason, "OK");
        assert_eq!(response.head.header("content-type"), Some("application/json"));

        let body = collect_body(response.body).await.unwrap();
        assert_eq!(body, b"{}");
    }
}
