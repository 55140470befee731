//! Shared utilities for end-to-end tunnel tests.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use kube_tunnel::lifecycle::startup::{start_master, start_worker};
use kube_tunnel::proxy::ApiServerClient;
use kube_tunnel::transport::{MemoryBroker, MemoryConnector, TransportConnector, TransportParams};
use kube_tunnel::{Shutdown, TunnelConfig, WorkerProxy};

/// What the mock API server sends for one request.
#[allow(dead_code)]
pub enum Reply {
    /// Plain response with a Content-Length.
    Fixed { status: u16, body: String },
    /// Chunked watch body, one chunk per line.
    Watch { lines: Vec<String>, hang: bool },
}

/// Start a mock API server; `handler` maps the request target to a reply.
pub async fn start_api_server<F>(handler: F) -> SocketAddr
where
    F: Fn(&str) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let Some(target) = read_request_target(&mut socket).await else {
                    return;
                };
                match handler(&target) {
                    Reply::Fixed { status, body } => {
                        let response = format!(
                            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            reason(status),
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    }
                    Reply::Watch { lines, hang } => {
                        let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n";
                        if socket.write_all(head.as_bytes()).await.is_err() {
                            return;
                        }
                        for line in lines {
                            let chunk = format!("{:x}\r\n{}\r\n", line.len(), line);
                            if socket.write_all(chunk.as_bytes()).await.is_err() {
                                return;
                            }
                            let _ = socket.flush().await;
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                        if hang {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        } else {
                            let _ = socket.write_all(b"0\r\n\r\n").await;
                            let _ = socket.shutdown().await;
                        }
                    }
                }
            });
        }
    });

    addr
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        410 => "Gone",
        _ => "Unknown",
    }
}

async fn read_request_target(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match socket.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => buf.push(byte[0]),
        }
    }
    let head = String::from_utf8_lossy(&buf).into_owned();
    head.lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .map(str::to_string)
}

/// Worker and master wired through one in-process broker.
pub struct Tunnel {
    pub worker_addr: SocketAddr,
    pub worker: Arc<WorkerProxy>,
    pub shutdown: Shutdown,
    markers: PathBuf,
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shutdown.trigger();
        let _ = std::fs::remove_dir_all(&self.markers);
    }
}

static TUNNEL_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Config pointing at `api`, with short timeouts and private marker files.
pub fn test_config(api: SocketAddr) -> (TunnelConfig, PathBuf) {
    let dir = std::env::temp_dir().join(format!(
        "kube-tunnel-it-{}-{}",
        std::process::id(),
        TUNNEL_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();

    let mut config = TunnelConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.server_address = format!("http://{api}");
    config.upstream.watch_read_timeout_ms = 300;
    config.relay.poll_interval_ms = 20;
    config.relay.first_reply_max_polls = 250;
    config.relay.watch_idle_max_polls = 250;
    config.control.stop_marker = dir.join("EndClientRun.k8s");
    config.control.worker_ready_marker = dir.join("ClientReady.k8s");
    config.control.master_ready_marker = dir.join("ServerReady.k8s");
    (config, dir)
}

/// Start both sides of the tunnel in front of the mock API server at `api`.
#[allow(dead_code)]
pub async fn start_tunnel(api: SocketAddr) -> Tunnel {
    let (config, dir) = test_config(api);
    start_tunnel_with(config, dir).await
}

/// Start both sides of the tunnel from a prepared config.
#[allow(dead_code)]
pub async fn start_tunnel_with(config: TunnelConfig, dir: PathBuf) -> Tunnel {
    let shutdown = Shutdown::new();
    let broker = MemoryBroker::new();
    let params = TransportParams::from(&config.transport);

    let master_side: Arc<dyn TransportConnector> =
        Arc::new(MemoryConnector::new(Arc::clone(&broker)));
    master_side.connect(&params).await.unwrap();
    let upstream = Arc::new(ApiServerClient::from_config(&config.upstream).unwrap());
    start_master(&config, master_side, upstream, &shutdown)
        .await
        .unwrap();

    let worker_side: Arc<dyn TransportConnector> =
        Arc::new(MemoryConnector::new(Arc::clone(&broker)));
    worker_side.connect(&params).await.unwrap();
    let running = start_worker(&config, worker_side, &shutdown).await.unwrap();

    Tunnel {
        worker_addr: running.local_addr,
        worker: running.worker,
        shutdown,
        markers: dir,
    }
}

/// Read one response whose body is delimited by Content-Length.
#[allow(dead_code)]
pub async fn read_fixed_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_eq!(n, 1, "connection closed inside the response head");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .expect("response has a content-length");
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.unwrap();
    (head, body)
}

/// Read until the worker closes the connection.
#[allow(dead_code)]
pub async fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out))
        .await
        .expect("worker closed the connection in time")
        .unwrap();
    out
}
