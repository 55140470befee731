//! End-to-end watch relay tests.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use kube_tunnel::chunk::{frame_body, ChunkDecoder, DecodeProgress};

mod common;
use common::Reply;

fn event(n: usize) -> String {
    format!("{{\"type\":\"ADDED\",\"object\":{{\"metadata\":{{\"name\":\"pod-{n}\"}}}}}}\n")
}

async fn watch(addr: std::net::SocketAddr, target: &str) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .await
        .unwrap();
    common::read_until_close(&mut client).await
}

fn decode(received: &[u8]) -> ChunkDecoder {
    let mut decoder = ChunkDecoder::with_head();
    let progress = decoder.feed(received).unwrap();
    assert_eq!(progress, DecodeProgress::Complete);
    decoder
}

#[tokio::test]
async fn test_watch_read_timeout_ends_with_terminal() {
    let api = common::start_api_server(|_| Reply::Watch {
        lines: (1..=3).map(event).collect(),
        hang: true,
    })
    .await;
    let tunnel = common::start_tunnel(api).await;

    let received = watch(tunnel.worker_addr, "/api/v1/pods?watch=true").await;
    let text = String::from_utf8_lossy(&received);

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.to_ascii_lowercase().contains("transfer-encoding: chunked"));
    assert!(!text.to_ascii_lowercase().contains("content-length"));
    for n in 1..=3 {
        let line = event(n);
        assert!(text.contains(&format!("{:x}\r\n{}\r\n", line.len(), line)));
    }
    assert!(received.ends_with(b"0\r\n\r\n"));
    assert_eq!(decode(&received).chunks(), 3);
}

#[tokio::test]
async fn test_watch_upstream_eof_relays_every_event() {
    let api = common::start_api_server(|_| Reply::Watch {
        lines: (1..=5).map(event).collect(),
        hang: false,
    })
    .await;
    let tunnel = common::start_tunnel(api).await;

    let received = watch(
        tunnel.worker_addr,
        "/api/v1/namespaces/default/pods?labelSelector=app%3Dweb&watch=true",
    )
    .await;

    assert_eq!(decode(&received).chunks(), 5);
    let text = String::from_utf8_lossy(&received);
    for n in 1..=5 {
        assert!(text.contains(&format!("pod-{n}")));
    }
}

#[tokio::test]
async fn test_watch_gone_status_is_relayed() {
    let api = common::start_api_server(|_| Reply::Fixed {
        status: 410,
        body: "{\"kind\":\"Status\",\"reason\":\"Expired\",\"code\":410}".into(),
    })
    .await;
    let tunnel = common::start_tunnel(api).await;

    let received = watch(
        tunnel.worker_addr,
        "/api/v1/pods?resourceVersion=1&watch=true",
    )
    .await;

    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 410 Gone\r\n"));
    assert!(text.contains("\"code\":410"));
    assert_eq!(decode(&received).chunks(), 1);
}

#[test]
fn test_framed_plain_body() {
    assert_eq!(frame_body(b"{\"a\":1}"), b"7\r\n{\"a\":1}\r\n0\r\n\r\n");
    assert_eq!(frame_body(b""), b"0\r\n\r\n");
}

#[tokio::test]
async fn test_http_client_reads_watch_and_plain_responses() {
    let api = common::start_api_server(|target| {
        if target.contains("watch=true") {
            Reply::Watch {
                lines: (1..=4).map(event).collect(),
                hang: false,
            }
        } else {
            Reply::Fixed {
                status: 200,
                body: format!("{{\"path\":\"{target}\"}}"),
            }
        }
    })
    .await;
    let tunnel = common::start_tunnel(api).await;
    let base = format!("http://{}", tunnel.worker_addr);
    let client = reqwest::Client::new();

    // Two plain requests on one pooled client share a keep-alive connection.
    for path in ["/api/v1/namespaces", "/version"] {
        let response = client.get(format!("{base}{path}")).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.text().await.unwrap(),
            format!("{{\"path\":\"{path}\"}}")
        );
    }

    // The watch goes last; the worker closes the connection after it.
    let response = client
        .get(format!("{base}/api/v1/pods?watch=true"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    let expected: String = (1..=4).map(event).collect();
    assert_eq!(body, expected);
}
