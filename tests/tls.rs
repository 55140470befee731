//! Worker listener over TLS.

use std::net::SocketAddr;

mod common;
use common::Reply;

use kube_tunnel::config::schema::TlsConfig;

#[tokio::test]
async fn test_plain_get_over_tls() {
    let api = common::start_api_server(|target| Reply::Fixed {
        status: 200,
        body: format!("{{\"path\":\"{target}\"}}"),
    })
    .await;

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = certified.cert.pem();

    let (mut config, dir) = common::test_config(api);
    let cert_path = dir.join("server.crt");
    let key_path = dir.join("server.key");
    std::fs::write(&cert_path, &cert_pem).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
    config.listener.tls = Some(TlsConfig {
        cert_path: cert_path.display().to_string(),
        key_path: key_path.display().to_string(),
    });

    let tunnel = common::start_tunnel_with(config, dir).await;
    let worker: SocketAddr = tunnel.worker_addr;

    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(reqwest::Certificate::from_pem(cert_pem.as_bytes()).unwrap())
        .resolve("localhost", worker)
        .build()
        .unwrap();

    let url = format!("https://localhost:{}/api/v1/namespaces", worker.port());
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.text().await.unwrap(),
        "{\"path\":\"/api/v1/namespaces\"}"
    );

    // A plaintext client cannot complete an exchange with the TLS listener.
    let plain = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/api/v1/namespaces", worker.port());
    assert!(plain.get(&url).send().await.is_err());
}
