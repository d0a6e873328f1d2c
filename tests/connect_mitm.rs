//! CONNECT handling: opaque tunnels and MITM interception.

mod support;

use interpose::{ProxyConfig, ProxyServer};
use rustls_pki_types::ServerName;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use support::{
    Origin, OriginReply, RecordingSource, TestMitm, read_head, read_response, stop_proxy,
    trusting_client_tls_config,
};

#[tokio::test(flavor = "multi_thread")]
async fn connect_without_mitm_is_an_opaque_tunnel() {
    let origin = Origin::start_tls(|_| {
        OriginReply::closing(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nsecret!".to_vec())
    })
    .await;
    let source = RecordingSource::new();
    let proxy = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("tunnel")
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_filters_source(source.clone())
            .build()
            .unwrap(),
    )
    .unwrap();

    let mut stream = TcpStream::connect(proxy.address()).await.unwrap();
    stream
        .write_all(
            format!(
                "CONNECT {h} HTTP/1.1\r\nHost: {h}\r\n\r\n",
                h = origin.host()
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    assert_eq!(read_head(&mut stream).await, 200);

    // inside the tunnel the client talks TLS straight to the origin
    let connector = tokio_rustls::TlsConnector::from(trusting_client_tls_config());
    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(name, stream).await.unwrap();
    tls.write_all(b"GET /secret HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut tls, false).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "secret!");

    // the proxy saw the CONNECT, but nothing of the tunneled exchange
    let events = source.events();
    assert!(
        events
            .iter()
            .any(|e| e.starts_with("clientToProxyRequest:CONNECT"))
    );
    assert!(!events.iter().any(|e| e.contains("GET")));

    stop_proxy(&proxy, false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_with_mitm_exposes_the_decrypted_exchange() {
    let origin = Origin::start_tls(|_| {
        OriginReply::new(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nintercepted".to_vec())
    })
    .await;
    let source = RecordingSource::new();
    let proxy = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("mitm")
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_mitm_manager(Arc::new(TestMitm))
            .with_filters_source(source.clone())
            .build()
            .unwrap(),
    )
    .unwrap();

    let mut stream = TcpStream::connect(proxy.address()).await.unwrap();
    stream
        .write_all(
            format!(
                "CONNECT {h} HTTP/1.1\r\nHost: {h}\r\n\r\n",
                h = origin.host()
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    assert_eq!(read_head(&mut stream).await, 200);

    // the client's TLS peer is now the proxy, impersonating the origin
    let connector = tokio_rustls::TlsConnector::from(trusting_client_tls_config());
    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(name, stream).await.unwrap();
    tls.write_all(b"GET /data HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut tls, false).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "intercepted");

    let events = source.events();
    // the filter chain observed CONNECT first, then the plaintext GET
    let connect_at = events
        .iter()
        .position(|e| e.starts_with("clientToProxyRequest:CONNECT"))
        .expect("connect seen");
    let get_at = events
        .iter()
        .position(|e| e.starts_with("clientToProxyRequest:GET /data"))
        .expect("inner get seen");
    assert!(connect_at < get_at);

    // both response hooks saw exactly the bytes the client reconstructed
    let observed: usize = events
        .iter()
        .filter_map(|e| e.strip_prefix("serverToProxyResponse:data:"))
        .filter_map(|n| n.parse::<usize>().ok())
        .sum();
    assert_eq!(observed, response.body.len());
    let relayed: usize = events
        .iter()
        .filter_map(|e| e.strip_prefix("proxyToClientResponse:data:"))
        .filter_map(|n| n.parse::<usize>().ok())
        .sum();
    assert_eq!(relayed, response.body.len());

    stop_proxy(&proxy, false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mitm_keeps_serving_sequential_inner_requests() {
    let origin = Origin::start_tls(|request| {
        let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
        OriginReply::new(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                path.len(),
                path
            )
            .into_bytes(),
        )
    })
    .await;
    let proxy = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("mitm-keepalive")
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_mitm_manager(Arc::new(TestMitm))
            .build()
            .unwrap(),
    )
    .unwrap();

    let mut stream = TcpStream::connect(proxy.address()).await.unwrap();
    stream
        .write_all(
            format!(
                "CONNECT {h} HTTP/1.1\r\nHost: {h}\r\n\r\n",
                h = origin.host()
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    assert_eq!(read_head(&mut stream).await, 200);

    let connector = tokio_rustls::TlsConnector::from(trusting_client_tls_config());
    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(name, stream).await.unwrap();

    for path in ["/one", "/two"] {
        tls.write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let response = read_response(&mut tls, false).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body_text(), path);
    }
    assert_eq!(origin.requests().len(), 2);

    stop_proxy(&proxy, false).await;
}
