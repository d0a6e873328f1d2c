//! Chained-proxy iteration and fallback.

mod support;

use interpose::chain::{ChainCandidate, ChainedProxy, ChainedProxyManager};
use interpose::http::RequestHead;
use interpose::tracker::FlowContext;
use interpose::{ProxyConfig, ProxyError, ProxyServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use support::{Origin, OriginReply, RecordingSource, roundtrip, stop_proxy};

struct Hop {
    addr: SocketAddr,
    failed: AtomicUsize,
    succeeded: AtomicUsize,
}

impl Hop {
    fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            failed: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
        })
    }
}

impl ChainedProxy for Hop {
    fn chained_proxy_address(&self) -> SocketAddr {
        self.addr
    }

    fn connection_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_failed(&self, _error: &ProxyError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

struct StaticChain {
    candidates: Vec<ChainCandidate>,
}

impl ChainedProxyManager for StaticChain {
    fn lookup(&self, _request: &RequestHead, _flow: &FlowContext) -> Vec<ChainCandidate> {
        self.candidates.clone()
    }
}

/// A port that refuses connections: bind, snapshot, drop.
async fn dead_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn candidates_are_tried_in_order_until_one_succeeds() {
    let origin = Origin::start(|_| {
        OriginReply::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec())
    })
    .await;

    // the working candidate is a second proxy instance acting as the hop
    let hop_proxy = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("chain-hop")
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_proxy_alias("hop-alias")
            .build()
            .unwrap(),
    )
    .unwrap();

    let dead_a = Hop::new(dead_port().await);
    let dead_b = Hop::new(dead_port().await);
    let live = Hop::new(hop_proxy.address());
    let source = RecordingSource::new();
    let proxy = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("chain-front")
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_proxy_alias("front-alias")
            .with_chain_proxy_manager(Arc::new(StaticChain {
                candidates: vec![
                    ChainCandidate::Proxied(dead_a.clone()),
                    ChainCandidate::Proxied(dead_b.clone()),
                    ChainCandidate::Proxied(live.clone()),
                ],
            }))
            .with_filters_source(source.clone())
            .build()
            .unwrap(),
    )
    .unwrap();

    let response = roundtrip(
        proxy.address(),
        &format!(
            "GET http://{h}/ HTTP/1.1\r\nHost: {h}\r\n\r\n",
            h = origin.host()
        ),
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "ok");

    // one failure per refused candidate, one success on the live one
    assert_eq!(dead_a.failed.load(Ordering::SeqCst), 1);
    assert_eq!(dead_b.failed.load(Ordering::SeqCst), 1);
    assert_eq!(live.failed.load(Ordering::SeqCst), 0);
    assert_eq!(live.succeeded.load(Ordering::SeqCst), 1);
    let events = source.events();
    assert_eq!(
        events.iter().filter(|e| *e == "connectionFailed").count(),
        2
    );
    assert_eq!(
        events.iter().filter(|e| *e == "connectionSucceeded").count(),
        1
    );

    // both hops stamped Via on the way to the origin
    let requests = origin.requests();
    assert_eq!(requests.len(), 1);
    let seen = requests[0].to_ascii_lowercase();
    assert!(seen.contains("via: 1.1 front-alias"));
    assert!(seen.contains("via: 1.1 hop-alias"));

    stop_proxy(&proxy, false).await;
    stop_proxy(&hop_proxy, false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn chain_falls_back_to_direct() {
    let origin = Origin::start(|_| {
        OriginReply::new(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\ndirect".to_vec())
    })
    .await;
    let dead = Hop::new(dead_port().await);
    let source = RecordingSource::new();
    let proxy = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("chain-fallback")
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_chain_proxy_manager(Arc::new(StaticChain {
                candidates: vec![
                    ChainCandidate::Proxied(dead.clone()),
                    ChainCandidate::Direct,
                ],
            }))
            .with_filters_source(source.clone())
            .build()
            .unwrap(),
    )
    .unwrap();

    let response = roundtrip(
        proxy.address(),
        &format!(
            "GET http://{h}/ HTTP/1.1\r\nHost: {h}\r\n\r\n",
            h = origin.host()
        ),
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "direct");
    assert_eq!(dead.failed.load(Ordering::SeqCst), 1);

    stop_proxy(&proxy, false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_chain_yields_502() {
    let dead_a = Hop::new(dead_port().await);
    let dead_b = Hop::new(dead_port().await);
    let proxy = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("chain-exhausted")
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_chain_proxy_manager(Arc::new(StaticChain {
                candidates: vec![
                    ChainCandidate::Proxied(dead_a.clone()),
                    ChainCandidate::Proxied(dead_b.clone()),
                ],
            }))
            .build()
            .unwrap(),
    )
    .unwrap();

    let response = roundtrip(
        proxy.address(),
        "GET http://192.0.2.1:9/ HTTP/1.1\r\nHost: 192.0.2.1:9\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 502);
    assert_eq!(dead_a.failed.load(Ordering::SeqCst), 1);
    assert_eq!(dead_b.failed.load(Ordering::SeqCst), 1);

    stop_proxy(&proxy, false).await;
}
