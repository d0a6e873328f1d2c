//! Worker-pool behavior, cloning and shutdown semantics.

mod support;

use interpose::{ProxyConfig, ProxyServer, ThreadPoolConfig};
use std::time::Duration;
use support::{Origin, OriginReply, RecordingSource, roundtrip, stop_proxy};

#[tokio::test(flavor = "multi_thread")]
async fn single_threaded_pool_runs_all_filters_on_one_worker() {
    let origin = Origin::start(|_| {
        OriginReply::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec())
    })
    .await;
    let source = RecordingSource::new();
    let proxy = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("singlepool")
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_thread_pool_config(ThreadPoolConfig::single_threaded())
            .with_filters_source(source.clone())
            .build()
            .unwrap(),
    )
    .unwrap();

    for _ in 0..2 {
        let response = roundtrip(
            proxy.address(),
            &format!(
                "GET http://{h}/ HTTP/1.1\r\nHost: {h}\r\n\r\n",
                h = origin.host()
            ),
        )
        .await;
        assert_eq!(response.status, 200);
    }

    let names = source.thread_names.lock().unwrap().clone();
    assert_eq!(names.len(), 2);
    assert_eq!(names[0], names[1]);
    assert!(
        names[0].starts_with("singlepool-client-worker-"),
        "unexpected worker thread name: {}",
        names[0]
    );

    stop_proxy(&proxy, false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn clone_survives_aborting_the_original()  {
    let origin = Origin::start(|_| {
        OriginReply::new(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nalive".to_vec())
    })
    .await;
    let original = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("clonetest")
            .with_address("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap(),
    )
    .unwrap();
    let clone = original.try_clone().unwrap();
    assert_eq!(clone.address().port(), original.address().port() + 1);

    // the clone is an independent instance on the shared worker pools
    let response = roundtrip(
        clone.address(),
        &format!(
            "GET http://{h}/ HTTP/1.1\r\nHost: {h}\r\n\r\n",
            h = origin.host()
        ),
    )
    .await;
    assert_eq!(response.status, 200);

    stop_proxy(&original, false).await;
    assert!(original.is_stopped());
    assert!(!clone.server_group().is_stopped());

    // aborting the original leaves the clone serving
    let response = roundtrip(
        clone.address(),
        &format!(
            "GET http://{h}/ HTTP/1.1\r\nHost: {h}\r\n\r\n",
            h = origin.host()
        ),
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "alive");

    stop_proxy(&clone, false).await;
    assert!(clone.server_group().is_stopped());
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_stop_drains_the_inflight_exchange() {
    let origin = Origin::start(|_| OriginReply {
        bytes: b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\ndrained".to_vec(),
        close: false,
        delay: Some(Duration::from_millis(500)),
    })
    .await;
    let proxy = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("graceful")
            .with_address("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap(),
    )
    .unwrap();

    let address = proxy.address();
    let host = origin.host();
    let inflight = tokio::spawn(async move {
        roundtrip(
            address,
            &format!("GET http://{host}/slow HTTP/1.1\r\nHost: {host}\r\n\r\n"),
        )
        .await
    });

    // let the request reach the origin, then stop gracefully
    tokio::time::sleep(Duration::from_millis(150)).await;
    stop_proxy(&proxy, true).await;
    assert!(proxy.is_stopped());

    let response = inflight.await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "drained");

    // nothing is accepted anymore
    let refused = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(proxy.address()),
    )
    .await;
    match refused {
        Ok(Ok(mut stream)) => {
            use tokio::io::AsyncReadExt;
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or(0);
            assert_eq!(n, 0, "stopped proxy still talking");
        }
        Ok(Err(_)) | Err(_) => {}
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn throttle_rates_are_adjustable_at_runtime() {
    let origin = Origin::start(|_| {
        OriginReply::new(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec())
    })
    .await;
    let proxy = ProxyServer::start(
        ProxyConfig::builder()
            .with_name("throttled")
            .with_address("127.0.0.1:0".parse().unwrap())
            .with_throttling(64 * 1024, 64 * 1024)
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

    proxy.set_throttle(0, 0);
    let response = roundtrip(
        proxy.address(),
        &format!(
            "GET http://{h}/ HTTP/1.1\r\nHost: {h}\r\n\r\n",
            h = origin.host()
        ),
    )
    .await;
    assert_eq!(response.status, 200);

    stop_proxy(&proxy, false).await;
}
