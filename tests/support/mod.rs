//! Shared plumbing of the end-to-end tests: a scriptable in-process origin
//! server, a minimal raw HTTP client, recording filters/trackers and static
//! TLS material.

#![allow(dead_code)]

use interpose::filter::{HttpFilters, HttpFiltersSource};
use interpose::http::{Frame, LocalResponse, RequestFrame, RequestHead, ResponseFrame};
use interpose::tracker::FlowContext;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const CERT_PEM: &[u8] = include_bytes!("../fixtures/localhost.crt");
pub const KEY_PEM: &[u8] = include_bytes!("../fixtures/localhost.key");

/// What the origin should do with one received request.
pub struct OriginReply {
    pub bytes: Vec<u8>,
    pub close: bool,
    pub delay: Option<Duration>,
}

impl OriginReply {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            close: false,
            delay: None,
        }
    }

    pub fn closing(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            close: true,
            delay: None,
        }
    }

    /// Never answer; the connection just hangs.
    pub fn hang() -> Self {
        Self {
            bytes: Vec::new(),
            close: false,
            delay: Some(Duration::from_secs(3600)),
        }
    }
}

type OriginHandler = Arc<dyn Fn(&str) -> OriginReply + Send + Sync>;

/// A minimal scriptable HTTP origin server.
pub struct Origin {
    pub addr: SocketAddr,
    /// Raw request texts (head + body) in arrival order.
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl Origin {
    pub async fn start(handler: impl Fn(&str) -> OriginReply + Send + Sync + 'static) -> Self {
        Self::start_inner(Arc::new(handler), None).await
    }

    /// An origin that speaks TLS with the static test certificate.
    pub async fn start_tls(handler: impl Fn(&str) -> OriginReply + Send + Sync + 'static) -> Self {
        Self::start_inner(Arc::new(handler), Some(test_server_tls_config())).await
    }

    async fn start_inner(handler: OriginHandler, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
        let addr = listener.local_addr().expect("origin addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                let seen = seen.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        None => serve_connection(stream, handler, seen).await,
                        Some(config) => {
                            let acceptor = tokio_rustls::TlsAcceptor::from(config);
                            if let Ok(stream) = acceptor.accept(stream).await {
                                serve_connection(stream, handler, seen).await;
                            }
                        }
                    }
                });
            }
        });
        Self { addr, requests }
    }

    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("origin requests").clone()
    }
}

async fn serve_connection<S>(mut stream: S, handler: OriginHandler, seen: Arc<Mutex<Vec<String>>>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        // read one request: head plus a Content-Length body when present
        let head_end = loop {
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                break pos + 4;
            }
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let head_text = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let body_len = content_length_of(&head_text);
        while buf.len() < head_end + body_len {
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let request = String::from_utf8_lossy(&buf[..head_end + body_len]).to_string();
        buf.drain(..head_end + body_len);
        if let Ok(mut seen) = seen.lock() {
            seen.push(request.clone());
        }

        let reply = handler(&request);
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        if !reply.bytes.is_empty() && stream.write_all(&reply.bytes).await.is_err() {
            return;
        }
        let _ = stream.flush().await;
        if reply.close {
            return;
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length_of(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// A decoded response as seen by the raw test client.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Read only a response head (for CONNECT, whose 200 carries no body and
/// no framing headers). Returns the status code.
pub async fn read_head<S>(stream: &mut S) -> u16
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        if find_subslice(&buf, b"\r\n\r\n").is_some() {
            break;
        }
        let mut chunk = [0u8; 1024];
        match tokio::time::timeout(Duration::from_secs(10), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => panic!("connection closed before head"),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(err)) => panic!("read failed: {err}"),
        }
    }
    String::from_utf8_lossy(&buf)
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status line")
}

/// Send one raw request over a fresh connection and read one response.
pub async fn roundtrip(proxy: SocketAddr, request: &str) -> RawResponse {
    let mut stream = TcpStream::connect(proxy).await.expect("connect proxy");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");
    read_response(&mut stream, request.starts_with("HEAD ")).await
}

/// Read a single response from the stream, honoring its framing.
pub async fn read_response<S>(stream: &mut S, head_request: bool) -> RawResponse
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 4096];
        match tokio::time::timeout(Duration::from_secs(10), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => panic!("connection closed before response head"),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(err)) => panic!("read failed: {err}"),
        }
    };

    let head_text = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head_text.lines();
    let status: u16 = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status line");
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers
                .entry(name.trim().to_ascii_lowercase())
                .or_default()
                .push(value.trim().to_string());
        }
    }

    let mut rest = buf[head_end..].to_vec();
    let body = if head_request || status == 204 || status == 304 || (100..200).contains(&status) {
        Vec::new()
    } else if let Some(te) = headers.get("transfer-encoding")
        && te.iter().any(|v| v.eq_ignore_ascii_case("chunked"))
    {
        read_chunked_body(stream, &mut rest).await
    } else if let Some(len) = headers
        .get("content-length")
        .and_then(|v| v.first())
        .and_then(|v| v.parse::<usize>().ok())
    {
        while rest.len() < len {
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => rest.extend_from_slice(&chunk[..n]),
            }
        }
        rest.truncate(len);
        rest
    } else {
        // close-delimited
        loop {
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => rest.extend_from_slice(&chunk[..n]),
            }
        }
        rest
    };

    RawResponse {
        status,
        headers,
        body,
    }
}

async fn read_chunked_body<S>(stream: &mut S, buf: &mut Vec<u8>) -> Vec<u8>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(pos) = find_subslice(buf, b"\r\n") {
                break pos;
            }
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return body,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let size = usize::from_str_radix(
            String::from_utf8_lossy(&buf[..line_end]).trim(),
            16,
        )
        .unwrap_or(0);
        buf.drain(..line_end + 2);
        if size == 0 {
            return body;
        }
        while buf.len() < size + 2 {
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return body,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
    }
}

/// Filter hook names recorded in invocation order.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn log_event(log: &EventLog, event: impl Into<String>) {
    if let Ok(mut log) = log.lock() {
        log.push(event.into());
    }
}

pub fn events_of(log: &EventLog) -> Vec<String> {
    log.lock().expect("event log").clone()
}

/// Filters recording every hook invocation; optionally short-circuiting.
pub struct RecordingFilters {
    pub log: EventLog,
    pub short_circuit: Option<LocalResponse>,
}

impl HttpFilters for RecordingFilters {
    fn client_to_proxy_request(&mut self, frame: &mut RequestFrame) -> Option<LocalResponse> {
        match frame {
            Frame::Head(head) => log_event(
                &self.log,
                format!("clientToProxyRequest:{} {}", head.method, head.uri),
            ),
            Frame::Full { head, body, .. } => log_event(
                &self.log,
                format!(
                    "clientToProxyRequest:full:{} {}:{}",
                    head.method,
                    head.uri,
                    body.len()
                ),
            ),
            Frame::Data(data) => log_event(&self.log, format!("clientToProxyRequest:data:{}", data.len())),
            Frame::End(_) => log_event(&self.log, "clientToProxyRequest:end"),
        }
        self.short_circuit.take()
    }

    fn proxy_to_server_request(&mut self, frame: &mut RequestFrame) -> Option<LocalResponse> {
        if let Frame::Head(head) | Frame::Full { head, .. } = frame {
            log_event(&self.log, format!("proxyToServerRequest:{}", head.uri));
        }
        None
    }

    fn proxy_to_server_request_sending(&mut self) {
        log_event(&self.log, "proxyToServerRequestSending");
    }

    fn proxy_to_server_request_sent(&mut self) {
        log_event(&self.log, "proxyToServerRequestSent");
    }

    fn server_to_proxy_response(&mut self, frame: &mut ResponseFrame) {
        match frame {
            Frame::Head(head) => {
                log_event(&self.log, format!("serverToProxyResponse:{}", head.status))
            }
            Frame::Full { head, body, .. } => log_event(
                &self.log,
                format!("serverToProxyResponse:full:{}:{}", head.status, body.len()),
            ),
            Frame::Data(data) => {
                log_event(&self.log, format!("serverToProxyResponse:data:{}", data.len()))
            }
            Frame::End(_) => log_event(&self.log, "serverToProxyResponse:end"),
        }
    }

    fn proxy_to_client_response(&mut self, frame: &mut ResponseFrame) {
        match frame {
            Frame::Head(head) => {
                log_event(&self.log, format!("proxyToClientResponse:{}", head.status))
            }
            Frame::Full { head, body, .. } => log_event(
                &self.log,
                format!("proxyToClientResponse:full:{}:{}", head.status, body.len()),
            ),
            Frame::Data(data) => {
                log_event(&self.log, format!("proxyToClientResponse:data:{}", data.len()))
            }
            Frame::End(_) => log_event(&self.log, "proxyToClientResponse:end"),
        }
    }

    fn proxy_to_server_resolution_started(
        &mut self,
        host: &interpose::net::HostAndPort,
    ) -> Option<SocketAddr> {
        log_event(&self.log, format!("resolutionStarted:{host}"));
        None
    }

    fn proxy_to_server_resolution_succeeded(
        &mut self,
        _host: &interpose::net::HostAndPort,
        _address: SocketAddr,
    ) {
        log_event(&self.log, "resolutionSucceeded");
    }

    fn proxy_to_server_resolution_failed(&mut self, host: &interpose::net::HostAndPort) {
        log_event(&self.log, format!("resolutionFailed:{host}"));
    }

    fn proxy_to_server_connection_queued(&mut self) {
        log_event(&self.log, "connectionQueued");
    }

    fn proxy_to_server_connection_started(&mut self, _address: SocketAddr) {
        log_event(&self.log, "connectionStarted");
    }

    fn proxy_to_server_connection_ssl_handshake_started(&mut self) {
        log_event(&self.log, "sslHandshakeStarted");
    }

    fn proxy_to_server_connection_succeeded(&mut self) {
        log_event(&self.log, "connectionSucceeded");
    }

    fn proxy_to_server_connection_failed(&mut self) {
        log_event(&self.log, "connectionFailed");
    }

    fn server_to_proxy_response_timed_out(&mut self) {
        log_event(&self.log, "responseTimedOut");
    }

    fn server_to_proxy_response_receiving(&mut self) {
        log_event(&self.log, "responseReceiving");
    }

    fn server_to_proxy_response_received(&mut self) {
        log_event(&self.log, "responseReceived");
    }
}

/// Source handing out [`RecordingFilters`] and, optionally, buffer limits.
pub struct RecordingSource {
    pub log: EventLog,
    pub request_buffer: usize,
    pub response_buffer: usize,
    /// Short-circuit the next request with this response.
    pub short_circuit: Mutex<Option<LocalResponse>>,
    /// Record the worker thread name at binding time.
    pub thread_names: Arc<Mutex<Vec<String>>>,
}

impl RecordingSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(Mutex::new(Vec::new())),
            request_buffer: 0,
            response_buffer: 0,
            short_circuit: Mutex::new(None),
            thread_names: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn buffering(request: usize, response: usize) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(Mutex::new(Vec::new())),
            request_buffer: request,
            response_buffer: response,
            short_circuit: Mutex::new(None),
            thread_names: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn events(&self) -> Vec<String> {
        events_of(&self.log)
    }
}

impl HttpFiltersSource for RecordingSource {
    fn filter_request(&self, _request: &RequestHead, _flow: &FlowContext) -> Box<dyn HttpFilters> {
        if let Ok(mut names) = self.thread_names.lock() {
            names.push(
                std::thread::current()
                    .name()
                    .unwrap_or("unnamed")
                    .to_string(),
            );
        }
        let short_circuit = self.short_circuit.lock().ok().and_then(|mut s| s.take());
        Box::new(RecordingFilters {
            log: self.log.clone(),
            short_circuit,
        })
    }

    fn max_request_buffer_size(&self) -> usize {
        self.request_buffer
    }

    fn max_response_buffer_size(&self) -> usize {
        self.response_buffer
    }
}

// --- TLS material -----------------------------------------------------------

pub fn test_cert() -> CertificateDer<'static> {
    CertificateDer::from_pem_slice(CERT_PEM).expect("parse test certificate")
}

pub fn test_key() -> PrivateKeyDer<'static> {
    PrivateKeyDer::from_pem_slice(KEY_PEM).expect("parse test key")
}

pub fn test_server_tls_config() -> Arc<rustls::ServerConfig> {
    Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![test_cert()], test_key())
            .expect("server tls config"),
    )
}

/// A client TLS config that trusts any certificate; tests only.
pub fn trusting_client_tls_config() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustAnything))
            .with_no_client_auth(),
    )
}

#[derive(Debug)]
pub struct TrustAnything;

impl rustls::client::danger::ServerCertVerifier for TrustAnything {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// The MITM manager of the tests: impersonates every origin with the static
/// certificate and trusts whatever the origin presents.
#[derive(Debug)]
pub struct TestMitm;

impl interpose::tls::MitmManager for TestMitm {
    fn upstream_config(
        &self,
        _authority: &interpose::net::HostAndPort,
    ) -> Result<Arc<rustls::ClientConfig>, interpose::BoxError> {
        Ok(trusting_client_tls_config())
    }

    fn client_config(
        &self,
        _request: &RequestHead,
        _upstream: &interpose::tls::TlsInfo,
    ) -> Result<Arc<rustls::ServerConfig>, interpose::BoxError> {
        Ok(test_server_tls_config())
    }
}

/// Stop a proxy from inside an async test without blocking the runtime.
pub async fn stop_proxy(proxy: &interpose::ProxyServer, graceful: bool) {
    let proxy = proxy.clone();
    let _ = tokio::task::spawn_blocking(move || proxy.stop(graceful)).await;
}
