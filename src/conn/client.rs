//! The client-to-proxy half: request parsing, the authentication gate,
//! filter dispatch, CONNECT negotiation (tunnel and MITM), response
//! delivery and keep-alive bookkeeping.
//!
//! One invocation of [`run`] owns one accepted client socket for its whole
//! life. Requests are handled strictly in arrival order; the upstream
//! connections the requests needed are kept in a per-connection reuse map
//! keyed by `host:port`, so no cross-task synchronization exists anywhere
//! on the hot path.

use super::upstream::{self, Upstream};
use super::{ConnectionState, ExchangeEnd, StateMachine};
use crate::config::ClientSecurity;
use crate::error::ProxyError;
use crate::filter::HttpFilters;
use crate::http::codec::ServerCodec;
use crate::http::frame::{Frame, LocalResponse, RequestFrame, RequestHead, ResponseHead};
use crate::http::headers::{
    self as headers, BodyKind, append_via, request_wants_keep_alive, response_keep_alive,
    rewrite_absolute_to_origin_form, strip_hop_by_hop,
};
use crate::net::HostAndPort;
use crate::server::ProxyCore;
use crate::shaper::throttled::Throttled;
use crate::stream::{BoxedStream, ByteSink, IdleMeter, Instrumented, Prefixed};
use crate::tracker::FlowContext;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderValue, Method, StatusCode, Version, header};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_graceful::ShutdownGuard;
use tokio_util::codec::Framed;

type ClientFramed = Framed<BoxedStream, ServerCodec>;

/// Drive one accepted client connection to completion.
pub(crate) async fn run(
    core: Arc<ProxyCore>,
    guard: ShutdownGuard,
    mut abort: watch::Receiver<bool>,
    tcp: TcpStream,
    peer: SocketAddr,
    connection_id: u64,
) {
    let mut flow = FlowContext {
        client_address: peer,
        client_tls: None,
        connection_id,
    };
    core.each_tracker(|t| t.client_connected(&flow));

    let meter = IdleMeter::new();
    let stream = instrument_client_stream(&core, &flow, &meter, tcp);

    let (stream, proxied_for) = match accept_proxy_protocol(&core, stream).await {
        Ok(accepted) => accepted,
        Err(err) => {
            tracing::debug!(connection = connection_id, "dropping client: {err}");
            core.each_tracker(|t| t.client_disconnected(&flow));
            return;
        }
    };
    if let Some(source) = proxied_for {
        tracing::trace!(
            connection = connection_id,
            "proxy protocol header names original client {source}"
        );
        flow.client_address = source;
    }

    let stream = match accept_client_tls(&core, &mut flow, stream).await {
        Ok(stream) => stream,
        Err(err) => {
            // no HTTP response on a client-leg TLS failure, just a reset
            tracing::debug!(connection = connection_id, "client tls failed: {err}");
            core.each_tracker(|t| t.client_disconnected(&flow));
            return;
        }
    };

    let mut client: ClientFramed = Framed::new(stream, ServerCodec::new(core.config.limits));
    let mut session = Session {
        core: core.clone(),
        flow: flow.clone(),
        meter,
        upstreams: HashMap::new(),
        mitm_authority: None,
        connecting_servers: 0,
        reused_server_connections: 0,
        state: StateMachine::new(connection_id, "client-to-proxy", ConnectionState::AwaitingInitial),
    };

    loop {
        let frame = tokio::select! {
            frame = client.next() => frame,
            () = session.meter.idle(core.config.idle_connection_timeout) => {
                tracing::debug!(connection = connection_id, "closing idle client connection");
                break;
            }
            () = guard.cancelled() => break,
            _ = abort.changed() => break,
        };

        let head = match frame {
            None => break,
            Some(Ok(Frame::Head(head))) => head,
            Some(Ok(_)) => {
                tracing::debug!(connection = connection_id, "unexpected frame between requests");
                break;
            }
            Some(Err(err)) => {
                session.state.transition(ConnectionState::DisconnectRequested);
                session.respond_with_error(&mut client, &err).await;
                break;
            }
        };

        let outcome = {
            let exchange = session.handle_exchange(&mut client, head);
            tokio::pin!(exchange);
            tokio::select! {
                outcome = &mut exchange => Some(outcome),
                _ = abort.changed() => None,
            }
        };
        let Some(outcome) = outcome else { break };

        match outcome {
            Ok(ExchangeEnd::KeepAlive) => {}
            Ok(ExchangeEnd::Close) => break,
            Err(err) => {
                let closes = err.closes_client_connection();
                if closes {
                    session.state.transition(ConnectionState::DisconnectRequested);
                }
                session.respond_with_error(&mut client, &err).await;
                if closes {
                    break;
                }
            }
        }
        session.state.transition(ConnectionState::AwaitingInitial);
    }

    session.state.transition(ConnectionState::Disconnected);
    core.each_tracker(|t| t.client_disconnected(&session.flow));
    tracing::debug!(
        connection = connection_id,
        state = %session.state.current(),
        reused = session.reused_server_connections,
        "client connection closed"
    );
}

fn instrument_client_stream(
    core: &Arc<ProxyCore>,
    flow: &FlowContext,
    meter: &Arc<IdleMeter>,
    tcp: TcpStream,
) -> BoxedStream {
    let trackers = core.trackers.clone();
    let f = flow.clone();
    let on_read: ByteSink = Arc::new(move |n| {
        for tracker in trackers.iter() {
            tracker.bytes_received_from_client(&f, n);
        }
    });
    let trackers = core.trackers.clone();
    let f = flow.clone();
    let on_write: ByteSink = Arc::new(move |n| {
        for tracker in trackers.iter() {
            tracker.bytes_sent_to_client(&f, n);
        }
    });
    Box::new(Instrumented::new(
        Throttled::new(tcp, core.shaper.clone()),
        meter.clone(),
        on_read,
        on_write,
    ))
}

/// Consume the mandatory PROXY protocol header when configured to.
async fn accept_proxy_protocol(
    core: &Arc<ProxyCore>,
    mut stream: BoxedStream,
) -> Result<(BoxedStream, Option<SocketAddr>), ProxyError> {
    if !core.config.accept_proxy_protocol {
        return Ok((stream, None));
    }
    let mut buf = BytesMut::with_capacity(256);
    loop {
        match crate::haproxy::parse(&buf) {
            Ok(crate::haproxy::Parsed::Complete { header, consumed }) => {
                let _ = buf.split_to(consumed);
                let source = match header {
                    crate::haproxy::ProxyHeader::Tcp { source, .. } => Some(source),
                    crate::haproxy::ProxyHeader::Unknown => None,
                };
                let stream: BoxedStream = Box::new(Prefixed::new(buf.freeze(), stream));
                return Ok((stream, source));
            }
            Ok(crate::haproxy::Parsed::Partial) => {}
            Err(err) => {
                return Err(ProxyError::ClientProtocol(err.to_string()));
            }
        }
        let n = bounded(core.config.idle_connection_timeout, stream.read_buf(&mut buf))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        if n == 0 {
            return Err(ProxyError::ClientProtocol(
                "connection closed before a complete proxy protocol header".into(),
            ));
        }
    }
}

/// Run the client-leg TLS handshake when the leg is configured encrypted.
async fn accept_client_tls(
    core: &Arc<ProxyCore>,
    flow: &mut FlowContext,
    stream: BoxedStream,
) -> Result<BoxedStream, ProxyError> {
    let ClientSecurity::Tls(source) = &core.config.client_security else {
        return Ok(stream);
    };
    let config = source
        .server_config(core.config.authenticate_ssl_clients)
        .map_err(ProxyError::TlsHandshake)?;
    let (tls, info) = crate::tls::accept(config, stream)
        .await
        .map_err(ProxyError::TlsHandshake)?;
    flow.client_tls = Some(info);
    core.each_tracker(|t| t.client_ssl_handshake_succeeded(flow));
    Ok(tls)
}

struct Session {
    core: Arc<ProxyCore>,
    flow: FlowContext,
    meter: Arc<IdleMeter>,
    /// Keep-alive upstream connections of this client, keyed by `host:port`.
    upstreams: HashMap<HostAndPort, Upstream>,
    /// Set once a MITM tunnel is live: every inner request routes here.
    mitm_authority: Option<HostAndPort>,
    connecting_servers: usize,
    reused_server_connections: u64,
    state: StateMachine,
}

impl Session {
    fn idle_window(&self) -> std::time::Duration {
        self.core.config.idle_connection_timeout
    }

    /// Handle one complete request/response exchange starting at `head`.
    async fn handle_exchange(
        &mut self,
        client: &mut ClientFramed,
        head: RequestHead,
    ) -> Result<ExchangeEnd, ProxyError> {
        let is_connect = head.is_connect();
        self.state.transition(if is_connect {
            ConnectionState::NegotiatingConnect
        } else {
            ConnectionState::AwaitingChunk
        });

        // request-target classification; a request addressed to the proxy
        // itself is only served when acting as an origin gateway
        let authority = self.target_authority(&head)?;

        // authentication gate
        if let Some(authenticator) = &self.core.config.authenticator {
            let authorized = crate::auth::basic_credentials(&head.headers)
                .is_some_and(|(user, pass)| authenticator.authenticate(&user, &pass));
            if !authorized {
                self.drain_request(client, &head).await;
                return Err(ProxyError::AuthenticationRequired);
            }
        }

        // bind the filter instance of this request
        let mut filters = self
            .core
            .config
            .filters_source
            .filter_request(&head, &self.flow);
        self.core
            .each_tracker(|t| t.request_received_from_client(&self.flow, &head));

        if is_connect {
            let mut frame = Frame::Head(head);
            if let Some(response) = filters.client_to_proxy_request(&mut frame) {
                let Frame::Head(head) = frame else {
                    return Err(ProxyError::Fatal("connect head vanished in filter".into()));
                };
                self.drain_request(client, &head).await;
                return self
                    .deliver_local(client, Some(filters.as_mut()), response, &head)
                    .await;
            }
            let Frame::Head(head) = frame else {
                return Err(ProxyError::Fatal("connect head vanished in filter".into()));
            };
            return self.handle_connect(client, head, filters, authority).await;
        }

        let aggregate_limit = self.core.config.filters_source.max_request_buffer_size();
        if aggregate_limit > 0 {
            let full = self.aggregate_request(client, head, aggregate_limit).await?;
            self.forward(client, full, filters, authority, true).await
        } else {
            self.forward(client, Frame::Head(head), filters, authority, false)
                .await
        }
    }

    /// Pick the upstream authority of this request, per request-target form.
    fn target_authority(&self, head: &RequestHead) -> Result<HostAndPort, ProxyError> {
        if head.is_connect() {
            return HostAndPort::from_uri(&head.uri, 443);
        }
        if head.uri.authority().is_some() {
            return HostAndPort::from_uri(&head.uri, 80);
        }
        // origin-form
        if let Some(mitm) = &self.mitm_authority {
            // inside a MITM tunnel every inner request goes to its target
            return Ok(mitm.clone());
        }
        if !self.core.config.allow_requests_to_origin_server {
            return Err(ProxyError::ClientProtocol(
                "origin-form request-target while not acting as an origin gateway".into(),
            ));
        }
        let host = head.host_header().ok_or_else(|| {
            ProxyError::ClientProtocol("origin-form request-target without a Host header".into())
        })?;
        HostAndPort::from_header(host, 80)
    }

    /// Collect head and body into a single aggregated frame, bounded by the
    /// filters source's request buffer limit.
    async fn aggregate_request(
        &mut self,
        client: &mut ClientFramed,
        head: RequestHead,
        limit: usize,
    ) -> Result<RequestFrame, ProxyError> {
        let mut body = BytesMut::new();
        let mut trailers = None;
        loop {
            let frame = bounded(self.idle_window(), client.next())
                .await
                .map_err(|_| ProxyError::Timeout)?
                .ok_or_else(|| {
                    ProxyError::ClientProtocol("client closed mid-request".into())
                })??;
            match frame {
                Frame::Data(data) => {
                    if body.len() + data.len() > limit {
                        return Err(ProxyError::ClientProtocol(format!(
                            "request body exceeds the {limit} byte aggregation buffer"
                        )));
                    }
                    body.extend_from_slice(&data);
                }
                Frame::End(t) => {
                    trailers = t;
                    break;
                }
                Frame::Head(_) | Frame::Full { .. } => {
                    return Err(ProxyError::Fatal("nested message while aggregating".into()));
                }
            }
        }
        Ok(Frame::Full {
            head,
            body: body.freeze(),
            trailers,
        })
    }

    /// Forward a request (streamed or aggregated) upstream and relay the
    /// response back.
    async fn forward(
        &mut self,
        client: &mut ClientFramed,
        frame: RequestFrame,
        mut filters: Box<dyn HttpFilters>,
        authority: HostAndPort,
        aggregated: bool,
    ) -> Result<ExchangeEnd, ProxyError> {
        let mut frame = frame;

        // client-to-proxy hook on the head (or full message); a returned
        // response short-circuits the exchange before anything goes upstream
        if let Some(response) = filters.client_to_proxy_request(&mut frame) {
            let head = frame_head(&frame)?;
            if !aggregated {
                self.drain_request(client, head).await;
            }
            let head = head.clone();
            return self
                .deliver_local(client, Some(filters.as_mut()), response, &head)
                .await;
        }

        let (mut head, body, trailers) = match frame {
            Frame::Head(head) => (head, None, None),
            Frame::Full {
                head,
                body,
                trailers,
            } => (head, Some(body), trailers),
            Frame::Data(_) | Frame::End(_) => {
                return Err(ProxyError::Fatal("request head expected".into()));
            }
        };

        let client_version = head.version;
        let request_method = head.method.clone();
        let request_keep_alive = request_wants_keep_alive(head.version, &head.headers);
        let body_kind = BodyKind::of_request(&head);
        let upgrade = headers::upgrade_offer(&head.headers);

        // hop-by-hop surgery and the Via stamp for this hop
        strip_hop_by_hop(&mut head.headers);
        append_via(&mut head.headers, head.version, &self.core.config.proxy_alias);
        if !aggregated && body_kind == BodyKind::Chunked {
            head.headers.insert(
                header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            );
        }
        if let Some(offer) = upgrade {
            headers::restate_upgrade(&mut head.headers, offer);
        }

        let (mut upstream, reused) = self.acquire_upstream(&head, &authority, filters.as_mut()).await?;

        if !upstream.is_chained() && !self.core.config.transparent {
            rewrite_absolute_to_origin_form(&mut head);
        }
        if let Some(chained) = upstream.chained.clone() {
            chained.filter_request(&mut head);
        }

        // rebuild the outbound frame and give the proxy-to-server hook the
        // last word before the wire
        let mut frame = match body {
            Some(body) => Frame::Full {
                head,
                body,
                trailers,
            },
            None => Frame::Head(head),
        };
        if let Some(response) = filters.proxy_to_server_request(&mut frame) {
            let head = frame_head(&frame)?;
            if !aggregated {
                self.drain_request(client, head).await;
            }
            let head = head.clone();
            self.retire(upstream, true);
            return self
                .deliver_local(client, Some(filters.as_mut()), response, &head)
                .await;
        }

        let sent_head = frame_head(&frame)?.clone();
        let full_body = match &frame {
            Frame::Full { body, trailers, .. } => Some((body.clone(), trailers.clone())),
            _ => None,
        };
        filters.proxy_to_server_request_sending();
        if let Err(err) = upstream.framed.send(frame).await {
            if !reused {
                return Err(err);
            }
            // a stale keep-alive connection died under us; dial a fresh one
            tracing::debug!(
                connection = self.flow.connection_id,
                host = %authority,
                "reused upstream connection failed, redialing"
            );
            let (fresh, _) = self
                .acquire_upstream(&sent_head, &authority, filters.as_mut())
                .await?;
            upstream = fresh;
            let retry = match &full_body {
                Some((body, trailers)) => Frame::Full {
                    head: sent_head.clone(),
                    body: body.clone(),
                    trailers: trailers.clone(),
                },
                None => Frame::Head(sent_head.clone()),
            };
            upstream.framed.send(retry).await?;
        }
        self.core
            .each_tracker(|t| t.request_sent_to_server(&upstream.full_flow, &sent_head));

        // pump the request body (every request ends with an End frame)
        if !aggregated {
            loop {
                let frame = bounded(self.idle_window(), client.next())
                    .await
                    .map_err(|_| ProxyError::Timeout)?
                    .ok_or_else(|| {
                        ProxyError::ClientProtocol("client closed mid-request".into())
                    })??;
                let mut frame = frame;
                if matches!(frame, Frame::Head(_) | Frame::Full { .. }) {
                    return Err(ProxyError::Fatal("message head inside a request body".into()));
                }
                if let Some(response) = filters.client_to_proxy_request(&mut frame) {
                    self.drain_body_frames(client, frame.is_last()).await;
                    // the upstream saw a truncated request; never reuse it
                    self.retire(upstream, false);
                    let head = sent_head.clone();
                    return self
                        .deliver_local(client, Some(filters.as_mut()), response, &head)
                        .await;
                }
                if let Some(response) = filters.proxy_to_server_request(&mut frame) {
                    self.drain_body_frames(client, frame.is_last()).await;
                    self.retire(upstream, false);
                    let head = sent_head.clone();
                    return self
                        .deliver_local(client, Some(filters.as_mut()), response, &head)
                        .await;
                }
                let last = frame.is_last();
                upstream.framed.send(frame).await?;
                if last {
                    break;
                }
            }
        }
        filters.proxy_to_server_request_sent();

        // and relay the response
        self.state.transition(ConnectionState::AwaitingProxyChunk);
        self.relay_response(
            client,
            upstream,
            filters,
            &request_method,
            client_version,
            request_keep_alive,
        )
        .await
    }

    /// Fetch a reusable upstream connection or dial a new one.
    async fn acquire_upstream(
        &mut self,
        head: &RequestHead,
        authority: &HostAndPort,
        filters: &mut dyn HttpFilters,
    ) -> Result<(Upstream, bool), ProxyError> {
        match self.upstreams.remove(authority) {
            Some(existing) if existing.reusable => {
                self.reused_server_connections += 1;
                tracing::trace!(
                    connection = self.flow.connection_id,
                    host = %authority,
                    reused = self.reused_server_connections,
                    "reusing upstream connection"
                );
                return Ok((existing, true));
            }
            // inner MITM requests must travel the intercepted tunnel;
            // dialing around a dead one would bypass the interception
            _ if self.mitm_authority.is_some() => {
                return Err(ProxyError::Connection {
                    host: authority.to_string(),
                    reason: "intercepted tunnel is no longer open".to_owned(),
                });
            }
            _ => {}
        }

        self.connecting_servers += 1;
        self.state.transition(ConnectionState::Connecting);
        let connected = upstream::connect(
            &self.core,
            &self.flow,
            head,
            authority,
            filters,
            &self.meter,
        )
        .await;
        self.connecting_servers -= 1;
        self.state.transition(ConnectionState::AwaitingChunk);
        connected.map(|upstream| (upstream, false))
    }

    /// Relay the upstream response (including any informational preludes)
    /// to the client, then settle keep-alive and reuse.
    async fn relay_response(
        &mut self,
        client: &mut ClientFramed,
        mut upstream: Upstream,
        mut filters: Box<dyn HttpFilters>,
        request_method: &Method,
        client_version: Version,
        request_keep_alive: bool,
    ) -> Result<ExchangeEnd, ProxyError> {
        let aggregate_limit = self.core.config.filters_source.max_response_buffer_size();
        let mut receiving_seen = false;

        let mut head = loop {
            let head = self
                .next_response_head(&mut upstream, filters.as_mut(), &mut receiving_seen)
                .await?;
            if head.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                // relay the prelude and keep waiting for the real response
                self.consume_end(&mut upstream).await?;
                let mut frame = Frame::Head(head);
                filters.server_to_proxy_response(&mut frame);
                filters.proxy_to_client_response(&mut frame);
                client.send(frame).await?;
                continue;
            }
            break head;
        };

        let upstream_keep_alive = response_keep_alive(&head);
        let upstream_body = BodyKind::of_response(request_method, &head);
        let upgrade = headers::upgrade_offer(&head.headers);

        strip_hop_by_hop(&mut head.headers);
        append_via(&mut head.headers, head.version, &self.core.config.proxy_alias);
        if head.status == StatusCode::SWITCHING_PROTOCOLS
            && let Some(offer) = upgrade
        {
            headers::restate_upgrade(&mut head.headers, offer);
        }

        // re-frame towards the client
        let mut converted_close_delimited = false;
        match upstream_body {
            BodyKind::Chunked => {
                head.headers.insert(
                    header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
            }
            BodyKind::CloseDelimited if client_version != Version::HTTP_10 => {
                head.headers.insert(
                    header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
                converted_close_delimited = true;
            }
            _ => {}
        }

        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            let mut frame = Frame::Head(head);
            filters.server_to_proxy_response(&mut frame);
            filters.proxy_to_client_response(&mut frame);
            let sent = frame_response_head(&frame)?.clone();
            client.send(frame).await?;
            self.core
                .each_tracker(|t| t.response_sent_to_client(&self.flow, &sent));
            filters.server_to_proxy_response_received();
            // the upgraded protocol owns the bytes from here on
            self.state.transition(ConnectionState::Tunneling);
            self.meter.disable_read_idle();
            return self.splice(client, upstream).await;
        }

        if aggregate_limit > 0 {
            return self
                .relay_aggregated(
                    client,
                    upstream,
                    filters,
                    head,
                    aggregate_limit,
                    request_keep_alive,
                    upstream_keep_alive,
                    upstream_body,
                )
                .await;
        }

        // stream the head
        let sent_head = {
            let mut frame = Frame::Head(head);
            filters.server_to_proxy_response(&mut frame);
            filters.proxy_to_client_response(&mut frame);
            let head = frame_response_head(&frame)?.clone();
            client.send(frame).await?;
            head
        };

        // stream the body
        loop {
            let frame = bounded(self.idle_window(), upstream.framed.next())
                .await
                .map_err(|_| {
                    // mid-body stalls abort the exchange, there is nothing
                    // sensible left to synthesize
                    ProxyError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut))
                })?
                .ok_or_else(|| {
                    ProxyError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
                })??;
            let mut frame = frame;
            filters.server_to_proxy_response(&mut frame);
            filters.proxy_to_client_response(&mut frame);
            let last = frame.is_last();
            client.send(frame).await?;
            if last {
                break;
            }
        }

        filters.server_to_proxy_response_received();
        self.core
            .each_tracker(|t| t.response_sent_to_client(&self.flow, &sent_head));

        // settle both connections
        upstream.reusable = upstream_keep_alive && upstream_body != BodyKind::CloseDelimited;
        self.retire(upstream, true);
        let response_forces_close =
            converted_close_delimited || upstream_body == BodyKind::CloseDelimited;
        if request_keep_alive && !response_forces_close && !connection_close(&sent_head) {
            Ok(ExchangeEnd::KeepAlive)
        } else {
            Ok(ExchangeEnd::Close)
        }
    }

    /// Aggregated response path: buffer the full body, hand it to the
    /// filters as one message, re-frame with an exact `Content-Length`.
    #[allow(clippy::too_many_arguments)]
    async fn relay_aggregated(
        &mut self,
        client: &mut ClientFramed,
        mut upstream: Upstream,
        mut filters: Box<dyn HttpFilters>,
        head: ResponseHead,
        limit: usize,
        request_keep_alive: bool,
        upstream_keep_alive: bool,
        upstream_body: BodyKind,
    ) -> Result<ExchangeEnd, ProxyError> {
        let mut body = BytesMut::new();
        let mut trailers = None;
        loop {
            let frame = bounded(self.idle_window(), upstream.framed.next())
                .await
                .map_err(|_| ProxyError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)))?
                .ok_or_else(|| {
                    ProxyError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
                })??;
            match frame {
                Frame::Data(data) => {
                    if body.len() + data.len() > limit {
                        return Err(ProxyError::UpstreamProtocol(format!(
                            "response body exceeds the {limit} byte aggregation buffer"
                        )));
                    }
                    body.extend_from_slice(&data);
                }
                Frame::End(t) => {
                    trailers = t;
                    break;
                }
                Frame::Head(_) | Frame::Full { .. } => {
                    return Err(ProxyError::Fatal("nested message while aggregating".into()));
                }
            }
        }

        let mut frame = Frame::Full {
            head,
            body: body.freeze(),
            trailers,
        };
        filters.server_to_proxy_response(&mut frame);
        filters.proxy_to_client_response(&mut frame);
        let sent_head = frame_response_head(&frame)?.clone();
        client.send(frame).await?;

        filters.server_to_proxy_response_received();
        self.core
            .each_tracker(|t| t.response_sent_to_client(&self.flow, &sent_head));

        upstream.reusable = upstream_keep_alive && upstream_body != BodyKind::CloseDelimited;
        self.retire(upstream, true);
        // close-delimited upstream responses close the client leg even
        // after re-framing with an exact length
        let response_forces_close = upstream_body == BodyKind::CloseDelimited;
        if request_keep_alive && !response_forces_close && !connection_close(&sent_head) {
            Ok(ExchangeEnd::KeepAlive)
        } else {
            Ok(ExchangeEnd::Close)
        }
    }

    /// Await the next response head, firing the receive-lifecycle hooks.
    async fn next_response_head(
        &mut self,
        upstream: &mut Upstream,
        filters: &mut dyn HttpFilters,
        receiving_seen: &mut bool,
    ) -> Result<ResponseHead, ProxyError> {
        let frame = bounded(self.idle_window(), upstream.framed.next())
            .await
            .map_err(|_| {
                filters.server_to_proxy_response_timed_out();
                ProxyError::Timeout
            })?
            .ok_or_else(|| {
                ProxyError::UpstreamProtocol("upstream closed before the response head".into())
            })?
            .map_err(|err| match err {
                err @ ProxyError::UpstreamProtocol(_) => err,
                other => ProxyError::UpstreamProtocol(other.to_string()),
            })?;
        let Frame::Head(head) = frame else {
            return Err(ProxyError::Fatal("response head expected".into()));
        };
        if !*receiving_seen {
            *receiving_seen = true;
            filters.server_to_proxy_response_receiving();
            self.core
                .each_tracker(|t| t.response_received_from_server(&upstream.full_flow, &head));
        }
        Ok(head)
    }

    /// Consume the `End` frame terminating a bodyless message.
    async fn consume_end(&self, upstream: &mut Upstream) -> Result<(), ProxyError> {
        match bounded(self.idle_window(), upstream.framed.next())
            .await
            .map_err(|_| ProxyError::Timeout)?
        {
            Some(Ok(frame)) if frame.is_last() => Ok(()),
            Some(Ok(_)) => Err(ProxyError::Fatal("expected end of message".into())),
            Some(Err(err)) => Err(err),
            None => Err(ProxyError::UpstreamProtocol("upstream closed early".into())),
        }
    }

    /// CONNECT: negotiate the upstream leg, then become either an opaque
    /// tunnel or a MITM interception point.
    async fn handle_connect(
        &mut self,
        client: &mut ClientFramed,
        head: RequestHead,
        mut filters: Box<dyn HttpFilters>,
        authority: HostAndPort,
    ) -> Result<ExchangeEnd, ProxyError> {
        let mitm_manager = match &self.core.config.client_security {
            ClientSecurity::Mitm(manager) if filters.proxy_to_server_allow_mitm() => {
                Some(manager.clone())
            }
            _ => None,
        };

        let mut upstream = self
            .acquire_connect_upstream(&head, &authority, filters.as_mut())
            .await?;

        // a CONNECT travels the wire only when a chained proxy speaks HTTP
        // on our behalf; a direct hop *is* the tunnel already
        if upstream.is_chained() {
            let mut chead = head.clone();
            strip_hop_by_hop(&mut chead.headers);
            append_via(&mut chead.headers, chead.version, &self.core.config.proxy_alias);
            if let Some(chained) = upstream.chained.clone() {
                chained.filter_request(&mut chead);
            }
            filters.proxy_to_server_request_sending();
            upstream.framed.send(Frame::Head(chead.clone())).await?;
            filters.proxy_to_server_request_sent();
            self.core
                .each_tracker(|t| t.request_sent_to_server(&upstream.full_flow, &chead));

            upstream.state.transition(ConnectionState::AwaitingConnectOk);
            let mut receiving_seen = false;
            let rhead = self
                .next_response_head(&mut upstream, filters.as_mut(), &mut receiving_seen)
                .await?;
            if !rhead.status.is_success() {
                // the chain refused: relay its verdict and carry on
                tracing::debug!(
                    connection = self.flow.connection_id,
                    status = %rhead.status,
                    "chained proxy refused CONNECT"
                );
                self.drain_request(client, &head).await;
                return self
                    .relay_refused_connect(client, upstream, filters, rhead)
                    .await;
            }
            self.consume_end(&mut upstream).await?;
        }

        match mitm_manager {
            Some(mitm) => self.become_mitm(client, head, filters, authority, upstream, mitm).await,
            None => self.become_tunnel(client, filters, upstream).await,
        }
    }

    /// CONNECT upstreams are never taken from (nor returned to) the reuse
    /// pool; the tunnel owns its connection outright.
    async fn acquire_connect_upstream(
        &mut self,
        head: &RequestHead,
        authority: &HostAndPort,
        filters: &mut dyn HttpFilters,
    ) -> Result<Upstream, ProxyError> {
        self.connecting_servers += 1;
        let connected = upstream::connect(
            &self.core,
            &self.flow,
            head,
            authority,
            filters,
            &self.meter,
        )
        .await;
        self.connecting_servers -= 1;
        connected
    }

    /// Relay a chained proxy's non-2xx CONNECT response to the client.
    async fn relay_refused_connect(
        &mut self,
        client: &mut ClientFramed,
        mut upstream: Upstream,
        mut filters: Box<dyn HttpFilters>,
        mut rhead: ResponseHead,
    ) -> Result<ExchangeEnd, ProxyError> {
        strip_hop_by_hop(&mut rhead.headers);
        append_via(&mut rhead.headers, rhead.version, &self.core.config.proxy_alias);
        let body = BodyKind::of_response(&Method::CONNECT, &rhead);
        if body == BodyKind::Chunked {
            rhead.headers.insert(
                header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            );
        }

        let mut frame = Frame::Head(rhead);
        filters.server_to_proxy_response(&mut frame);
        filters.proxy_to_client_response(&mut frame);
        let sent_head = frame_response_head(&frame)?.clone();
        client.send(frame).await?;
        loop {
            let frame = bounded(self.idle_window(), upstream.framed.next())
                .await
                .map_err(|_| ProxyError::Timeout)?
                .ok_or_else(|| {
                    ProxyError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
                })??;
            let mut frame = frame;
            filters.server_to_proxy_response(&mut frame);
            filters.proxy_to_client_response(&mut frame);
            let last = frame.is_last();
            client.send(frame).await?;
            if last {
                break;
            }
        }
        filters.server_to_proxy_response_received();
        self.core
            .each_tracker(|t| t.response_sent_to_client(&self.flow, &sent_head));
        // the chain connection served its verdict; don't keep it
        drop(upstream);
        self.state.transition(ConnectionState::AwaitingInitial);
        // a close-delimited verdict leaves the client without a message
        // boundary, so the client connection closes with it
        if body == BodyKind::CloseDelimited {
            Ok(ExchangeEnd::Close)
        } else {
            Ok(ExchangeEnd::KeepAlive)
        }
    }

    /// CONNECT with interception: encrypt towards the origin, impersonate
    /// it towards the client, and resume HTTP framing on both halves.
    async fn become_mitm(
        &mut self,
        client: &mut ClientFramed,
        head: RequestHead,
        mut filters: Box<dyn HttpFilters>,
        authority: HostAndPort,
        mut upstream: Upstream,
        mitm: Arc<dyn crate::tls::MitmManager>,
    ) -> Result<ExchangeEnd, ProxyError> {
        self.state.transition(ConnectionState::HandshakingTls);

        filters.proxy_to_server_connection_ssl_handshake_started();
        let upstream_config = mitm.upstream_config(&authority).map_err(|err| {
            ProxyError::Connection {
                host: authority.to_string(),
                reason: format!("no upstream tls config: {err}"),
            }
        })?;
        upstream
            .start_tls(upstream_config, &authority, self.core.config.limits)
            .await
            .map_err(|err| ProxyError::Connection {
                host: authority.to_string(),
                reason: format!("tls handshake with origin failed: {err}"),
            })?;

        // the tunnel is up: tell the client, then immediately expect its
        // TLS ClientHello on the same bytes
        client
            .send(Frame::Head(connection_established()))
            .await?;

        let upstream_tls = upstream.tls_info.clone().unwrap_or_default();
        let client_config = mitm
            .client_config(&head, &upstream_tls)
            .map_err(ProxyError::TlsHandshake)?;

        let parts = std::mem::replace(
            client,
            Framed::new(
                Box::new(tokio::io::empty()) as BoxedStream,
                ServerCodec::new(self.core.config.limits),
            ),
        )
        .into_parts();
        let stream = Prefixed::new(parts.read_buf.freeze(), parts.io);
        let (tls, info) = crate::tls::accept(client_config, stream)
            .await
            .map_err(ProxyError::TlsHandshake)?;
        self.flow.client_tls = Some(info);
        self.core
            .each_tracker(|t| t.client_ssl_handshake_succeeded(&self.flow));

        *client = Framed::new(tls, ServerCodec::new(self.core.config.limits));
        self.mitm_authority = Some(authority.clone());
        upstream.state.transition(ConnectionState::AwaitingInitial);
        self.upstreams.insert(authority, upstream);
        self.state.transition(ConnectionState::AwaitingInitial);
        tracing::debug!(
            connection = self.flow.connection_id,
            "mitm interception established, resuming http framing"
        );
        Ok(ExchangeEnd::KeepAlive)
    }

    /// CONNECT without interception: a plain byte pipe in both directions.
    async fn become_tunnel(
        &mut self,
        client: &mut ClientFramed,
        _filters: Box<dyn HttpFilters>,
        upstream: Upstream,
    ) -> Result<ExchangeEnd, ProxyError> {
        client
            .send(Frame::Head(connection_established()))
            .await?;

        self.state.transition(ConnectionState::Tunneling);
        self.meter.disable_read_idle();
        self.splice(client, upstream).await
    }

    /// Relay raw bytes between the two halves until either side ends,
    /// replaying whatever both codecs had buffered.
    async fn splice(
        &mut self,
        client: &mut ClientFramed,
        upstream: Upstream,
    ) -> Result<ExchangeEnd, ProxyError> {
        let client_parts = std::mem::replace(
            client,
            Framed::new(
                Box::new(tokio::io::empty()) as BoxedStream,
                ServerCodec::new(self.core.config.limits),
            ),
        )
        .into_parts();
        let upstream_parts = upstream.framed.into_parts();

        let mut client_io = Prefixed::new(client_parts.read_buf.freeze(), client_parts.io);
        let mut upstream_io = Prefixed::new(upstream_parts.read_buf.freeze(), upstream_parts.io);

        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io) => {
                if let Err(err) = result {
                    tracing::debug!(
                        connection = self.flow.connection_id,
                        "tunnel ended with error: {err}"
                    );
                }
            }
            () = self.meter.idle(self.idle_window()) => {
                tracing::debug!(connection = self.flow.connection_id, "tunnel idled out");
            }
        }
        self.state.transition(ConnectionState::Disconnected);
        Ok(ExchangeEnd::Close)
    }

    /// Return an upstream to the pool, or drop it.
    fn retire(&mut self, upstream: Upstream, keep_if_reusable: bool) {
        if keep_if_reusable && upstream.reusable {
            self.upstreams.insert(upstream.host.clone(), upstream);
        }
    }

    /// Deliver a short-circuit / locally synthesized response produced
    /// while a filter instance was bound.
    async fn deliver_local(
        &mut self,
        client: &mut ClientFramed,
        filters: Option<&mut dyn HttpFilters>,
        response: LocalResponse,
        request_head: &RequestHead,
    ) -> Result<ExchangeEnd, ProxyError> {
        let keep_alive = request_wants_keep_alive(request_head.version, &request_head.headers);
        let mut response = response;
        if !keep_alive {
            response = response.with_connection_close();
        }
        let mut frame = Frame::Full {
            head: response.head,
            body: response.body,
            trailers: None,
        };
        if let Some(filters) = filters {
            filters.proxy_to_client_response(&mut frame);
        }
        let sent_head = frame_response_head(&frame)?.clone();
        client.send(frame).await?;
        self.core
            .each_tracker(|t| t.response_sent_to_client(&self.flow, &sent_head));
        if keep_alive && !connection_close(&sent_head) {
            Ok(ExchangeEnd::KeepAlive)
        } else {
            Ok(ExchangeEnd::Close)
        }
    }

    /// Synthesize the client-visible response of an engine error.
    async fn respond_with_error(&mut self, client: &mut ClientFramed, err: &ProxyError) {
        let Some(status) = err.response_status() else {
            tracing::debug!(
                connection = self.flow.connection_id,
                "closing without response: {err}"
            );
            return;
        };
        let mut response = LocalResponse::plaintext(status, &err.to_string());
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            let realm = self
                .core
                .config
                .authenticator
                .as_ref()
                .and_then(|a| a.realm().map(ToOwned::to_owned))
                .unwrap_or_else(|| "Restricted Files".to_owned());
            if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{realm}\"")) {
                response
                    .head
                    .headers
                    .insert(header::PROXY_AUTHENTICATE, value);
            }
        }
        if err.closes_client_connection() {
            response = response.with_connection_close();
        }
        let head = response.head.clone();
        let frame = Frame::Full {
            head: response.head,
            body: response.body,
            trailers: None,
        };
        if client.send(frame).await.is_ok() {
            self.core
                .each_tracker(|t| t.response_sent_to_client(&self.flow, &head));
        }
    }

    /// Consume the rest of the current request so the connection is
    /// positioned at the next message boundary.
    async fn drain_request(&self, client: &mut ClientFramed, _head: &RequestHead) {
        self.drain_body_frames(client, false).await;
    }

    async fn drain_body_frames(&self, client: &mut ClientFramed, already_done: bool) {
        if already_done {
            return;
        }
        loop {
            match bounded(self.idle_window(), client.next()).await {
                Ok(Some(Ok(frame))) if frame.is_last() => break,
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_)) | None) | Err(_) => break,
            }
        }
    }
}

fn frame_head(frame: &RequestFrame) -> Result<&RequestHead, ProxyError> {
    match frame {
        Frame::Head(head) | Frame::Full { head, .. } => Ok(head),
        Frame::Data(_) | Frame::End(_) => Err(ProxyError::Fatal(
            "filter replaced a message head with a body frame".into(),
        )),
    }
}

fn frame_response_head(frame: &Frame<ResponseHead>) -> Result<&ResponseHead, ProxyError> {
    match frame {
        Frame::Head(head) | Frame::Full { head, .. } => Ok(head),
        Frame::Data(_) | Frame::End(_) => Err(ProxyError::Fatal(
            "filter replaced a response head with a body frame".into(),
        )),
    }
}

fn connection_close(head: &ResponseHead) -> bool {
    head.headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("close"))
}

fn connection_established() -> ResponseHead {
    ResponseHead::new(StatusCode::OK).with_reason("Connection established")
}

/// [`timeout`] with the zero-window-disables-supervision rule applied.
async fn bounded<F: Future>(
    window: std::time::Duration,
    future: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    if window.is_zero() {
        Ok(future.await)
    } else {
        timeout(window, future).await
    }
}
