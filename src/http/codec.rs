//! HTTP/1.x wire codec for both halves of the proxy.
//!
//! [`ServerCodec`] sits on the client-to-proxy connection: it decodes
//! requests and encodes responses. [`ClientCodec`] sits on the
//! proxy-to-server connection: it encodes requests and decodes responses.
//! Both produce and consume the [`Frame`] stream model, so the connection
//! drivers can relay messages chunk by chunk without ever buffering a body
//! they were not explicitly asked to buffer.
//!
//! The decoders enforce the configured parser limits: initial line length,
//! total header block size and maximum emitted chunk size.

use super::frame::{Frame, RequestFrame, RequestHead, ResponseFrame, ResponseHead};
use super::headers::BodyKind;
use crate::error::ProxyError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version, header};
use std::collections::VecDeque;
use tokio_util::codec::{Decoder, Encoder};

const MAX_HEADERS: usize = 128;
/// Upper bound for a single chunk-size line, extensions included.
const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Parser limits, enforced while decoding message heads and bodies.
#[derive(Debug, Clone, Copy)]
pub struct CodecLimits {
    /// Maximum length of the request/status line in bytes.
    pub max_initial_line_length: usize,
    /// Maximum size of the header block in bytes.
    pub max_header_size: usize,
    /// Maximum size of a single emitted body chunk in bytes.
    pub max_chunk_size: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_initial_line_length: 8192,
            max_header_size: 16384,
            max_chunk_size: 16384,
        }
    }
}

/// Where the decoder currently is within one message.
#[derive(Debug)]
enum ReadState {
    Head,
    /// Emit `End` before looking for the next head.
    EmitEnd,
    FixedBody {
        remaining: u64,
    },
    ChunkSize,
    ChunkData {
        remaining: u64,
    },
    /// CRLF terminating a fully consumed chunk.
    ChunkCrlf,
    Trailers,
    CloseDelimited,
}

/// Body framing applied while encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteBody {
    None,
    Raw,
    Chunked,
}

fn crlf_line(buf: &mut BytesMut, max: usize, what: &str) -> Result<Option<BytesMut>, ProxyError> {
    match find_crlf(buf) {
        Some(idx) => {
            let mut line = buf.split_to(idx + 2);
            line.truncate(idx);
            Ok(Some(line))
        }
        None if buf.len() > max => Err(ProxyError::ClientProtocol(format!("{what} line too long"))),
        None => Ok(None),
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn version_of(minor: u8) -> Version {
    if minor == 0 {
        Version::HTTP_10
    } else {
        Version::HTTP_11
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Check head-size limits for a buffer that does not yet contain a full head.
fn check_partial_head(buf: &[u8], limits: &CodecLimits) -> Result<(), ProxyError> {
    match find_crlf(buf) {
        None if buf.len() > limits.max_initial_line_length => Err(ProxyError::ClientProtocol(
            "initial line exceeds configured maximum".into(),
        )),
        Some(idx) if idx > limits.max_initial_line_length => Err(ProxyError::ClientProtocol(
            "initial line exceeds configured maximum".into(),
        )),
        _ if buf.len() > limits.max_initial_line_length + limits.max_header_size => Err(
            ProxyError::ClientProtocol("header block exceeds configured maximum".into()),
        ),
        _ => Ok(()),
    }
}

fn check_complete_head(
    buf: &[u8],
    head_end: usize,
    limits: &CodecLimits,
) -> Result<(), ProxyError> {
    let initial = find_crlf(buf).unwrap_or(head_end);
    if initial > limits.max_initial_line_length {
        return Err(ProxyError::ClientProtocol(
            "initial line exceeds configured maximum".into(),
        ));
    }
    if head_end - initial > limits.max_header_size {
        return Err(ProxyError::ClientProtocol(
            "header block exceeds configured maximum".into(),
        ));
    }
    Ok(())
}

fn headers_from_httparse(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|err| ProxyError::ClientProtocol(format!("invalid header name: {err}")))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|err| ProxyError::ClientProtocol(format!("invalid header value: {err}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ProxyError> {
    let hex = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or_default()
        .trim_ascii();
    if hex.is_empty() || hex.len() > 16 {
        return Err(ProxyError::ClientProtocol("invalid chunk size".into()));
    }
    let mut size: u64 = 0;
    for &b in hex {
        let digit = match b {
            b'0'..=b'9' => u64::from(b - b'0'),
            b'a'..=b'f' => u64::from(b - b'a' + 10),
            b'A'..=b'F' => u64::from(b - b'A' + 10),
            _ => return Err(ProxyError::ClientProtocol("invalid chunk size".into())),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit))
            .ok_or_else(|| ProxyError::ClientProtocol("chunk size overflow".into()))?;
    }
    Ok(size)
}

fn parse_trailer_block(block: &[u8]) -> Result<Option<HeaderMap>, ProxyError> {
    let mut trailers = HeaderMap::new();
    for line in block.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let mut split = line.splitn(2, |&b| b == b':');
        let name = split.next().unwrap_or_default();
        let value = split.next().unwrap_or_default().trim_ascii();
        let name = HeaderName::from_bytes(name)
            .map_err(|err| ProxyError::ClientProtocol(format!("invalid trailer name: {err}")))?;
        let value = HeaderValue::from_bytes(value)
            .map_err(|err| ProxyError::ClientProtocol(format!("invalid trailer value: {err}")))?;
        trailers.append(name, value);
    }
    Ok((!trailers.is_empty()).then_some(trailers))
}

/// Shared body-decoding engine used by both roles.
///
/// Returns `Ok(Some(frame))` when a frame is ready, `Ok(None)` when more
/// bytes are needed.
fn decode_body<H>(
    state: &mut ReadState,
    buf: &mut BytesMut,
    limits: &CodecLimits,
) -> Result<Option<Frame<H>>, ProxyError> {
    loop {
        match state {
            ReadState::Head => return Ok(None),
            ReadState::EmitEnd => {
                *state = ReadState::Head;
                return Ok(Some(Frame::End(None)));
            }
            ReadState::FixedBody { remaining } => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(buf.len() as u64).min(limits.max_chunk_size as u64);
                *remaining -= take;
                let data = buf.split_to(take as usize).freeze();
                if *remaining == 0 {
                    *state = ReadState::EmitEnd;
                }
                return Ok(Some(Frame::Data(data)));
            }
            ReadState::ChunkSize => {
                let Some(line) = crlf_line(buf, MAX_CHUNK_SIZE_LINE, "chunk size")? else {
                    return Ok(None);
                };
                let size = parse_chunk_size(&line)?;
                if size == 0 {
                    *state = ReadState::Trailers;
                } else {
                    *state = ReadState::ChunkData { remaining: size };
                }
            }
            ReadState::ChunkData { remaining } => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(buf.len() as u64).min(limits.max_chunk_size as u64);
                *remaining -= take;
                let data = buf.split_to(take as usize).freeze();
                if *remaining == 0 {
                    *state = ReadState::ChunkCrlf;
                }
                return Ok(Some(Frame::Data(data)));
            }
            ReadState::ChunkCrlf => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(ProxyError::ClientProtocol("malformed chunk ending".into()));
                }
                buf.advance(2);
                *state = ReadState::ChunkSize;
            }
            ReadState::Trailers => {
                // an immediate CRLF ends the message without trailers
                if buf.starts_with(b"\r\n") {
                    buf.advance(2);
                    *state = ReadState::Head;
                    return Ok(Some(Frame::End(None)));
                }
                let Some(end) = find_head_end(buf) else {
                    if buf.len() > limits.max_header_size {
                        return Err(ProxyError::ClientProtocol(
                            "trailer block exceeds configured maximum".into(),
                        ));
                    }
                    return Ok(None);
                };
                let block = buf.split_to(end);
                let trailers = parse_trailer_block(&block)?;
                *state = ReadState::Head;
                return Ok(Some(Frame::End(trailers)));
            }
            ReadState::CloseDelimited => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = buf.len().min(limits.max_chunk_size);
                return Ok(Some(Frame::Data(buf.split_to(take).freeze())));
            }
        }
    }
}

fn encode_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

fn encode_data(body: WriteBody, data: &Bytes, dst: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    match body {
        WriteBody::Chunked => {
            dst.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
            dst.put_slice(data);
            dst.put_slice(b"\r\n");
        }
        WriteBody::Raw => dst.put_slice(data),
        WriteBody::None => {}
    }
}

fn encode_end(body: WriteBody, trailers: Option<&HeaderMap>, dst: &mut BytesMut) {
    if body == WriteBody::Chunked {
        dst.put_slice(b"0\r\n");
        match trailers {
            Some(trailers) => encode_headers(trailers, dst),
            None => dst.put_slice(b"\r\n"),
        }
    }
}

/// Replace the framing headers of an aggregated message with an exact
/// `Content-Length`.
fn set_full_framing(headers: &mut HeaderMap, len: usize) {
    headers.remove(header::TRANSFER_ENCODING);
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
}

/// Codec for the client-facing half: decodes [`RequestFrame`]s,
/// encodes [`ResponseFrame`]s.
#[derive(Debug)]
pub struct ServerCodec {
    limits: CodecLimits,
    read: ReadState,
    write: WriteBody,
    /// Method of the most recently decoded request head; responses are
    /// framed relative to it (HEAD never gets a body, CONNECT 2xx neither).
    last_method: Method,
}

impl ServerCodec {
    /// Create a new [`ServerCodec`] with the given limits.
    #[must_use]
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            limits,
            read: ReadState::Head,
            write: WriteBody::None,
            last_method: Method::GET,
        }
    }

    /// Method of the request the next encoded response answers.
    #[must_use]
    pub fn last_method(&self) -> &Method {
        &self.last_method
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<RequestFrame>, ProxyError> {
        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut parsed);
        let status = req
            .parse(buf)
            .map_err(|err| ProxyError::ClientProtocol(format!("malformed request: {err}")))?;
        let head_len = match status {
            httparse::Status::Partial => {
                check_partial_head(buf, &self.limits)?;
                return Ok(None);
            }
            httparse::Status::Complete(len) => len,
        };
        check_complete_head(buf, head_len, &self.limits)?;

        let method = req
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| ProxyError::ClientProtocol("invalid request method".into()))?;
        let uri: Uri = req
            .path
            .ok_or_else(|| ProxyError::ClientProtocol("missing request-target".into()))?
            .parse()
            .map_err(|err| ProxyError::ClientProtocol(format!("invalid request-target: {err}")))?;
        let version = version_of(
            req.version
                .ok_or_else(|| ProxyError::ClientProtocol("missing http version".into()))?,
        );
        let headers = headers_from_httparse(req.headers)?;

        buf.advance(head_len);

        let head = RequestHead {
            method: method.clone(),
            uri,
            version,
            headers,
        };
        self.last_method = method;
        self.read = match BodyKind::of_request(&head) {
            BodyKind::None => ReadState::EmitEnd,
            BodyKind::Length(len) => ReadState::FixedBody { remaining: len },
            BodyKind::Chunked => ReadState::ChunkSize,
            // requests cannot be close-delimited
            BodyKind::CloseDelimited => ReadState::EmitEnd,
        };
        Ok(Some(Frame::Head(head)))
    }
}

impl Decoder for ServerCodec {
    type Item = RequestFrame;
    type Error = ProxyError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if matches!(self.read, ReadState::Head) {
            self.decode_head(buf)
        } else {
            decode_body(&mut self.read, buf, &self.limits)
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.read {
            ReadState::Head if buf.is_empty() => Ok(None),
            _ => match self.decode(buf)? {
                Some(frame) => Ok(Some(frame)),
                None if matches!(self.read, ReadState::Head) && buf.is_empty() => Ok(None),
                None => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
            },
        }
    }
}

impl Encoder<ResponseFrame> for ServerCodec {
    type Error = ProxyError;

    fn encode(&mut self, frame: ResponseFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            Frame::Head(head) => {
                self.write = match BodyKind::of_response(&self.last_method, &head) {
                    BodyKind::None => WriteBody::None,
                    BodyKind::Chunked => WriteBody::Chunked,
                    BodyKind::Length(_) | BodyKind::CloseDelimited => WriteBody::Raw,
                };
                encode_response_head(&head, dst);
            }
            Frame::Data(data) => encode_data(self.write, &data, dst),
            Frame::End(trailers) => encode_end(self.write, trailers.as_ref(), dst),
            Frame::Full {
                mut head,
                body,
                trailers: _,
            } => {
                if BodyKind::of_response(&self.last_method, &head) == BodyKind::None {
                    encode_response_head(&head, dst);
                } else {
                    set_full_framing(&mut head.headers, body.len());
                    encode_response_head(&head, dst);
                    dst.put_slice(&body);
                }
                self.write = WriteBody::None;
            }
        }
        Ok(())
    }
}

fn encode_response_head(head: &ResponseHead, dst: &mut BytesMut) {
    dst.put_slice(version_str(head.version).as_bytes());
    dst.put_slice(b" ");
    dst.put_slice(head.status.as_str().as_bytes());
    dst.put_slice(b" ");
    let reason = head
        .reason
        .as_deref()
        .or_else(|| head.status.canonical_reason())
        .unwrap_or("Unknown");
    dst.put_slice(reason.as_bytes());
    dst.put_slice(b"\r\n");
    encode_headers(&head.headers, dst);
}

/// Codec for the upstream half: encodes [`RequestFrame`]s,
/// decodes [`ResponseFrame`]s.
#[derive(Debug)]
pub struct ClientCodec {
    limits: CodecLimits,
    read: ReadState,
    write: WriteBody,
    /// Methods of requests written but not yet answered, oldest first.
    pending: VecDeque<Method>,
}

impl ClientCodec {
    /// Create a new [`ClientCodec`] with the given limits.
    #[must_use]
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            limits,
            read: ReadState::Head,
            write: WriteBody::None,
            pending: VecDeque::new(),
        }
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseFrame>, ProxyError> {
        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut rsp = httparse::Response::new(&mut parsed);
        let status = rsp
            .parse(buf)
            .map_err(|err| ProxyError::UpstreamProtocol(format!("malformed response: {err}")))?;
        let head_len = match status {
            httparse::Status::Partial => {
                check_partial_head(buf, &self.limits).map_err(|err| match err {
                    ProxyError::ClientProtocol(msg) => ProxyError::UpstreamProtocol(msg),
                    other => other,
                })?;
                return Ok(None);
            }
            httparse::Status::Complete(len) => len,
        };

        let code = rsp
            .code
            .ok_or_else(|| ProxyError::UpstreamProtocol("missing status code".into()))?;
        let status_code = StatusCode::from_u16(code)
            .map_err(|_| ProxyError::UpstreamProtocol(format!("invalid status code {code}")))?;
        let version = version_of(
            rsp.version
                .ok_or_else(|| ProxyError::UpstreamProtocol("missing http version".into()))?,
        );
        let headers = headers_from_httparse(rsp.headers).map_err(|err| match err {
            ProxyError::ClientProtocol(msg) => ProxyError::UpstreamProtocol(msg),
            other => other,
        })?;

        let head = ResponseHead {
            version,
            status: status_code,
            reason: rsp.reason.map(ToOwned::to_owned),
            headers,
        };

        buf.advance(head_len);

        // informational responses do not complete the pending exchange
        let method = if head.is_informational() {
            self.pending.front().cloned().unwrap_or(Method::GET)
        } else {
            self.pending.pop_front().unwrap_or(Method::GET)
        };

        self.read = match BodyKind::of_response(&method, &head) {
            BodyKind::None => ReadState::EmitEnd,
            BodyKind::Length(len) => ReadState::FixedBody { remaining: len },
            BodyKind::Chunked => ReadState::ChunkSize,
            BodyKind::CloseDelimited => ReadState::CloseDelimited,
        };
        Ok(Some(Frame::Head(head)))
    }
}

impl Decoder for ClientCodec {
    type Item = ResponseFrame;
    type Error = ProxyError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if matches!(self.read, ReadState::Head) {
            self.decode_head(buf)
        } else {
            decode_body(&mut self.read, buf, &self.limits).map_err(|err| match err {
                ProxyError::ClientProtocol(msg) => ProxyError::UpstreamProtocol(msg),
                other => other,
            })
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        match self.read {
            ReadState::Head if buf.is_empty() => Ok(None),
            // the upstream signaled the end of a close-delimited body
            ReadState::CloseDelimited => {
                self.read = ReadState::Head;
                Ok(Some(Frame::End(None)))
            }
            _ => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
        }
    }
}

impl Encoder<RequestFrame> for ClientCodec {
    type Error = ProxyError;

    fn encode(&mut self, frame: RequestFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            Frame::Head(head) => {
                self.write = match BodyKind::of_request(&head) {
                    BodyKind::None | BodyKind::CloseDelimited => WriteBody::None,
                    BodyKind::Chunked => WriteBody::Chunked,
                    BodyKind::Length(_) => WriteBody::Raw,
                };
                self.pending.push_back(head.method.clone());
                encode_request_head(&head, dst);
            }
            Frame::Data(data) => encode_data(self.write, &data, dst),
            Frame::End(trailers) => encode_end(self.write, trailers.as_ref(), dst),
            Frame::Full {
                mut head,
                body,
                trailers: _,
            } => {
                if body.is_empty() {
                    head.headers.remove(header::TRANSFER_ENCODING);
                    head.headers.remove(header::CONTENT_LENGTH);
                } else {
                    set_full_framing(&mut head.headers, body.len());
                }
                self.pending.push_back(head.method.clone());
                encode_request_head(&head, dst);
                dst.put_slice(&body);
                self.write = WriteBody::None;
            }
        }
        Ok(())
    }
}

fn encode_request_head(head: &RequestHead, dst: &mut BytesMut) {
    dst.put_slice(head.method.as_str().as_bytes());
    dst.put_slice(b" ");
    dst.put_slice(uri_wire_form(&head.uri).as_bytes());
    dst.put_slice(b" ");
    dst.put_slice(version_str(head.version).as_bytes());
    dst.put_slice(b"\r\n");
    encode_headers(&head.headers, dst);
}

fn uri_wire_form(uri: &Uri) -> String {
    if uri.scheme().is_some() || uri.authority().is_some() {
        uri.to_string()
    } else {
        uri.path_and_query()
            .map_or_else(|| "/".to_owned(), |pq| pq.as_str().to_owned())
    }
}
