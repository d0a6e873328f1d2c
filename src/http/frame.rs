//! The frame model of the codec pipeline.
//!
//! HTTP messages travel through the engine as a head frame followed by zero
//! or more data frames and a terminating end frame, mirroring the shape in
//! which an HTTP/1 connection actually delivers them. Aggregation (for
//! filters that want to see full bodies) folds the sequence into a single
//! [`Frame::Full`].

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version, header};

/// The head of an HTTP request as read from (or written to) the wire.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Request-target in whichever form the peer sent it
    /// (origin-form, absolute-form or authority-form).
    pub uri: Uri,
    /// Protocol version.
    pub version: Version,
    /// Header block.
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Whether this request opens a CONNECT tunnel.
    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// The `Host` header value, if present and valid UTF-8.
    #[must_use]
    pub fn host_header(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
    }
}

/// The head of an HTTP response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Protocol version.
    pub version: Version,
    /// Status code.
    pub status: StatusCode,
    /// Reason phrase as seen on the wire, when it differs from nothing;
    /// falls back to the canonical phrase when absent.
    pub reason: Option<String>,
    /// Header block.
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// A bare head with the given status, `HTTP/1.1` and no headers.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    /// Replace the reason phrase.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Whether this is an informational (1xx) response.
    #[must_use]
    pub fn is_informational(&self) -> bool {
        self.status.is_informational()
    }
}

/// A single frame of an HTTP message stream.
#[derive(Debug)]
pub enum Frame<H> {
    /// The message head.
    Head(H),
    /// A chunk of body data. Never empty.
    Data(Bytes),
    /// End of the message, with optional trailers (chunked encoding only).
    End(Option<HeaderMap>),
    /// An aggregated full message: head, complete body, optional trailers.
    ///
    /// Produced by the aggregation stage on behalf of buffering filters,
    /// never by the codec itself.
    Full {
        /// The message head. The codec corrects its framing headers
        /// (`Content-Length`) when writing a full frame out.
        head: H,
        /// The complete message body.
        body: Bytes,
        /// Trailers carried by the original chunked stream, if any.
        trailers: Option<HeaderMap>,
    },
}

/// Frames of a request stream.
pub type RequestFrame = Frame<RequestHead>;
/// Frames of a response stream.
pub type ResponseFrame = Frame<ResponseHead>;

impl<H> Frame<H> {
    /// Whether this frame terminates the message it belongs to.
    #[must_use]
    pub fn is_last(&self) -> bool {
        matches!(self, Self::End(_) | Self::Full { .. })
    }
}

/// A locally produced response: either synthesized by the engine
/// (`400`, `407`, `502`, `504`, …) or returned by a short-circuiting filter.
#[derive(Debug, Clone)]
pub struct LocalResponse {
    /// Response head.
    pub head: ResponseHead,
    /// Complete response body.
    pub body: Bytes,
}

impl LocalResponse {
    /// Create a new [`LocalResponse`] from a head and a body.
    #[must_use]
    pub fn new(head: ResponseHead, body: impl Into<Bytes>) -> Self {
        Self {
            head,
            body: body.into(),
        }
    }

    /// A plaintext response with the given status, carrying `Date`,
    /// `Content-Length` and `Content-Type` headers.
    #[must_use]
    pub fn plaintext(status: StatusCode, body: &str) -> Self {
        let mut head = ResponseHead::new(status);
        head.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(std::time::SystemTime::now())) {
            head.headers.insert(header::DATE, date);
        }
        let body = Bytes::copy_from_slice(body.as_bytes());
        let mut response = Self { head, body };
        response.set_content_length();
        response
    }

    /// Mark the response as the last one on the connection.
    #[must_use]
    pub fn with_connection_close(mut self) -> Self {
        self.head
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        self
    }

    fn set_content_length(&mut self) {
        if let Ok(value) = HeaderValue::from_str(&self.body.len().to_string()) {
            self.head.headers.insert(header::CONTENT_LENGTH, value);
        }
    }
}
