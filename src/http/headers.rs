//! Header surgery performed on every forwarded message: hop-by-hop
//! stripping, `Via` stamping, body-framing classification and the
//! keep-alive decision logic.

use super::frame::{RequestHead, ResponseHead};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version, header};

/// `Proxy-Connection` is a de-facto hop-by-hop header even though no RFC
/// ever blessed it.
pub(crate) const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

fn hop_by_hop() -> [HeaderName; 9] {
    [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        HeaderName::from_static("trailers"),
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        PROXY_CONNECTION,
    ]
}

/// How the body of a message is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body at all.
    None,
    /// `Content-Length` delimited.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Delimited by connection close (responses only).
    CloseDelimited,
}

impl BodyKind {
    /// Body classification for a request head.
    #[must_use]
    pub fn of_request(head: &RequestHead) -> Self {
        if is_chunked(&head.headers) {
            Self::Chunked
        } else if let Some(len) = content_length(&head.headers) {
            if len == 0 { Self::None } else { Self::Length(len) }
        } else {
            Self::None
        }
    }

    /// Body classification for a response head, which depends on the
    /// request that triggered it.
    #[must_use]
    pub fn of_response(request_method: &Method, head: &ResponseHead) -> Self {
        if request_method == Method::HEAD
            || head.status.is_informational()
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
            || (request_method == Method::CONNECT && head.status.is_success())
        {
            return Self::None;
        }
        if is_chunked(&head.headers) {
            Self::Chunked
        } else if let Some(len) = content_length(&head.headers) {
            if len == 0 { Self::None } else { Self::Length(len) }
        } else {
            Self::CloseDelimited
        }
    }
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// The comma separated token list carried by `Connection` headers.
fn connection_tokens(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::try_from(token.trim()).ok())
        .collect()
}

pub(crate) fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .chain(headers.get_all(PROXY_CONNECTION).iter())
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Strip every hop-by-hop header: the RFC 7230 set plus every header the
/// message nominated in its own `Connection` token list.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in connection_tokens(headers) {
        headers.remove(&name);
    }
    for name in &hop_by_hop() {
        headers.remove(name);
    }
}

/// Append the `Via` entry for this hop: `<protocol-version> <alias>`.
///
/// The alias appears exactly once per hop; an existing `Via` chain from
/// earlier intermediaries is preserved.
pub fn append_via(headers: &mut HeaderMap, version: Version, alias: &str) {
    let protocol = match version {
        Version::HTTP_10 => "1.0",
        _ => "1.1",
    };
    if let Ok(value) = HeaderValue::from_str(&format!("{protocol} {alias}")) {
        headers.append(header::VIA, value);
    }
}

/// Whether the client wants the connection kept open after this exchange.
pub fn request_wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    match version {
        Version::HTTP_10 => connection_has_token(headers, "keep-alive"),
        _ => !connection_has_token(headers, "close"),
    }
}

/// Whether the upstream intends to keep its side open after this response.
pub fn response_keep_alive(head: &ResponseHead) -> bool {
    match head.version {
        Version::HTTP_10 => connection_has_token(&head.headers, "keep-alive"),
        _ => !connection_has_token(&head.headers, "close"),
    }
}

/// The `Upgrade` offer of a message, when its `Connection` header actually
/// activates one. Captured before hop-by-hop stripping so the hop can
/// re-emit it: `Upgrade` is hop-by-hop, and a proxy that brokers upgrades
/// must restate the offer itself.
pub(crate) fn upgrade_offer(headers: &HeaderMap) -> Option<HeaderValue> {
    if connection_has_token(headers, "upgrade") {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

/// Restate an upgrade offer on an outgoing message.
pub(crate) fn restate_upgrade(headers: &mut HeaderMap, offer: HeaderValue) {
    headers.insert(header::UPGRADE, offer);
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
}

/// Rewrite an absolute-form request-target into origin-form, as expected by
/// origin servers. Backfills the `Host` header from the authority when the
/// client did not send one.
pub fn rewrite_absolute_to_origin_form(head: &mut RequestHead) {
    let Some(authority) = head.uri.authority().cloned() else {
        return;
    };
    if head.host_header().is_none()
        && let Ok(host) = HeaderValue::from_str(authority.as_str())
    {
        head.headers.insert(header::HOST, host);
    }
    let path_and_query = head
        .uri
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str);
    if let Ok(uri) = path_and_query.parse() {
        head.uri = uri;
    }
}
