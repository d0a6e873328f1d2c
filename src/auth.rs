//! Proxy authentication gate (`Proxy-Authorization: Basic …`).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::HeaderMap;
use http::header::PROXY_AUTHORIZATION;

/// Validates credentials carried by `Proxy-Authorization` headers.
///
/// Must not block: it is invoked on the connection's driver task.
pub trait ProxyAuthenticator: Send + Sync + 'static {
    /// Whether this username/password pair is allowed through the proxy.
    fn authenticate(&self, username: &str, password: &str) -> bool;

    /// The realm advertised in `Proxy-Authenticate` challenges.
    fn realm(&self) -> Option<&str> {
        None
    }
}

impl<A: ProxyAuthenticator + ?Sized> ProxyAuthenticator for std::sync::Arc<A> {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        (**self).authenticate(username, password)
    }

    fn realm(&self) -> Option<&str> {
        (**self).realm()
    }
}

/// Extract `Basic` credentials from the request headers, if any.
pub(crate) fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(PROXY_AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}
