//! Deriving rate limit keys from HTTP requests.

use std::net::{IpAddr, SocketAddr};

use http::{Extensions, HeaderMap, HeaderName};
use thiserror::Error;

/// Why a key could not be derived from a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    /// No header matched and the request carries no peer address.
    #[error("request has no remote address")]
    MissingRemoteAddr,

    /// A configured header holds a value that is not visible ASCII.
    #[error("header {0} is not a valid key")]
    InvalidHeader(HeaderName),

    /// Failure reported by a caller-supplied extractor.
    #[error("{0}")]
    Custom(String),
}

/// Derives the rate limit key for a request.
///
/// Any `Fn(&HeaderMap, &Extensions) -> Result<String, KeyError>` is an
/// extractor, so keys can come from an account id, an API token, or anything
/// else the application stores on the request.
pub trait KeyExtractor: Send + Sync {
    /// Produce the key for a request with these headers and extensions.
    fn extract(&self, headers: &HeaderMap, extensions: &Extensions) -> Result<String, KeyError>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&HeaderMap, &Extensions) -> Result<String, KeyError> + Send + Sync,
{
    fn extract(&self, headers: &HeaderMap, extensions: &Extensions) -> Result<String, KeyError> {
        self(headers, extensions)
    }
}

/// Keys requests by client IP.
///
/// Headers are checked in the order given (for example `x-forwarded-for`
/// then `cf-connecting-ip`); the first non-empty one wins. For list-valued
/// headers only the first entry is used. When no header matches, the peer
/// address is read from a [`SocketAddr`] or [`IpAddr`] request extension.
#[derive(Debug, Clone, Default)]
pub struct IpKeyExtractor {
    headers: Vec<HeaderName>,
}

impl IpKeyExtractor {
    /// Key on the peer address only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer these headers over the peer address.
    pub fn with_headers(headers: impl IntoIterator<Item = HeaderName>) -> Self {
        Self {
            headers: headers.into_iter().collect(),
        }
    }
}

impl KeyExtractor for IpKeyExtractor {
    fn extract(&self, headers: &HeaderMap, extensions: &Extensions) -> Result<String, KeyError> {
        for name in &self.headers {
            let Some(value) = headers.get(name) else {
                continue;
            };
            let value = value
                .to_str()
                .map_err(|_| KeyError::InvalidHeader(name.clone()))?;
            let first = value.split(',').next().unwrap_or_default().trim();
            if !first.is_empty() {
                return Ok(first.to_string());
            }
        }

        if let Some(addr) = extensions.get::<SocketAddr>() {
            return Ok(addr.ip().to_string());
        }
        if let Some(ip) = extensions.get::<IpAddr>() {
            return Ok(ip.to_string());
        }
        Err(KeyError::MissingRemoteAddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn forwarded() -> HeaderName {
        HeaderName::from_static("x-forwarded-for")
    }

    fn cloudflare() -> HeaderName {
        HeaderName::from_static("cf-connecting-ip")
    }

    #[test]
    fn test_header_order_wins() {
        let extractor = IpKeyExtractor::with_headers([cloudflare(), forwarded()]);
        let mut headers = HeaderMap::new();
        headers.insert(forwarded(), HeaderValue::from_static("10.0.0.1"));
        headers.insert(cloudflare(), HeaderValue::from_static("203.0.113.7"));

        let key = extractor.extract(&headers, &Extensions::new()).unwrap();
        assert_eq!(key, "203.0.113.7");
    }

    #[test]
    fn test_forwarded_list_uses_first_entry() {
        let extractor = IpKeyExtractor::with_headers([forwarded()]);
        let mut headers = HeaderMap::new();
        headers.insert(forwarded(), HeaderValue::from_static(" 198.51.100.2 , 10.0.0.1"));

        let key = extractor.extract(&headers, &Extensions::new()).unwrap();
        assert_eq!(key, "198.51.100.2");
    }

    #[test]
    fn test_empty_header_falls_back_to_peer() {
        let extractor = IpKeyExtractor::with_headers([forwarded()]);
        let mut headers = HeaderMap::new();
        headers.insert(forwarded(), HeaderValue::from_static(""));
        let mut extensions = Extensions::new();
        extensions.insert(SocketAddr::from(([192, 0, 2, 10], 44321)));

        let key = extractor.extract(&headers, &extensions).unwrap();
        assert_eq!(key, "192.0.2.10");
    }

    #[test]
    fn test_ip_extension() {
        let mut extensions = Extensions::new();
        extensions.insert(IpAddr::from([127, 0, 0, 1]));

        let key = IpKeyExtractor::new()
            .extract(&HeaderMap::new(), &extensions)
            .unwrap();
        assert_eq!(key, "127.0.0.1");
    }

    #[test]
    fn test_missing_remote_addr() {
        let err = IpKeyExtractor::new()
            .extract(&HeaderMap::new(), &Extensions::new())
            .unwrap_err();
        assert_eq!(err, KeyError::MissingRemoteAddr);
    }

    #[test]
    fn test_invalid_header() {
        let extractor = IpKeyExtractor::with_headers([forwarded()]);
        let mut headers = HeaderMap::new();
        headers.insert(forwarded(), HeaderValue::from_bytes(b"\xfa\xfb").unwrap());

        let err = extractor.extract(&headers, &Extensions::new()).unwrap_err();
        assert_eq!(err, KeyError::InvalidHeader(forwarded()));
    }

    #[test]
    fn test_closure_extractor() {
        let by_account = |headers: &HeaderMap, _: &Extensions| {
            headers
                .get("x-account-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| KeyError::Custom("missing account".into()))
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-account-id", HeaderValue::from_static("acct-42"));

        assert_eq!(by_account.extract(&headers, &Extensions::new()).unwrap(), "acct-42");
        assert_eq!(
            by_account.extract(&HeaderMap::new(), &Extensions::new()).unwrap_err(),
            KeyError::Custom("missing account".into())
        );
    }
}
