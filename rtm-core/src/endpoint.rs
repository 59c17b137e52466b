//! Endpoint normalization.
//!
//! The service speaks protocol version 2 under the `/v2` path, with the
//! appkey as a query parameter. Callers supply the bare endpoint URL; the
//! version segment is appended here and must not be pre-specified.

use url::Url;

use crate::error::EndpointError;

/// A validated, fully-qualified connect URL (`.../v2?appkey=...`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Validate `endpoint` + `appkey` and build the connect URL.
    ///
    /// A trailing `/vN` segment in the endpoint is deprecated and stripped
    /// before `/v2` is appended.
    pub fn new(endpoint: &str, appkey: &str) -> Result<Self, EndpointError> {
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(EndpointError::BadScheme(endpoint.to_string()));
        }
        if appkey.is_empty() {
            return Err(EndpointError::MissingAppkey);
        }

        let mut url =
            Url::parse(endpoint).map_err(|_| EndpointError::InvalidUrl(endpoint.to_string()))?;

        let path = url.path().trim_end_matches('/').to_string();
        let path = match path.rsplit_once('/') {
            Some((head, tail)) if is_version_segment(tail) => {
                tracing::warn!(
                    endpoint,
                    "specifying a version as part of the endpoint is deprecated"
                );
                head.to_string()
            }
            _ => path,
        };
        url.set_path(&format!("{path}/v2"));
        url.query_pairs_mut().append_pair("appkey", appkey);

        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// The explicit port, or the scheme default (80 for ws, 443 for wss).
    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(if self.is_secure() { 443 } else { 80 })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

fn is_version_segment(segment: &str) -> bool {
    match segment.strip_prefix('v') {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_version_and_appkey() {
        let ep = Endpoint::new("wss://rtm.example.com", "k3y").unwrap();
        assert_eq!(ep.as_str(), "wss://rtm.example.com/v2?appkey=k3y");
        assert!(ep.is_secure());
        assert_eq!(ep.port(), 443);
    }

    #[test]
    fn preserves_a_path_prefix() {
        let ep = Endpoint::new("ws://rtm.example.com:8080/foo/bar", "k").unwrap();
        assert_eq!(ep.as_str(), "ws://rtm.example.com:8080/foo/bar/v2?appkey=k");
        assert_eq!(ep.port(), 8080);
    }

    #[test]
    fn strips_a_deprecated_version_segment() {
        let ep = Endpoint::new("wss://rtm.example.com/v1", "k").unwrap();
        assert_eq!(ep.as_str(), "wss://rtm.example.com/v2?appkey=k");

        let ep = Endpoint::new("wss://rtm.example.com/foo/v3/", "k").unwrap();
        assert_eq!(ep.as_str(), "wss://rtm.example.com/foo/v2?appkey=k");

        // not a version segment
        let ep = Endpoint::new("wss://rtm.example.com/video", "k").unwrap();
        assert_eq!(ep.as_str(), "wss://rtm.example.com/video/v2?appkey=k");
    }

    #[test]
    fn rejects_malformed_credentials() {
        assert_eq!(
            Endpoint::new("https://rtm.example.com", "k").unwrap_err(),
            EndpointError::BadScheme("https://rtm.example.com".to_string())
        );
        assert_eq!(
            Endpoint::new("wss://rtm.example.com", "").unwrap_err(),
            EndpointError::MissingAppkey
        );
        assert!(matches!(
            Endpoint::new("ws://", "k").unwrap_err(),
            EndpointError::InvalidUrl(_)
        ));
    }
}
