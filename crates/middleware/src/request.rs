//! Reconstruction of the endpoint a client addressed.
//!
//! Behind a reverse proxy the connection only tells where the proxy connected from; the
//! `X-Forwarded-Host` and `X-Forwarded-Proto` headers carry what the client actually asked for
//! and take precedence over the connection attributes.

use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, HeaderName, Request, Uri};
use std::fmt;
use std::net::SocketAddr;

pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Attributes of the connection a request arrived on, installed by the host as a request
/// extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,
    pub tls: bool,
}

impl ConnectionInfo {
    pub fn of<B>(req: &Request<B>) -> Option<&ConnectionInfo> {
        req.extensions().get::<ConnectionInfo>()
    }
}

/// Scheme and host the client addressed, optionally with the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    host: String,
    path: Option<String>,
}

impl Endpoint {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Extends the endpoint with the path and query of `uri`.
    #[must_use]
    pub fn with_path_and_query(mut self, uri: &Uri) -> Self {
        self.path = uri.path_and_query().map(|pq| pq.as_str().to_owned());
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(path) = &self.path {
            f.write_str(path)?;
        }
        Ok(())
    }
}

impl TryFrom<&Endpoint> for Uri {
    type Error = http::Error;

    fn try_from(endpoint: &Endpoint) -> Result<Self, Self::Error> {
        let scheme = Scheme::try_from(endpoint.scheme.as_str())?;
        let authority = Authority::try_from(endpoint.host.as_str())?;
        let path = PathAndQuery::try_from(endpoint.path.as_deref().unwrap_or("/"))?;
        Ok(Uri::builder().scheme(scheme).authority(authority).path_and_query(path).build()?)
    }
}

impl TryFrom<Endpoint> for Uri {
    type Error = http::Error;

    fn try_from(endpoint: Endpoint) -> Result<Self, Self::Error> {
        Uri::try_from(&endpoint)
    }
}

/// Rebuilds the origin (`scheme://host`) the client used to reach this request.
pub fn request_endpoint<B>(req: &Request<B>) -> Endpoint {
    let tls = ConnectionInfo::of(req).is_some_and(|info| info.tls);
    let mut scheme = if tls { "https" } else { "http" }.to_owned();

    let mut host = match req.uri().authority() {
        Some(authority) => authority.as_str().to_owned(),
        None => header_str(req.headers(), &http::header::HOST).unwrap_or_default().to_owned(),
    };

    if let Some(value) = header_str(req.headers(), &X_FORWARDED_HOST) {
        value.clone_into(&mut host);
    }
    if let Some(value) = header_str(req.headers(), &X_FORWARDED_PROTO) {
        value.clone_into(&mut scheme);
    }

    Endpoint { scheme, host, path: None }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{ConnectionInfo, request_endpoint};
    use crate::body::Body;
    use http::{Request, Uri};

    fn request(uri: &str) -> http::request::Builder {
        Request::builder().uri(uri)
    }

    #[test]
    fn forwarded_headers_take_precedence() {
        let req = request("/login")
            .header("Host", "internal:8080")
            .header("X-Forwarded-Host", "h")
            .header("X-Forwarded-Proto", "https")
            .body(Body::empty())
            .unwrap();

        assert_eq!(request_endpoint(&req).to_string(), "https://h");
    }

    #[test]
    fn falls_back_to_host_header_and_plain_http() {
        let req = request("/login").header("Host", "example.com").body(Body::empty()).unwrap();

        let endpoint = request_endpoint(&req);
        assert_eq!(endpoint.scheme(), "http");
        assert_eq!(endpoint.host(), "example.com");
        assert_eq!(endpoint.path(), None);
    }

    #[test]
    fn tls_connection_yields_https() {
        let mut req = request("http://api.example.com/v1").body(Body::empty()).unwrap();
        req.extensions_mut().insert(ConnectionInfo { remote_addr: None, tls: true });

        assert_eq!(request_endpoint(&req).to_string(), "https://api.example.com");
    }

    #[test]
    fn path_preserving_variant() {
        let uri: Uri = "/users/7?tab=profile".parse().unwrap();
        let req = request("/users/7?tab=profile").header("Host", "example.com").body(Body::empty()).unwrap();

        let endpoint = request_endpoint(&req).with_path_and_query(&uri);
        assert_eq!(endpoint.to_string(), "http://example.com/users/7?tab=profile");

        let uri = Uri::try_from(endpoint).unwrap();
        assert_eq!(uri.host(), Some("example.com"));
        assert_eq!(uri.path(), "/users/7");
    }
}
