//! Cross-origin resource sharing.
//!
//! Configuration comes as any number of [`CorsConfig`] lists merged additively into the default
//! [`CorsOptions`]. Deciding what a given request may do is delegated to a [`CorsPolicy`]; the
//! stock one, [`CorsLayerPolicy`], runs the options as a `tower-http` [`CorsLayer`].

use crate::body::Body;
use crate::context::RequestContext;
use crate::decorator::Decorator;
use crate::handler::RequestHandler;
use crate::response::ResponseWriter;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{self, Ready};
use http::header::{ACCESS_CONTROL_REQUEST_METHOD, ORIGIN};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, request};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Service, ServiceExt};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};
use tower_layer::Layer;
use tracing::{trace, warn};

/// Additional CORS lists, merged on top of the defaults.
///
/// An origin may be `*` or contain a single `*` wildcard, e.g. `https://*.example.com`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
}

/// The effective CORS options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsOptions {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: Duration,
}

const DEFAULT_ALLOWED_HEADERS: [&str; 14] = [
    "Authorization",
    "Accept-Encoding",
    "Content-Encoding",
    "Content-Type",
    "Connect-Protocol-Version",
    "Connect-Timeout-Ms",
    "Connect-Accept-Encoding",
    "Connect-Content-Encoding",
    "Grpc-Timeout",
    "X-Grpc-Web",
    "X-User-Agent",
    "X-Request-ID",
    "X-Requested-With",
    "X-HTTP-Method-Override",
];

const DEFAULT_EXPOSED_HEADERS: [&str; 5] =
    ["Content-Encoding", "Connect-Content-Encoding", "Grpc-Status", "Grpc-Message", "Location"];

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: vec![Method::GET.to_string(), Method::POST.to_string()],
            allowed_headers: DEFAULT_ALLOWED_HEADERS.iter().map(|&h| h.to_owned()).collect(),
            exposed_headers: DEFAULT_EXPOSED_HEADERS.iter().map(|&h| h.to_owned()).collect(),
            allow_credentials: true,
            max_age: Duration::from_secs(86400),
        }
    }
}

impl CorsOptions {
    /// The defaults merged with every config in order.
    pub fn with_configs<'a, I: IntoIterator<Item = &'a CorsConfig>>(configs: I) -> Self {
        let mut options = Self::default();
        for config in configs {
            options.merge(config);
        }
        options
    }

    /// Adds the lists of `config`; entries already present are not repeated.
    pub fn merge(&mut self, config: &CorsConfig) {
        union(&mut self.allowed_origins, &config.allowed_origins, |a, b| a == b);
        union(&mut self.allowed_methods, &config.allowed_methods, str::eq_ignore_ascii_case);
        union(&mut self.allowed_headers, &config.allowed_headers, str::eq_ignore_ascii_case);
        union(&mut self.exposed_headers, &config.exposed_headers, str::eq_ignore_ascii_case);
    }

    /// Builds the `tower-http` layer enforcing these options.
    ///
    /// A `*` entry allows any value; with credentials allowed the request's own value is echoed
    /// instead. Entries that are not valid header names, methods or origins are skipped.
    pub fn layer(&self) -> CorsLayer {
        let origins = if has_wildcard(&self.allowed_origins) {
            if self.allow_credentials { AllowOrigin::mirror_request() } else { AllowOrigin::any() }
        } else if self.allowed_origins.iter().any(|origin| origin.contains('*')) {
            let patterns = self.allowed_origins.clone();
            AllowOrigin::predicate(move |origin: &HeaderValue, _: &request::Parts| {
                origin.to_str().is_ok_and(|origin| patterns.iter().any(|pattern| origin_matches(pattern, origin)))
            })
        } else {
            AllowOrigin::list(parse_all("origin", &self.allowed_origins, HeaderValue::from_str))
        };
        let methods = if has_wildcard(&self.allowed_methods) {
            if self.allow_credentials { AllowMethods::mirror_request() } else { AllowMethods::any() }
        } else {
            AllowMethods::list(parse_all("method", &self.allowed_methods, |m| Method::from_bytes(m.as_bytes())))
        };
        let headers = if has_wildcard(&self.allowed_headers) {
            if self.allow_credentials { AllowHeaders::mirror_request() } else { AllowHeaders::any() }
        } else {
            AllowHeaders::list(parse_all("header", &self.allowed_headers, HeaderName::try_from))
        };
        let exposed = if has_wildcard(&self.exposed_headers) && !self.allow_credentials {
            ExposeHeaders::any()
        } else {
            ExposeHeaders::list(parse_all("header", &self.exposed_headers, HeaderName::try_from))
        };

        let layer = CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .expose_headers(exposed)
            .allow_credentials(self.allow_credentials);
        if self.max_age.is_zero() { layer } else { layer.max_age(self.max_age) }
    }
}

fn union(target: &mut Vec<String>, extra: &[String], same: fn(&str, &str) -> bool) {
    for value in extra {
        if !target.iter().any(|existing| same(existing, value)) {
            target.push(value.clone());
        }
    }
}

fn origin_matches(pattern: &str, origin: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == origin,
        Some((prefix, suffix)) => {
            origin.len() >= prefix.len() + suffix.len() && origin.starts_with(prefix) && origin.ends_with(suffix)
        }
    }
}

fn has_wildcard(values: &[String]) -> bool {
    values.iter().any(|value| value == "*")
}

fn parse_all<'a, T, E: fmt::Display>(kind: &str, values: &'a [String], parse: impl Fn(&'a str) -> Result<T, E>) -> Vec<T> {
    values
        .iter()
        .filter(|value| value.as_str() != "*")
        .filter_map(|value| match parse(value.as_str()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(kind, value = value.as_str(), cause = %e, "invalid cors entry skipped");
                None
            }
        })
        .collect()
}

/// The policy engine deciding what a cross-origin request may do.
#[cfg_attr(test, mockall::automock)]
pub trait CorsPolicy: Send + Sync {
    /// Answers a preflight request by filling `headers`, returning the status to respond with.
    fn preflight(&self, req: &Request<Body>, headers: &mut HeaderMap) -> StatusCode;

    /// Fills `headers` for an actual request before the handler runs.
    fn actual(&self, req: &Request<Body>, headers: &mut HeaderMap);
}

/// [`CorsPolicy`] delegating to a `tower-http` [`CorsLayer`].
///
/// The layer wraps a service answering every request with an empty response, so running it
/// over a copy of the request head yields exactly the CORS headers to add.
#[derive(Debug, Clone)]
pub struct CorsLayerPolicy {
    service: tower_http::cors::Cors<EmptyResponse>,
}

impl CorsLayerPolicy {
    pub fn new(layer: &CorsLayer) -> Self {
        Self { service: layer.layer(EmptyResponse) }
    }

    fn run(&self, req: &Request<Body>) -> Option<Response<()>> {
        let mut head = Request::new(());
        *head.method_mut() = req.method().clone();
        *head.uri_mut() = req.uri().clone();
        *head.version_mut() = req.version();
        *head.headers_mut() = req.headers().clone();

        let response = self.service.clone().oneshot(head).now_or_never();
        if response.is_none() {
            trace!(method = %req.method(), "cors layer did not answer synchronously");
        }
        response.map(|result| match result {
            Ok(response) => response,
            Err(never) => match never {},
        })
    }
}

impl CorsPolicy for CorsLayerPolicy {
    fn preflight(&self, req: &Request<Body>, headers: &mut HeaderMap) -> StatusCode {
        match self.run(req) {
            Some(response) => {
                let (parts, ()) = response.into_parts();
                headers.extend(parts.headers);
                parts.status
            }
            None => StatusCode::FORBIDDEN,
        }
    }

    fn actual(&self, req: &Request<Body>, headers: &mut HeaderMap) {
        if let Some(response) = self.run(req) {
            headers.extend(response.into_parts().0.headers);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EmptyResponse;

impl Service<Request<()>> for EmptyResponse {
    type Response = Response<()>;
    type Error = Infallible;
    type Future = Ready<Result<Response<()>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        future::ready(Ok(Response::new(())))
    }
}

/// Decorator applying a [`CorsPolicy`]; preflight requests are answered without reaching the
/// inner handler.
#[derive(Clone)]
pub struct Cors {
    policy: Arc<dyn CorsPolicy>,
}

impl Cors {
    pub fn new<P: CorsPolicy + 'static>(policy: P) -> Self {
        Self { policy: Arc::new(policy) }
    }

    /// Uses a [`CorsLayerPolicy`] built from the defaults merged with `configs`.
    pub fn from_config(configs: &[CorsConfig]) -> Self {
        Self::from_options(&CorsOptions::with_configs(configs))
    }

    pub fn from_options(options: &CorsOptions) -> Self {
        Self::new(CorsLayerPolicy::new(&options.layer()))
    }
}

impl Default for Cors {
    fn default() -> Self {
        Self::from_options(&CorsOptions::default())
    }
}

impl fmt::Debug for Cors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cors").finish_non_exhaustive()
    }
}

impl<H: RequestHandler> Decorator<H> for Cors {
    type Out = CorsHandler<H>;

    fn decorate(&self, raw: H) -> Self::Out {
        CorsHandler { policy: Arc::clone(&self.policy), inner: raw }
    }
}

pub struct CorsHandler<H> {
    policy: Arc<dyn CorsPolicy>,
    inner: H,
}

impl<H: fmt::Debug> fmt::Debug for CorsHandler<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorsHandler").field("inner", &self.inner).finish_non_exhaustive()
    }
}

#[async_trait]
impl<H: RequestHandler> RequestHandler for CorsHandler<H> {
    async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
        if is_preflight(req.request()) {
            let status = self.policy.preflight(req.request(), resp.headers_mut());
            resp.write_header(status);
            return;
        }

        self.policy.actual(req.request(), resp.headers_mut());
        self.inner.invoke(req, resp).await;
    }
}

fn is_preflight(req: &Request<Body>) -> bool {
    req.method() == Method::OPTIONS
        && req.headers().contains_key(ORIGIN)
        && req.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD)
}
