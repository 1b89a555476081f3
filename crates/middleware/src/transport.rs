//! Outbound transports and the options wrapping them.
//!
//! A [`Transport`] performs one client round trip. A [`TransportOption`] wraps a transport into
//! another one; [`apply_options`] composes a base transport with options in order, so the last
//! option ends up outermost. [`TransportWithAuthorization`] is the option adding a bearer token
//! for a fixed audience to every outgoing request.

use crate::body::{Body, BoxError};
use async_trait::async_trait;
use http::header::AUTHORIZATION;
use http::uri::InvalidUri;
use http::{HeaderValue, Request, Response, Uri};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, trace};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to authorize request: {source}")]
    Authorization { source: BoxError },

    #[error("round trip failed: {source}")]
    RoundTrip { source: BoxError },
}

impl TransportError {
    pub fn authorization<E: Into<BoxError>>(e: E) -> Self {
        Self::Authorization { source: e.into() }
    }

    pub fn round_trip<E: Into<BoxError>>(e: E) -> Self {
        Self::RoundTrip { source: e.into() }
    }
}

/// Failure to construct a wrapped transport.
#[derive(Error, Debug)]
pub enum TransportBuildError {
    #[error("invalid audience {audience:?}: {source}")]
    InvalidAudience { audience: String, source: InvalidUri },

    #[error("audience {audience:?} is not an absolute url")]
    RelativeAudience { audience: String },
}

impl TransportBuildError {
    pub fn invalid_audience(audience: &str, source: InvalidUri) -> Self {
        Self::InvalidAudience { audience: audience.to_owned(), source }
    }

    pub fn relative_audience(audience: &str) -> Self {
        Self::RelativeAudience { audience: audience.to_owned() }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
        (**self).round_trip(req).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
        (**self).round_trip(req).await
    }
}

pub struct TransportFn<F> {
    f: F,
}

/// Adapts an async closure into a [`Transport`].
pub fn transport_fn<F, Fut>(f: F) -> TransportFn<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<Body>, TransportError>> + Send,
{
    TransportFn { f }
}

impl<F> fmt::Debug for TransportFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFn").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Transport for TransportFn<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<Body>, TransportError>> + Send,
{
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
        (self.f)(req).await
    }
}

/// Wraps a transport into another one.
pub trait TransportOption {
    fn wrap_transport(&self, base: Box<dyn Transport>) -> Box<dyn Transport>;
}

pub struct TransportOptionFn<F> {
    f: F,
}

impl<F> TransportOptionFn<F>
where
    F: Fn(Box<dyn Transport>) -> Box<dyn Transport>,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for TransportOptionFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptionFn").finish_non_exhaustive()
    }
}

impl<F> TransportOption for TransportOptionFn<F>
where
    F: Fn(Box<dyn Transport>) -> Box<dyn Transport>,
{
    fn wrap_transport(&self, base: Box<dyn Transport>) -> Box<dyn Transport> {
        (self.f)(base)
    }
}

/// Applies `options` to `base` in order: the first option wraps `base`, the last one is outermost.
pub fn apply_options(base: Box<dyn Transport>, options: &[&dyn TransportOption]) -> Box<dyn Transport> {
    options.iter().fold(base, |transport, option| option.wrap_transport(transport))
}

/// Supplies tokens for an audience.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, audience: &str) -> Result<String, BoxError>;
}

/// Hands out the same token for every audience.
#[derive(Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self { token: token.into() }
    }
}

impl fmt::Debug for StaticTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self, _audience: &str) -> Result<String, BoxError> {
        Ok(self.token.clone())
    }
}

/// Option adding `Authorization: Bearer <token>` to every request, the token being issued for
/// `audience`.
#[derive(Clone)]
pub struct TransportWithAuthorization {
    audience: String,
    source: Arc<dyn TokenSource>,
}

impl TransportWithAuthorization {
    pub fn new<A: Into<String>, S: TokenSource + 'static>(audience: A, source: S) -> Self {
        Self { audience: audience.into(), source: Arc::new(source) }
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Wraps `base`, failing when the audience is not an absolute url.
    pub fn try_wrap(&self, base: Box<dyn Transport>) -> Result<Box<dyn Transport>, TransportBuildError> {
        let uri: Uri = self.audience.parse().map_err(|e| TransportBuildError::invalid_audience(&self.audience, e))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(TransportBuildError::relative_audience(&self.audience));
        }

        Ok(Box::new(AuthorizedTransport { audience: self.audience.clone(), source: Arc::clone(&self.source), inner: base }))
    }
}

impl fmt::Debug for TransportWithAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportWithAuthorization").field("audience", &self.audience).finish_non_exhaustive()
    }
}

impl TransportOption for TransportWithAuthorization {
    /// # Panics
    ///
    /// When [`try_wrap`](Self::try_wrap) fails. Transports are built at startup, and a process
    /// must not go on with one that would send requests unauthenticated.
    fn wrap_transport(&self, base: Box<dyn Transport>) -> Box<dyn Transport> {
        match self.try_wrap(base) {
            Ok(transport) => transport,
            Err(e) => {
                error!(cause = %e, "failed to build authorized transport");
                panic!("failed to build authorized transport: {e}");
            }
        }
    }
}

struct AuthorizedTransport {
    audience: String,
    source: Arc<dyn TokenSource>,
    inner: Box<dyn Transport>,
}

#[async_trait]
impl Transport for AuthorizedTransport {
    async fn round_trip(&self, mut req: Request<Body>) -> Result<Response<Body>, TransportError> {
        let token = self.source.token(&self.audience).await.map_err(TransportError::authorization)?;

        let mut value = HeaderValue::try_from(format!("Bearer {token}")).map_err(TransportError::authorization)?;
        value.set_sensitive(true);
        req.headers_mut().insert(AUTHORIZATION, value);

        trace!(audience = %self.audience, uri = %req.uri(), "sending authorized request");
        self.inner.round_trip(req).await
    }
}
