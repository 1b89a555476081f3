//! Post/redirect/get support.
//!
//! The inner handler runs against a [`BufferedResponse`] in buffering mode. When it returns,
//! a non-empty sentinel header (`X-Location` by default) turns the held response into a
//! redirect to that location; otherwise the response is flushed as the handler wrote it. The
//! sentinel never reaches the client.

use crate::config::{ConfigError, RedirectConfig};
use crate::context::RequestContext;
use crate::decorator::Decorator;
use crate::handler::RequestHandler;
use crate::response::{BufferedResponse, ResponseWriter};
use async_trait::async_trait;
use http::{HeaderName, HeaderValue, StatusCode, Uri};
use tracing::{debug, warn};
use url::{Position, Url};

pub const X_LOCATION: HeaderName = HeaderName::from_static("x-location");

#[derive(Debug, Clone)]
pub struct Redirector {
    header: HeaderName,
    status: StatusCode,
}

impl Redirector {
    pub fn new() -> Self {
        Self { header: X_LOCATION, status: StatusCode::FOUND }
    }

    pub fn from_config(config: &RedirectConfig) -> Result<Self, ConfigError> {
        let header = HeaderName::try_from(config.header.as_str()).map_err(|e| ConfigError::invalid_header(&config.header, e))?;
        let status = StatusCode::from_u16(config.status)
            .ok()
            .filter(StatusCode::is_redirection)
            .ok_or_else(|| ConfigError::invalid_status(config.status))?;
        Ok(Self { header, status })
    }

    /// Uses `header` as the sentinel instead of `X-Location`.
    #[must_use]
    pub fn with_header(mut self, header: HeaderName) -> Self {
        self.header = header;
        self
    }

    /// Redirects with `status` instead of `302 Found`.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl Default for Redirector {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: RequestHandler> Decorator<H> for Redirector {
    type Out = RedirectHandler<H>;

    fn decorate(&self, raw: H) -> Self::Out {
        RedirectHandler { header: self.header.clone(), status: self.status, inner: raw }
    }
}

#[derive(Debug)]
pub struct RedirectHandler<H> {
    header: HeaderName,
    status: StatusCode,
    inner: H,
}

#[async_trait]
impl<H: RequestHandler> RequestHandler for RedirectHandler<H> {
    async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
        let mut buffered = BufferedResponse::buffering(&mut *resp);
        self.inner.invoke(req, &mut buffered).await;

        let location = buffered.headers_mut().remove(&self.header).filter(|value| !value.is_empty());
        if let Some(location) = location {
            if buffered.is_committed() {
                warn!(location = ?location, "response already committed, redirect dropped");
            } else {
                let location = resolve_location(req.uri(), location);
                debug!(location = ?location, status = self.status.as_u16(), "redirecting");

                buffered.discard();
                let headers = buffered.headers_mut();
                headers.remove(http::header::CONTENT_TYPE);
                headers.remove(http::header::CONTENT_LENGTH);
                headers.insert(http::header::LOCATION, location);
                buffered.write_header(self.status);
            }
        }

        if let Err(e) = buffered.flush().await {
            debug!(cause = %e, "failed to flush buffered response");
        }
    }
}

const LOCAL_ORIGIN: &str = "http://localhost";

/// Resolves a location without scheme or host against the request path, keeping it
/// host-relative. Absolute and scheme-relative locations pass through.
fn resolve_location(uri: &Uri, location: HeaderValue) -> HeaderValue {
    let Ok(target) = location.to_str() else {
        return location;
    };
    if target.starts_with("//") || Url::parse(target).is_ok() {
        return location;
    }

    let resolved = Url::parse(LOCAL_ORIGIN).and_then(|origin| origin.join(uri.path())).and_then(|base| base.join(target));
    match resolved {
        Ok(url) => HeaderValue::from_str(&url[Position::BeforePath..]).unwrap_or(location),
        Err(e) => {
            debug!(cause = %e, location = target, "location kept unresolved");
            location
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Redirector, X_LOCATION, resolve_location};
    use crate::body::Body;
    use crate::context::RequestContext;
    use crate::decorator::Decorator;
    use crate::handler::RequestHandler;
    use crate::response::{ResponseRecorder, ResponseWriter};
    use async_trait::async_trait;
    use http::{HeaderValue, Method, Request, StatusCode, Uri};

    struct SaveForm {
        location: Option<&'static str>,
        flush_early: bool,
    }

    #[async_trait]
    impl RequestHandler for SaveForm {
        async fn invoke(&self, _req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
            let headers = resp.headers_mut();
            headers.insert(http::header::SET_COOKIE, HeaderValue::from_static("flash=saved"));
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
            headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(17));
            resp.write_header(StatusCode::OK);
            resp.write_all(b"<p>rendered!</p>\n").await.unwrap();

            if self.flush_early {
                resp.flush().await.unwrap();
            }
            if let Some(location) = self.location {
                resp.headers_mut().insert(X_LOCATION, HeaderValue::from_static(location));
            }
        }
    }

    async fn run(redirector: &Redirector, handler: SaveForm, path: &str) -> ResponseRecorder {
        let handler = redirector.decorate(handler);
        let mut ctx = RequestContext::new(Request::builder().method(Method::POST).uri(path).body(Body::empty()).unwrap());
        let mut recorder = ResponseRecorder::new();
        handler.invoke(&mut ctx, &mut recorder).await;
        recorder
    }

    #[tokio::test]
    async fn without_sentinel_response_is_flushed_verbatim() {
        let recorder = run(&Redirector::new(), SaveForm { location: None, flush_early: false }, "/signup").await;

        assert_eq!(recorder.status(), StatusCode::OK);
        assert_eq!(recorder.body(), b"<p>rendered!</p>\n");
        assert_eq!(recorder.headers()[http::header::CONTENT_LENGTH], "17");
        assert_eq!(recorder.headers()[http::header::CONTENT_TYPE], "text/html");
        assert_eq!(recorder.flush_count(), 1);
    }

    #[tokio::test]
    async fn sentinel_turns_response_into_redirect() {
        let handler = SaveForm { location: Some("/signup/done"), flush_early: false };
        let recorder = run(&Redirector::new(), handler, "/signup").await;

        assert_eq!(recorder.status(), StatusCode::FOUND);
        assert_eq!(recorder.headers()[http::header::LOCATION], "/signup/done");
        assert!(recorder.body().is_empty());

        let headers = recorder.committed_headers();
        assert!(headers.get(X_LOCATION).is_none());
        assert!(headers.get(http::header::CONTENT_TYPE).is_none());
        assert!(headers.get(http::header::CONTENT_LENGTH).is_none());
        assert_eq!(headers[http::header::SET_COOKIE], "flash=saved");
    }

    #[tokio::test]
    async fn empty_sentinel_is_stripped_and_ignored() {
        let recorder = run(&Redirector::new(), SaveForm { location: Some(""), flush_early: false }, "/signup").await;

        assert_eq!(recorder.status(), StatusCode::OK);
        assert_eq!(recorder.body(), b"<p>rendered!</p>\n");
        assert!(recorder.committed_headers().get(X_LOCATION).is_none());
    }

    #[tokio::test]
    async fn relative_location_resolves_against_request_directory() {
        let handler = SaveForm { location: Some("../home?welcome=1"), flush_early: false };
        let recorder = run(&Redirector::new(), handler, "/account/settings/profile").await;
        assert_eq!(recorder.headers()[http::header::LOCATION], "/account/home?welcome=1");

        let handler = SaveForm { location: Some("https://example.com/next"), flush_early: false };
        let recorder = run(&Redirector::new(), handler, "/account/settings").await;
        assert_eq!(recorder.headers()[http::header::LOCATION], "https://example.com/next");
    }

    #[tokio::test]
    async fn committed_response_cannot_be_redirected() {
        let handler = SaveForm { location: Some("/too-late"), flush_early: true };
        let recorder = run(&Redirector::new(), handler, "/signup").await;

        assert_eq!(recorder.status(), StatusCode::OK);
        assert_eq!(recorder.body(), b"<p>rendered!</p>\n");
        assert!(recorder.headers().get(http::header::LOCATION).is_none());
    }

    #[tokio::test]
    async fn custom_status_and_header() {
        let redirector = Redirector::new().with_status(StatusCode::SEE_OTHER).with_header(http::HeaderName::from_static("x-next"));

        struct Next;

        #[async_trait]
        impl RequestHandler for Next {
            async fn invoke(&self, _req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
                resp.headers_mut().insert("x-next", HeaderValue::from_static("/orders/7"));
                resp.write_all(b"created").await.unwrap();
            }
        }

        let handler = redirector.decorate(Next);
        let mut ctx = RequestContext::new(Request::new(Body::empty()));
        let mut recorder = ResponseRecorder::new();
        handler.invoke(&mut ctx, &mut recorder).await;

        assert_eq!(recorder.status(), StatusCode::SEE_OTHER);
        assert_eq!(recorder.headers()[http::header::LOCATION], "/orders/7");
        assert!(recorder.body().is_empty());
    }

    #[test]
    fn resolves_dot_segments_and_keeps_trailing_slash() {
        let resolve = |path: &'static str, location: &'static str| {
            resolve_location(&Uri::from_static(path), HeaderValue::from_static(location))
        };

        assert_eq!(resolve("/a/b/c", "./d/../e/"), "/a/b/e/");
        assert_eq!(resolve("/a/b/c", "/x/./y/../z"), "/x/z");
        assert_eq!(resolve("/a/b/c", "../../../x"), "/x");
        assert_eq!(resolve("/a/b/", "d#top"), "/a/b/d#top");
        assert_eq!(resolve("/a/b/c", "//cdn.example.com/x"), "//cdn.example.com/x");
    }
}
