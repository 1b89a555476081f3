//! Adapter from a decorated [`RequestHandler`] to a plain request/response function.

use crate::body::Body;
use crate::context::RequestContext;
use crate::handler::RequestHandler;
use crate::response::response_channel;
use futures::channel::oneshot;
use http::{Request, Response};
use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, trace};

const DEFAULT_CHANNEL_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("handler ended without sending a response")]
    Aborted {
        #[from]
        source: oneshot::Canceled,
    },
}

/// Serves requests with a handler, one spawned task per request.
///
/// [`call`](HandlerService::call) resolves as soon as the handler committed the response head;
/// the body keeps streaming from the task while the caller consumes it. A handler that panics
/// after committing leaves the body ending in an error.
#[derive(Debug)]
pub struct HandlerService<H> {
    handler: Arc<H>,
    capacity: usize,
}

impl<H> Clone for HandlerService<H> {
    fn clone(&self) -> Self {
        Self { handler: Arc::clone(&self.handler), capacity: self.capacity }
    }
}

impl<H: RequestHandler + 'static> HandlerService<H> {
    pub fn new(handler: H) -> Self {
        Self { handler: Arc::new(handler), capacity: DEFAULT_CHANNEL_CAPACITY }
    }

    /// Bounds the number of body chunks buffered between the handler and the caller.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub async fn call(&self, req: Request<Body>) -> Result<Response<Body>, ServiceError> {
        let (mut writer, pending) = response_channel(self.capacity);
        let handler = Arc::clone(&self.handler);

        tokio::spawn(
            async move {
                let mut ctx = RequestContext::new(req);
                handler.invoke(&mut ctx, &mut writer).await;
                writer.finish();
                trace!("handler finished");
            }
            .in_current_span(),
        );

        Ok(pending.response().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::{HandlerService, ServiceError};
    use crate::body::Body;
    use crate::context::RequestContext;
    use crate::handler::RequestHandler;
    use crate::response::ResponseWriter;
    use async_trait::async_trait;
    use http::{HeaderValue, Request, StatusCode};
    use http_body_util::BodyExt;

    struct Greeter;

    #[async_trait]
    impl RequestHandler for Greeter {
        async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
            let name = req.uri().path().trim_start_matches('/').to_owned();
            resp.headers_mut().insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            resp.write_header(StatusCode::ACCEPTED);
            for part in ["hello", ", ", name.as_str()] {
                resp.write_all(part.as_bytes()).await.unwrap();
            }
        }
    }

    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn invoke(&self, _req: &mut RequestContext, _resp: &mut dyn ResponseWriter) {}
    }

    struct Crashing;

    #[async_trait]
    impl RequestHandler for Crashing {
        async fn invoke(&self, _req: &mut RequestContext, _resp: &mut dyn ResponseWriter) {
            panic!("handler crashed");
        }
    }

    struct CrashingMidway;

    #[async_trait]
    impl RequestHandler for CrashingMidway {
        async fn invoke(&self, _req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
            resp.write_all(b"partial").await.unwrap();
            panic!("handler crashed");
        }
    }

    #[tokio::test]
    async fn streams_handler_response() {
        let service = HandlerService::new(Greeter).with_capacity(1);
        let response = service.call(Request::builder().uri("/world").body(Body::empty()).unwrap()).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()[http::header::CONTENT_TYPE], "text/plain");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "hello, world");
    }

    #[tokio::test]
    async fn silent_handler_answers_ok_with_empty_body() {
        let service = HandlerService::new(Silent);
        let response = service.call(Request::new(Body::empty())).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.into_body().collect().await.unwrap().to_bytes().is_empty());
    }

    #[tokio::test]
    async fn crashed_handler_aborts_the_call() {
        let service = HandlerService::new(Crashing);
        let result = service.call(Request::new(Body::empty())).await;
        assert!(matches!(result, Err(ServiceError::Aborted { .. })));
    }

    #[tokio::test]
    async fn crash_after_commit_fails_the_body() {
        let service = HandlerService::new(CrashingMidway);
        let response = service.call(Request::new(Body::empty())).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let err = response.into_body().collect().await.unwrap_err();
        assert_eq!(err.to_string(), "response ended before the handler finished");
    }
}
