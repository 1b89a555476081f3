//! Distributed-trace propagation.
//!
//! [`Tracer`] extracts the caller's trace context from the request headers with a
//! `TextMapPropagator` (W3C `traceparent` by default), stores it in the [`RequestContext`] under
//! [`TRACE_CONTEXT_KEY`], and runs the inner handler inside an `http.server` span whose
//! OpenTelemetry parent is that context. Every request body frame read and every response write
//! is reported as a message event. The tracer only observes: requests and responses pass through
//! unchanged.

use crate::body::{Body, BoxError};
use crate::context::{ContextKey, RequestContext};
use crate::decorator::Decorator;
use crate::handler::RequestHandler;
use crate::response::{BufferedResponse, ResponseWriter};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body::{Body as HttpBody, Frame, SizeHint};
use once_cell::sync::Lazy;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::TraceContextExt;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use pin_project_lite::pin_project;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tracing::field::{Empty, display};
use tracing::{Instrument, Span, info_span, trace};
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub static TRACE_CONTEXT_KEY: Lazy<ContextKey<opentelemetry::Context>> = Lazy::new(|| ContextKey::new("trace_context"));

#[derive(Clone)]
pub struct Tracer {
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
}

impl Tracer {
    pub fn new() -> Self {
        Self { propagator: Arc::new(TraceContextPropagator::new()) }
    }

    #[must_use]
    pub fn with_propagator<P: TextMapPropagator + Send + Sync + 'static>(mut self, propagator: P) -> Self {
        self.propagator = Arc::new(propagator);
        self
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer").field("propagator", &self.propagator).finish()
    }
}

impl<H: RequestHandler> Decorator<H> for Tracer {
    type Out = TraceHandler<H>;

    fn decorate(&self, raw: H) -> Self::Out {
        TraceHandler { propagator: Arc::clone(&self.propagator), inner: raw }
    }
}

pub struct TraceHandler<H> {
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    inner: H,
}

impl<H: fmt::Debug> fmt::Debug for TraceHandler<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceHandler").field("inner", &self.inner).finish_non_exhaustive()
    }
}

#[async_trait]
impl<H: RequestHandler> RequestHandler for TraceHandler<H> {
    async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
        let parent = self.propagator.extract(&HeaderExtractor(req.headers()));
        let span = info_span!(
            "http.server",
            otel.name = %format!("{} {}", req.method(), req.uri().path()),
            otel.kind = "server",
            trace_id = Empty,
            parent_span_id = Empty,
            http.status_code = Empty,
        );

        let remote = parent.span().span_context().clone();
        if remote.is_valid() {
            span.record("trace_id", display(remote.trace_id()));
            span.record("parent_span_id", display(remote.span_id()));
        }
        span.set_parent(parent.clone());
        req.insert(&TRACE_CONTEXT_KEY, parent);

        let body = req.request_mut().body_mut();
        if !body.is_end_stream() {
            *body = Body::stream(ReadEventBody::new(body.take(), span.clone()));
        }

        let mut writer = MessageEventWriter::new(&mut *resp, span.clone());
        self.inner.invoke(req, &mut writer).instrument(span.clone()).await;

        span.record("http.status_code", writer.status().as_u16());
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(http::HeaderName::as_str).collect()
    }
}

pin_project! {
    /// Request body reporting a `RECEIVED` message event per data frame.
    #[derive(Debug)]
    pub struct ReadEventBody<B> {
        #[pin]
        inner: B,
        span: Span,
        sequence: u64,
    }
}

impl<B> ReadEventBody<B> {
    pub fn new(inner: B, span: Span) -> Self {
        Self { inner, span, sequence: 0 }
    }
}

impl<B> HttpBody for ReadEventBody<B>
where
    B: HttpBody<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        let frame = ready!(this.inner.as_mut().poll_frame(cx));

        if let Some(Ok(frame)) = &frame
            && let Some(data) = frame.data_ref()
        {
            *this.sequence += 1;
            trace!(
                parent: &*this.span,
                message.kind = "RECEIVED",
                message.id = *this.sequence,
                message.uncompressed_size = data.len(),
                "message received"
            );
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Response writer reporting a `SENT` message event per body write.
#[derive(Debug)]
pub struct MessageEventWriter<W> {
    inner: BufferedResponse<W>,
    span: Span,
    sequence: u64,
}

impl<W: ResponseWriter> MessageEventWriter<W> {
    pub fn new(inner: W, span: Span) -> Self {
        Self { inner: BufferedResponse::pass_through(inner), span, sequence: 0 }
    }

    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }
}

#[async_trait]
impl<W: ResponseWriter> ResponseWriter for MessageEventWriter<W> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        self.inner.write_header(status);
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(data).await?;
        self.sequence += 1;
        trace!(
            parent: &self.span,
            message.kind = "SENT",
            message.id = self.sequence,
            message.uncompressed_size = written,
            "message sent"
        );
        Ok(written)
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::{TRACE_CONTEXT_KEY, Tracer};
    use crate::body::Body;
    use crate::context::RequestContext;
    use crate::decorator::Decorator;
    use crate::handler::RequestHandler;
    use crate::logger::tests::Captured;
    use crate::response::{ResponseRecorder, ResponseWriter};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderValue, Method, Request, StatusCode};
    use http_body::Frame;
    use http_body_util::{BodyExt, StreamBody};
    use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
    use opentelemetry_sdk::trace::TracerProvider;
    use std::convert::Infallible;
    use tracing::Span;
    use tracing_opentelemetry::OpenTelemetrySpanExt;
    use tracing_subscriber::layer::SubscriberExt;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
            if let Some(cx) = req.get(&TRACE_CONTEXT_KEY) {
                let trace_id = cx.span().span_context().trace_id().to_string();
                resp.headers_mut().insert("x-trace-id", HeaderValue::from_str(&trace_id).unwrap());
            }

            let body = req.request_mut().body_mut().take().collect().await.unwrap().to_bytes();
            resp.write_header(StatusCode::CREATED);
            for chunk in body.chunks(4) {
                resp.write_all(chunk).await.unwrap();
            }
        }
    }

    struct SpanIds;

    #[async_trait]
    impl RequestHandler for SpanIds {
        async fn invoke(&self, _req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
            let cx = Span::current().context();
            let span_context = cx.span().span_context().clone();
            resp.headers_mut().insert("x-trace-id", HeaderValue::from_str(&span_context.trace_id().to_string()).unwrap());
            resp.headers_mut().insert("x-span-id", HeaderValue::from_str(&span_context.span_id().to_string()).unwrap());
        }
    }

    fn request(traceparent: Option<&str>) -> RequestContext {
        let frames = vec![
            Ok::<_, Infallible>(Frame::data(Bytes::from_static(b"hello "))),
            Ok(Frame::data(Bytes::from_static(b"tracer"))),
        ];
        let mut builder = Request::builder().method(Method::PUT).uri("/items/1");
        if let Some(value) = traceparent {
            builder = builder.header("traceparent", value);
        }
        RequestContext::new(builder.body(Body::stream(StreamBody::new(futures::stream::iter(frames)))).unwrap())
    }

    #[tokio::test]
    async fn extracts_remote_context() {
        let handler = Tracer::new().decorate(Echo);
        let mut ctx = request(Some(TRACEPARENT));
        let mut recorder = ResponseRecorder::new();
        handler.invoke(&mut ctx, &mut recorder).await;

        assert_eq!(recorder.headers()["x-trace-id"], "4bf92f3577b34da6a3ce929d0e0e4736");
        let stored = ctx.get(&TRACE_CONTEXT_KEY).unwrap();
        assert!(stored.span().span_context().is_remote());
    }

    #[tokio::test]
    async fn server_span_joins_the_remote_trace() {
        let provider = TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry().with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));
        let _guard = tracing::subscriber::set_default(subscriber);

        let handler = Tracer::new().decorate(SpanIds);
        let mut ctx = request(Some(TRACEPARENT));
        let mut recorder = ResponseRecorder::new();
        handler.invoke(&mut ctx, &mut recorder).await;

        assert_eq!(recorder.headers()["x-trace-id"], "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_ne!(recorder.headers()["x-span-id"], "00f067aa0ba902b7");
    }

    #[tokio::test]
    async fn request_and_response_pass_through_unchanged() {
        let handler = Tracer::new().decorate(Echo);
        let mut ctx = request(None);
        let mut recorder = ResponseRecorder::new();
        handler.invoke(&mut ctx, &mut recorder).await;

        assert_eq!(recorder.status(), StatusCode::CREATED);
        assert_eq!(recorder.body(), b"hello tracer");
        assert!(!ctx.get(&TRACE_CONTEXT_KEY).unwrap().has_active_span());
    }

    #[tokio::test]
    async fn reports_message_events() {
        let captured = Captured::default();
        let _guard = captured.install();

        let handler = Tracer::new().decorate(Echo);
        let mut ctx = request(Some(TRACEPARENT));
        let mut recorder = ResponseRecorder::new();
        handler.invoke(&mut ctx, &mut recorder).await;

        let received = captured.with_message("message received");
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].numbers["message.id"], 2);
        assert_eq!(received[0].numbers["message.uncompressed_size"], 6);

        let sent = captured.with_message("message sent");
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].numbers["message.uncompressed_size"], 4);
    }
}
