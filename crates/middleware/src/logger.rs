//! Structured access logging.
//!
//! [`RequestLogger`] opens an `http.request` span carrying the request metadata, runs the inner
//! handler inside it and, once the handler returned, emits exactly one `request completed` event
//! with the final status, the response byte count and the latency. The event level follows the
//! status: below 400 `INFO`, 4xx `WARN`, anything else `ERROR`.
//!
//! The span is also stored in the [`RequestContext`] under [`LOGGER_KEY`] so that code running
//! outside the instrumented future can still log against the request.

use crate::config::LoggerConfig;
use crate::context::{ContextKey, RequestContext};
use crate::decorator::Decorator;
use crate::handler::RequestHandler;
use crate::request::{ConnectionInfo, request_endpoint};
use crate::response::{BufferedResponse, ResponseWriter};
use async_trait::async_trait;
use http::{HeaderMap, HeaderName, StatusCode};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{Instrument, Level, Span, debug, info_span};

pub static LOGGER_KEY: Lazy<ContextKey<Span>> = Lazy::new(|| ContextKey::new("logger"));

/// How the logger observes the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferMode {
    /// Body bytes go straight to the client, only status and size are tracked.
    #[default]
    PassThrough,
    /// The whole response is held back and flushed after the handler returned.
    Buffered,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogger {
    mode: BufferMode,
}

impl RequestLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &LoggerConfig) -> Self {
        Self::new().with_mode(config.mode)
    }

    #[must_use]
    pub fn with_mode(mut self, mode: BufferMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Log level of the completion event for a response with `status`.
pub fn level_for(status: StatusCode) -> Level {
    match status.as_u16() {
        0..400 => Level::INFO,
        400..500 => Level::WARN,
        _ => Level::ERROR,
    }
}

impl<H: RequestHandler> Decorator<H> for RequestLogger {
    type Out = RequestLoggerHandler<H>;

    fn decorate(&self, raw: H) -> Self::Out {
        RequestLoggerHandler { mode: self.mode, inner: raw }
    }
}

#[derive(Debug)]
pub struct RequestLoggerHandler<H> {
    mode: BufferMode,
    inner: H,
}

#[async_trait]
impl<H: RequestHandler> RequestHandler for RequestLoggerHandler<H> {
    async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
        let start = Instant::now();
        let span = request_span(req);
        req.insert(&LOGGER_KEY, span.clone());

        let mut writer = match self.mode {
            BufferMode::PassThrough => BufferedResponse::pass_through(&mut *resp),
            BufferMode::Buffered => BufferedResponse::buffering(&mut *resp),
        };
        self.inner.invoke(req, &mut writer).instrument(span.clone()).await;

        if writer.is_buffering()
            && let Err(e) = writer.flush().await
        {
            debug!(parent: &span, cause = %e, "failed to flush buffered response");
        }

        let status = writer.status();
        let content_length = writer.content_length();
        span.in_scope(|| log_completion(status, content_length, start.elapsed()));
    }
}

fn request_span(req: &RequestContext) -> Span {
    let headers = req.headers();
    let remote_addr = ConnectionInfo::of(req.request()).and_then(|info| info.remote_addr);
    let request_length = header_str(headers, &http::header::CONTENT_LENGTH).and_then(|value| value.parse::<u64>().ok());

    info_span!(
        "http.request",
        http.method = %req.method(),
        http.uri = %req.uri(),
        http.version = ?req.version(),
        http.endpoint = %request_endpoint(req.request()),
        http.remote_addr = remote_addr.as_ref().map(tracing::field::display),
        http.user_agent = header_str(headers, &http::header::USER_AGENT),
        http.referer = header_str(headers, &http::header::REFERER),
        http.request_content_length = request_length,
    )
}

macro_rules! completed {
    ($level:ident, $status:expr, $content_length:expr, $latency:expr) => {
        tracing::$level!(
            status = $status.as_u16(),
            content_length = $content_length,
            latency_ms = $latency.as_secs_f64() * 1000.0,
            "request completed"
        )
    };
}

fn log_completion(status: StatusCode, content_length: u64, latency: Duration) {
    let level = level_for(status);
    if level == Level::ERROR {
        completed!(error, status, content_length, latency);
    } else if level == Level::WARN {
        completed!(warn, status, content_length, latency);
    } else {
        completed!(info, status, content_length, latency);
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
