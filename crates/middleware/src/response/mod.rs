//! The response-writer capability and its implementations.
//!
//! Handlers do not return a response; they write one into a [`ResponseWriter`] sink. That lets
//! decorators interpose their own writer between the handler and the real connection:
//!
//! - [`BufferedResponse`]: captures status, byte count and, in buffering mode, the whole
//!   response until an explicit flush
//! - [`ResponseRecorder`]: an in-memory sink that can be turned into a `Response<Body>`
//! - [`ChannelResponseWriter`]: a streaming sink feeding a [`PendingResponse`]

mod buffered;
mod channel;
mod recorder;

pub use buffered::BufferedResponse;
pub use channel::{ChannelResponseWriter, PendingResponse, response_channel};
pub use recorder::ResponseRecorder;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};
use std::io;
use tracing::debug;

/// A sink for one HTTP response.
///
/// The head (status and headers) is committed by [`write_header`](ResponseWriter::write_header)
/// or implicitly with `200 OK` by the first body write. Headers changed after the commit are not
/// sent.
#[async_trait]
pub trait ResponseWriter: Send {
    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    fn write_header(&mut self, status: StatusCode);

    /// Writes body bytes, returning how many were accepted.
    async fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    async fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.write(data).await? {
                0 => return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write whole response body")),
                n => data = &data[n..],
            }
        }
        Ok(())
    }

    /// Pushes written bytes towards the client. Sinks that cannot flush incrementally keep this no-op.
    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<W: ResponseWriter + ?Sized> ResponseWriter for &mut W {
    fn headers(&self) -> &HeaderMap {
        (**self).headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        (**self).write_header(status);
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        (**self).flush().await
    }
}

#[async_trait]
impl<W: ResponseWriter + ?Sized> ResponseWriter for Box<W> {
    fn headers(&self) -> &HeaderMap {
        (**self).headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        (**self).write_header(status);
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        (**self).flush().await
    }
}

/// Answers with a plain text error: `message` followed by a newline.
///
/// Any `Content-Length` set so far is dropped since the body is replaced.
pub async fn write_error<W: ResponseWriter + ?Sized>(resp: &mut W, status: StatusCode, message: &str) {
    let headers = resp.headers_mut();
    headers.remove(http::header::CONTENT_LENGTH);
    headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(http::header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));

    resp.write_header(status);

    let body = format!("{message}\n");
    if let Err(e) = resp.write_all(body.as_bytes()).await {
        debug!(cause = %e, "failed to write error response");
    }
}
