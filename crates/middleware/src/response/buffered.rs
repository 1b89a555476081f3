use crate::response::ResponseWriter;
use async_trait::async_trait;
use bytes::BytesMut;
use http::{HeaderMap, StatusCode};
use std::io;
use tracing::trace;

/// A response writer that sits between a handler and the real sink.
///
/// In **buffering** mode nothing reaches the sink before [`flush`](ResponseWriter::flush): the
/// status, a private copy of the headers and every body byte are held back, so the response can
/// still be inspected, rewritten or thrown away with [`discard`](BufferedResponse::discard).
/// The first flush commits status and headers to the sink, later flushes only push the bytes
/// written since.
///
/// In **pass-through** mode writes go straight to the sink and only the status and the number
/// of body bytes are recorded.
///
/// Either way the status is fixed by the first `write_header` call (or `200 OK` by the first
/// body write), it is forwarded to the sink exactly once, and [`status`](BufferedResponse::status)
/// reports `200 OK` when it was never set.
#[derive(Debug)]
pub struct BufferedResponse<W> {
    inner: W,
    mode: Mode,
    status: Option<StatusCode>,
    content_length: u64,
}

#[derive(Debug)]
enum Mode {
    Buffering { headers: HeaderMap, body: BytesMut, committed: bool },
    PassThrough { forwarded: bool },
}

impl<W: ResponseWriter> BufferedResponse<W> {
    pub fn buffering(inner: W) -> Self {
        let headers = inner.headers().clone();
        Self {
            inner,
            mode: Mode::Buffering { headers, body: BytesMut::new(), committed: false },
            status: None,
            content_length: 0,
        }
    }

    pub fn pass_through(inner: W) -> Self {
        Self { inner, mode: Mode::PassThrough { forwarded: false }, status: None, content_length: 0 }
    }

    /// The status the handler chose, `200 OK` if it never chose one.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// Whether the handler explicitly or implicitly fixed the status.
    pub fn has_status(&self) -> bool {
        self.status.is_some()
    }

    /// Total body bytes written by the handler.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn is_buffering(&self) -> bool {
        matches!(self.mode, Mode::Buffering { .. })
    }

    /// Whether the head has reached the sink, after which the response can no longer be discarded.
    pub fn is_committed(&self) -> bool {
        match &self.mode {
            Mode::Buffering { committed, .. } => *committed,
            Mode::PassThrough { forwarded } => *forwarded || self.content_length > 0,
        }
    }

    /// Body bytes held back since the last flush; always empty in pass-through mode.
    pub fn buffered_body(&self) -> &[u8] {
        match &self.mode {
            Mode::Buffering { body, .. } => &body[..],
            Mode::PassThrough { .. } => &[],
        }
    }

    /// Drops the buffered body and status, keeping the headers.
    ///
    /// Returns `false`, leaving everything untouched, in pass-through mode or once committed.
    pub fn discard(&mut self) -> bool {
        match &mut self.mode {
            Mode::Buffering { body, committed: false, .. } => {
                body.clear();
                self.status = None;
                self.content_length = 0;
                true
            }
            _ => false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn commit(inner: &mut W, headers: &HeaderMap, status: StatusCode) {
        *inner.headers_mut() = headers.clone();
        inner.write_header(status);
    }
}

#[async_trait]
impl<W: ResponseWriter> ResponseWriter for BufferedResponse<W> {
    fn headers(&self) -> &HeaderMap {
        match &self.mode {
            Mode::Buffering { headers, .. } => headers,
            Mode::PassThrough { .. } => self.inner.headers(),
        }
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        match &mut self.mode {
            Mode::Buffering { headers, .. } => headers,
            Mode::PassThrough { .. } => self.inner.headers_mut(),
        }
    }

    fn write_header(&mut self, status: StatusCode) {
        if let Some(current) = self.status {
            trace!(current = %current, ignored = %status, "superfluous write_header call");
            return;
        }
        self.status = Some(status);

        if let Mode::PassThrough { forwarded } = &mut self.mode {
            *forwarded = true;
            self.inner.write_header(status);
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.write_header(StatusCode::OK);
        }

        let written = match &mut self.mode {
            Mode::Buffering { body, .. } => {
                body.extend_from_slice(data);
                data.len()
            }
            Mode::PassThrough { .. } => self.inner.write(data).await?,
        };

        self.content_length += written as u64;
        Ok(written)
    }

    async fn flush(&mut self) -> io::Result<()> {
        let status = self.status();
        if let Mode::Buffering { headers, body, committed } = &mut self.mode {
            if !*committed {
                Self::commit(&mut self.inner, headers, status);
                *committed = true;
            }
            if !body.is_empty() {
                let chunk = body.split().freeze();
                self.inner.write_all(&chunk).await?;
            }
        }
        self.inner.flush().await
    }
}
