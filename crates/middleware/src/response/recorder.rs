use crate::body::Body;
use crate::response::ResponseWriter;
use async_trait::async_trait;
use bytes::BytesMut;
use http::{HeaderMap, Response, StatusCode};
use std::io;
use tracing::trace;

/// An in-memory response sink.
///
/// The headers are snapshotted when the head is committed, mirroring what a real connection
/// would have sent; later header changes stay visible through
/// [`headers`](ResponseWriter::headers) but are not part of [`into_response`](Self::into_response).
#[derive(Debug, Default)]
pub struct ResponseRecorder {
    status: Option<StatusCode>,
    headers: HeaderMap,
    committed_headers: Option<HeaderMap>,
    body: BytesMut,
    flush_count: usize,
}

impl ResponseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The committed status, `200 OK` when nothing was committed.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn is_committed(&self) -> bool {
        self.status.is_some()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count
    }

    /// Headers as they were when the head was committed, or the current ones if it never was.
    pub fn committed_headers(&self) -> &HeaderMap {
        self.committed_headers.as_ref().unwrap_or(&self.headers)
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body.freeze()));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.committed_headers.unwrap_or(self.headers);
        response
    }
}

#[async_trait]
impl ResponseWriter for ResponseRecorder {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.status.is_some() {
            trace!(ignored = %status, "response head already committed");
            return;
        }
        self.status = Some(status);
        self.committed_headers = Some(self.headers.clone());
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.write_header(StatusCode::OK);
        }
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.status.is_none() {
            self.write_header(StatusCode::OK);
        }
        self.flush_count += 1;
        Ok(())
    }
}
