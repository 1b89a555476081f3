use crate::body::{Body, BoxError};
use crate::response::ResponseWriter;
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt, future, stream};
use http::{HeaderMap, Response, StatusCode};
use http_body::Frame;
use http_body_util::StreamBody;
use std::io;
use tracing::trace;

type Head = (StatusCode, HeaderMap);

/// Creates a streaming response sink and the response it will resolve.
///
/// `capacity` bounds the number of body chunks in flight; a writer that gets ahead of the
/// client waits.
pub fn response_channel(capacity: usize) -> (ChannelResponseWriter, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(capacity);
    let (done_tx, done_rx) = oneshot::channel();

    let writer =
        ChannelResponseWriter { headers: HeaderMap::new(), status: None, head: Some(head_tx), body: body_tx, done: done_tx };
    (writer, PendingResponse { head: head_rx, body: body_rx, done: done_rx })
}

/// Writer half of [`response_channel`].
///
/// Dropping it without [`finish`](ChannelResponseWriter::finish) after the head was committed
/// ends the body with an error frame.
#[derive(Debug)]
pub struct ChannelResponseWriter {
    headers: HeaderMap,
    status: Option<StatusCode>,
    head: Option<oneshot::Sender<Head>>,
    body: mpsc::Sender<Bytes>,
    done: oneshot::Sender<()>,
}

impl ChannelResponseWriter {
    pub fn is_committed(&self) -> bool {
        self.status.is_some()
    }

    /// Ends the response, committing `200 OK` if the head was never written.
    pub fn finish(mut self) {
        if self.status.is_none() {
            self.write_header(StatusCode::OK);
        }
        if self.done.send(()).is_err() {
            trace!("response receiver dropped before the body ended");
        }
        self.body.close_channel();
    }
}

#[async_trait]
impl ResponseWriter for ChannelResponseWriter {
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

        if let Some(head) = self.head.take()
            && head.send((status, self.headers.clone())).is_err()
        {
            trace!("response receiver dropped before head was sent");
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.write_header(StatusCode::OK);
        }
        if data.is_empty() {
            return Ok(0);
        }

        self.body
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(data.len())
    }
}

/// Receiver half of [`response_channel`].
#[derive(Debug)]
pub struct PendingResponse {
    head: oneshot::Receiver<Head>,
    body: mpsc::Receiver<Bytes>,
    done: oneshot::Receiver<()>,
}

impl PendingResponse {
    /// Waits for the head to be committed and returns a response streaming the body.
    ///
    /// Fails when the writer was dropped without committing.
    pub async fn response(self) -> Result<Response<Body>, oneshot::Canceled> {
        let (status, headers) = self.head.await?;

        let truncated = stream::once(self.done).filter_map(|done| {
            future::ready(done.is_err().then(|| {
                Err(BoxError::from(io::Error::new(io::ErrorKind::UnexpectedEof, "response ended before the handler finished")))
            }))
        });
        let frames = self.body.map(|chunk| Ok::<_, BoxError>(Frame::data(chunk))).chain(truncated);
        let mut response = Response::new(Body::stream(StreamBody::new(frames)));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
