//! Rewrites form-encoded request bodies into the canonical JSON encoding.
//!
//! For a request whose media type is `application/x-www-form-urlencoded`, the body (plus the URL
//! query) is parsed as a form, the message type registered for the URL path is instantiated and
//! populated from the form, and the message re-encoded as JSON replaces the request body. Other
//! requests pass through untouched. Any failure answers the client directly with a 4xx and the
//! inner handler is not invoked.

use crate::body::{Body, BoxError};
use crate::config::TransformConfig;
use crate::context::RequestContext;
use crate::decorator::Decorator;
use crate::form::{DecodeError, FormDecoder, FormError, FormValues};
use crate::handler::RequestHandler;
use crate::registry::{LookupError, UrlMessageType};
use crate::response::{ResponseWriter, write_error};
use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("request body exceeds the limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("failed to read request body: {source}")]
    ReadBody { source: BoxError },

    #[error(transparent)]
    Form {
        #[from]
        source: FormError,
    },

    #[error(transparent)]
    Lookup {
        #[from]
        source: LookupError,
    },

    #[error(transparent)]
    Decode {
        #[from]
        source: DecodeError,
    },

    #[error("failed to encode message: {source}")]
    Encode {
        #[from]
        source: serde_json::Error,
    },
}

impl TransformError {
    pub fn body_too_large(limit: usize) -> Self {
        Self::BodyTooLarge { limit }
    }

    pub fn read_body<E: Into<BoxError>>(e: E) -> Self {
        Self::ReadBody { source: e.into() }
    }

    /// The status the client is answered with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Decorator installing a [`TransformHandler`].
#[derive(Clone)]
pub struct Transformer {
    registry: Arc<dyn UrlMessageType>,
    decoder: FormDecoder,
    max_body_size: usize,
}

impl Transformer {
    pub fn new<R: UrlMessageType + 'static>(registry: R) -> Self {
        Self::with_registry(Arc::new(registry))
    }

    pub fn with_registry(registry: Arc<dyn UrlMessageType>) -> Self {
        Self { registry, decoder: FormDecoder::new(), max_body_size: DEFAULT_MAX_BODY_SIZE }
    }

    pub fn from_config(registry: Arc<dyn UrlMessageType>, config: &TransformConfig) -> Self {
        Self::with_registry(registry)
            .with_decoder(FormDecoder::new().with_strict(config.strict))
            .with_max_body_size(config.max_body_size)
    }

    #[must_use]
    pub fn with_decoder(mut self, decoder: FormDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    #[must_use]
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Rewrites the request in `ctx` if it carries a form, reporting whether it did.
    pub async fn transform(&self, ctx: &mut RequestContext) -> Result<bool, TransformError> {
        if !is_form(ctx.headers()) {
            return Ok(false);
        }

        let body = ctx.request_mut().body_mut().take();
        let payload = match Limited::new(body, self.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => return Err(TransformError::body_too_large(self.max_body_size)),
            Err(e) => return Err(TransformError::read_body(e)),
        };

        let mut values = FormValues::parse(&payload)?;
        if let Some(query) = ctx.uri().query() {
            values.extend(FormValues::parse(query.as_bytes())?);
        }

        let factory = self.registry.message_type(ctx.uri())?;
        let mut message = factory.new_message();
        message.decode_form(&self.decoder, &values)?;
        let json = message.encode_json()?;

        trace!(message = message.type_name(), form_size = payload.len(), json_size = json.len(), "form transformed");

        let content_length = HeaderValue::from(json.len());
        let request = ctx.request_mut();
        *request.body_mut() = Body::from(json);

        let headers = request.headers_mut();
        headers.remove(http::header::TRANSFER_ENCODING);
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(http::header::CONTENT_LENGTH, content_length);

        Ok(true)
    }
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("decoder", &self.decoder)
            .field("max_body_size", &self.max_body_size)
            .finish_non_exhaustive()
    }
}

impl<H: RequestHandler> Decorator<H> for Transformer {
    type Out = TransformHandler<H>;

    fn decorate(&self, raw: H) -> Self::Out {
        TransformHandler { transformer: self.clone(), inner: raw }
    }
}

#[derive(Debug)]
pub struct TransformHandler<H> {
    transformer: Transformer,
    inner: H,
}

#[async_trait]
impl<H: RequestHandler> RequestHandler for TransformHandler<H> {
    async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
        if let Err(e) = self.transformer.transform(req).await {
            debug!(cause = %e, uri = %req.uri(), "rejecting request");
            write_error(resp, e.status(), &e.to_string()).await;
            return;
        }

        self.inner.invoke(req, resp).await;
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .is_some_and(|media| media.type_() == mime::APPLICATION && media.subtype() == mime::WWW_FORM_URLENCODED)
}
