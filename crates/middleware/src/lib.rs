//! Request/response decorators for HTTP handlers.
//!
//! A handler implements [`RequestHandler`]: it reads a [`RequestContext`] and writes its answer
//! into a [`ResponseWriter`](response::ResponseWriter). Decorators wrap handlers to add one
//! concern each:
//!
//! - [`Transformer`](transformer::Transformer): form-encoded bodies become the JSON encoding of
//!   the message type registered for the URL
//! - [`Tracer`](tracer::Tracer): trace-context propagation and message events
//! - [`RequestLogger`](logger::RequestLogger): one structured record per request
//! - [`Redirector`](redirector::Redirector): post/redirect/get through a sentinel header
//! - [`Cors`](cors::Cors): cross-origin policy, preflights answered early
//!
//! Decorators compose with [`chain`], outermost first:
//!
//! ```no_run
//! use micro_middleware::logger::RequestLogger;
//! use micro_middleware::redirector::Redirector;
//! use micro_middleware::response::ResponseWriter;
//! use micro_middleware::{HandlerService, RequestContext, RequestHandler, chain};
//!
//! struct App;
//!
//! #[async_trait::async_trait]
//! impl RequestHandler for App {
//!     async fn invoke(&self, _req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
//!         let _ = resp.write_all(b"hello").await;
//!     }
//! }
//!
//! let handler = chain().then(RequestLogger::new()).then(Redirector::new()).handler(App);
//! let service = HandlerService::new(handler);
//! ```
//!
//! The crate only emits `tracing` events and spans; installing a subscriber is up to the host.

mod body;
mod context;
mod decorator;
mod handler;
mod service;

pub mod config;
pub mod cors;
pub mod form;
pub mod logger;
pub mod redirector;
pub mod registry;
pub mod request;
pub mod response;
pub mod tracer;
pub mod transformer;
pub mod transport;

pub use body::Body;
pub use body::BoxError;
pub use context::ContextKey;
pub use context::RequestContext;
pub use decorator::{Chain, Decorator, DecoratorComposer, DecoratorFn, IdentityDecorator, chain, decorator_fn};
pub use handler::RequestHandler;
pub use service::{HandlerService, ServiceError};
