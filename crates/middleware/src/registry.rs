//! URL-keyed registry of message types.
//!
//! The transformer needs to know which structure a form posted to a given URL decodes into.
//! [`UrlMessageType`] answers that; [`MessageRegistry`] is the stock implementation, populated
//! once at startup and shared read-only between requests.

use crate::form::{DecodeError, FormDecoder, FormValues};
use http::Uri;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// A structured message instance the transformer decodes a form into.
pub trait Message: Send {
    fn type_name(&self) -> &'static str;

    /// Replaces the message content with the fields decoded from `values`.
    fn decode_form(&mut self, decoder: &FormDecoder, values: &FormValues) -> Result<(), DecodeError>;

    /// The canonical encoding of the message.
    fn encode_json(&self) -> Result<Vec<u8>, serde_json::Error>;
}

/// Produces new, empty instances of one message type.
pub trait MessageFactory: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn new_message(&self) -> Box<dyn Message>;
}

/// Resolves the message type for a request URL.
#[cfg_attr(test, mockall::automock)]
pub trait UrlMessageType: Send + Sync {
    fn message_type(&self, uri: &Uri) -> Result<Arc<dyn MessageFactory>, LookupError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("no message type registered for {path}")]
    NotFound { path: String },
}

impl LookupError {
    pub fn not_found<S: ToString>(path: S) -> Self {
        Self::NotFound { path: path.to_string() }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid route {path}: {source}")]
    InvalidRoute {
        path: String,
        #[source]
        source: matchit::InsertError,
    },
}

/// [`MessageFactory`] for any serde type with a default value.
pub struct MessageType<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> MessageType<T> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

impl<T> Default for MessageType<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MessageType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageType").field(&std::any::type_name::<T>()).finish()
    }
}

impl<T> MessageFactory for MessageType<T>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn new_message(&self) -> Box<dyn Message> {
        Box::new(TypedMessage(T::default()))
    }
}

struct TypedMessage<T>(T);

impl<T> Message for TypedMessage<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn decode_form(&mut self, decoder: &FormDecoder, values: &FormValues) -> Result<(), DecodeError> {
        self.0 = decoder.decode(values)?;
        Ok(())
    }

    fn encode_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }
}

/// Route table from URL path patterns to message types.
///
/// Patterns follow `matchit`: static segments, `{param}` segments and a trailing `{*rest}`.
pub struct MessageRegistry {
    router: matchit::Router<Arc<dyn MessageFactory>>,
    routes: Vec<(String, &'static str)>,
}

impl MessageRegistry {
    pub fn builder() -> MessageRegistryBuilder {
        MessageRegistryBuilder { routes: Vec::new() }
    }

    /// Registered patterns with the type each resolves to.
    pub fn routes(&self) -> impl Iterator<Item = (&str, &'static str)> {
        self.routes.iter().map(|(path, name)| (path.as_str(), *name))
    }
}

impl UrlMessageType for MessageRegistry {
    fn message_type(&self, uri: &Uri) -> Result<Arc<dyn MessageFactory>, LookupError> {
        match self.router.at(uri.path()) {
            Ok(matched) => Ok(Arc::clone(matched.value)),
            Err(e) => {
                trace!(path = uri.path(), cause = %e, "message type lookup failed");
                Err(LookupError::not_found(uri.path()))
            }
        }
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRegistry").field("routes", &self.routes).finish()
    }
}

pub struct MessageRegistryBuilder {
    routes: Vec<(String, Arc<dyn MessageFactory>)>,
}

impl MessageRegistryBuilder {
    #[must_use]
    pub fn register<T>(self, path: impl Into<String>) -> Self
    where
        T: Serialize + DeserializeOwned + Default + Send + 'static,
    {
        self.register_factory(path, MessageType::<T>::new())
    }

    #[must_use]
    pub fn register_factory<F: MessageFactory + 'static>(mut self, path: impl Into<String>, factory: F) -> Self {
        self.routes.push((path.into(), Arc::new(factory)));
        self
    }

    pub fn build(self) -> Result<MessageRegistry, RegistryError> {
        let mut router = matchit::Router::new();
        let mut routes = Vec::with_capacity(self.routes.len());

        for (path, factory) in self.routes {
            routes.push((path.clone(), factory.type_name()));
            router
                .insert(path.clone(), factory)
                .map_err(|source| RegistryError::InvalidRoute { path, source })?;
        }

        Ok(MessageRegistry { router, routes })
    }
}

impl fmt::Debug for MessageRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.routes.iter().map(|(path, _)| path)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{LookupError, MessageRegistry, RegistryError, UrlMessageType};
    use crate::form::{FormDecoder, FormValues};
    use http::Uri;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Pair {
        a: i32,
        b: i32,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Comment {
        body: String,
    }

    fn registry() -> MessageRegistry {
        MessageRegistry::builder()
            .register::<Pair>("/pairs")
            .register::<Comment>("/posts/{id}/comments")
            .build()
            .unwrap()
    }

    #[test]
    fn resolves_static_and_parameterized_paths() {
        let registry = registry();

        let factory = registry.message_type(&Uri::from_static("/pairs?x=1")).unwrap();
        assert!(factory.type_name().ends_with("Pair"));

        let factory = registry.message_type(&Uri::from_static("http://host/posts/42/comments")).unwrap();
        assert!(factory.type_name().ends_with("Comment"));
    }

    #[test]
    fn unregistered_path_is_not_found() {
        let Err(err) = registry().message_type(&Uri::from_static("/unknown")) else {
            panic!("/unknown resolved to a message type");
        };
        assert_eq!(err, LookupError::not_found("/unknown"));
        assert_eq!(err.to_string(), "no message type registered for /unknown");
    }

    #[test]
    fn conflicting_routes_fail_to_build() {
        let err = MessageRegistry::builder().register::<Pair>("/pairs").register::<Comment>("/pairs").build().unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRoute { ref path, .. } if path == "/pairs"));
    }

    #[test]
    fn message_decodes_form_and_encodes_json() {
        let factory = registry().message_type(&Uri::from_static("/pairs")).unwrap();
        let mut message = factory.new_message();

        let values = FormValues::parse(b"a=1&b=2").unwrap();
        message.decode_form(&FormDecoder::new(), &values).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&message.encode_json().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"a": 1, "b": 2}));
    }

    #[test]
    fn lists_routes() {
        let registry = registry();
        let paths: Vec<_> = registry.routes().map(|(path, _)| path).collect();
        assert_eq!(paths, vec!["/pairs", "/posts/{id}/comments"]);
    }
}
