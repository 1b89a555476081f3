//! Request-scoped state threaded through the decorator chain.
//!
//! Every decorator receives the same [`RequestContext`] by mutable reference. It owns the
//! in-flight request and a small typed value store where decorators leave per-request handles
//! (the logger span, the extracted trace context) for the ones that run after them.
//!
//! Values are addressed by [`ContextKey`]. A key is a token with an identity allocated when it
//! is created, so two subsystems choosing the same name never see each other's values.

use crate::body::Body;
use http::{HeaderMap, Method, Request, Uri, Version};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_KEY_ID: AtomicUsize = AtomicUsize::new(0);

/// A named token used to store and look up a value of type `T` in a [`RequestContext`].
///
/// Keys compare by identity: every call to [`ContextKey::new`] yields a distinct key, and
/// copies of a key share its identity. Keys are usually kept in a `static` behind
/// `once_cell::sync::Lazy`.
pub struct ContextKey<T> {
    id: usize,
    name: &'static str,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub fn new(name: &'static str) -> Self {
        Self { id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed), name, _phantom: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

impl<T> PartialEq for ContextKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ContextKey<T> {}

impl<T> Hash for ContextKey<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextKey").field("name", &self.name).field("id", &self.id).finish()
    }
}

impl<T> fmt::Display for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The in-flight request together with the values decorators attached to it.
pub struct RequestContext {
    request: Request<Body>,
    values: HashMap<usize, Box<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub fn new(request: Request<Body>) -> Self {
        Self { request, values: HashMap::new() }
    }

    pub fn request(&self) -> &Request<Body> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Body> {
        &mut self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    pub fn version(&self) -> Version {
        self.request.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    pub fn into_request(self) -> Request<Body> {
        self.request
    }

    /// Stores `value` under `key`, returning the value previously stored under the same key.
    pub fn insert<T: Send + Sync + 'static>(&mut self, key: &ContextKey<T>, value: T) -> Option<T> {
        self.values.insert(key.id, Box::new(value)).and_then(|old| old.downcast::<T>().ok()).map(|old| *old)
    }

    pub fn get<T: 'static>(&self, key: &ContextKey<T>) -> Option<&T> {
        self.values.get(&key.id).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T: 'static>(&mut self, key: &ContextKey<T>) -> Option<T> {
        self.values.remove(&key.id).and_then(|value| value.downcast::<T>().ok()).map(|value| *value)
    }

    pub fn contains<T>(&self, key: &ContextKey<T>) -> bool {
        self.values.contains_key(&key.id)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext").field("request", &self.request).field("values", &self.values.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextKey, RequestContext};
    use crate::body::Body;
    use http::{Method, Request};

    fn context() -> RequestContext {
        RequestContext::new(Request::builder().method(Method::POST).uri("/users").body(Body::empty()).unwrap())
    }

    #[test]
    fn keys_with_same_name_do_not_collide() {
        let first: ContextKey<String> = ContextKey::new("user");
        let second: ContextKey<String> = ContextKey::new("user");
        assert_ne!(first, second);

        let mut ctx = context();
        ctx.insert(&first, "alice".to_string());

        assert_eq!(ctx.get(&first).map(String::as_str), Some("alice"));
        assert!(ctx.get(&second).is_none());
    }

    #[test]
    fn copied_key_shares_identity() {
        let key: ContextKey<u32> = ContextKey::new("attempt");
        let copy = key;

        let mut ctx = context();
        ctx.insert(&key, 3);

        assert_eq!(copy, key);
        assert_eq!(ctx.get(&copy), Some(&3));
    }

    #[test]
    fn insert_returns_previous_value() {
        let key: ContextKey<&'static str> = ContextKey::new("stage");

        let mut ctx = context();
        assert_eq!(ctx.insert(&key, "decode"), None);
        assert_eq!(ctx.insert(&key, "encode"), Some("decode"));

        assert_eq!(ctx.remove(&key), Some("encode"));
        assert!(!ctx.contains(&key));
    }

    #[test]
    fn exposes_request_metadata() {
        let ctx = context();
        assert_eq!(ctx.method(), Method::POST);
        assert_eq!(ctx.uri().path(), "/users");
        assert_eq!(format!("{}", ContextKey::<()>::new("logger")), "logger");
    }
}
