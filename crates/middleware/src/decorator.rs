//! Composition of request-handler decorators.
//!
//! A [`Decorator`] turns one value into another of the same capability, typically a
//! [`RequestHandler`](crate::RequestHandler) into a wrapping handler. Decorators compose by
//! explicit, ordered application through [`DecoratorComposer`]; [`chain`] builds such a
//! composition in request order:
//!
//! ```text
//! chain().then(transformer).then(tracer).then(logger).then(redirector).handler(app)
//!
//!     request ──► transformer ──► tracer ──► logger ──► redirector ──► app
//! ```

/// Wraps a value of type `In`, producing `Out`.
pub trait Decorator<In> {
    type Out;

    fn decorate(&self, raw: In) -> Self::Out;
}

/// Applies `decorator_1` first and `decorator_2` to its result, so `decorator_2` ends up outermost.
#[derive(Debug, Clone, Copy)]
pub struct DecoratorComposer<D1, D2> {
    decorator_1: D1,
    decorator_2: D2,
}

impl<D1, D2> DecoratorComposer<D1, D2> {
    pub fn new(decorator_1: D1, decorator_2: D2) -> Self {
        Self { decorator_1, decorator_2 }
    }
}

impl<In, D1, D2> Decorator<In> for DecoratorComposer<D1, D2>
where
    D1: Decorator<In>,
    D2: Decorator<D1::Out>,
{
    type Out = D2::Out;

    fn decorate(&self, raw: In) -> Self::Out {
        let output_1 = self.decorator_1.decorate(raw);
        self.decorator_2.decorate(output_1)
    }
}

#[derive(Default, Clone, Copy, Debug)]
pub struct IdentityDecorator;

impl<In> Decorator<In> for IdentityDecorator {
    type Out = In;

    #[inline]
    fn decorate(&self, raw: In) -> Self::Out {
        raw
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DecoratorFn<F> {
    f: F,
}

/// Adapts a plain function into a [`Decorator`].
pub fn decorator_fn<In, Out, F>(f: F) -> DecoratorFn<F>
where
    F: Fn(In) -> Out,
{
    DecoratorFn { f }
}

impl<In, Out, F> Decorator<In> for DecoratorFn<F>
where
    F: Fn(In) -> Out,
{
    type Out = Out;

    fn decorate(&self, raw: In) -> Self::Out {
        (self.f)(raw)
    }
}

/// Builder listing decorators from the outermost to the innermost.
#[derive(Debug, Clone, Copy)]
pub struct Chain<D> {
    decorator: D,
}

/// Starts an empty decorator chain.
pub fn chain() -> Chain<IdentityDecorator> {
    Chain { decorator: IdentityDecorator }
}

impl<D> Chain<D> {
    /// Adds `next` inside every decorator already in the chain.
    pub fn then<N>(self, next: N) -> Chain<DecoratorComposer<N, D>> {
        Chain { decorator: DecoratorComposer::new(next, self.decorator) }
    }

    /// Wraps `handler` with the whole chain.
    pub fn handler<H>(&self, handler: H) -> D::Out
    where
        D: Decorator<H>,
    {
        self.decorator.decorate(handler)
    }

    pub fn into_decorator(self) -> D {
        self.decorator
    }
}

#[cfg(test)]
mod tests {
    use super::{Decorator, DecoratorComposer, IdentityDecorator, chain, decorator_fn};

    trait Service {
        fn call(&self, input: &str) -> String;
    }

    struct Endpoint;

    struct Named<S> {
        name: &'static str,
        inner: S,
    }

    impl Service for Endpoint {
        fn call(&self, input: &str) -> String {
            format!("app({input})")
        }
    }

    impl<S: Service> Service for Named<S> {
        fn call(&self, input: &str) -> String {
            format!("{}({})", self.name, self.inner.call(input))
        }
    }

    struct NamedDecorator(&'static str);

    impl<S: Service> Decorator<S> for NamedDecorator {
        type Out = Named<S>;

        fn decorate(&self, raw: S) -> Self::Out {
            Named { name: self.0, inner: raw }
        }
    }

    #[test]
    fn chain_lists_decorators_outermost_first() {
        let service = chain()
            .then(NamedDecorator("transformer"))
            .then(NamedDecorator("logger"))
            .then(NamedDecorator("redirector"))
            .handler(Endpoint);

        assert_eq!(service.call("req"), "transformer(logger(redirector(app(req))))");
    }

    #[test]
    fn composer_applies_first_decorator_innermost() {
        let composer = DecoratorComposer::new(NamedDecorator("inner"), NamedDecorator("outer"));
        assert_eq!(composer.decorate(Endpoint).call("x"), "outer(inner(app(x)))");
    }

    #[test]
    fn identity_and_fn_decorators() {
        let service = IdentityDecorator.decorate(Endpoint);
        assert_eq!(service.call("x"), "app(x)");

        let wrap = decorator_fn(|inner: Endpoint| Named { name: "fn", inner });
        assert_eq!(wrap.decorate(Endpoint).call("x"), "fn(app(x))");
    }

    #[test]
    fn empty_chain_is_identity() {
        let service = chain().handler(Endpoint);
        assert_eq!(service.call("y"), "app(y)");
    }
}
