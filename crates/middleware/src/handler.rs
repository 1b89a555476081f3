use crate::context::RequestContext;
use crate::response::ResponseWriter;
use async_trait::async_trait;
use std::sync::Arc;

/// An asynchronous request handler.
///
/// The handler reads the request from `req` and answers by writing into `resp`. Decorators are
/// themselves handlers that wrap an inner one and may hand it a different writer.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter);
}

#[async_trait]
impl<H: RequestHandler + ?Sized> RequestHandler for Box<H> {
    async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
        (**self).invoke(req, resp).await;
    }
}

#[async_trait]
impl<H: RequestHandler + ?Sized> RequestHandler for Arc<H> {
    async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
        (**self).invoke(req, resp).await;
    }
}

#[cfg(test)]
mod tests {
    use super::RequestHandler;
    use crate::body::Body;
    use crate::context::RequestContext;
    use crate::response::{ResponseRecorder, ResponseWriter};
    use async_trait::async_trait;
    use http::{Request, StatusCode};
    use std::sync::Arc;

    struct Teapot;

    #[async_trait]
    impl RequestHandler for Teapot {
        async fn invoke(&self, _req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
            resp.write_header(StatusCode::IM_A_TEAPOT);
        }
    }

    fn assert_is_handler<T: RequestHandler>(_handler: &T) {
        // no op
    }

    #[tokio::test]
    async fn boxed_and_shared_handlers_delegate() {
        let boxed: Box<dyn RequestHandler> = Box::new(Teapot);
        let shared = Arc::new(Teapot);
        assert_is_handler(&boxed);
        assert_is_handler(&shared);

        let handlers: [Box<dyn RequestHandler>; 2] = [boxed, Box::new(shared)];
        for handler in handlers {
            let mut ctx = RequestContext::new(Request::new(Body::empty()));
            let mut recorder = ResponseRecorder::new();
            handler.invoke(&mut ctx, &mut recorder).await;
            assert_eq!(recorder.status(), StatusCode::IM_A_TEAPOT);
        }
    }
}
