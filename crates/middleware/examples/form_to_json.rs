use async_trait::async_trait;
use http::{HeaderValue, Method, Request};
use http_body_util::BodyExt;
use micro_middleware::config::MiddlewareConfig;
use micro_middleware::cors::Cors;
use micro_middleware::logger::RequestLogger;
use micro_middleware::redirector::{Redirector, X_LOCATION};
use micro_middleware::registry::MessageRegistry;
use micro_middleware::response::{ResponseWriter, write_error};
use micro_middleware::tracer::Tracer;
use micro_middleware::transformer::Transformer;
use micro_middleware::{Body, HandlerService, RequestContext, RequestHandler, chain};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Serialize, Deserialize, Default, Debug)]
#[serde(default)]
struct SignUp {
    name: String,
    zip: String,
    newsletter: bool,
    tags: Vec<String>,
}

struct SignUpHandler;

#[async_trait]
impl RequestHandler for SignUpHandler {
    async fn invoke(&self, req: &mut RequestContext, resp: &mut dyn ResponseWriter) {
        let body = match req.request_mut().body_mut().take().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                write_error(resp, http::StatusCode::BAD_REQUEST, &e.to_string()).await;
                return;
            }
        };

        match serde_json::from_slice::<SignUp>(&body) {
            Ok(sign_up) => {
                info!(?sign_up, "signed up");
                resp.headers_mut().insert(X_LOCATION, HeaderValue::from_static("welcome"));
            }
            Err(e) => write_error(resp, http::StatusCode::UNPROCESSABLE_ENTITY, &e.to_string()).await,
        }
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = MiddlewareConfig::default();
    let registry = MessageRegistry::builder().register::<SignUp>("/users/signup").build().expect("valid routes");

    let handler = chain()
        .then(Cors::from_config(&config.cors))
        .then(Transformer::from_config(Arc::new(registry), &config.transform))
        .then(Tracer::new())
        .then(RequestLogger::from_config(&config.logger))
        .then(Redirector::from_config(&config.redirect).expect("valid redirect config"))
        .handler(SignUpHandler);
    let service = HandlerService::new(handler);

    // same as: curl -v -d "name=hello&zip=world&newsletter=on&tags=a&tags=b" http://127.0.0.1/users/signup
    let request = Request::builder()
        .method(Method::POST)
        .uri("/users/signup")
        .header(http::header::HOST, "127.0.0.1")
        .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("name=hello&zip=world&newsletter=on&tags=a&tags=b"))
        .expect("valid request");

    match service.call(request).await {
        Ok(response) => info!(status = %response.status(), location = ?response.headers().get(http::header::LOCATION), "response"),
        Err(e) => warn!(cause = %e, "request aborted"),
    }
}
