use crate::errors::ProxyError;
use crate::routing::RequestHints;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::Method;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use registry::ServiceRegistry;
use registry::metrics_defs::CONVERSATIONS_EVICTED;
use shared::counter;
use shared::http::make_error_response;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub struct AdminService {
    registry: Arc<ServiceRegistry>,
}

impl AdminService {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

fn text_response(body: &'static str) -> Response<BoxBody<Bytes, ProxyError>> {
    Response::new(Full::new(body.into()).map_err(|e| match e {}).boxed())
}

fn pool_response(registry: &ServiceRegistry) -> Response<BoxBody<Bytes, ProxyError>> {
    let body = match serde_json::to_vec(&registry.snapshot().endpoints) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "could not encode pool state");
            return make_error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|e| match e {})
            .boxed(),
    );
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<BoxBody<Bytes, ProxyError>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let registry = self.registry.clone();

        Box::pin(async move {
            let res = match (req.method(), req.uri().path()) {
                (_, "/health") => text_response("ok\n"),
                (_, "/ready") => match registry.has_membership() {
                    true => text_response("ok\n"),
                    false => make_error_response(StatusCode::SERVICE_UNAVAILABLE),
                },
                (&Method::GET, "/pool") => pool_response(&registry),
                (&Method::DELETE, "/pool") => {
                    match RequestHints::from_query(req.uri().query()).conversation_id {
                        Some(conversation) => {
                            if registry.remove_conversation(&conversation) {
                                counter!(CONVERSATIONS_EVICTED, "reason" => "admin").increment(1);
                                tracing::info!(conversation = %conversation, "conversation removed by operator");
                            }
                            pool_response(&registry)
                        }
                        // rejected rather than answered with the unchanged pool
                        None => make_error_response(StatusCode::BAD_REQUEST),
                    }
                }
                (_, "/pool") => make_error_response(StatusCode::METHOD_NOT_ALLOWED),
                _ => make_error_response(StatusCode::NOT_FOUND),
            };
            Ok(res)
        })
    }
}
