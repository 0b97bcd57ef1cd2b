use crate::affinity;
use crate::errors::ProxyError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT, UPSTREAM_ERRORS};
use crate::routing::{self, RequestHints};
use crate::upstreams::Upstreams;
use bytes::Bytes;
use http::Version;
use http::header::HOST;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::service::Service as HyperService;
use hyper::{Request, Response, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use registry::ServiceRegistry;
use shared::http::{add_via_header, filter_hop_by_hop, make_error_response};
use shared::{counter, gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

type ProxyResponse = Response<BoxBody<Bytes, ProxyError>>;
type UpstreamClient = Client<HttpsConnector<HttpConnector>, Incoming>;

/// Forwards requests to the backend chosen by the routing decision and learns
/// conversation affinity from the responses.
pub struct ProxyService {
    registry: Arc<ServiceRegistry>,
    upstreams: Upstreams,
    client: UpstreamClient,
}

impl ProxyService {
    pub fn new(registry: Arc<ServiceRegistry>, upstreams: Upstreams) -> Result<Self, ProxyError> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        // https URIs go through the TLS layer
        http.enforce_http(false);
        let tls = native_tls::TlsConnector::new()?;
        let conn = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));
        let client: UpstreamClient = Client::builder(TokioExecutor::new()).build(conn);

        Ok(Self {
            registry,
            upstreams,
            client,
        })
    }
}

impl HyperService<Request<Incoming>> for ProxyService {
    type Response = ProxyResponse;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let registry = self.registry.clone();
        let upstreams = self.upstreams.clone();
        let client = self.client.clone();

        Box::pin(async move {
            let start = Instant::now();
            gauge!(REQUESTS_INFLIGHT).increment(1.0);

            let response = forward(&registry, &upstreams, &client, req).await;

            gauge!(REQUESTS_INFLIGHT).decrement(1.0);
            histogram!(REQUEST_DURATION, "status" => response.status().as_u16().to_string())
                .record(start.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

async fn forward(
    registry: &ServiceRegistry,
    upstreams: &Upstreams,
    client: &UpstreamClient,
    req: Request<Incoming>,
) -> ProxyResponse {
    let hints = RequestHints::from_query(req.uri().query());
    let route = match routing::route(registry, &hints) {
        Ok(route) => route,
        Err(e) => {
            tracing::warn!(error = %e, conversation = ?hints.conversation_id, "rejecting request");
            return make_error_response(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    let uri = match upstreams.uri_for(&route.backend, req.uri().path_and_query()) {
        Ok(uri) => uri,
        Err(e) => {
            counter!(UPSTREAM_ERRORS).increment(1);
            tracing::error!(error = %e, backend = %route.backend, "cannot address backend");
            return make_error_response(StatusCode::BAD_GATEWAY);
        }
    };
    tracing::debug!(
        backend = %route.backend,
        reason = route.reason.as_str(),
        uri = %uri,
        "forwarding request"
    );

    let (mut parts, body) = req.into_parts();
    let request_version = parts.version;
    filter_hop_by_hop(&mut parts.headers, request_version);
    add_via_header(&mut parts.headers, request_version);
    // the client derives Host from the upstream URI
    parts.headers.remove(HOST);
    parts.uri = uri;
    parts.version = Version::HTTP_11;

    let response = match client.request(Request::from_parts(parts, body)).await {
        Ok(response) => response,
        Err(e) => {
            counter!(UPSTREAM_ERRORS).increment(1);
            tracing::warn!(error = %e, backend = %route.backend, "upstream request failed");
            return make_error_response(StatusCode::BAD_GATEWAY);
        }
    };

    affinity::learn(registry, response.headers());

    let (mut parts, body) = response.into_parts();
    let response_version = parts.version;
    filter_hop_by_hop(&mut parts.headers, response_version);
    add_via_header(&mut parts.headers, response_version);

    Response::from_parts(parts, body.map_err(ProxyError::from).boxed())
}
