use crate::config::BackendConfig;
use crate::errors::ProxyError;
use http::uri::{Authority, PathAndQuery, Scheme, Uri};

/// Maps backend names to upstream URIs.
#[derive(Clone, Debug)]
pub struct Upstreams {
    scheme: Scheme,
    domain: Option<String>,
    port: u16,
}

impl Upstreams {
    pub fn try_new(config: &BackendConfig, service: &str) -> Result<Self, ProxyError> {
        let domain = match config.domain.as_deref() {
            None => Some(service.to_string()),
            Some("") => None,
            Some(domain) => Some(domain.trim_start_matches('.').to_string()),
        };
        let upstreams = Upstreams {
            scheme: config.scheme.as_scheme(),
            domain,
            port: config.port,
        };

        // reject a suffix that can never form a valid host
        upstreams.authority("backend")?;
        Ok(upstreams)
    }

    fn authority(&self, backend: &str) -> Result<Authority, ProxyError> {
        let authority = match &self.domain {
            Some(domain) => format!("{backend}.{domain}:{}", self.port),
            None => format!("{backend}:{}", self.port),
        };
        Ok(authority.parse()?)
    }

    /// Upstream URI for a request to `backend`, keeping the original path and query.
    pub fn uri_for(
        &self,
        backend: &str,
        path_and_query: Option<&PathAndQuery>,
    ) -> Result<Uri, ProxyError> {
        let path_and_query = path_and_query
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        Ok(Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority(backend)?)
            .path_and_query(path_and_query)
            .build()?)
    }
}
