use registry::discovery::DiscoveryError;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ValidationError),
    #[error("invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("could not build upstream request: {0}")]
    Http(#[from] http::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("could not set up TLS: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("membership discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
}
