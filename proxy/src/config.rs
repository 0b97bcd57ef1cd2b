use http::uri::Scheme;
use serde::Deserialize;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("port cannot be 0")]
    InvalidPort,

    #[error("backend port cannot be 0")]
    InvalidBackendPort,

    #[error(transparent)]
    Registry(#[from] registry::config::ValidationError),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Scheme used to reach backends. Anything other than `http` or `https` is rejected
/// when the configuration is parsed.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendScheme {
    #[default]
    Http,
    Https,
}

impl BackendScheme {
    pub fn as_scheme(&self) -> Scheme {
        match self {
            BackendScheme::Http => Scheme::HTTP,
            BackendScheme::Https => Scheme::HTTPS,
        }
    }
}

/// How backend names are turned into upstream addresses.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub scheme: BackendScheme,
    /// Port every backend listens on.
    pub port: u16,
    /// Suffix appended to the backend name to form its host name. Unset uses the
    /// discovery service name, which matches the DNS name of a pod behind a headless
    /// service. An empty string uses the bare backend name.
    pub domain: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for proxied traffic
    pub listener: Listener,
    /// Listener for health checks and pool administration
    pub admin_listener: Listener,
    pub backend: BackendConfig,
    pub registry: registry::config::Config,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        if self.backend.port == 0 {
            return Err(ValidationError::InvalidBackendPort);
        }
        self.registry.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry::config::{DiscoverySource, SnapshotStoreType};

    const YAML: &str = r#"
listener:
    host: 0.0.0.0
    port: 3000
admin_listener:
    host: 127.0.0.1
    port: 3001
backend:
    port: 8080
registry:
    discovery:
        service: chatapi
        source: static
        members: [chat-0, chat-1]
    snapshot_store:
        type: none
"#;

    #[test]
    fn test_parse_config() {
        let config: Config = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(
            config.listener,
            Listener {
                host: "0.0.0.0".into(),
                port: 3000
            }
        );
        assert_eq!(config.admin_listener.port, 3001);
        assert_eq!(config.backend.port, 8080);
        assert_eq!(config.backend.scheme, BackendScheme::Http);
        assert_eq!(config.backend.domain, None);
        assert_eq!(config.registry.discovery.service, "chatapi");
        assert!(matches!(
            config.registry.discovery.source,
            DiscoverySource::Static { .. }
        ));
        assert_eq!(config.registry.snapshot_store.r#type, SnapshotStoreType::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let mut config: Config = serde_yaml::from_str(YAML).unwrap();

        config.admin_listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));
        config.admin_listener.port = 3001;

        config.backend.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidBackendPort));
        config.backend.port = 8080;

        config.registry.discovery.service = String::new();
        assert_eq!(
            config.validate(),
            Err(ValidationError::Registry(
                registry::config::ValidationError::EmptyServiceName
            ))
        );
    }

    #[test]
    fn test_backend_scheme() {
        let config: Config =
            serde_yaml::from_str(&YAML.replace("port: 8080", "port: 443\n    scheme: https"))
                .unwrap();
        assert_eq!(config.backend.scheme, BackendScheme::Https);
        assert_eq!(config.backend.scheme.as_scheme(), Scheme::HTTPS);
        assert!(config.validate().is_ok());

        let result: Result<Config, _> =
            serde_yaml::from_str(&YAML.replace("port: 8080", "port: 8080\n    scheme: ftp"));
        assert!(result.is_err());
    }
}
