//! Membership feeds. Each feed runs as its own task and pushes full member-set
//! snapshots into a channel consumed by the [`MembershipReconciler`].
//!
//! [`MembershipReconciler`]: crate::reconciler::MembershipReconciler
use crate::config::{Discovery, DiscoverySource};
use crate::types::BackendName;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const DEFAULT_NAMESPACE: &str = "default";
const REOPEN_DELAY: Duration = Duration::from_secs(1);
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// The complete set of live members of one service at a point in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub service: String,
    pub members: BTreeSet<BackendName>,
}

pub type FeedItem = Result<DiscoveryEvent, DiscoveryError>;

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    #[error("not running inside a kubernetes cluster: {0}")]
    NotInCluster(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("kubernetes API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("kubernetes API returned {0}")]
    Status(StatusCode),
    #[error("could not decode watch event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("watch reported an error: {0}")]
    Watch(String),
    #[error("watch event longer than {0} bytes")]
    LineTooLong(usize),
    #[error("membership feed closed")]
    FeedClosed,
}

/// Starts the feed selected by `config` on the current runtime.
pub fn spawn_feed(
    config: &Discovery,
    tx: mpsc::Sender<FeedItem>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, DiscoveryError> {
    match &config.source {
        DiscoverySource::Kubernetes => {
            let watch = EndpointsWatch::in_cluster(config.namespace.as_deref())?;
            tracing::info!(namespace = %watch.namespace, "watching kubernetes endpoints");
            Ok(tokio::spawn(watch.run(tx, shutdown)))
        }
        DiscoverySource::Static { members } => {
            let event = DiscoveryEvent {
                service: config.service.clone(),
                members: members.iter().cloned().collect(),
            };
            Ok(tokio::spawn(run_static(event, tx, shutdown)))
        }
    }
}

/// Announces a fixed member set once, then holds the channel open until shutdown.
pub async fn run_static(
    event: DiscoveryEvent,
    tx: mpsc::Sender<FeedItem>,
    shutdown: CancellationToken,
) {
    if tx.send(Ok(event)).await.is_err() {
        return;
    }
    shutdown.cancelled().await;
}

#[derive(Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

#[derive(Deserialize)]
struct Endpoints {
    metadata: ObjectMeta,
    subsets: Option<Vec<EndpointSubset>>,
}

#[derive(Deserialize)]
struct ObjectMeta {
    name: String,
}

#[derive(Deserialize)]
struct EndpointSubset {
    addresses: Option<Vec<EndpointAddress>>,
}

#[derive(Deserialize)]
struct EndpointAddress {
    ip: String,
    hostname: Option<String>,
}

#[derive(Deserialize)]
struct Status {
    message: Option<String>,
}

impl Endpoints {
    fn into_event(self) -> DiscoveryEvent {
        let members = self
            .subsets
            .unwrap_or_default()
            .into_iter()
            .flat_map(|subset| subset.addresses.unwrap_or_default())
            .map(|address| match address.hostname {
                Some(hostname) if !hostname.is_empty() => hostname,
                _ => address.ip,
            })
            .collect();

        DiscoveryEvent {
            service: self.metadata.name,
            members,
        }
    }
}

/// Decodes one line of a kubernetes watch stream. Returns `None` for blank lines and
/// event types that carry no membership information.
fn parse_watch_line(line: &[u8]) -> Result<Option<DiscoveryEvent>, DiscoveryError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let event: WatchEvent = serde_json::from_slice(line)?;
    match event.kind.as_str() {
        "ADDED" | "MODIFIED" => {
            let endpoints: Endpoints = serde_json::from_value(event.object)?;
            Ok(Some(endpoints.into_event()))
        }
        "DELETED" => {
            let endpoints: Endpoints = serde_json::from_value(event.object)?;
            Ok(Some(DiscoveryEvent {
                service: endpoints.metadata.name,
                members: BTreeSet::new(),
            }))
        }
        "ERROR" => {
            let status: Status = serde_json::from_value(event.object)?;
            Err(DiscoveryError::Watch(
                status.message.unwrap_or_else(|| "unknown error".into()),
            ))
        }
        other => {
            tracing::debug!(kind = other, "ignoring watch event");
            Ok(None)
        }
    }
}

/// Splits a streamed body into newline-terminated lines.
struct LineBuffer {
    buffer: Vec<u8>,
    // prefix of `buffer` known to hold no newline
    scanned: usize,
    max_line: usize,
}

impl LineBuffer {
    fn new(max_line: usize) -> Self {
        LineBuffer {
            buffer: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    /// Appends `chunk` and returns the lines it completed, newline included.
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, DiscoveryError> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
        {
            let end = self.scanned + offset + 1;
            if end - start > self.max_line {
                return Err(DiscoveryError::LineTooLong(self.max_line));
            }
            lines.push(self.buffer[start..end].to_vec());
            start = end;
            self.scanned = end;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        if self.buffer.len() > self.max_line {
            return Err(DiscoveryError::LineTooLong(self.max_line));
        }
        Ok(lines)
    }

    /// Whatever followed the last newline.
    fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Watches all Endpoints objects of a namespace through the kubernetes API.
pub struct EndpointsWatch {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    token: Option<String>,
}

impl EndpointsWatch {
    pub fn new(base_url: String, namespace: String, token: Option<String>) -> Self {
        EndpointsWatch {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace,
            token,
        }
    }

    /// Builds a watch from the pod's service account, the way in-cluster clients do.
    pub fn in_cluster(namespace: Option<&str>) -> Result<Self, DiscoveryError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| DiscoveryError::NotInCluster("KUBERNETES_SERVICE_HOST not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let account = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(account.join("token"))?;
        let ca = std::fs::read(account.join("ca.crt"))?;
        let namespace = match namespace {
            Some(ns) => ns.to_string(),
            None => std::fs::read_to_string(account.join("namespace"))
                .map(|ns| ns.trim().to_string())
                .unwrap_or_else(|_| DEFAULT_NAMESPACE.into()),
        };

        let client = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
            .build()?;

        Ok(EndpointsWatch {
            client,
            base_url: format!("https://{host}:{port}"),
            namespace,
            token: Some(token.trim().to_string()),
        })
    }

    fn watch_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/endpoints?watch=true",
            self.base_url, self.namespace
        )
    }

    /// Streams events into `tx` until shutdown. The API server ends watches after a
    /// while; a cleanly ended watch is reopened, and a fresh watch replays the current
    /// objects. Any failure is sent down the channel and ends the feed.
    pub async fn run(self, tx: mpsc::Sender<FeedItem>, shutdown: CancellationToken) {
        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                result = self.watch_once(&tx) => result,
            };

            match result {
                Ok(()) => {
                    tracing::debug!(namespace = %self.namespace, "endpoints watch ended, reopening");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(REOPEN_DELAY) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "endpoints watch failed");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    async fn watch_once(&self, tx: &mpsc::Sender<FeedItem>) -> Result<(), DiscoveryError> {
        let mut request = self.client.get(self.watch_url());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let mut response = request.send().await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Status(response.status()));
        }

        let mut lines = LineBuffer::new(MAX_LINE_BYTES);
        while let Some(chunk) = response.chunk().await? {
            for line in lines.push(&chunk)? {
                if let Some(event) = parse_watch_line(&line)? {
                    tx.send(Ok(event))
                        .await
                        .map_err(|_| DiscoveryError::FeedClosed)?;
                }
            }
        }

        if let Some(event) = parse_watch_line(&lines.finish())? {
            tx.send(Ok(event))
                .await
                .map_err(|_| DiscoveryError::FeedClosed)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ADDED: &str = r#"{"type":"ADDED","object":{"metadata":{"name":"chatapi"},"subsets":[{"addresses":[{"ip":"10.0.0.1","hostname":"chat-0"},{"ip":"10.0.0.2","hostname":"chat-1"}]}]}}"#;
    const MODIFIED_OTHER: &str = r#"{"type":"MODIFIED","object":{"metadata":{"name":"redis"},"subsets":[{"addresses":[{"ip":"10.0.1.1"}]}]}}"#;

    fn members(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_parse_added() {
        let event = parse_watch_line(ADDED.as_bytes()).unwrap().unwrap();
        assert_eq!(event.service, "chatapi");
        assert_eq!(event.members, members(&["chat-0", "chat-1"]));
    }

    #[test]
    fn test_parse_falls_back_to_ip() {
        let event = parse_watch_line(MODIFIED_OTHER.as_bytes()).unwrap().unwrap();
        assert_eq!(event.service, "redis");
        assert_eq!(event.members, members(&["10.0.1.1"]));
    }

    #[test]
    fn test_parse_without_subsets() {
        let line = r#"{"type":"MODIFIED","object":{"metadata":{"name":"chatapi"},"subsets":null}}"#;
        let event = parse_watch_line(line.as_bytes()).unwrap().unwrap();
        assert!(event.members.is_empty());
    }

    #[test]
    fn test_parse_deleted() {
        let line = ADDED.replace("ADDED", "DELETED");
        let event = parse_watch_line(line.as_bytes()).unwrap().unwrap();
        assert_eq!(event.service, "chatapi");
        assert!(event.members.is_empty());
    }

    #[test]
    fn test_parse_error_and_other_kinds() {
        let line = r#"{"type":"ERROR","object":{"kind":"Status","message":"too old resource version","code":410}}"#;
        let err = parse_watch_line(line.as_bytes()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Watch(msg) if msg == "too old resource version"));

        let line = r#"{"type":"BOOKMARK","object":{"metadata":{"name":""}}}"#;
        assert!(parse_watch_line(line.as_bytes()).unwrap().is_none());
        assert!(parse_watch_line(b"  \n").unwrap().is_none());
        assert!(parse_watch_line(b"not json").is_err());
    }

    #[test]
    fn test_line_buffer() {
        let mut lines = LineBuffer::new(64);
        assert!(lines.push(b"{\"type\":").unwrap().is_empty());
        assert!(lines.push(b"\"ADDED\"").unwrap().is_empty());
        assert_eq!(
            lines.push(b"}\n{}\n{\"ty").unwrap(),
            vec![b"{\"type\":\"ADDED\"}\n".to_vec(), b"{}\n".to_vec()]
        );
        assert_eq!(lines.push(b"pe\"").unwrap(), Vec::<Vec<u8>>::new());
        assert_eq!(lines.finish(), b"{\"type\"".to_vec());
    }

    #[test]
    fn test_line_buffer_rejects_long_lines() {
        // a line that never ends
        let mut lines = LineBuffer::new(8);
        assert!(lines.push(b"12345").unwrap().is_empty());
        let err = lines.push(b"6789").unwrap_err();
        assert!(matches!(err, DiscoveryError::LineTooLong(8)));

        // a complete line arriving in one chunk
        let mut lines = LineBuffer::new(8);
        let err = lines.push(b"ok\n0123456789\n").unwrap_err();
        assert!(matches!(err, DiscoveryError::LineTooLong(8)));

        // the limit applies per line, not per chunk
        let mut lines = LineBuffer::new(8);
        assert_eq!(lines.push(b"aaaaaa\nbbbbbb\ncc").unwrap().len(), 2);
        assert_eq!(lines.finish(), b"cc".to_vec());
    }

    #[tokio::test]
    async fn test_endpoints_watch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/chat/endpoints"))
            .and(query_param("watch", "true"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(format!("{ADDED}\n{MODIFIED_OTHER}")),
            )
            .mount(&server)
            .await;

        let watch = EndpointsWatch::new(server.uri(), "chat".into(), Some("secret".into()));
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(watch.run(tx, shutdown.clone()));

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.members, members(&["chat-0", "chat-1"]));
        // last line has no trailing newline
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second.service, "redis");

        // the watch is reopened after the body ends
        let replayed = rx.recv().await.unwrap().unwrap();
        assert_eq!(replayed, first);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_endpoints_watch_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let watch = EndpointsWatch::new(server.uri(), "chat".into(), None);
        let (tx, mut rx) = mpsc::channel(8);
        watch.run(tx, CancellationToken::new()).await;

        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, DiscoveryError::Status(status) if status == StatusCode::FORBIDDEN));
        // the feed is over
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_static_feed() {
        let config = Discovery {
            service: "chatapi".into(),
            namespace: None,
            source: DiscoverySource::Static {
                members: vec!["a".into(), "b".into()],
            },
        };
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = spawn_feed(&config, tx, shutdown.clone()).unwrap();

        let event = rx.recv().await.unwrap().unwrap();
        assert_eq!(event.service, "chatapi");
        assert_eq!(event.members, members(&["a", "b"]));

        shutdown.cancel();
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
