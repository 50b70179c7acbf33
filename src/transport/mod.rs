use crate::model::{OutputStatus, StreamMetrics, VersionInfo};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[cfg(test)]
pub mod fake;
mod obs;

pub use self::obs::ObwsTransport;

/// Inbound push event, one variant per category the server emits.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    ConnectionOpened,
    ConnectionClosed,
    SceneChanged { name: String },
    SceneCollectionChanged { name: String },
    ProfileChanged { name: String },
    TransitionChanged { name: String },
    TransitionDurationChanged { duration_ms: i64 },
    /// `state` is the raw token as received; it is validated downstream.
    StreamingStateChanged { state: String },
    RecordingStateChanged { state: String },
    MetricsSample(StreamMetrics),
}

/// Receives events on the transport's delivery task. Implementations must
/// return promptly and must not call back into the transport.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: RemoteEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("not connected")]
    NotConnected,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        address: &ServerAddress,
        password: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Closes the session if one is open. Calling it without a session is a no-op.
    async fn disconnect(&self);

    fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<SubscriptionId, TransportError>;

    fn unsubscribe(&self, id: SubscriptionId);

    async fn version(&self) -> Result<VersionInfo, TransportError>;

    async fn output_status(&self) -> Result<OutputStatus, TransportError>;

    async fn toggle_recording(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid server address {0:?}: {1}")]
    Parse(String, String),
    #[error("unsupported scheme {0:?}, expected ws")]
    Scheme(String),
    #[error("server address {0:?} has no host")]
    MissingHost(String),
    #[error("server address {0:?} has no port")]
    MissingPort(String),
}

impl FromStr for ServerAddress {
    type Err = AddressError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("ws://{trimmed}")
        };
        let url = Url::parse(&candidate)
            .map_err(|err| AddressError::Parse(trimmed.to_string(), err.to_string()))?;
        if url.scheme() != "ws" {
            return Err(AddressError::Scheme(url.scheme().to_string()));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| AddressError::MissingHost(trimmed.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AddressError::MissingPort(trimmed.to_string()))?;
        Ok(Self { host, port })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "ws://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "ws://{}:{}", self.host, self.port)
        }
    }
}
