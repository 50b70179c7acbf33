use crate::dispatch::EventDispatcher;
use crate::mirror::{ApplyOutcome, SlotUpdate, StateMirror};
use crate::model::{ConnectionState, OutputState};
use crate::transport::{ServerAddress, SubscriptionId, Transport, TransportError};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("authentication rejected by {address}: {reason}")]
pub struct AuthError {
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect rejected: session is already {0:?}")]
    Busy(ConnectionState),
    #[error("{step} timed out after {timeout_ms} ms")]
    Timeout { step: &'static str, timeout_ms: u64 },
    #[error("cannot reach {address}: {reason}")]
    Transport { address: String, reason: String },
    #[error("reconciliation failed: {0}")]
    Reconciliation(String),
    #[error("connect attempt cancelled by disconnect")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("not connected")]
    NotConnected,
    #[error("request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub address: ServerAddress,
    pub password: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
    Connected,
    Disconnected,
}

/// Owns the session lifecycle: connect, reconcile, disconnect.
///
/// At most one subscription is registered with the transport at any time.
/// The subscription slot and the mirror epoch change together under
/// `subscription`, so a disconnect racing a connect either sees the handler
/// and removes it, or the connect sees the new epoch and never registers.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    mirror: StateMirror,
    settings: ConnectionSettings,
    subscription: Mutex<Option<SubscriptionId>>,
    // Serializes the transport-facing part of connect attempts, so an
    // abandoned attempt finishes its cleanup before the next one dials.
    attempt: tokio::sync::Mutex<()>,
}

enum Attach {
    Attached,
    Cancelled,
    Failed(TransportError),
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        mirror: StateMirror,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            transport,
            mirror,
            settings,
            subscription: Mutex::new(None),
            attempt: tokio::sync::Mutex::new(()),
        }
    }

    pub fn mirror(&self) -> &StateMirror {
        &self.mirror
    }

    pub fn state(&self) -> ConnectionState {
        self.mirror.connection_state()
    }

    /// Presenter command: connect when there is no session, disconnect when
    /// there is one. A click while a connect is in flight is rejected as busy.
    pub async fn connect_clicked(&self) -> Result<ClickOutcome, ConnectionError> {
        if self.state() == ConnectionState::Connected {
            self.disconnect().await;
            return Ok(ClickOutcome::Disconnected);
        }
        let address = self.settings.address.clone();
        let password = self.settings.password.clone();
        self.connect(&address, password.as_deref()).await?;
        Ok(ClickOutcome::Connected)
    }

    /// Presenter command. The authoritative recording state arrives later as
    /// a recording-state event.
    pub async fn toggle_recording_clicked(&self) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        match self.bounded(self.transport.toggle_recording()).await {
            Some(Ok(())) => Ok(()),
            Some(Err(TransportError::NotConnected)) => Err(ConnectionError::NotConnected),
            Some(Err(err)) => Err(ConnectionError::Request(err.to_string())),
            None => Err(ConnectionError::Request(format!(
                "toggle recording timed out after {} ms",
                self.timeout_ms()
            ))),
        }
    }

    pub async fn connect(
        &self,
        address: &ServerAddress,
        password: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let epoch = self
            .mirror
            .begin_session()
            .map_err(|err| ConnectError::Busy(err.from))?;
        tracing::info!(%address, epoch, "connecting");

        let _attempt = self.attempt.lock().await;
        if self.mirror.epoch() != epoch {
            return Err(ConnectError::Cancelled.into());
        }
        // A server-side close leaves the old handler registered.
        self.release_subscription();

        match self.bounded(self.transport.connect(address, password)).await {
            Some(Ok(())) => {}
            Some(Err(TransportError::Auth(reason))) => {
                self.mirror
                    .update(epoch, SlotUpdate::Connection(ConnectionState::AuthFailed));
                tracing::warn!(%address, %reason, "authentication failed");
                self.abandon(epoch).await;
                return Err(AuthError {
                    address: address.to_string(),
                    reason,
                }
                .into());
            }
            Some(Err(err)) => {
                tracing::warn!(%address, error = %err, "connect failed");
                self.abandon(epoch).await;
                return Err(ConnectError::Transport {
                    address: address.to_string(),
                    reason: err.to_string(),
                }
                .into());
            }
            None => {
                tracing::warn!(%address, "connect timed out");
                self.abandon(epoch).await;
                return Err(self.timeout_error("connect").into());
            }
        }

        match self.attach(epoch) {
            Attach::Attached => {}
            Attach::Cancelled => {
                tracing::info!(%address, "connect abandoned after disconnect");
                self.abandon(epoch).await;
                return Err(ConnectError::Cancelled.into());
            }
            Attach::Failed(err) => {
                self.abandon(epoch).await;
                return Err(ConnectError::Transport {
                    address: address.to_string(),
                    reason: err.to_string(),
                }
                .into());
            }
        }

        if let Err(err) = self.reconcile(epoch).await {
            tracing::warn!(%address, error = %err, "reconciliation failed");
            self.abandon(epoch).await;
            return Err(err.into());
        }

        if self.mirror.epoch() != epoch {
            return Err(ConnectError::Cancelled.into());
        }
        tracing::info!(%address, "connected");
        Ok(())
    }

    /// Drives the state to Disconnected from any state. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (previous, subscription) = {
            let mut slot = self.lock_subscription();
            let previous = self.mirror.connection_state();
            self.mirror.end_session();
            (previous, slot.take())
        };
        if let Some(id) = subscription {
            self.transport.unsubscribe(id);
        }
        if self.bounded(self.transport.disconnect()).await.is_none() {
            tracing::warn!("transport disconnect timed out");
        }
        if previous != ConnectionState::Disconnected {
            tracing::info!(?previous, "disconnected");
        }
    }

    /// Marks the session Connected and registers the dispatcher, unless a
    /// disconnect already ended this epoch.
    fn attach(&self, epoch: u64) -> Attach {
        let mut slot = self.lock_subscription();
        if self.mirror.epoch() != epoch {
            return Attach::Cancelled;
        }
        if self
            .mirror
            .update(epoch, SlotUpdate::Connection(ConnectionState::Connected))
            != ApplyOutcome::Changed
        {
            return Attach::Cancelled;
        }
        let dispatcher = Arc::new(EventDispatcher::new(self.mirror.clone(), epoch));
        match self.transport.subscribe(dispatcher) {
            Ok(id) => {
                *slot = Some(id);
                Attach::Attached
            }
            Err(err) => Attach::Failed(err),
        }
    }

    /// Push events only report changes, so the current version and output
    /// states are queried once and fed in as if they were events.
    async fn reconcile(&self, epoch: u64) -> Result<(), ConnectError> {
        let version = self
            .bounded(self.transport.version())
            .await
            .ok_or_else(|| self.timeout_error("version query"))?
            .map_err(|err| ConnectError::Reconciliation(err.to_string()))?;
        tracing::info!(
            plugin_version = %version.plugin_version,
            server_version = %version.server_version,
            "server version"
        );
        self.mirror.reconcile(epoch, SlotUpdate::Version(version));

        let status = self
            .bounded(self.transport.output_status())
            .await
            .ok_or_else(|| self.timeout_error("output status query"))?
            .map_err(|err| ConnectError::Reconciliation(err.to_string()))?;
        for update in [
            SlotUpdate::Streaming(OutputState::from_active(status.is_streaming)),
            SlotUpdate::Recording(OutputState::from_active(status.is_recording)),
        ] {
            if self.mirror.reconcile(epoch, update) == ApplyOutcome::Superseded {
                tracing::debug!("reconciled output state superseded by event");
            }
        }
        Ok(())
    }

    /// Cleans up after a failed attempt. Only resets the mirror if the
    /// attempt's epoch is still current.
    async fn abandon(&self, epoch: u64) {
        let subscription = {
            let mut slot = self.lock_subscription();
            if self.mirror.epoch() == epoch {
                self.mirror.end_session();
                slot.take()
            } else {
                None
            }
        };
        if let Some(id) = subscription {
            self.transport.unsubscribe(id);
        }
        if self.bounded(self.transport.disconnect()).await.is_none() {
            tracing::warn!("transport disconnect timed out");
        }
    }

    fn release_subscription(&self) {
        let leftover = self.lock_subscription().take();
        if let Some(id) = leftover {
            tracing::debug!(subscription = id.0, "releasing handler of closed session");
            self.transport.unsubscribe(id);
        }
    }

    fn lock_subscription(&self) -> std::sync::MutexGuard<'_, Option<SubscriptionId>> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn bounded<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::time::timeout(self.settings.timeout, fut).await.ok()
    }

    fn timeout_ms(&self) -> u64 {
        self.settings.timeout.as_millis() as u64
    }

    fn timeout_error(&self, step: &'static str) -> ConnectError {
        ConnectError::Timeout {
            step,
            timeout_ms: self.timeout_ms(),
        }
    }
}
