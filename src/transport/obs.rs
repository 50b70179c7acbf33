use super::{EventHandler, RemoteEvent, ServerAddress, SubscriptionId, Transport, TransportError};
use crate::model::{OutputStatus, StreamMetrics, VersionInfo};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use obws::events::Event;
use obws::Client as ObsClient;
use std::collections::HashMap;
use std::error::Error as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinHandle};

/// obs-websocket v5 transport backed by `obws`.
///
/// Push events come from the client's event stream. obs-websocket v5 has no
/// periodic stream-status event, so metrics samples are produced by polling
/// the stream status while the stream is active.
pub struct ObwsTransport {
    client: Arc<Mutex<Option<Arc<ObsClient>>>>,
    tasks: Mutex<HashMap<SubscriptionId, Vec<JoinHandle<()>>>>,
    next_id: AtomicU64,
    metrics_interval: Duration,
}

impl ObwsTransport {
    pub fn new(metrics_interval: Duration) -> Self {
        Self {
            client: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics_interval,
        }
    }

    fn client(&self) -> Result<Arc<ObsClient>, TransportError> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for ObwsTransport {
    async fn connect(
        &self,
        address: &ServerAddress,
        password: Option<&str>,
    ) -> Result<(), TransportError> {
        let password_status = if password.is_some() {
            "with password"
        } else {
            "without password"
        };
        tracing::debug!(
            "Attempting to connect to OBS at {}:{} {}",
            address.host,
            address.port,
            password_status
        );

        match ObsClient::connect(&address.host, address.port, password).await {
            Ok(client) => {
                tracing::info!("Connected to OBS at {}:{}", address.host, address.port);
                *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(client));
                Ok(())
            }
            Err(err) => {
                let detail = error_chain(&err);
                if is_auth_failure(&detail) {
                    Err(TransportError::Auth(detail))
                } else {
                    Err(TransportError::Connect(detail))
                }
            }
        }
    }

    async fn disconnect(&self) {
        // Dropping the last handle closes the socket.
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        if client.is_some() {
            tracing::debug!("released OBS client");
        }
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<SubscriptionId, TransportError> {
        let client = self.client()?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let interval = self.metrics_interval;
        let poll_task = tokio::spawn(poll_stream_metrics(client.clone(), handler.clone(), interval));
        let poll = poll_task.abort_handle();

        let session = self.client.clone();
        let event_task = tokio::spawn(async move {
            forward_events(&client, handler.as_ref()).await;
            close_session(handler.as_ref(), &*session, &client, &poll);
        });

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, vec![event_task, poll_task]);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        match tasks {
            Some(tasks) => {
                for task in tasks {
                    task.abort();
                }
            }
            None => tracing::debug!(subscription = id.0, "unsubscribe for unknown subscription"),
        }
    }

    async fn version(&self) -> Result<VersionInfo, TransportError> {
        let client = self.client()?;
        let version = client
            .general()
            .version()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(VersionInfo {
            plugin_version: version.obs_web_socket_version.to_string(),
            server_version: version.obs_version.to_string(),
        })
    }

    async fn output_status(&self) -> Result<OutputStatus, TransportError> {
        let client = self.client()?;
        let streaming = client
            .streaming()
            .status()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        let recording = client
            .recording()
            .status()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(OutputStatus {
            is_streaming: streaming.active,
            is_recording: recording.active,
        })
    }

    async fn toggle_recording(&self) -> Result<(), TransportError> {
        let client = self.client()?;
        let active = client
            .recording()
            .toggle()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        tracing::debug!(active, "recording toggle requested");
        Ok(())
    }
}

/// How one subscription to the client's event broadcast ended.
#[derive(Debug, PartialEq)]
enum StreamEnd {
    ServerStopped,
    Ended { delivered: usize },
}

/// Forwards translated events until the server stops. A broadcast stream can
/// also end because the receiver lagged behind; the socket is still up then,
/// so the stream is opened again.
async fn forward_events(client: &ObsClient, handler: &dyn EventHandler) {
    handler.handle(RemoteEvent::ConnectionOpened);
    loop {
        let events = match client.events() {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(error = %err, "OBS event stream unavailable");
                return;
            }
        };
        match pump_events(events, handler).await {
            StreamEnd::ServerStopped => return,
            // A fresh receiver that ends without a single event has no live
            // sender behind it.
            StreamEnd::Ended { delivered: 0 } => {
                tracing::warn!("OBS event stream closed");
                return;
            }
            StreamEnd::Ended { delivered } => {
                tracing::warn!(delivered, "OBS event stream lagged, resubscribing");
            }
        }
    }
}

async fn pump_events<S>(events: S, handler: &dyn EventHandler) -> StreamEnd
where
    S: Stream<Item = Event>,
{
    let mut events = std::pin::pin!(events);
    let mut delivered = 0;
    while let Some(event) = events.next().await {
        delivered += 1;
        match translate_event(event) {
            Some(RemoteEvent::ConnectionClosed) => return StreamEnd::ServerStopped,
            Some(remote) => handler.handle(remote),
            None => {}
        }
    }
    StreamEnd::Ended { delivered }
}

/// Reports the close, stops metrics polling and drops the client unless a
/// newer session already replaced it.
fn close_session<T>(
    handler: &dyn EventHandler,
    session: &Mutex<Option<Arc<T>>>,
    client: &Arc<T>,
    poll: &AbortHandle,
) {
    handler.handle(RemoteEvent::ConnectionClosed);
    poll.abort();
    let mut current = session.lock().unwrap_or_else(|e| e.into_inner());
    if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, client)) {
        *current = None;
        tracing::debug!("released OBS client of closed session");
    }
}

fn translate_event(event: Event) -> Option<RemoteEvent> {
    let remote = match event {
        Event::CurrentProgramSceneChanged { id, .. } => RemoteEvent::SceneChanged { name: id.name },
        Event::CurrentSceneCollectionChanged { name, .. } => {
            RemoteEvent::SceneCollectionChanged { name }
        }
        Event::CurrentProfileChanged { name, .. } => RemoteEvent::ProfileChanged { name },
        Event::CurrentSceneTransitionChanged { id, .. } => {
            RemoteEvent::TransitionChanged { name: id.name }
        }
        Event::CurrentSceneTransitionDurationChanged { duration, .. } => {
            RemoteEvent::TransitionDurationChanged {
                duration_ms: duration.whole_milliseconds() as i64,
            }
        }
        // The debug name of the obws variant is the bare state name; anything
        // outside the four canonical states is normalized downstream.
        Event::StreamStateChanged { state, .. } => RemoteEvent::StreamingStateChanged {
            state: format!("{state:?}"),
        },
        Event::RecordStateChanged { state, .. } => RemoteEvent::RecordingStateChanged {
            state: format!("{state:?}"),
        },
        Event::ServerStopped => RemoteEvent::ConnectionClosed,
        _ => return None,
    };
    Some(remote)
}

/// Byte throughput between consecutive stream-status polls.
#[derive(Debug, Default)]
struct ByteRate {
    last: Option<(u64, Instant)>,
}

impl ByteRate {
    /// The first sample of a stream averages over its whole duration. A
    /// counter that went backwards counts as zero bytes sent.
    fn sample(&mut self, bytes: u64, total_secs: f64, now: Instant) -> f64 {
        let rate = match self.last {
            Some((prev, at)) => {
                let dt = now.saturating_duration_since(at).as_secs_f64();
                if dt > 0.0 {
                    bytes.saturating_sub(prev) as f64 / dt
                } else {
                    0.0
                }
            }
            None if total_secs > 0.0 => bytes as f64 / total_secs,
            None => 0.0,
        };
        self.last = Some((bytes, now));
        rate
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

struct StreamCounters {
    duration_ms: i128,
    bytes: u64,
    congestion: f64,
    skipped_frames: u64,
    total_frames: u64,
}

fn stream_sample(
    counters: &StreamCounters,
    rate: &mut ByteRate,
    frames_per_second: f64,
    now: Instant,
) -> StreamMetrics {
    let total_secs = counters.duration_ms.max(0) as f64 / 1000.0;
    let bytes_per_second = rate.sample(counters.bytes, total_secs, now);
    StreamMetrics {
        total_time_seconds: total_secs as u64,
        kbits_per_second: (bytes_per_second * 8.0 / 1000.0).round(),
        bytes_per_second: bytes_per_second.round(),
        frames_per_second,
        strain_fraction: counters.congestion,
        dropped_frames: counters.skipped_frames,
        total_frames: counters.total_frames,
    }
}

async fn poll_stream_metrics(
    client: Arc<ObsClient>,
    handler: Arc<dyn EventHandler>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut rate = ByteRate::default();
    loop {
        ticker.tick().await;
        let status = match client.streaming().status().await {
            Ok(status) => status,
            Err(err) => {
                tracing::debug!(error = %err, "stream status poll failed");
                continue;
            }
        };
        if !status.active {
            rate.reset();
            continue;
        }

        let frames_per_second = match client.general().stats().await {
            Ok(stats) => stats.active_fps as f64,
            Err(_) => 0.0,
        };
        let counters = StreamCounters {
            duration_ms: status.duration.whole_milliseconds(),
            bytes: status.bytes,
            congestion: status.congestion as f64,
            skipped_frames: status.skipped_frames as u64,
            total_frames: status.total_frames as u64,
        };
        handler.handle(RemoteEvent::MetricsSample(stream_sample(
            &counters,
            &mut rate,
            frames_per_second,
            Instant::now(),
        )));
    }
}

fn error_chain(err: &obws::error::Error) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        detail.push_str(": ");
        detail.push_str(&inner.to_string());
        source = inner.source();
    }
    detail
}

/// obs-websocket closes the socket with code 4009 when the password is wrong;
/// obws reports that as a handshake failure mentioning authentication.
fn is_auth_failure(detail: &str) -> bool {
    let lower = detail.to_lowercase();
    lower.contains("authentication") || lower.contains("password") || lower.contains("4009")
}
