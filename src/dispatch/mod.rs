use crate::mirror::{ApplyOutcome, SlotUpdate, StateMirror};
use crate::model::{ConnectionState, OutputState, StreamMetrics};
use crate::transport::{EventHandler, RemoteEvent};

/// Routes inbound events of one session into the mirror.
///
/// A dispatcher is bound to the epoch it was created for, so anything the
/// transport still delivers after that session ended is discarded by the
/// mirror instead of overwriting fresh state.
pub struct EventDispatcher {
    mirror: StateMirror,
    epoch: u64,
}

impl EventDispatcher {
    pub fn new(mirror: StateMirror, epoch: u64) -> Self {
        Self { mirror, epoch }
    }

    /// Computes the slot update an event maps to. Informational categories
    /// are logged and touch no slot.
    pub fn route(&self, event: RemoteEvent) -> Option<SlotUpdate> {
        let update = match event {
            RemoteEvent::ConnectionOpened => self.on_connection_opened(),
            RemoteEvent::ConnectionClosed => self.on_connection_closed(),
            RemoteEvent::SceneChanged { name } => self.on_scene_changed(name),
            RemoteEvent::SceneCollectionChanged { name } => {
                self.on_scene_collection_changed(&name);
                return None;
            }
            RemoteEvent::ProfileChanged { name } => {
                self.on_profile_changed(&name);
                return None;
            }
            RemoteEvent::TransitionChanged { name } => {
                self.on_transition_changed(&name);
                return None;
            }
            RemoteEvent::TransitionDurationChanged { duration_ms } => {
                self.on_transition_duration_changed(duration_ms);
                return None;
            }
            RemoteEvent::StreamingStateChanged { state } => self.on_streaming_state_changed(&state),
            RemoteEvent::RecordingStateChanged { state } => self.on_recording_state_changed(&state),
            RemoteEvent::MetricsSample(sample) => self.on_metrics_sample(sample),
        };
        Some(update)
    }

    fn on_connection_opened(&self) -> SlotUpdate {
        SlotUpdate::Connection(ConnectionState::Connected)
    }

    fn on_connection_closed(&self) -> SlotUpdate {
        tracing::info!("connection closed by server");
        SlotUpdate::Connection(ConnectionState::Disconnected)
    }

    fn on_scene_changed(&self, name: String) -> SlotUpdate {
        SlotUpdate::Scene(name)
    }

    fn on_scene_collection_changed(&self, name: &str) {
        tracing::info!(scene_collection = %name, "scene collection changed");
    }

    fn on_profile_changed(&self, name: &str) {
        tracing::info!(profile = %name, "profile changed");
    }

    fn on_transition_changed(&self, name: &str) {
        tracing::info!(transition = %name, "transition changed");
    }

    fn on_transition_duration_changed(&self, duration_ms: i64) {
        tracing::info!(duration_ms, "transition duration changed");
    }

    fn on_streaming_state_changed(&self, raw: &str) -> SlotUpdate {
        let state = OutputState::normalize(raw);
        tracing::debug!(?state, "streaming state changed");
        SlotUpdate::Streaming(state)
    }

    fn on_recording_state_changed(&self, raw: &str) -> SlotUpdate {
        let state = OutputState::normalize(raw);
        tracing::debug!(?state, "recording state changed");
        SlotUpdate::Recording(state)
    }

    fn on_metrics_sample(&self, mut sample: StreamMetrics) -> SlotUpdate {
        if let Some(err) = sample.sanitize() {
            tracing::warn!(error = %err, "malformed metrics sample clamped");
        }
        SlotUpdate::Metrics(sample)
    }
}

impl EventHandler for EventDispatcher {
    fn handle(&self, event: RemoteEvent) {
        let Some(update) = self.route(event) else {
            return;
        };
        let slot = update.slot();
        match self.mirror.update(self.epoch, update) {
            ApplyOutcome::Changed | ApplyOutcome::Unchanged => {}
            ApplyOutcome::Stale | ApplyOutcome::Superseded => {
                tracing::debug!(?slot, epoch = self.epoch, "discarded event from ended session");
            }
            ApplyOutcome::Rejected(err) => {
                tracing::warn!(?slot, error = %err, "event rejected");
            }
        }
    }
}
