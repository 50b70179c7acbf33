use crate::model::{
    ConnectionState, InvalidTransition, OutputChannel, OutputState, SceneState, StreamMetrics,
    VersionInfo,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Connection,
    Version,
    Scene,
    Streaming,
    Recording,
    Metrics,
}

impl Slot {
    pub const ALL: [Slot; 6] = [
        Slot::Connection,
        Slot::Version,
        Slot::Scene,
        Slot::Streaming,
        Slot::Recording,
        Slot::Metrics,
    ];
}

/// A new value for exactly one slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotUpdate {
    Connection(ConnectionState),
    Version(VersionInfo),
    Scene(String),
    Streaming(OutputState),
    Recording(OutputState),
    Metrics(StreamMetrics),
}

impl SlotUpdate {
    pub fn slot(&self) -> Slot {
        match self {
            SlotUpdate::Connection(_) => Slot::Connection,
            SlotUpdate::Version(_) => Slot::Version,
            SlotUpdate::Scene(_) => Slot::Scene,
            SlotUpdate::Streaming(_) => Slot::Streaming,
            SlotUpdate::Recording(_) => Slot::Recording,
            SlotUpdate::Metrics(_) => Slot::Metrics,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Changed,
    /// Same value as already stored; nothing to notify.
    Unchanged,
    /// Stamped with an epoch that is no longer current, or arrived while
    /// there is no live session.
    Stale,
    /// Reconciliation value skipped because an event already wrote the slot.
    Superseded,
    Rejected(InvalidTransition),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MirrorSnapshot {
    pub connection: ConnectionState,
    pub version: Option<VersionInfo>,
    pub scene: SceneState,
    pub streaming: Option<OutputState>,
    pub recording: Option<OutputState>,
    pub metrics: StreamMetrics,
}

impl MirrorSnapshot {
    /// Writes a non-connection slot, returning whether the value changed.
    fn write(&mut self, update: SlotUpdate) -> bool {
        match update {
            SlotUpdate::Connection(state) => replace(&mut self.connection, state),
            SlotUpdate::Version(version) => replace(&mut self.version, Some(version)),
            SlotUpdate::Scene(name) => replace(
                &mut self.scene,
                SceneState {
                    current_scene_name: name,
                },
            ),
            SlotUpdate::Streaming(state) => replace(&mut self.streaming, Some(state)),
            SlotUpdate::Recording(state) => replace(&mut self.recording, Some(state)),
            SlotUpdate::Metrics(metrics) => replace(&mut self.metrics, metrics),
        }
    }

    fn differs(&self, other: &MirrorSnapshot, slot: Slot) -> bool {
        match slot {
            Slot::Connection => self.connection != other.connection,
            Slot::Version => self.version != other.version,
            Slot::Scene => self.scene != other.scene,
            Slot::Streaming => self.streaming != other.streaming,
            Slot::Recording => self.recording != other.recording,
            Slot::Metrics => self.metrics != other.metrics,
        }
    }

    pub fn view(&self) -> PresenterView {
        let m = &self.metrics;
        let version = self.version.clone().unwrap_or_default();
        PresenterView {
            connection_state: self.connection,
            connection_label: self.connection.button_label(),
            plugin_version: version.plugin_version,
            server_version: version.server_version,
            current_scene: self.scene.current_scene_name.clone(),
            streaming_label: OutputChannel::Streaming.caption(self.streaming),
            recording_label: OutputChannel::Recording.caption(self.recording),
            recording_control_enabled: self.connection == ConnectionState::Connected,
            stream_time: format!("{} sec", m.total_time_seconds),
            kbits_per_sec: format!("{} kbit/s", m.kbits_per_second),
            bytes_per_sec: format!("{} bytes/s", m.bytes_per_second),
            framerate: format!("{} FPS", m.frames_per_second),
            strain: format!("{} %", m.strain_fraction * 100.0),
            dropped_frames: m.dropped_frames.to_string(),
            total_frames: m.total_frames.to_string(),
        }
    }
}

fn replace<T: PartialEq>(field: &mut T, value: T) -> bool {
    if *field == value {
        false
    } else {
        *field = value;
        true
    }
}

/// Presenter-facing read surface: every value already formatted as a label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenterView {
    pub connection_state: ConnectionState,
    pub connection_label: &'static str,
    pub plugin_version: String,
    pub server_version: String,
    pub current_scene: String,
    pub streaming_label: &'static str,
    pub recording_label: &'static str,
    pub recording_control_enabled: bool,
    pub stream_time: String,
    pub kbits_per_sec: String,
    pub bytes_per_sec: String,
    pub framerate: String,
    pub strain: String,
    pub dropped_frames: String,
    pub total_frames: String,
}

/// Result of a presenter tick: a consistent snapshot plus the slots that
/// changed since the previous drain.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorDrain {
    pub snapshot: MirrorSnapshot,
    pub changed: Vec<Slot>,
}

#[derive(Debug, Default)]
struct MirrorInner {
    fields: MirrorSnapshot,
    epoch: u64,
    pending: BTreeSet<Slot>,
    event_written: HashSet<Slot>,
    applies: u64,
}

impl MirrorInner {
    fn reset(&mut self) {
        let before = std::mem::take(&mut self.fields);
        for slot in Slot::ALL {
            if before.differs(&self.fields, slot) {
                self.pending.insert(slot);
            }
        }
        self.epoch += 1;
        self.event_written.clear();
    }

    fn apply(&mut self, epoch: u64, update: SlotUpdate, reconciling: bool) -> ApplyOutcome {
        if epoch != self.epoch {
            return ApplyOutcome::Stale;
        }
        let slot = update.slot();

        if let SlotUpdate::Connection(next) = update {
            if next == self.fields.connection {
                self.applies += 1;
                return ApplyOutcome::Unchanged;
            }
            if let Err(err) = self.fields.connection.transition(next) {
                return ApplyOutcome::Rejected(err);
            }
            self.applies += 1;
            if next == ConnectionState::Disconnected {
                self.reset();
            } else {
                self.fields.connection = next;
                self.pending.insert(Slot::Connection);
            }
            return ApplyOutcome::Changed;
        }

        if self.fields.connection != ConnectionState::Connected {
            return ApplyOutcome::Stale;
        }
        if reconciling && self.event_written.contains(&slot) {
            return ApplyOutcome::Superseded;
        }
        if !reconciling {
            self.event_written.insert(slot);
        }
        self.applies += 1;
        if self.fields.write(update) {
            self.pending.insert(slot);
            ApplyOutcome::Changed
        } else {
            ApplyOutcome::Unchanged
        }
    }
}

/// Shared, lock-guarded mirror of remote state. Cloning shares the same slots.
///
/// Every write and every read goes through one mutex, so a snapshot never
/// observes a partially applied update.
#[derive(Debug, Clone, Default)]
pub struct StateMirror {
    inner: Arc<Mutex<MirrorInner>>,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MirrorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new epoch and moves Disconnected -> Connecting.
    pub fn begin_session(&self) -> Result<u64, InvalidTransition> {
        let mut inner = self.lock();
        let next = inner.fields.connection.transition(ConnectionState::Connecting)?;
        inner.epoch += 1;
        inner.event_written.clear();
        inner.fields.connection = next;
        inner.pending.insert(Slot::Connection);
        Ok(inner.epoch)
    }

    /// Resets every slot to its default and invalidates the current epoch.
    /// Returns the new epoch.
    pub fn end_session(&self) -> u64 {
        let mut inner = self.lock();
        inner.reset();
        inner.epoch
    }

    /// Last-write-wins update of one slot, stamped with the session epoch it
    /// was produced in.
    pub fn update(&self, epoch: u64, update: SlotUpdate) -> ApplyOutcome {
        self.lock().apply(epoch, update, false)
    }

    /// Applies a reconciliation result unless an event already wrote the slot
    /// in this epoch.
    pub fn reconcile(&self, epoch: u64, update: SlotUpdate) -> ApplyOutcome {
        self.lock().apply(epoch, update, true)
    }

    pub fn snapshot(&self) -> MirrorSnapshot {
        self.lock().fields.clone()
    }

    pub fn drain(&self) -> MirrorDrain {
        let mut inner = self.lock();
        let changed = std::mem::take(&mut inner.pending).into_iter().collect();
        MirrorDrain {
            snapshot: inner.fields.clone(),
            changed,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().fields.connection
    }

    /// Number of updates accepted so far, including no-op duplicates.
    pub fn applies(&self) -> u64 {
        self.lock().applies
    }
}
