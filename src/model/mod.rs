use serde::Serialize;
use thiserror::Error;

const WIRE_OUTPUT_PREFIX: &str = "OBS_WEBSOCKET_OUTPUT_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    AuthFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid connection transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    /// Guarded transition. Any state may fall back to `Disconnected`; the
    /// forward path is Disconnected -> Connecting -> Connected | AuthFailed.
    pub fn transition(self, to: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionState::*;
        let allowed = matches!(
            (self, to),
            (_, Disconnected) | (Disconnected, Connecting) | (Connecting, Connected) | (Connecting, AuthFailed)
        );
        if allowed {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    pub fn button_label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected | ConnectionState::AuthFailed => "Connect",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Disconnect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutputState {
    Starting,
    Started,
    Stopping,
    Stopped,
    Unknown,
}

impl OutputState {
    pub fn from_active(active: bool) -> Self {
        if active {
            OutputState::Started
        } else {
            OutputState::Stopped
        }
    }

    /// Accepts both the bare names (`Started`) and the obs-websocket wire
    /// tokens (`OBS_WEBSOCKET_OUTPUT_STARTED`), case-insensitively.
    pub fn parse(raw: &str) -> Result<Self, MalformedEventError> {
        let trimmed = raw.trim();
        let upper = trimmed.to_ascii_uppercase();
        let name = upper.strip_prefix(WIRE_OUTPUT_PREFIX).unwrap_or(upper.as_str());
        match name {
            "STARTING" => Ok(OutputState::Starting),
            "STARTED" => Ok(OutputState::Started),
            "STOPPING" => Ok(OutputState::Stopping),
            "STOPPED" => Ok(OutputState::Stopped),
            _ => Err(MalformedEventError::OutputState(trimmed.to_string())),
        }
    }

    /// Like [`OutputState::parse`] but never fails: anything outside the known
    /// set becomes `Unknown` and is logged.
    pub fn normalize(raw: &str) -> Self {
        match Self::parse(raw) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(error = %err, "malformed output state normalized to Unknown");
                OutputState::Unknown
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutputChannel {
    Streaming,
    Recording,
}

impl OutputChannel {
    /// Button caption for the channel. `None` means there is no live session.
    pub fn caption(self, state: Option<OutputState>) -> &'static str {
        let Some(state) = state else {
            return "Offline";
        };
        match (self, state) {
            (OutputChannel::Streaming, OutputState::Starting) => "Stream starting...",
            (OutputChannel::Streaming, OutputState::Started) => "Stop streaming",
            (OutputChannel::Streaming, OutputState::Stopping) => "Stream stopping...",
            (OutputChannel::Streaming, OutputState::Stopped) => "Start streaming",
            (OutputChannel::Recording, OutputState::Starting) => "Recording starting...",
            (OutputChannel::Recording, OutputState::Started) => "Stop recording",
            (OutputChannel::Recording, OutputState::Stopping) => "Recording stopping...",
            (OutputChannel::Recording, OutputState::Stopped) => "Start recording",
            (_, OutputState::Unknown) => "State unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub plugin_version: String,
    pub server_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SceneState {
    pub current_scene_name: String,
}

/// Result of the post-connect output status query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStatus {
    pub is_streaming: bool,
    pub is_recording: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StreamMetrics {
    pub total_time_seconds: u64,
    pub kbits_per_second: f64,
    pub bytes_per_second: f64,
    pub frames_per_second: f64,
    pub strain_fraction: f64,
    pub dropped_frames: u64,
    pub total_frames: u64,
}

impl StreamMetrics {
    /// Clamps non-finite or negative float fields to zero. Returns the first
    /// offending field so the caller can log it.
    pub fn sanitize(&mut self) -> Option<MalformedEventError> {
        let mut first = None;
        for (field, value) in [
            ("kbits_per_second", &mut self.kbits_per_second),
            ("bytes_per_second", &mut self.bytes_per_second),
            ("frames_per_second", &mut self.frames_per_second),
            ("strain_fraction", &mut self.strain_fraction),
        ] {
            if !value.is_finite() || *value < 0.0 {
                if first.is_none() {
                    first = Some(MalformedEventError::Metric {
                        field,
                        value: *value,
                    });
                }
                *value = 0.0;
            }
        }
        first
    }
}

/// Non-fatal: payload outside the expected shape or range.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedEventError {
    #[error("unrecognized output state {0:?}")]
    OutputState(String),
    #[error("metric {field} out of range: {value}")]
    Metric { field: &'static str, value: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_wire_output_tokens() {
        assert_eq!(OutputState::parse("Started").unwrap(), OutputState::Started);
        assert_eq!(
            OutputState::parse("OBS_WEBSOCKET_OUTPUT_STOPPING").unwrap(),
            OutputState::Stopping
        );
        assert_eq!(OutputState::parse(" starting ").unwrap(), OutputState::Starting);
        assert_eq!(OutputState::parse("STOPPED").unwrap(), OutputState::Stopped);
    }

    #[test]
    fn unrecognized_output_tokens_normalize_to_unknown() {
        for raw in ["Paused", "OBS_WEBSOCKET_OUTPUT_RECONNECTING", "", "Unknown", "42"] {
            assert!(OutputState::parse(raw).is_err());
            assert_eq!(OutputState::normalize(raw), OutputState::Unknown);
        }
    }

    #[test]
    fn connection_transitions_are_guarded() {
        use ConnectionState::*;
        assert_eq!(Disconnected.transition(Connecting), Ok(Connecting));
        assert_eq!(Connecting.transition(Connected), Ok(Connected));
        assert_eq!(Connecting.transition(AuthFailed), Ok(AuthFailed));
        assert_eq!(AuthFailed.transition(Disconnected), Ok(Disconnected));
        assert_eq!(Connected.transition(Disconnected), Ok(Disconnected));

        assert!(Disconnected.transition(Connected).is_err());
        assert!(Connected.transition(Connecting).is_err());
        assert!(Connecting.transition(Connecting).is_err());
        assert!(AuthFailed.transition(Connected).is_err());
    }

    #[test]
    fn captions_follow_output_cycle() {
        let s = OutputChannel::Streaming;
        let r = OutputChannel::Recording;
        assert_eq!(s.caption(Some(OutputState::Stopped)), "Start streaming");
        assert_eq!(s.caption(Some(OutputState::Started)), "Stop streaming");
        assert_eq!(r.caption(Some(OutputState::Starting)), "Recording starting...");
        assert_eq!(r.caption(Some(OutputState::Unknown)), "State unknown");
        assert_eq!(r.caption(None), "Offline");
    }

    #[test]
    fn sanitize_clamps_bad_metrics() {
        let mut m = StreamMetrics {
            kbits_per_second: f64::NAN,
            strain_fraction: -0.5,
            frames_per_second: 30.0,
            ..Default::default()
        };
        let err = m.sanitize().unwrap();
        assert!(matches!(err, MalformedEventError::Metric { field: "kbits_per_second", .. }));
        assert_eq!(m.kbits_per_second, 0.0);
        assert_eq!(m.strain_fraction, 0.0);
        assert_eq!(m.frames_per_second, 30.0);

        let mut ok = StreamMetrics {
            kbits_per_second: 1500.0,
            ..Default::default()
        };
        assert!(ok.sanitize().is_none());
    }
}
