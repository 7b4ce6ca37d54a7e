//! Notification events published by the correction loop.
//!
//! The controller and the presentation layer communicate exclusively over
//! an asynchronous channel of these events; the loop never waits on a
//! consumer to make progress.

use crate::diagnose::DiagnosisCategory;
use crate::types::{Id, LoopState};
use serde::{Deserialize, Serialize};

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    /// Engine status messages.
    Status,
    /// Child process stdout, line by line as produced.
    Stdout,
    /// Child process stderr, line by line as produced.
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Payload for a state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedPayload {
    pub project: String,
    pub from: LoopState,
    pub to: LoopState,
    /// Re-entries into Running so far for this build.
    pub attempt: u32,
}

/// Payload for a live log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLinePayload {
    pub project: String,
    pub stream: LogStream,
    pub line: String,
}

/// Payload emitted when a script run finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    pub project: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Payload emitted when a new revision lands in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionAppendedPayload {
    pub project: String,
    pub revision_id: Id,
}

/// Payload emitted when a fix request goes to the model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRequestedPayload {
    pub project: String,
    pub category: DiagnosisCategory,
    pub detail: String,
}

/// Payload emitted when a dependency install completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallFinishedPayload {
    pub project: String,
    pub packages: Vec<String>,
    pub success: bool,
}

/// Payload emitted once per build when the loop reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildFinishedPayload {
    pub project: String,
    pub state: LoopState,
    pub attempts: u32,
}

/// Union type for all loop events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    StateChanged(StateChangedPayload),
    LogLine(LogLinePayload),
    RunFinished(RunFinishedPayload),
    RevisionAppended(RevisionAppendedPayload),
    FixRequested(FixRequestedPayload),
    InstallFinished(InstallFinishedPayload),
    BuildFinished(BuildFinishedPayload),
}

impl LoopEvent {
    /// Convenience constructor for status log lines.
    pub fn status(project: impl Into<String>, line: impl Into<String>) -> Self {
        Self::LogLine(LogLinePayload {
            project: project.into(),
            stream: LogStream::Status,
            line: line.into(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_changed_serializes_with_tag() {
        let event = LoopEvent::StateChanged(StateChangedPayload {
            project: "demo".to_string(),
            from: LoopState::Running,
            to: LoopState::Classifying,
            attempt: 1,
        });
        let json = event.to_json().unwrap();
        assert!(json.contains("\"event\":\"state_changed\""));
        assert!(json.contains("\"to\":\"classifying\""));
    }

    #[test]
    fn status_constructor_uses_status_stream() {
        let event = LoopEvent::status("demo", "creating environment");
        match event {
            LoopEvent::LogLine(payload) => {
                assert_eq!(payload.stream, LogStream::Status);
                assert_eq!(payload.line, "creating environment");
            }
            other => panic!("expected LogLine, got {other:?}"),
        }
    }

    #[test]
    fn log_stream_as_str() {
        assert_eq!(LogStream::Status.as_str(), "status");
        assert_eq!(LogStream::Stdout.as_str(), "stdout");
        assert_eq!(LogStream::Stderr.as_str(), "stderr");
    }
}
