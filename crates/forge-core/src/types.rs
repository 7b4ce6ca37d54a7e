//! Core types for the project execution and auto-correction engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Unique identifier for revisions and build runs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Lifecycle of a project's isolated environment.
///
/// Only the environment manager transitions this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentStatus {
    #[default]
    Absent,
    Creating,
    Ready,
    /// Metadata claims Ready but the on-disk indicator is gone.
    Stale,
    Failed,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "ABSENT",
            Self::Creating => "CREATING",
            Self::Ready => "READY",
            Self::Stale => "STALE",
            Self::Failed => "FAILED",
        }
    }
}

/// States of the correction loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    EnsuringEnvironment,
    Running,
    Classifying,
    RequestingFix,
    InstallingDependency,
    Succeeded,
    Exhausted,
    Cancelled,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::EnsuringEnvironment => "ensuring_environment",
            Self::Running => "running",
            Self::Classifying => "classifying",
            Self::RequestingFix => "requesting_fix",
            Self::InstallingDependency => "installing_dependency",
            Self::Succeeded => "succeeded",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states end the loop; no further transitions occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted | Self::Cancelled)
    }
}

// --- Core Types ---

/// Where a revision's source came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevisionOrigin {
    /// Generated from the user's initial request.
    Prompt { prompt: String },
    /// Model correction for a failed run.
    Fix { diagnosis: String },
    /// Written directly (seed script, manual edit).
    Manual,
}

/// One generated or corrected version of a project's source.
///
/// Revisions are append-only; `accepted` flips to true on the revision
/// whose run exited 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub id: Id,
    /// Full source snapshot of the entry script.
    pub source: String,
    /// SHA-256 of `source`, hex-encoded.
    pub checksum: String,
    pub origin: RevisionOrigin,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
}

impl Revision {
    pub fn new(source: impl Into<String>, origin: RevisionOrigin) -> Self {
        let source = source.into();
        let checksum = source_checksum(&source);
        Self {
            id: Id::new(),
            source,
            checksum,
            origin,
            accepted: false,
            created_at: Utc::now(),
        }
    }
}

/// Hex-encoded SHA-256 of a source snapshot.
pub fn source_checksum(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    digest.iter().fold(String::with_capacity(64), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Outcome of one process runner invocation. Transient: consumed by the
/// classifier, then discarded except for the excerpt copied into history.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Exit code; -1 for abnormal termination without a code.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl RunOutcome {
    /// Exit code 0 is the sole success signal.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }

    /// The text the classifier matches against: stderr, falling back to
    /// stdout, falling back to a synthetic exit-code line.
    pub fn failure_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("script failed with exit code {}", self.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn environment_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&EnvironmentStatus::Ready).unwrap(),
            "\"READY\""
        );
        assert_eq!(
            serde_json::to_string(&EnvironmentStatus::Absent).unwrap(),
            "\"ABSENT\""
        );
    }

    #[test]
    fn loop_state_terminality() {
        assert!(LoopState::Succeeded.is_terminal());
        assert!(LoopState::Exhausted.is_terminal());
        assert!(LoopState::Cancelled.is_terminal());
        assert!(!LoopState::Running.is_terminal());
        assert!(!LoopState::RequestingFix.is_terminal());
    }

    #[test]
    fn revision_checksum_matches_source() {
        let rev = Revision::new("print('hi')\n", RevisionOrigin::Manual);
        assert_eq!(rev.checksum, source_checksum("print('hi')\n"));
        assert!(!rev.accepted);
    }

    #[test]
    fn source_checksum_is_stable_hex() {
        let sum = source_checksum("abc");
        assert_eq!(sum.len(), 64);
        assert_eq!(
            sum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn run_outcome_success_requires_zero_exit() {
        let ok = RunOutcome {
            exit_code: 0,
            ..Default::default()
        };
        assert!(ok.is_success());

        let failed = RunOutcome {
            exit_code: 1,
            ..Default::default()
        };
        assert!(!failed.is_success());

        let timed_out = RunOutcome {
            exit_code: 0,
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.is_success());
    }

    #[test]
    fn failure_text_prefers_stderr() {
        let outcome = RunOutcome {
            exit_code: 1,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            ..Default::default()
        };
        assert_eq!(outcome.failure_text(), "err");

        let stdout_only = RunOutcome {
            exit_code: 1,
            stdout: "out".to_string(),
            ..Default::default()
        };
        assert_eq!(stdout_only.failure_text(), "out");

        let silent = RunOutcome {
            exit_code: 3,
            ..Default::default()
        };
        assert_eq!(silent.failure_text(), "script failed with exit code 3");
    }
}
