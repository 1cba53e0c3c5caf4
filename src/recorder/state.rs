//! Session state management
//!
//! Defines the session state machine, the status snapshot published for
//! display, and the events broadcast on lifecycle changes and faults.

use crate::utils::{ErrorResponse, InvalidTransition};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::watch;
use uuid::Uuid;

/// Current state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SessionState {
    /// No loops running
    Idle,
    /// Mirroring and sampling, not recording
    TeleopActive,
    /// Mirroring and sampling into the armed episode
    Recording { episode_num: u64 },
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }

    pub fn recording_episode(&self) -> Option<u64> {
        match self {
            SessionState::Recording { episode_num } => Some(*episode_num),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::TeleopActive => write!(f, "teleop active"),
            SessionState::Recording { episode_num } => write!(f, "recording episode {episode_num}"),
        }
    }
}

/// Result of a controller command that did not fail outright
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CommandOutcome {
    Applied,
    /// The command was not valid in the current state and changed nothing
    Ignored(InvalidTransition),
}

impl CommandOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CommandOutcome::Applied)
    }
}

/// Fault flags shown to the operator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultFlags {
    /// Leader input held past the staleness bound
    pub leader_stale: bool,
    pub leader_fault: Option<String>,
    pub follower_fault: Option<String>,
    pub camera_faults: [Option<String>; 2],
}

impl FaultFlags {
    pub fn any(&self) -> bool {
        self.leader_stale
            || self.leader_fault.is_some()
            || self.follower_fault.is_some()
            || self.camera_faults.iter().any(Option::is_some)
    }
}

/// How an episode hand-off ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum WriteOutcome {
    Saved {
        episode_num: u64,
        frame_count: u64,
        path: PathBuf,
    },
    Failed {
        episode_num: u64,
        error: ErrorResponse,
        temp_path: Option<PathBuf>,
    },
    /// Nothing was recorded, so no file was written
    Skipped { episode_num: u64 },
}

/// Snapshot of the whole session for display
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub teleop_ticks: u64,
    /// Frames the sampler emitted this session
    pub frames_emitted: u64,
    /// Frames pushed into the armed episode
    pub frames_recorded: u64,
    pub overruns: u64,
    pub faults: FaultFlags,
    pub pending_writes: usize,
    pub last_write: Option<WriteOutcome>,
}

/// Events broadcast by the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionStarted { session_id: Uuid },
    SessionStopped { session_id: Uuid },
    RecordingStarted { episode_num: u64 },
    RecordingStopped { episode_num: u64, frame_count: u64 },
    EpisodeSaved { episode_num: u64, path: PathBuf },
    EpisodeSkipped { episode_num: u64 },
    WriteFailed { episode_num: u64, error: ErrorResponse, temp_path: Option<PathBuf> },
    /// A command was ignored in the current state
    Warning(InvalidTransition),
    /// A source or loop fault was raised
    Fault(ErrorResponse),
    /// A previously raised condition went away
    Recovered(String),
}

/// Shared owner of the status watch channel.
///
/// Every loop updates its own fields in place; subscribers see the merged snapshot.
#[derive(Debug)]
pub struct StatusBoard {
    tx: watch::Sender<SessionStatus>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionStatus::default());
        Self { tx }
    }

    pub fn update(&self, modify: impl FnOnce(&mut SessionStatus)) {
        self.tx.send_modify(modify);
    }

    pub fn snapshot(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_queries() {
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::TeleopActive.is_active());
        let recording = SessionState::Recording { episode_num: 7 };
        assert_eq!(recording.recording_episode(), Some(7));
        assert_eq!(recording.to_string(), "recording episode 7");
    }

    #[test]
    fn test_board_publishes_updates() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();

        board.update(|status| {
            status.frames_emitted = 12;
            status.faults.camera_faults[1] = Some("unplugged".to_string());
        });

        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.frames_emitted, 12);
        assert!(seen.faults.any());
        assert_eq!(board.snapshot(), seen);
    }

    #[test]
    fn test_status_serializes_state_tag() {
        let status = SessionStatus {
            state: SessionState::Recording { episode_num: 3 },
            ..SessionStatus::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"]["state"], "recording");
        assert_eq!(json["state"]["episode_num"], 3);
    }
}
