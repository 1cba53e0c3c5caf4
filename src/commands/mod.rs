//! Session command queue
//!
//! Front ends (terminal, GUI, remote control) never touch the controller
//! directly. They send [`SessionCommand`]s through a [`SessionHandle`] and
//! get an [`ErrorResponse`] back on failure.

use crate::recorder::CommandOutcome;
use crate::utils::{ErrorResponse, SessionError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Commands accepted by the session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCommand {
    StartSession,
    StopSession,
    StartRecording,
    StopRecording,
    /// Stop any session, wait for pending writes, then exit the command loop
    Shutdown,
}

pub type CommandReply = Result<CommandOutcome, ErrorResponse>;

/// A queued command and where to send its result
#[derive(Debug)]
pub struct SessionRequest {
    pub command: SessionCommand,
    pub reply: Option<oneshot::Sender<CommandReply>>,
}

/// Cloneable sender side of the command queue
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
}

fn controller_gone() -> ErrorResponse {
    ErrorResponse::from(&SessionError::ControllerGone)
}

impl SessionHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a command and wait for its outcome
    pub async fn execute(&self, command: SessionCommand) -> CommandReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionRequest {
                command,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| controller_gone())?;
        reply_rx.await.map_err(|_| controller_gone())?
    }

    /// Queue a command without waiting for it to run
    pub async fn send(&self, command: SessionCommand) -> Result<(), ErrorResponse> {
        self.tx
            .send(SessionRequest {
                command,
                reply: None,
            })
            .await
            .map_err(|_| controller_gone())
    }

    pub async fn start_session(&self) -> CommandReply {
        self.execute(SessionCommand::StartSession).await
    }

    pub async fn stop_session(&self) -> CommandReply {
        self.execute(SessionCommand::StopSession).await
    }

    pub async fn start_recording(&self) -> CommandReply {
        self.execute(SessionCommand::StartRecording).await
    }

    pub async fn stop_recording(&self) -> CommandReply {
        self.execute(SessionCommand::StopRecording).await
    }

    pub async fn shutdown(&self) -> CommandReply {
        self.execute(SessionCommand::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_round_trips_through_queue() {
        let (handle, mut rx) = SessionHandle::channel(4);

        let responder = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.command, SessionCommand::StartRecording);
            request
                .reply
                .unwrap()
                .send(Ok(CommandOutcome::Applied))
                .unwrap();
        });

        assert_eq!(handle.start_recording().await, Ok(CommandOutcome::Applied));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_controller_reports_gone() {
        let (handle, rx) = SessionHandle::channel(1);
        drop(rx);
        let error = handle.start_session().await.unwrap_err();
        assert_eq!(error.code, "CONTROLLER_GONE");
        assert!(handle.send(SessionCommand::StopSession).await.is_err());
    }

    #[test]
    fn test_command_names() {
        let json = serde_json::to_string(&SessionCommand::StopRecording).unwrap();
        assert_eq!(json, "\"stop_recording\"");
    }
}
