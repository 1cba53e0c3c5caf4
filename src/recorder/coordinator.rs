//! Session controller
//!
//! Owns the lifecycle of the teleop loop, the sampler and the armed episode
//! buffer, and hands finished episodes to the writer in the background.

use super::buffer::EpisodeBuffer;
use super::config::SessionConfig;
use super::sampler::{ArmedBuffer, SamplerLinks, SyncSampler};
use super::slot::LatestSlot;
use super::state::{
    CommandOutcome, SessionEvent, SessionState, SessionStatus, StatusBoard, WriteOutcome,
};
use super::teleop::TeleopLoop;
use crate::capture::{CameraSource, FollowerArm, JointSource};
use crate::commands::{SessionCommand, SessionHandle, SessionRequest};
use crate::episode::{list_episodes, Episode, EpisodeNumbering, EpisodeWriter};
use crate::utils::{ErrorResponse, InvalidTransition, SessionError, SessionResult, SharedClock};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

/// The devices a session runs against
pub struct SessionHardware {
    pub leader: Box<dyn JointSource>,
    pub follower: Box<dyn FollowerArm>,
    pub cameras: [Arc<dyn CameraSource>; 2],
}

struct ActiveSession {
    session_id: Uuid,
    running: Arc<AtomicBool>,
    teleop: JoinHandle<TeleopLoop>,
    sampler: JoinHandle<SyncSampler>,
    armed: ArmedBuffer,
}

/// Top-level session state machine
pub struct SessionController {
    config: SessionConfig,
    clock: SharedClock,

    /// Arm sources while no session is running; the teleop loop owns them otherwise
    arms: Option<(Box<dyn JointSource>, Box<dyn FollowerArm>)>,
    cameras: [Arc<dyn CameraSource>; 2],

    numbering: EpisodeNumbering,
    writer: EpisodeWriter,

    state: SessionState,
    active: Option<ActiveSession>,

    /// Episode writes still in flight
    writes: Vec<tokio::task::JoinHandle<()>>,

    board: Arc<StatusBoard>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Validate the configuration and scan the output directory for used episode numbers
    pub fn new(
        config: SessionConfig,
        hardware: SessionHardware,
        clock: SharedClock,
    ) -> SessionResult<Self> {
        config.validate()?;
        let numbering = EpisodeNumbering::scan(&config.output_dir)?;
        let writer = EpisodeWriter::new(numbering.dir());
        let (event_tx, _) = broadcast::channel(256);

        tracing::info!(
            "Session controller ready; episodes go to {:?}, next is {}",
            numbering.dir(),
            numbering.peek()
        );

        Ok(Self {
            config,
            clock,
            arms: Some((hardware.leader, hardware.follower)),
            cameras: hardware.cameras,
            numbering,
            writer,
            state: SessionState::Idle,
            active: None,
            writes: Vec::new(),
            board: Arc::new(StatusBoard::new()),
            event_tx,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> SessionStatus {
        self.board.snapshot()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.board.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Finalized episodes in the output directory
    pub fn episodes(&self) -> std::io::Result<Vec<(u64, PathBuf)>> {
        list_episodes(self.numbering.dir())
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.board.update(|status| status.state = state);
    }

    fn ignore(&self, command: &str) -> CommandOutcome {
        let transition = InvalidTransition {
            command: command.to_string(),
            state: self.state.to_string(),
        };
        tracing::warn!("Ignoring command: {}", transition);
        let _ = self.event_tx.send(SessionEvent::Warning(transition.clone()));
        CommandOutcome::Ignored(transition)
    }

    /// Start mirroring and sampling
    pub async fn start_session(&mut self) -> SessionResult<CommandOutcome> {
        if self.state.is_active() {
            return Ok(self.ignore("start_session"));
        }
        let (leader, follower) = self
            .arms
            .take()
            .ok_or_else(|| SessionError::Worker("arm sources were lost".to_string()))?;

        let session_id = Uuid::new_v4();
        tracing::info!("Starting session {}", session_id);

        self.board.update(|status| {
            *status = SessionStatus {
                session_id: Some(session_id),
                pending_writes: status.pending_writes,
                last_write: status.last_write.take(),
                ..SessionStatus::default()
            };
        });

        for camera in &self.cameras {
            if let Err(fault) = camera.start() {
                // The sampler flags the stream; the session still runs
                tracing::error!("Could not start {}: {}", camera.camera(), fault);
                let error = ErrorResponse::from(&SessionError::Source(fault));
                let _ = self.event_tx.send(SessionEvent::Fault(error));
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let links = SamplerLinks {
            arms: Arc::new(LatestSlot::new()),
            armed: Arc::new(Mutex::new(None)),
            board: self.board.clone(),
            events: self.event_tx.clone(),
        };

        let teleop = TeleopLoop::new(
            leader,
            follower,
            self.config.teleop.clone(),
            links.arms.clone(),
            self.board.clone(),
            self.event_tx.clone(),
        )
        .spawn(self.clock.clone(), running.clone())?;

        let sampler = SyncSampler::new(
            self.config.sampler.clone(),
            self.clock.clone(),
            self.cameras.clone(),
            [
                (self.config.cameras[0].width, self.config.cameras[0].height),
                (self.config.cameras[1].width, self.config.cameras[1].height),
            ],
            links.clone(),
        );
        let sampler = match sampler.spawn(running.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                if let Ok(teleop) = teleop.join() {
                    self.arms = Some(teleop.into_arms());
                }
                for camera in &self.cameras {
                    camera.stop();
                }
                return Err(e.into());
            }
        };

        self.active = Some(ActiveSession {
            session_id,
            running,
            teleop,
            sampler,
            armed: links.armed,
        });
        self.set_state(SessionState::TeleopActive);
        let _ = self.event_tx.send(SessionEvent::SessionStarted { session_id });
        Ok(CommandOutcome::Applied)
    }

    /// Arm a fresh episode buffer under the next episode number
    pub async fn start_recording(&mut self) -> SessionResult<CommandOutcome> {
        let (session_id, armed) = match (&self.active, self.state) {
            (Some(active), SessionState::TeleopActive) => (active.session_id, active.armed.clone()),
            _ => return Ok(self.ignore("start_recording")),
        };

        let episode_num = self.numbering.allocate()?;
        let buffer = EpisodeBuffer::new(
            episode_num,
            session_id,
            self.config.sampler.fps,
            self.config.position_unit,
        );
        *armed.lock() = Some(buffer);

        self.board.update(|status| status.frames_recorded = 0);
        self.set_state(SessionState::Recording { episode_num });
        tracing::info!("Recording episode {}", episode_num);
        let _ = self.event_tx.send(SessionEvent::RecordingStarted { episode_num });
        Ok(CommandOutcome::Applied)
    }

    /// Disarm the buffer, finalize it and write it in the background.
    ///
    /// Returns once the episode is finalized; the write outcome arrives as an
    /// event and in the status.
    pub async fn stop_recording(&mut self) -> SessionResult<CommandOutcome> {
        let Some(episode_num) = self.state.recording_episode() else {
            return Ok(self.ignore("stop_recording"));
        };

        let buffer = self
            .active
            .as_ref()
            .and_then(|active| active.armed.lock().take());
        self.set_state(SessionState::TeleopActive);

        let buffer = buffer.ok_or_else(|| {
            SessionError::Worker(format!("episode {episode_num} buffer was not armed"))
        })?;
        let frame_count = buffer.len() as u64;
        tracing::info!("Stopped recording episode {} ({} frames)", episode_num, frame_count);
        let _ = self.event_tx.send(SessionEvent::RecordingStopped {
            episode_num,
            frame_count,
        });

        if buffer.is_empty() {
            tracing::warn!("Episode {} has no frames; nothing saved", episode_num);
            let _ = self.event_tx.send(SessionEvent::EpisodeSkipped { episode_num });
            self.board.update(|status| {
                status.last_write = Some(WriteOutcome::Skipped { episode_num });
            });
            return Ok(CommandOutcome::Applied);
        }

        let episode = buffer
            .finalize()
            .map_err(|e| SessionError::Worker(format!("cannot finalize episode: {e}")))?;
        self.spawn_write(episode);
        Ok(CommandOutcome::Applied)
    }

    fn spawn_write(&mut self, episode: Episode) {
        let writer = self.writer.clone();
        let board = self.board.clone();
        let events = self.event_tx.clone();

        board.update(|status| status.pending_writes += 1);

        let handle = tokio::task::spawn_blocking(move || {
            let episode_num = episode.episode_num();
            let frame_count = episode.frame_count() as u64;

            let outcome = match writer.write(episode) {
                Ok(path) => {
                    let _ = events.send(SessionEvent::EpisodeSaved {
                        episode_num,
                        path: path.clone(),
                    });
                    WriteOutcome::Saved {
                        episode_num,
                        frame_count,
                        path,
                    }
                }
                Err(fault) => {
                    let error = ErrorResponse::from(&fault);
                    let _ = events.send(SessionEvent::WriteFailed {
                        episode_num,
                        error: error.clone(),
                        temp_path: fault.temp_path.clone(),
                    });
                    WriteOutcome::Failed {
                        episode_num,
                        error,
                        temp_path: fault.temp_path,
                    }
                }
            };

            board.update(|status| {
                status.pending_writes = status.pending_writes.saturating_sub(1);
                status.last_write = Some(outcome);
            });
        });

        self.writes.retain(|write| !write.is_finished());
        self.writes.push(handle);
    }

    /// Wait for every in-flight episode write to finish
    pub async fn flush_writes(&mut self) -> SessionResult<()> {
        for write in std::mem::take(&mut self.writes) {
            write
                .await
                .map_err(|e| SessionError::Worker(format!("episode write task failed: {e}")))?;
        }
        Ok(())
    }

    /// Stop recording if needed, then stop the loops and cameras.
    /// In-flight writes are left to finish on their own.
    pub async fn stop_session(&mut self) -> SessionResult<CommandOutcome> {
        if !self.state.is_active() {
            return Ok(self.ignore("stop_session"));
        }
        if self.state.recording_episode().is_some() {
            self.stop_recording().await?;
        }

        let Some(active) = self.active.take() else {
            self.set_state(SessionState::Idle);
            return Ok(CommandOutcome::Applied);
        };
        let session_id = active.session_id;
        tracing::info!("Stopping session {}", session_id);

        active.running.store(false, Ordering::SeqCst);
        let cameras = self.cameras.clone();
        let (teleop, sampler) = tokio::task::spawn_blocking(move || {
            let teleop = active.teleop.join();
            let sampler = active.sampler.join();
            for camera in &cameras {
                camera.stop();
            }
            (teleop, sampler)
        })
        .await
        .map_err(|e| SessionError::Worker(format!("session teardown failed: {e}")))?;

        self.set_state(SessionState::Idle);
        let _ = self.event_tx.send(SessionEvent::SessionStopped { session_id });

        if let Ok(sampler) = &sampler {
            tracing::info!(
                "Session {} stopped: {} frames emitted, {} overruns",
                session_id,
                sampler.emitted(),
                sampler.overruns()
            );
        } else {
            tracing::error!("Sampler thread panicked");
        }

        match teleop {
            Ok(teleop) => {
                self.arms = Some(teleop.into_arms());
                Ok(CommandOutcome::Applied)
            }
            Err(_) => Err(SessionError::Worker(
                "teleop thread panicked; arm sources were lost".to_string(),
            )),
        }
    }

    pub async fn execute(&mut self, command: SessionCommand) -> SessionResult<CommandOutcome> {
        match command {
            SessionCommand::StartSession => self.start_session().await,
            SessionCommand::StopSession => self.stop_session().await,
            SessionCommand::StartRecording => self.start_recording().await,
            SessionCommand::StopRecording => self.stop_recording().await,
            SessionCommand::Shutdown => {
                if self.state.is_active() {
                    self.stop_session().await?;
                }
                self.flush_writes().await?;
                Ok(CommandOutcome::Applied)
            }
        }
    }

    /// Consume commands until `Shutdown` or until every handle is dropped
    pub async fn run(mut self, mut rx: mpsc::Receiver<SessionRequest>) {
        while let Some(request) = rx.recv().await {
            let shutdown = request.command == SessionCommand::Shutdown;
            let result = self.execute(request.command).await;
            if let Err(e) = &result {
                tracing::error!("Command {:?} failed: {}", request.command, e);
            }
            if let Some(reply) = request.reply {
                let _ = reply.send(result.map_err(|e| ErrorResponse::from(&e)));
            }
            if shutdown {
                break;
            }
        }

        if self.state.is_active() {
            if let Err(e) = self.stop_session().await {
                tracing::error!("Failed to stop session on exit: {}", e);
            }
        }
        if let Err(e) = self.flush_writes().await {
            tracing::error!("Failed to flush episode writes: {}", e);
        }
        tracing::info!("Session controller stopped");
    }

    /// Run the controller on the tokio runtime and return a handle to command it
    pub fn spawn(self) -> (SessionHandle, tokio::task::JoinHandle<()>) {
        let (handle, rx) = SessionHandle::channel(32);
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.running.store(false, Ordering::SeqCst);
        }
    }
}
