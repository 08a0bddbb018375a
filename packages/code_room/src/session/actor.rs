use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use run_sandbox::OutputStream;

use super::document::Document;
use super::hub::{Hub, Participant, ParticipantId};
use super::registry::SessionMap;
use super::runner::{self, RunOrchestrator, RunOutcome, RunStatus, RunUpdate};
use crate::config::{RoomConfig, RunConfig};
use crate::error::SessionError;
use crate::metrics::ServerMetrics;
use crate::ws::protocol::{Edit, InitSnapshot, RunRequest, ServerFrame};

/// A freshly created session waits at least this long for its first join
const FIRST_JOIN_WINDOW: Duration = Duration::from_secs(1);

/// Longest accepted language id
const MAX_LANGUAGE_LEN: usize = 32;

/// Commands that can be sent to a session actor
#[derive(Debug)]
pub enum SessionCommand {
    Join {
        participant: Participant,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Leave {
        participant: ParticipantId,
    },
    Edit {
        participant: ParticipantId,
        edit: Edit,
    },
    SetLanguage {
        participant: ParticipantId,
        language: String,
    },
    Run {
        participant: ParticipantId,
        request: RunRequest,
    },
    /// Cursor or chat frame for everyone but the sender
    Relay {
        participant: ParticipantId,
        frame: ServerFrame,
    },
    /// Progress of a run, fed back by the task driving it
    RunUpdate {
        run_id: Uuid,
        update: RunUpdate,
    },
    GetInfo {
        respond_to: oneshot::Sender<SessionInfo>,
    },
}

/// Summary of a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub room_id: String,
    pub language: String,
    pub version: u64,
    pub participants: usize,
    pub running: bool,
    pub created_at: String,
}

/// Why a join did not go through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    Rejected(SessionError),
    /// The session shut down before it handled the join
    Closed,
}

/// Handle to communicate with a session actor
#[derive(Clone, Debug)]
pub struct SessionHandle {
    room_id: Arc<str>,
    instance_id: Uuid,
    sender: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Distinguishes this session from earlier or later ones for the same room
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Ask to be admitted. On success the `init` frame is already queued on
    /// the participant's channel.
    pub async fn join(&self, participant: Participant) -> Result<(), JoinError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Join {
                participant,
                respond_to: tx,
            })
            .await
            .map_err(|_| JoinError::Closed)?;
        rx.await
            .map_err(|_| JoinError::Closed)?
            .map_err(JoinError::Rejected)
    }

    pub async fn leave(&self, participant: ParticipantId) -> Result<(), SessionError> {
        self.send(SessionCommand::Leave { participant }).await
    }

    pub async fn edit(&self, participant: ParticipantId, edit: Edit) -> Result<(), SessionError> {
        self.send(SessionCommand::Edit { participant, edit }).await
    }

    pub async fn set_language(
        &self,
        participant: ParticipantId,
        language: String,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::SetLanguage {
            participant,
            language,
        })
        .await
    }

    pub async fn run(
        &self,
        participant: ParticipantId,
        request: RunRequest,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::Run {
            participant,
            request,
        })
        .await
    }

    pub async fn relay(
        &self,
        participant: ParticipantId,
        frame: ServerFrame,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::Relay { participant, frame }).await
    }

    pub async fn get_info(&self) -> Option<SessionInfo> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::GetInfo { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SessionError::Internal("session actor is gone".to_string()))
    }
}

/// Options for spawning a new session actor
pub struct SpawnOptions {
    pub room_id: String,
    pub language: String,
    pub room_config: Arc<RoomConfig>,
    pub run_config: Arc<RunConfig>,
    pub metrics: Arc<ServerMetrics>,
    /// The registry map the session removes itself from when disposed
    pub sessions: SessionMap,
}

/// The actor that owns one room: its document, participants and run
struct SessionActor {
    room_id: Arc<str>,
    instance_id: Uuid,
    language: String,
    created_at: String,
    document: Document,
    hub: Hub,
    runner: RunOrchestrator,
    config: Arc<RoomConfig>,
    metrics: Arc<ServerMetrics>,
    sessions: SessionMap,
    receiver: mpsc::Receiver<SessionCommand>,
    /// Given to run drivers so their events re-enter the queue
    commands: mpsc::WeakSender<SessionCommand>,
    /// Set while the room has nobody in it
    empty_deadline: Option<Instant>,
}

/// Spawn a new session actor and return its handle
pub fn spawn_session(opts: SpawnOptions) -> SessionHandle {
    let instance_id = Uuid::new_v4();
    let room_id: Arc<str> = Arc::from(opts.room_id);
    let (sender, receiver) = mpsc::channel(opts.room_config.command_queue_capacity);

    let first_join_wait = opts.room_config.grace_period.max(FIRST_JOIN_WINDOW);
    let actor = SessionActor {
        room_id: room_id.clone(),
        instance_id,
        language: opts.language,
        created_at: chrono::Utc::now().to_rfc3339(),
        document: Document::new(opts.room_config.max_document_bytes),
        hub: Hub::new(),
        runner: RunOrchestrator::new(opts.run_config),
        config: opts.room_config,
        metrics: opts.metrics,
        sessions: opts.sessions,
        receiver,
        commands: sender.downgrade(),
        empty_deadline: Some(Instant::now() + first_join_wait),
    };

    actor.metrics.session_created();
    tokio::spawn(actor.run());

    SessionHandle {
        room_id,
        instance_id,
        sender,
    }
}

impl SessionActor {
    async fn run(mut self) {
        info!(room = %self.room_id, language = %self.language, "Session started");

        loop {
            let deadline = self.empty_deadline;
            tokio::select! {
                biased;

                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debug!(room = %self.room_id, "Grace period elapsed with nobody in the room");
                    break;
                }
            }
            self.update_grace();
        }

        self.dispose().await;
    }

    fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join {
                participant,
                respond_to,
            } => {
                let result = self.handle_join(participant);
                let _ = respond_to.send(result);
            }

            SessionCommand::Leave { participant } => {
                if self.hub.remove(participant) {
                    info!(room = %self.room_id, %participant, remaining = self.hub.len(), "Participant left");
                }
            }

            SessionCommand::Edit { participant, edit } => self.handle_edit(participant, edit),

            SessionCommand::SetLanguage {
                participant,
                language,
            } => self.handle_language(participant, language),

            SessionCommand::Run {
                participant,
                request,
            } => self.handle_run(participant, request),

            SessionCommand::Relay { participant, frame } => {
                if self.hub.contains(participant) {
                    let dropped = self.hub.broadcast_except(participant, &frame);
                    self.metrics.slow_consumers(dropped);
                }
            }

            SessionCommand::RunUpdate { run_id, update } => self.handle_run_update(run_id, update),

            SessionCommand::GetInfo { respond_to } => {
                let _ = respond_to.send(self.info());
            }
        }
    }

    fn handle_join(&mut self, participant: Participant) -> Result<(), SessionError> {
        if self.hub.contains(participant.id) {
            return Err(SessionError::AlreadyJoined);
        }
        if self.hub.len() >= self.config.capacity {
            self.metrics.join_rejected();
            info!(room = %self.room_id, participant = %participant.id, "Room full, join refused");
            return Err(SessionError::RoomFull);
        }

        let init = ServerFrame::Init(InitSnapshot {
            session_id: self.room_id.to_string(),
            doc: self.document.snapshot(),
            language: self.language.clone(),
        });
        participant
            .try_deliver(init)
            .map_err(|_| SessionError::Internal("participant queue unavailable".to_string()))?;

        info!(
            room = %self.room_id,
            participant = %participant.id,
            version = self.document.version(),
            "Participant joined"
        );
        self.hub.add(participant);
        Ok(())
    }

    fn handle_edit(&mut self, participant: ParticipantId, edit: Edit) {
        if !self.hub.contains(participant) {
            debug!(room = %self.room_id, %participant, "Ignoring edit from non-member");
            return;
        }

        match self.document.try_apply(&edit) {
            Ok(snapshot) => {
                self.metrics.edit_accepted();
                debug!(room = %self.room_id, %participant, version = snapshot.version, "Edit applied");
                self.broadcast(&ServerFrame::Doc(snapshot));
            }
            Err(err @ SessionError::VersionMismatch { .. }) => {
                self.metrics.edit_rejected();
                debug!(room = %self.room_id, %participant, "{}", err);
                let resync = ServerFrame::Doc(self.document.snapshot());
                self.reply(participant, &ServerFrame::error(&err));
                self.reply(participant, &resync);
            }
            Err(err) => {
                self.metrics.edit_rejected();
                debug!(room = %self.room_id, %participant, "Edit refused: {}", err);
                self.reply(participant, &ServerFrame::error(&err));
            }
        }
    }

    fn handle_language(&mut self, participant: ParticipantId, language: String) {
        if !self.hub.contains(participant) {
            return;
        }
        if !is_valid_language(&language) {
            let err = SessionError::InvalidRequest(format!("bad language id {language:?}"));
            self.reply(participant, &ServerFrame::error(&err));
            return;
        }

        info!(room = %self.room_id, %participant, %language, "Language changed");
        self.language = language.clone();
        self.broadcast(&ServerFrame::Language(language));
    }

    fn handle_run(&mut self, participant: ParticipantId, request: RunRequest) {
        if !self.hub.contains(participant) {
            return;
        }

        let job = match self.runner.submit(&request.language, &request.code) {
            Ok(job) => job,
            Err(err) => {
                debug!(room = %self.room_id, %participant, "Run refused: {}", err);
                self.reply(participant, &ServerFrame::error(&err));
                return;
            }
        };

        let Some(commands) = self.commands.upgrade() else {
            let outcome = RunOutcome::Failed("session is shutting down".to_string());
            self.runner.finish(job.id, &outcome);
            return;
        };

        self.metrics.run_started();
        info!(
            room = %self.room_id,
            run_id = %job.id,
            language = %job.language,
            "Run started"
        );
        let spec = self.runner.job_spec(&job);
        tokio::spawn(runner::drive(
            job.id,
            spec,
            job.deadline,
            job.cancellation_token(),
            commands,
        ));
    }

    fn handle_run_update(&mut self, run_id: Uuid, update: RunUpdate) {
        if !self.runner.is_current(run_id) {
            debug!(room = %self.room_id, %run_id, "Dropping update from a stale run");
            return;
        }

        match update {
            RunUpdate::Output { stream, chunk } => {
                let frame = match stream {
                    OutputStream::Stdout => ServerFrame::Stdout(chunk),
                    OutputStream::Stderr => ServerFrame::Stderr(chunk),
                };
                self.broadcast(&frame);
            }
            RunUpdate::Finished(outcome) => {
                let status = self.runner.finish(run_id, &outcome);
                match outcome {
                    RunOutcome::Exited(report) => {
                        if status == Some(RunStatus::TimedOut) {
                            self.metrics.run_timed_out();
                        } else {
                            self.metrics.run_completed();
                        }
                        info!(
                            room = %self.room_id,
                            %run_id,
                            code = report.code,
                            timed_out = report.timed_out,
                            "Run finished"
                        );
                        self.broadcast(&ServerFrame::Exit(report));
                    }
                    RunOutcome::Failed(reason) => {
                        self.metrics.run_errored();
                        warn!(room = %self.room_id, %run_id, "Run failed: {}", reason);
                        self.broadcast(&ServerFrame::error(&SessionError::Internal(reason)));
                    }
                }
            }
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            room_id: self.room_id.to_string(),
            language: self.language.clone(),
            version: self.document.version(),
            participants: self.hub.len(),
            running: self.runner.active().is_some(),
            created_at: self.created_at.clone(),
        }
    }

    fn broadcast(&mut self, frame: &ServerFrame) {
        let dropped = self.hub.broadcast(frame);
        self.metrics.slow_consumers(dropped);
    }

    fn reply(&mut self, participant: ParticipantId, frame: &ServerFrame) {
        let dropped = self.hub.send_to(participant, frame);
        self.metrics.slow_consumers(dropped);
    }

    /// Arm the disposal timer when the room empties, disarm it on join
    fn update_grace(&mut self) {
        match (self.hub.is_empty(), self.empty_deadline) {
            (true, None) => {
                debug!(room = %self.room_id, grace = ?self.config.grace_period, "Room is empty");
                self.empty_deadline = Some(Instant::now() + self.config.grace_period);
            }
            (false, Some(_)) => self.empty_deadline = None,
            _ => {}
        }
    }

    async fn dispose(mut self) {
        {
            let mut sessions = self.sessions.write().await;
            let still_ours = sessions
                .get(&*self.room_id)
                .is_some_and(|handle| handle.instance_id() == self.instance_id);
            if still_ours {
                sessions.remove(&*self.room_id);
            }
        }

        // Joins that raced with disposal see JoinError::Closed and retry
        // against a fresh session.
        self.receiver.close();
        while let Some(cmd) = self.receiver.recv().await {
            if let SessionCommand::Join { participant, .. } = cmd {
                debug!(room = %self.room_id, participant = %participant.id, "Turning away late join");
            }
        }

        if let Some(job) = self.runner.abort() {
            info!(room = %self.room_id, run_id = %job.id, "Cancelled run of disposed session");
        }

        self.metrics.session_disposed();
        info!(room = %self.room_id, "Session disposed");
    }
}

/// Language ids are short tokens such as `python`, `cpp` or `c#`
pub fn is_valid_language(language: &str) -> bool {
    !language.is_empty()
        && language.len() <= MAX_LANGUAGE_LEN
        && language
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '#' | '-' | '_' | '.'))
}
