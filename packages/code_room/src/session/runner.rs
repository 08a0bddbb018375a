//! Run orchestration for one session.
//!
//! [`RunOrchestrator`] is the per-session state machine (idle or running one
//! job). [`drive`] owns the sandboxed process and feeds its events back into
//! the session's command queue, tagged with the run id so that events from a
//! run the session no longer tracks are dropped there.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use run_sandbox::{JobEvent, JobSpec, OutputStream, TIMED_OUT_EXIT_CODE, Toolchain};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::actor::SessionCommand;
use crate::config::RunConfig;
use crate::error::SessionError;
use crate::ws::protocol::ExitReport;

/// How long past its deadline a job may go silent before the session stops
/// waiting for the sandbox and reports the timeout itself.
const DEADLINE_SLACK: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    TimedOut,
    Errored,
}

#[derive(Debug, Clone)]
pub struct RunJob {
    pub id: Uuid,
    pub language: String,
    pub code: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub deadline: Instant,
    toolchain: Toolchain,
    cancel: CancellationToken,
}

impl RunJob {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Something a running job reports back to its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunUpdate {
    Output { stream: OutputStream, chunk: String },
    Finished(RunOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(ExitReport),
    /// The toolchain could not be launched or supervised
    Failed(String),
}

pub struct RunOrchestrator {
    config: Arc<RunConfig>,
    active: Option<RunJob>,
}

impl RunOrchestrator {
    pub fn new(config: Arc<RunConfig>) -> Self {
        Self {
            config,
            active: None,
        }
    }

    pub fn active(&self) -> Option<&RunJob> {
        self.active.as_ref()
    }

    pub fn is_current(&self, run_id: Uuid) -> bool {
        self.active.as_ref().is_some_and(|job| job.id == run_id)
    }

    /// Start tracking a new run. At most one run is active per session.
    pub fn submit(&mut self, language: &str, code: &str) -> Result<RunJob, SessionError> {
        let toolchain = self
            .config
            .toolchain(language)
            .ok_or_else(|| SessionError::ExecutionUnavailable(language.to_string()))?;

        if self.active.is_some() {
            return Err(SessionError::RunInProgress);
        }

        let job = RunJob {
            id: Uuid::new_v4(),
            language: language.to_string(),
            code: code.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            deadline: Instant::now() + self.config.timeout,
            toolchain: toolchain.clone(),
            cancel: CancellationToken::new(),
        };
        self.active = Some(job.clone());
        Ok(job)
    }

    /// What the sandbox needs to execute `job`
    pub fn job_spec(&self, job: &RunJob) -> JobSpec {
        JobSpec {
            toolchain: job.toolchain.clone(),
            code: job.code.clone(),
            timeout: self.config.timeout,
            max_output_bytes: self.config.max_output_bytes,
            sandbox_prefix: self.config.sandbox_prefix.clone(),
        }
    }

    /// Record the terminal outcome of `run_id` and return to idle.
    ///
    /// Returns `None` when `run_id` is not the active run.
    pub fn finish(&mut self, run_id: Uuid, outcome: &RunOutcome) -> Option<RunStatus> {
        if !self.is_current(run_id) {
            return None;
        }
        let mut job = self.active.take()?;
        job.status = match outcome {
            RunOutcome::Exited(exit) if exit.timed_out => RunStatus::TimedOut,
            RunOutcome::Exited(_) => RunStatus::Completed,
            RunOutcome::Failed(_) => RunStatus::Errored,
        };
        debug!(
            %run_id,
            status = ?job.status,
            elapsed_ms = (Utc::now() - job.started_at).num_milliseconds(),
            "Run left the orchestrator"
        );
        Some(job.status)
    }

    /// Kill the active run, if any, without reporting an outcome
    pub fn abort(&mut self) -> Option<RunJob> {
        let job = self.active.take()?;
        job.cancel.cancel();
        Some(job)
    }
}

/// Execute one job and forward its events to the session as
/// [`SessionCommand::RunUpdate`]s. Ends after the terminal update, on
/// cancellation, or when the session is gone (dropping the job kills it).
pub(crate) async fn drive(
    run_id: Uuid,
    spec: JobSpec,
    deadline: Instant,
    cancel: CancellationToken,
    commands: mpsc::Sender<SessionCommand>,
) {
    let report = |update: RunUpdate| {
        let commands = commands.clone();
        async move {
            commands
                .send(SessionCommand::RunUpdate { run_id, update })
                .await
                .is_ok()
        }
    };

    let mut job = match run_sandbox::spawn(spec).await {
        Ok(job) => job,
        Err(e) => {
            warn!(%run_id, "Failed to launch run: {}", e);
            report(RunUpdate::Finished(RunOutcome::Failed(e.to_string()))).await;
            return;
        }
    };
    debug!(%run_id, pid = ?job.pid(), "Run launched");

    let watchdog = tokio::time::sleep_until(deadline + DEADLINE_SLACK);
    tokio::pin!(watchdog);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%run_id, "Run cancelled");
                job.cancel();
                return;
            }
            _ = &mut watchdog => {
                warn!(%run_id, "Sandbox missed the run deadline, killing it");
                job.cancel();
                let exit = ExitReport { code: TIMED_OUT_EXIT_CODE, timed_out: true };
                report(RunUpdate::Finished(RunOutcome::Exited(exit))).await;
                return;
            }
            event = job.next_event() => event,
        };

        let Some(event) = event else {
            report(RunUpdate::Finished(RunOutcome::Failed(
                "run ended without an exit status".to_string(),
            )))
            .await;
            return;
        };

        let terminal = event.is_terminal();
        let update = match event {
            JobEvent::Output { stream, chunk } => RunUpdate::Output { stream, chunk },
            JobEvent::Exited(exit) => RunUpdate::Finished(RunOutcome::Exited(ExitReport {
                code: exit.code,
                timed_out: exit.timed_out,
            })),
            JobEvent::Failed(reason) => RunUpdate::Finished(RunOutcome::Failed(reason)),
        };

        if !report(update).await {
            debug!(%run_id, "Session gone, abandoning run");
            return;
        }
        if terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunFileConfig;
    use std::collections::BTreeMap;

    fn orchestrator() -> RunOrchestrator {
        let mut config = RunConfig::from_file(&RunFileConfig::default());
        config.languages = BTreeMap::from([(
            "shell".to_string(),
            Toolchain::new("main.sh", ["sh", "main.sh"]),
        )]);
        config.timeout = Duration::from_secs(2);
        RunOrchestrator::new(Arc::new(config))
    }

    fn exited(code: i32, timed_out: bool) -> RunOutcome {
        RunOutcome::Exited(ExitReport { code, timed_out })
    }

    #[test]
    fn unknown_language_is_unavailable() {
        let mut runner = orchestrator();
        let err = runner.submit("markdown", "# hi").unwrap_err();
        assert_eq!(err, SessionError::ExecutionUnavailable("markdown".into()));
        assert!(runner.active().is_none());
    }

    #[test]
    fn only_one_run_at_a_time() {
        let mut runner = orchestrator();
        let job = runner.submit("shell", "echo 1").unwrap();
        assert_eq!(job.status, RunStatus::Running);
        assert_eq!(runner.submit("shell", "echo 2").unwrap_err(), SessionError::RunInProgress);

        assert_eq!(runner.finish(job.id, &exited(0, false)), Some(RunStatus::Completed));
        assert!(runner.active().is_none());
        assert!(runner.submit("shell", "echo 3").is_ok());
    }

    #[test]
    fn stale_run_ids_are_ignored() {
        let mut runner = orchestrator();
        let job = runner.submit("shell", "echo 1").unwrap();
        assert_eq!(runner.finish(Uuid::new_v4(), &exited(0, false)), None);
        assert!(runner.is_current(job.id));
    }

    #[test]
    fn finish_classifies_outcomes() {
        let mut runner = orchestrator();
        let job = runner.submit("shell", "sleep 9").unwrap();
        assert_eq!(runner.finish(job.id, &exited(-1, true)), Some(RunStatus::TimedOut));

        let job = runner.submit("shell", "x").unwrap();
        assert_eq!(
            runner.finish(job.id, &RunOutcome::Failed("no sh".into())),
            Some(RunStatus::Errored)
        );
    }

    #[test]
    fn abort_cancels_the_job() {
        let mut runner = orchestrator();
        let job = runner.submit("shell", "sleep 9").unwrap();
        let token = job.cancellation_token();
        assert_eq!(runner.abort().map(|j| j.id), Some(job.id));
        assert!(token.is_cancelled());
        assert!(runner.abort().is_none());
    }

    #[test]
    fn job_spec_uses_configured_limits() {
        let mut runner = orchestrator();
        let job = runner.submit("shell", "echo hi").unwrap();
        let spec = runner.job_spec(&job);
        assert_eq!(spec.toolchain.source_file, "main.sh");
        assert_eq!(spec.code, "echo hi");
        assert_eq!(spec.timeout, Duration::from_secs(2));
        assert_eq!(spec.max_output_bytes, 1024 * 1024);
    }

    async fn collect(mut rx: mpsc::Receiver<SessionCommand>) -> Vec<RunUpdate> {
        let mut updates = Vec::new();
        while let Some(cmd) = rx.recv().await {
            if let SessionCommand::RunUpdate { update, .. } = cmd {
                updates.push(update);
            }
        }
        updates
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drive_streams_output_then_exit() {
        let mut runner = orchestrator();
        let job = runner.submit("shell", "echo 1; echo 2 >&2; exit 3").unwrap();
        let spec = runner.job_spec(&job);
        let (tx, rx) = mpsc::channel(16);

        drive(job.id, spec, job.deadline, job.cancellation_token(), tx).await;
        let updates = collect(rx).await;

        let stdout: String = updates
            .iter()
            .filter_map(|u| match u {
                RunUpdate::Output { stream: OutputStream::Stdout, chunk } => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, "1\n");
        assert_eq!(updates.last(), Some(&RunUpdate::Finished(exited(3, false))));
    }

    #[tokio::test]
    async fn drive_reports_launch_failure() {
        let mut config = RunConfig::from_file(&RunFileConfig::default());
        config.languages = BTreeMap::from([(
            "ghost".to_string(),
            Toolchain::new("main.txt", ["definitely-not-a-real-program-xyz"]),
        )]);
        let mut runner = RunOrchestrator::new(Arc::new(config));
        let job = runner.submit("ghost", "").unwrap();
        let spec = runner.job_spec(&job);
        let (tx, rx) = mpsc::channel(16);

        drive(job.id, spec, job.deadline, job.cancellation_token(), tx).await;
        let updates = collect(rx).await;

        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0], RunUpdate::Finished(RunOutcome::Failed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drive_stops_quietly_when_cancelled() {
        let mut runner = orchestrator();
        let job = runner.submit("shell", "sleep 5").unwrap();
        let spec = runner.job_spec(&job);
        let (tx, rx) = mpsc::channel(16);
        let token = job.cancellation_token();

        let handle = tokio::spawn(drive(job.id, spec, job.deadline, token.clone(), tx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(collect(rx).await.is_empty());
    }
}
