use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decoder::Utf8StreamDecoder;
use crate::error::SandboxError;
use crate::toolchain::Toolchain;

/// Exit code reported when the deadline killed the job.
pub const TIMED_OUT_EXIT_CODE: i32 = -1;

/// Emitted once on stderr when a job exceeds its output budget.
pub const TRUNCATION_NOTICE: &str = "\n[output truncated]\n";

const READ_CHUNK_BYTES: usize = 4096;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const UNKNOWN_EXIT_CODE: i32 = -1;

/// Everything needed to run one job
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub toolchain: Toolchain,
    pub code: String,
    pub timeout: Duration,
    /// Combined stdout + stderr bytes forwarded before truncation
    pub max_output_bytes: usize,
    /// Wrapper argv placed before the toolchain command (container, namespace jail, ...)
    pub sandbox_prefix: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobExit {
    pub code: i32,
    pub timed_out: bool,
}

/// Events produced by a running job.
///
/// Zero or more `Output` events are followed by exactly one `Exited` or
/// `Failed`, unless the job was cancelled, in which case the stream just ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    Output { stream: OutputStream, chunk: String },
    Exited(JobExit),
    Failed(String),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Output { .. })
    }
}

/// Handle to a running job. Dropping it kills the job.
pub struct JobHandle {
    events: mpsc::Receiver<JobEvent>,
    cancel: CancellationToken,
    pid: Option<u32>,
}

impl JobHandle {
    /// Next event, or `None` once the job is finished and drained
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Kill the job without reporting an exit
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Shared byte budget across both output streams
struct OutputBudget {
    limit: usize,
    used: AtomicUsize,
    truncated: AtomicBool,
}

impl OutputBudget {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
            truncated: AtomicBool::new(false),
        }
    }

    /// How many of `len` bytes may still be forwarded
    fn take(&self, len: usize) -> usize {
        let prev = self.used.fetch_add(len, Ordering::Relaxed);
        self.limit.saturating_sub(prev).min(len)
    }

    /// True for the first caller only
    fn mark_truncated(&self) -> bool {
        !self.truncated.swap(true, Ordering::Relaxed)
    }
}

/// Write the code into a fresh scratch directory and launch the toolchain
pub async fn spawn(spec: JobSpec) -> Result<JobHandle, SandboxError> {
    if !spec.toolchain.has_plain_source_file() {
        return Err(SandboxError::InvalidSourceFile(
            spec.toolchain.source_file.clone(),
        ));
    }

    let argv: Vec<String> = spec
        .sandbox_prefix
        .iter()
        .chain(spec.toolchain.command.iter())
        .cloned()
        .collect();
    let (program, args) = argv.split_first().ok_or(SandboxError::EmptyCommand)?;

    let scratch = tempfile::Builder::new()
        .prefix("code-room-run-")
        .tempdir()
        .map_err(SandboxError::Scratch)?;
    tokio::fs::write(scratch.path().join(&spec.toolchain.source_file), &spec.code)
        .await
        .map_err(SandboxError::Scratch)?;

    let mut child = build_command(program, args, scratch.path())
        .spawn()
        .map_err(|source| SandboxError::Spawn {
            program: program.clone(),
            source,
        })?;

    let pid = child.id();
    info!(
        program = %program,
        pid = ?pid,
        timeout_ms = spec.timeout.as_millis() as u64,
        "Job started"
    );

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let budget = Arc::new(OutputBudget::new(spec.max_output_bytes));

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(
            stdout,
            OutputStream::Stdout,
            tx.clone(),
            budget.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(
            stderr,
            OutputStream::Stderr,
            tx.clone(),
            budget,
        )));
    }

    let cancel = CancellationToken::new();
    let deadline = Instant::now() + spec.timeout;
    tokio::spawn(supervise(
        child,
        pid,
        scratch,
        readers,
        tx,
        deadline,
        cancel.clone(),
    ));

    Ok(JobHandle {
        events: rx,
        cancel,
        pid,
    })
}

fn build_command(program: &str, args: &[String], dir: &Path) -> Command {
    let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .env_clear()
        .env("PATH", path)
        .env("HOME", dir)
        .env("TMPDIR", dir)
        .env("LANG", "C.UTF-8")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    cmd
}

async fn pump<R>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<JobEvent>,
    budget: Arc<OutputBudget>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8StreamDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(%stream, error = %e, "Error reading job output");
                break;
            }
        };
        let chunk = decoder.decode(&buf[..n]);
        if !forward(&tx, stream, chunk, &budget).await {
            return;
        }
    }

    forward(&tx, stream, decoder.finish(), &budget).await;
}

/// Returns false once nobody is listening
async fn forward(
    tx: &mpsc::Sender<JobEvent>,
    stream: OutputStream,
    mut chunk: String,
    budget: &OutputBudget,
) -> bool {
    if chunk.is_empty() {
        return true;
    }

    let allowed = budget.take(chunk.len());
    if allowed == chunk.len() {
        return tx.send(JobEvent::Output { stream, chunk }).await.is_ok();
    }

    let mut cut = allowed;
    while !chunk.is_char_boundary(cut) {
        cut -= 1;
    }
    chunk.truncate(cut);

    if !chunk.is_empty() && tx.send(JobEvent::Output { stream, chunk }).await.is_err() {
        return false;
    }
    if budget.mark_truncated() {
        let notice = JobEvent::Output {
            stream: OutputStream::Stderr,
            chunk: TRUNCATION_NOTICE.to_string(),
        };
        return tx.send(notice).await.is_ok();
    }
    true
}

enum Finish {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    scratch: TempDir,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::Sender<JobEvent>,
    deadline: Instant,
    cancel: CancellationToken,
) {
    let finish = tokio::select! {
        status = child.wait() => Finish::Exited(status),
        _ = tokio::time::sleep_until(deadline) => Finish::TimedOut,
        _ = cancel.cancelled() => Finish::Cancelled,
    };

    // Leftover background processes would otherwise hold the pipes open.
    kill_group(pid);
    if !matches!(finish, Finish::Exited(_)) {
        if let Err(e) = child.kill().await {
            debug!(pid = ?pid, error = %e, "Kill after deadline failed");
        }
    }

    for mut reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            warn!(pid = ?pid, "Output reader did not drain in time");
            reader.abort();
        }
    }

    drop(scratch);

    let event = match finish {
        Finish::Exited(Ok(status)) => {
            let code = exit_code(status);
            info!(pid = ?pid, code, "Job exited");
            JobEvent::Exited(JobExit {
                code,
                timed_out: false,
            })
        }
        Finish::Exited(Err(e)) => {
            warn!(pid = ?pid, error = %e, "Failed to wait for job");
            JobEvent::Failed(format!("failed to wait for process: {e}"))
        }
        Finish::TimedOut => {
            info!(pid = ?pid, "Job killed at deadline");
            JobEvent::Exited(JobExit {
                code: TIMED_OUT_EXIT_CODE,
                timed_out: true,
            })
        }
        Finish::Cancelled => {
            debug!(pid = ?pid, "Job cancelled");
            return;
        }
    };

    let _ = tx.send(event).await;
}

fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            // ESRCH just means the group is already gone
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(pid, error = %e, "killpg");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}
