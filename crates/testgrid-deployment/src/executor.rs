//! Shell execution engine.
//!
//! Runs a staged script as a subprocess in its own process group, captures
//! stdout/stderr up to a cap, and bounds the whole call by a timeout. The
//! process group is killed with `SIGKILL` on timeout and whenever the
//! [`ShellExecutor::run`] future is dropped before completion, so scripts
//! cannot leave descendants behind.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::env::DeployEnvironment;
use crate::error::{ExecutionError, ExecutionResult};

const READ_CHUNK: usize = 8 * 1024;

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Raw result of a script run. A non-zero `exit_code` is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Process exit code; `128 + signal` when the script was killed by a signal.
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

#[derive(Debug, Clone, Default)]
struct CapturedStream {
    text: String,
    truncated: bool,
}

/// Runs deployment scripts with an interpreter such as `bash`.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    config: ExecutorConfig,
}

impl ShellExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `script_path` in `working_dir` with `env`, waiting at most `timeout`
    /// for the process to exit and its output to drain.
    pub async fn run(
        &self,
        script_path: &Path,
        working_dir: &Path,
        env: &DeployEnvironment,
        timeout: Duration,
    ) -> ExecutionResult<ExecutionOutcome> {
        let start = Instant::now();
        let deadline = deadline_after(timeout);
        let program = self.config.interpreter.clone();

        debug!(
            script = %script_path.display(),
            working_dir = %working_dir.display(),
            timeout_ms = millis(timeout),
            vars = ?env.keys().collect::<Vec<_>>(),
            "Spawning deployment script"
        );

        let mut command = self.command(script_path, working_dir, env);
        let mut child = command.spawn().map_err(|source| ExecutionError::Spawn {
            program: program.clone(),
            source,
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        let cap = self.config.max_output_bytes;
        let mut stdout = StreamReader::spawn(child.stdout.take(), cap);
        let mut stderr = StreamReader::spawn(child.stderr.take(), cap);

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => return Err(ExecutionError::Wait { source }),
            Err(_) => {
                group.kill("timeout");
                let _ = child.start_kill();
                if let Err(e) = child.wait().await {
                    warn!(error = %e, "Failed to reap timed-out deployment script");
                }
                let (stdout, stderr) = self.drain_after_kill(&mut stdout, &mut stderr).await;
                return Err(timeout_error(timeout, start, stdout, stderr));
            }
        };

        if self.config.kill_lingering_processes {
            group.kill("lingering after exit");
        }

        let drained = tokio::time::timeout_at(deadline, async {
            stdout.join().await;
            stderr.join().await;
        })
        .await;
        if drained.is_err() {
            // The script exited but something it spawned still holds the pipes.
            group.kill("timeout");
            let (stdout, stderr) = self.drain_after_kill(&mut stdout, &mut stderr).await;
            return Err(timeout_error(timeout, start, stdout, stderr));
        }
        group.release();

        let stdout = stdout
            .finish()
            .map_err(|source| ExecutionError::Wait { source })?;
        let stderr = stderr
            .finish()
            .map_err(|source| ExecutionError::Wait { source })?;

        let (exit_code, signal) = exit_parts(status);
        let duration = start.elapsed();
        info!(
            exit_code = exit_code,
            signal = ?signal,
            duration_ms = millis(duration),
            "Deployment script exited"
        );

        Ok(ExecutionOutcome {
            exit_code,
            signal,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            stdout: stdout.text,
            stderr: stderr.text,
            duration,
        })
    }

    fn command(&self, script_path: &Path, working_dir: &Path, env: &DeployEnvironment) -> Command {
        let mut std_command = std::process::Command::new(&self.config.interpreter);
        std_command
            .args(&self.config.interpreter_args)
            .arg(script_path)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !self.config.inherit_env {
            std_command.env_clear();
        }
        std_command.envs(env.iter());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New group whose id is the child's pid.
            std_command.process_group(0);
        }

        let mut command = Command::from(std_command);
        command.kill_on_drop(true);
        command
    }

    /// Collect whatever the readers captured once the group is dead. Readers
    /// whose pipes are still held by processes that escaped the group are
    /// abandoned after the grace period, keeping the bytes read so far.
    async fn drain_after_kill(
        &self,
        stdout: &mut StreamReader,
        stderr: &mut StreamReader,
    ) -> (CapturedStream, CapturedStream) {
        let grace = Duration::from_millis(self.config.output_grace_ms);
        let collected = tokio::time::timeout(grace, async {
            stdout.join().await;
            stderr.join().await;
        })
        .await;

        if collected.is_err() {
            stdout.abort();
            stderr.abort();
            warn!("Output pipes still open after kill; keeping output read so far");
        }
        (stdout.snapshot(), stderr.snapshot())
    }
}

fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn timeout_error(
    limit: Duration,
    start: Instant,
    stdout: CapturedStream,
    stderr: CapturedStream,
) -> ExecutionError {
    ExecutionError::Timeout {
        limit_ms: millis(limit),
        elapsed_ms: millis(start.elapsed()),
        stdout: stdout.text,
        stderr: stderr.text,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
    }
}

/// Bytes kept from one stream, shared between its reader task and the
/// executor so a reader abandoned mid-stream still yields what it read.
#[derive(Debug)]
struct CaptureBuffer {
    kept: Vec<u8>,
    omitted: u64,
    cap: usize,
}

impl CaptureBuffer {
    fn new(cap: usize) -> Self {
        Self {
            kept: Vec::with_capacity(cap.min(64 * 1024)),
            omitted: 0,
            cap,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let take = self.cap.saturating_sub(self.kept.len()).min(chunk.len());
        self.kept.extend_from_slice(&chunk[..take]);
        self.omitted += (chunk.len() - take) as u64;
    }

    fn snapshot(&self) -> CapturedStream {
        let mut text = String::from_utf8_lossy(&self.kept).into_owned();
        if self.omitted > 0 {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!(
                "[output truncated: {} bytes omitted]\n",
                self.omitted
            ));
        }
        CapturedStream {
            text,
            truncated: self.omitted > 0,
        }
    }
}

type SharedBuffer = Arc<Mutex<CaptureBuffer>>;

fn lock(buffer: &SharedBuffer) -> std::sync::MutexGuard<'_, CaptureBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background reader for one output stream. The joined result is kept, so
/// joining again after a cancelled wait never re-polls a finished task.
struct StreamReader {
    task: JoinHandle<std::io::Result<()>>,
    buffer: SharedBuffer,
    joined: Option<std::io::Result<()>>,
}

impl StreamReader {
    fn spawn<R>(reader: Option<R>, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::new(cap)));
        Self {
            task: tokio::spawn(capture(reader, Arc::clone(&buffer))),
            buffer,
            joined: None,
        }
    }

    async fn join(&mut self) {
        if self.joined.is_some() {
            return;
        }
        let result = match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        };
        self.joined = Some(result);
    }

    fn abort(&self) {
        if self.joined.is_none() {
            self.task.abort();
        }
    }

    /// Everything read so far, whether or not the stream reached EOF.
    fn snapshot(&self) -> CapturedStream {
        lock(&self.buffer).snapshot()
    }

    fn finish(self) -> std::io::Result<CapturedStream> {
        match self.joined {
            Some(Ok(())) => Ok(lock(&self.buffer).snapshot()),
            Some(Err(e)) => Err(e),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "output stream was not drained",
            )),
        }
    }
}

/// Read a stream to EOF into `buffer`, which keeps at most its cap.
async fn capture<R>(reader: Option<R>, buffer: SharedBuffer) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        lock(&buffer).push(&chunk[..n]);
    }
}

fn exit_parts(status: ExitStatus) -> (i32, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal, Some(signal));
        }
    }
    (status.code().unwrap_or(-1), None)
}

/// Kills the child's whole process group when dropped, unless released.
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
        }
    }

    fn kill(&mut self, reason: &str) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid, reason);
        }
    }

    fn release(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill("cancelled");
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32, reason: &str) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => crate::obs::emit_process_killed(pgid, reason),
        Err(Errno::ESRCH) => debug!(pgid = pgid, "Process group already gone"),
        Err(e) => warn!(pgid = pgid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32, _reason: &str) {}
