//! Spawning, supervising and reaping one CLI process.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CommandResolver, SubprocessError};

const READ_CHUNK: usize = 8192;

/// Forwarded explicitly so the CLI finds its credentials even when the host
/// runs with a stripped environment (systemd units, cron).
const FORWARDED_ENV: [&str; 3] = ["HOME", "PATH", "ANTHROPIC_API_KEY"];

/// What to run and under which limits.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// How the process came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

/// Everything a finished process left behind.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub termination: Termination,
    pub duration: Duration,
}

impl ProcessOutput {
    /// stdout followed by stderr, verbatim.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) if self.stdout.ends_with('\n') => {
                format!("{}{}", self.stdout, self.stderr)
            }
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs CLI invocations. Holds no state between calls.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    resolver: Arc<dyn CommandResolver>,
    terminate_grace: Duration,
}

impl ProcessExecutor {
    pub fn new(resolver: Arc<dyn CommandResolver>, terminate_grace: Duration) -> Self {
        Self {
            resolver,
            terminate_grace,
        }
    }

    /// Run one process to completion, timeout or cancellation.
    ///
    /// Only failures to start (or to wait on) the process are errors; any exit
    /// status, a timeout and a cancellation all return [`ProcessOutput`].
    pub async fn run(
        &self,
        request: &ProcessRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, SubprocessError> {
        if !request.working_directory.is_dir() {
            return Err(SubprocessError::WorkingDirectory {
                path: request.working_directory.clone(),
            });
        }
        let invocation = self.resolver.resolve(&request.program, &request.args)?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&request.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in FORWARDED_ENV {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.envs(&request.env);

        #[cfg(unix)]
        {
            // SAFETY: the hook runs in the forked child before exec and only
            // calls setsid(2), which is async-signal-safe.
            #[allow(unsafe_code)]
            unsafe {
                cmd.pre_exec(detach_session);
            }
        }

        let started = Instant::now();
        let child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            program: invocation.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut handle = ProcessHandle::attach(child, self.terminate_grace);
        let pid = handle.pid;

        info!(
            pid,
            program = %invocation.program.display(),
            working_dir = %request.working_directory.display(),
            timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
            "Spawned claude process"
        );

        let wake = tokio::select! {
            status = handle.child.wait() => Wake::Exited(status),
            () = tokio::time::sleep(request.timeout) => Wake::Deadline,
            () = cancel.cancelled() => Wake::Cancelled,
        };

        let (exit_code, termination) = match wake {
            Wake::Exited(Ok(status)) => {
                handle.sweep();
                (status.code(), Termination::Exited)
            }
            Wake::Exited(Err(e)) => {
                handle.terminate().await;
                return Err(SubprocessError::Wait {
                    pid,
                    reason: e.to_string(),
                });
            }
            Wake::Deadline => {
                warn!(
                    pid,
                    timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
                    "Process exceeded its timeout, terminating"
                );
                (handle.terminate().await, Termination::TimedOut)
            }
            Wake::Cancelled => {
                info!(pid, "Execution cancelled, terminating process");
                (handle.terminate().await, Termination::Cancelled)
            }
        };

        let (stdout, stderr) = handle.collect().await;
        let duration = started.elapsed();

        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            debug!(pid, "stderr: {}", line);
        }
        debug!(
            pid,
            exit_code,
            ?termination,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            stdout_bytes = stdout.len(),
            "Process finished"
        );

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
            termination,
            duration,
        })
    }
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

/// Start a new session so the child leads its own process group and has no
/// controlling terminal (an interactive shell would otherwise try to grab it).
#[cfg(unix)]
fn detach_session() -> io::Result<()> {
    // SAFETY: setsid(2) takes no arguments and only affects the calling process.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::setsid() };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// A live child process and its output capture. Never leaves this module.
struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    grace: Duration,
    stdout: Capture,
    stderr: Capture,
    reaped: bool,
}

impl ProcessHandle {
    fn attach(mut child: Child, grace: Duration) -> Self {
        let pid = child.id();
        let stdout = Capture::start(child.stdout.take());
        let stderr = Capture::start(child.stderr.take());
        Self {
            child,
            pid,
            grace,
            stdout,
            stderr,
            reaped: false,
        }
    }

    /// SIGTERM the whole group, wait out the grace period, then SIGKILL.
    ///
    /// Returns the leader's exit code when it exited on its own terms.
    async fn terminate(&mut self) -> Option<i32> {
        self.signal_group(false);
        let code = match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, ?status, "Process exited after SIGTERM");
                status.code()
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "Error waiting for process, killing");
                self.force_kill().await
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_secs = self.grace.as_secs(),
                    "Grace period expired, killing process group"
                );
                self.force_kill().await
            }
        };
        self.sweep();
        code
    }

    async fn force_kill(&mut self) -> Option<i32> {
        self.signal_group(true);
        if let Err(e) = self.child.kill().await {
            debug!(pid = self.pid, error = %e, "Kill after group SIGKILL failed");
        }
        self.child.try_wait().ok().flatten().and_then(|s| s.code())
    }

    /// Kill whatever the leader left running in its group.
    fn sweep(&mut self) {
        self.signal_group(true);
        self.reaped = true;
    }

    #[cfg(unix)]
    fn signal_group(&mut self, forceful: bool) {
        let Some(pgid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        let signal = if forceful { libc::SIGKILL } else { libc::SIGTERM };
        // SAFETY: kill(2) reads no memory. The group id equals the child's pid
        // because the child became a session leader before exec.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(-pgid, signal) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pgid, signal, error = %err, "Failed to signal process group");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _forceful: bool) {
        if let Err(e) = self.child.start_kill() {
            debug!(pid = self.pid, error = %e, "start_kill failed");
        }
    }

    /// Wait for both streams to drain and return them as text.
    async fn collect(&mut self) -> (String, String) {
        let stdout = self.stdout.finish(self.grace).await;
        let stderr = self.stderr.finish(self.grace).await;
        (stdout, stderr)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.reaped {
            self.signal_group(true);
        }
    }
}

/// Background reader appending one stream into a shared buffer.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|mut reader| {
            let sink = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = vec![0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Ok(mut out) = sink.lock() {
                                out.extend_from_slice(&chunk[..n]);
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "Output stream read failed");
                            break;
                        }
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Join the reader, giving up after `limit` if a stray process still
    /// holds the pipe open. Whatever was read so far is kept.
    async fn finish(&mut self, limit: Duration) -> String {
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(limit, task).await.is_err() {
                warn!("Output stream still open after process exit, keeping partial output");
                abort.abort();
            }
        }
        let bytes = self
            .buf
            .lock()
            .map(|mut out| std::mem::take(&mut *out))
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::subprocess::DirectResolver;

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(Arc::new(DirectResolver), Duration::from_secs(1))
    }

    fn sh(script: &str, dir: &std::path::Path, timeout: Duration) -> ProcessRequest {
        ProcessRequest {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            working_directory: dir.to_path_buf(),
            env: BTreeMap::new(),
            timeout,
        }
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let req = sh(
            "echo out; echo err >&2; exit 3",
            dir.path(),
            Duration::from_secs(10),
        );
        let out = executor()
            .run(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.termination, Termination::Exited);
        assert_eq!(out.combined(), "out\nerr\n");
    }

    #[tokio::test]
    async fn large_output_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let req = sh(
            "i=0; while [ $i -lt 5000 ]; do echo line-$i-xxxxxxxxxxxxxxxxxxxx; i=$((i+1)); done",
            dir.path(),
            Duration::from_secs(30),
        );
        let out = executor()
            .run(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.lines().count(), 5000);
        assert!(out.stdout.ends_with("line-4999-xxxxxxxxxxxxxxxxxxxx\n"));
    }

    #[tokio::test]
    async fn runs_in_working_directory_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = sh("pwd; echo $TURNCODE_PROBE", dir.path(), Duration::from_secs(10));
        req.env.insert("TURNCODE_PROBE".into(), "probe-value".into());
        let out = executor()
            .run(&req, &CancellationToken::new())
            .await
            .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.stdout.contains(canonical.to_str().unwrap()));
        assert!(out.stdout.contains("probe-value"));
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let req = sh("echo started; sleep 30", dir.path(), Duration::from_millis(300));
        let started = Instant::now();
        let out = executor()
            .run(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.termination, Termination::TimedOut);
        assert_eq!(out.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sigterm_ignoring_process_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let req = sh(
            "trap '' TERM; while true; do sleep 1; done",
            dir.path(),
            Duration::from_millis(200),
        );
        let started = Instant::now();
        let out = executor()
            .run(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let req = sh("sleep 30", dir.path(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let out = executor().run(&req, &cancel).await.unwrap();
        assert_eq!(out.termination, Termination::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn background_children_do_not_block_collection() {
        let dir = tempfile::tempdir().unwrap();
        let req = sh("sleep 30 & echo parent-done", dir.path(), Duration::from_secs(10));
        let started = Instant::now();
        let out = executor()
            .run(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, "parent-done\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_working_directory_is_an_error() {
        let req = sh("true", std::path::Path::new("/no/such/dir"), Duration::from_secs(1));
        let err = executor()
            .run(&req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SubprocessError::WorkingDirectory { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let req = ProcessRequest {
            program: "/no/such/claude".into(),
            args: Vec::new(),
            working_directory: dir.path().to_path_buf(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(1),
        };
        let err = executor()
            .run(&req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SubprocessError::SpawnFailed { .. }));
    }
}
