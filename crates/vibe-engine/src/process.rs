//! Subprocess runner (spec Section 4.1).
//!
//! Spawns a child process, streams stdout/stderr line-by-line to a
//! caller-supplied sink, enforces a single timeout over the whole run, and
//! reacts to cooperative cancellation immediately via the termination
//! protocol: terminate, wait 5s, kill, wait 2s.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    Spawn(std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Exit code recorded when a run times out (spec Section 4.1).
pub const TIMED_OUT_EXIT_CODE: i32 = -1;

const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub current_dir: Option<PathBuf>,
    /// Payload written to stdin and then closed. `None` closes stdin immediately.
    pub stdin: Option<String>,
}

impl ProcessSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            current_dir: None,
            stdin: None,
        }
    }

    pub fn with_current_dir(mut self, dir: PathBuf) -> Self {
        self.current_dir = Some(dir);
        self
    }

    pub fn with_stdin(mut self, input: String) -> Self {
        self.stdin = Some(input);
        self
    }

    fn command_string(&self) -> String {
        self.argv.join(" ")
    }
}

/// Result of running a process to completion (spec Section 4.1).
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Cooperative cancellation handle. Cloning shares the same flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct CancelListener {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelListener) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelListener { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelListener {
    /// Resolves once cancellation has been requested.
    async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        let _ = self.rx.changed().await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Run a process to completion, streaming lines to `on_line` as they arrive.
///
/// Decodes stream bytes as UTF-8 with replacement for invalid sequences and
/// strips trailing newlines. Never returns an error for a non-zero exit —
/// that is reported via `ProcessOutcome::exit_code`.
pub async fn run_process(
    spec: ProcessSpec,
    timeout: Duration,
    mut cancel: CancelListener,
    mut on_line: impl FnMut(StreamKind, &str) + Send + 'static,
) -> Result<ProcessOutcome> {
    let mut cmd = Command::new(&spec.argv[0]);
    cmd.args(&spec.argv[1..]);
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    new_session(&mut cmd);

    tracing::debug!(command = %spec.command_string(), "spawning process");
    let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;

    if let Some(input) = &spec.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
        }
    } else {
        drop(child.stdin.take());
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let (tx, mut rx) = mpsc::unbounded_channel::<(StreamKind, String)>();
    let out_task = tokio::spawn(stream_lines(stdout, StreamKind::Stdout, tx.clone()));
    let err_task = tokio::spawn(stream_lines(stderr, StreamKind::Stderr, tx));

    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();
    let mut timed_out = false;
    let mut cancelled = false;

    let status = loop {
        tokio::select! {
            biased;
            Some((stream, line)) = rx.recv() => {
                on_line(stream, &line);
                let buf = match stream {
                    StreamKind::Stdout => &mut stdout_buf,
                    StreamKind::Stderr => &mut stderr_buf,
                };
                buf.push_str(&line);
                buf.push('\n');
            }
            () = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                break None;
            }
            () = tokio::time::sleep(timeout) => {
                timed_out = true;
                break None;
            }
            status = child.wait() => {
                break Some(status);
            }
        }
    };

    // Drain any lines already buffered in the channel before deciding the
    // final outcome, whichever branch we took above.
    while let Some((stream, line)) = rx.recv().await {
        on_line(stream, &line);
        let buf = match stream {
            StreamKind::Stdout => &mut stdout_buf,
            StreamKind::Stderr => &mut stderr_buf,
        };
        buf.push_str(&line);
        buf.push('\n');
    }
    let _ = out_task.await;
    let _ = err_task.await;

    let exit_code = if timed_out || cancelled {
        terminate(&mut child).await;
        TIMED_OUT_EXIT_CODE
    } else {
        match status {
            Some(Ok(status)) => status.code().unwrap_or(TIMED_OUT_EXIT_CODE),
            Some(Err(_)) | None => TIMED_OUT_EXIT_CODE,
        }
    };

    Ok(ProcessOutcome {
        exit_code,
        stdout: stdout_buf,
        stderr: stderr_buf,
        timed_out: timed_out || cancelled,
    })
}

async fn stream_lines<R>(reader: R, kind: StreamKind, tx: mpsc::UnboundedSender<(StreamKind, String)>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((kind, line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

/// Terminate protocol: terminate, wait up to 5s, kill, wait up to 2s.
async fn terminate(child: &mut Child) {
    send_terminate(child);
    if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
        return;
    }
    send_kill(child);
    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
}

#[cfg(unix)]
fn new_session(cmd: &mut Command) {
    // Safety: pre_exec runs setsid() in the forked child before exec, which
    // is async-signal-safe and does not touch shared memory.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn new_session(_cmd: &mut Command) {}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn send_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn send_kill(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let spec = ProcessSpec::new(vec![
            "sh".into(),
            "-c".into(),
            "echo one; echo two >&2; exit 3".into(),
        ]);
        let (_handle, listener) = CancelHandle::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines_clone = lines.clone();
        let outcome = run_process(spec, Duration::from_secs(5), listener, move |stream, line| {
            lines_clone.lock().unwrap().push((stream.as_str().to_string(), line.to_string()));
        })
        .await
        .unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.stdout.trim(), "one");
        assert_eq!(outcome.stderr.trim(), "two");
        let captured = lines.lock().unwrap();
        assert!(captured.iter().any(|(s, l)| s == "stdout" && l == "one"));
        assert!(captured.iter().any(|(s, l)| s == "stderr" && l == "two"));
    }

    #[tokio::test]
    async fn timeout_marks_outcome_and_sentinel_exit_code() {
        let spec = ProcessSpec::new(vec!["sleep".into(), "5".into()]);
        let (_handle, listener) = CancelHandle::new();
        let outcome = run_process(spec, Duration::from_millis(100), listener, |_, _| {})
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMED_OUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn cancellation_terminates_promptly() {
        let spec = ProcessSpec::new(vec!["sleep".into(), "30".into()]);
        let (handle, listener) = CancelHandle::new();
        let task = tokio::spawn(run_process(spec, Duration::from_secs(30), listener, |_, _| {}));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("did not terminate promptly")
            .unwrap()
            .unwrap();
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn stdin_payload_is_delivered() {
        let spec = ProcessSpec::new(vec!["cat".into()]).with_stdin("hello\n".into());
        let (_handle, listener) = CancelHandle::new();
        let outcome = run_process(spec, Duration::from_secs(5), listener, |_, _| {})
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.exit_code, 0);
    }
}
