//! Helpers for running shell commands with timeouts and bounded output.

use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long to keep draining pipes after the child exits or is killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }
}

/// Bytes collected so far from one pipe, shared with the reader thread.
#[derive(Debug, Default)]
struct Captured {
    buf: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

/// Build a `<shell> -c <command>` invocation rooted at `workdir`.
///
/// On unix the child leads its own process group so a timeout can kill the
/// whole pipeline.
pub fn shell_command(shell: &str, command: &str, workdir: &Path) -> Command {
    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(command).current_dir(workdir);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// On timeout the output captured so far is returned with `timed_out` set.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_capture = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_capture = spawn_reader(stderr, output_limit_bytes, done_tx);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Some(status),
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(child.id());
            if let Err(err) = child.kill() {
                debug!(err = %err, "child already exited");
            }
            child
                .wait_timeout(DRAIN_GRACE)
                .context("wait command after kill")?
        }
    };

    // Background grandchildren can hold the pipes open; stop waiting after the grace period.
    for _ in 0..2 {
        if done_rx.recv_timeout(DRAIN_GRACE).is_err() {
            debug!("output reader still running; using partial capture");
            break;
        }
    }

    let (stdout, stdout_truncated) = snapshot(&stdout_capture);
    let (stderr, stderr_truncated) = snapshot(&stderr_capture);

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .arg("-KILL")
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = result {
        warn!(err = %err, pid, "failed to kill process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    done: mpsc::Sender<()>,
) -> SharedCapture {
    let capture = SharedCapture::default();
    let shared = Arc::clone(&capture);
    thread::spawn(move || {
        if let Err(err) = read_stream_limited(reader, limit, &shared) {
            debug!(err = %err, "output reader stopped");
        }
        let _ = done.send(());
    });
    capture
}

fn snapshot(capture: &SharedCapture) -> (Vec<u8>, usize) {
    match capture.lock() {
        Ok(captured) => (captured.buf.clone(), captured.truncated),
        Err(poisoned) => {
            let captured = poisoned.into_inner();
            (captured.buf.clone(), captured.truncated)
        }
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, capture: &SharedCapture) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut captured = capture
            .lock()
            .map_err(|_| anyhow!("output buffer lock poisoned"))?;
        let remaining = limit.saturating_sub(captured.buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            captured.buf.extend_from_slice(&chunk[..keep]);
            captured.truncated += n.saturating_sub(keep);
        } else {
            captured.truncated += n;
        }
    }

    Ok(())
}
