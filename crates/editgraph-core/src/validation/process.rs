//! Child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::errors::{EditGraphError, EditGraphResult};

/// Bytes of stdout/stderr kept per stream.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1 << 20;

/// How long reader threads get to hit EOF once a timed-out child is killed.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        text.push_str(&self.stderr_text());
        text
    }
}

/// True when `program` resolves on `PATH`.
pub fn program_available(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is drained on reader threads while the child runs; bytes beyond
/// `output_limit_bytes` are discarded. A child that outlives `timeout` is
/// killed along with its whole process group and reported with `timed_out`
/// set. After a kill, output readers are only waited on for a short grace
/// period, so a descendant holding the pipes open cannot stall the call.
/// Spawn failures keep their `io::ErrorKind` so callers can tell a missing
/// binary apart.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> EditGraphResult<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process: {:?}", cmd.get_program());
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e.into());
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| EditGraphError::Validation("stdin was not piped".to_string()))?;
        child_stdin.write_all(input)?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EditGraphError::Validation("stdout was not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EditGraphError::Validation("stderr was not piped".to_string()))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            kill_process_tree(&mut child)?;
            child.wait()?
        }
    };

    if timed_out {
        wait_for_readers(&[&stdout_handle, &stderr_handle], READER_GRACE);
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle, timed_out)?;
    let (stderr, stderr_truncated) = join_output(stderr_handle, timed_out)?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Kill the child's process group, then the child itself.
fn kill_process_tree(child: &mut Child) -> EditGraphResult<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // The child leads its own group, so its pid is the group id.
        match i32::try_from(child.id()) {
            Ok(pgid) => {
                if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                    debug!(err = %e, pgid, "killpg failed");
                }
            }
            Err(_) => warn!(pid = child.id(), "child pid out of range for killpg"),
        }
    }

    match child.kill() {
        Ok(()) => Ok(()),
        // Already reaped.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e.into()),
    }
}

type ReaderHandle = thread::JoinHandle<EditGraphResult<(Vec<u8>, usize)>>;

/// Poll until every reader has finished or `grace` elapses.
fn wait_for_readers(handles: &[&ReaderHandle], grace: Duration) {
    let deadline = Instant::now() + grace;
    while handles.iter().any(|h| !h.is_finished()) {
        if Instant::now() >= deadline {
            warn!("output pipes still open after kill, abandoning readers");
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Collect a reader's output. With `abandon_unfinished`, a reader still
/// blocked on an open pipe is detached and contributes no output.
fn join_output(
    handle: ReaderHandle,
    abandon_unfinished: bool,
) -> EditGraphResult<(Vec<u8>, usize)> {
    if abandon_unfinished && !handle.is_finished() {
        return Ok((Vec::new(), 0));
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(EditGraphError::Validation(
            "output reader thread panicked".to_string(),
        )),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> EditGraphResult<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
