//! Child process execution with a wall-clock timeout and bounded output capture.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long output readers may lag behind the child before its process group is killed.
const READER_GRACE: Duration = Duration::from_secs(2);

/// In-memory buffers are compacted once they grow past twice the limit or this floor.
const COMPACT_FLOOR: usize = 64 * 1024;

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

/// How to feed and bound a child process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory. The most recent bytes win; the
    /// dropped prefix is counted.
    pub output_limit_bytes: usize,
    /// When set, every stdout line is appended here as it arrives (unbounded).
    pub tee_path: Option<&'a Path>,
}

/// Run `cmd`, killing it and everything it started once `timeout` elapses.
///
/// The child leads its own process group. Input is fed and output drained on
/// helper threads, so neither a child that never reads stdin nor a chatty one
/// can stall the wait. Background processes left holding the output pipes are
/// killed with the group after a short grace period. Whatever was produced
/// before exit or kill is returned; a non-zero exit is not an error here.
#[instrument(skip_all, fields(timeout_secs = options.timeout.as_secs(), teeing = options.tee_path.is_some()))]
pub fn run_with_timeout(mut cmd: Command, options: ProcessOptions<'_>) -> Result<CommandOutput> {
    cmd.stdin(if options.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let tee = match options.tee_path {
        Some(path) => Some(open_tee(path)?),
        None => None,
    };

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = options.output_limit_bytes;
    let mut stdout_capture = Capture::spawn(TailBuffer::new(limit, true), move |buffer| {
        read_lines(stdout, buffer, tee)
    });
    let mut stderr_capture = Capture::spawn(TailBuffer::new(limit, false), move |buffer| {
        read_chunks(stderr, buffer)
    });

    if let Some(input) = options.stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Detached: a child that never reads its input would block this write
        // until the child is killed and the pipe closes.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "child closed stdin before reading all input");
            }
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(options.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = options.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(pid);
            if let Err(e) = child.kill() {
                warn!(err = %e, "failed to kill command");
            }
            child.wait().context("wait command after kill")?
        }
    };

    if !drained(&mut stdout_capture, &mut stderr_capture)? {
        warn!("output pipes still open after exit, killing process group");
        kill_process_group(pid);
        if !drained(&mut stdout_capture, &mut stderr_capture)? {
            warn!("output readers still blocked, keeping what was read");
        }
    }

    let (stdout, stdout_truncated) = stdout_capture.into_output().context("collect stdout")?;
    let (stderr, stderr_truncated) = stderr_capture.into_output().context("collect stderr")?;

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

fn open_tee(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create tee dir {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create tee file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Wait up to [`READER_GRACE`] for both readers to reach end of stream.
fn drained(stdout: &mut Capture, stderr: &mut Capture) -> Result<bool> {
    let deadline = Instant::now() + READER_GRACE;
    let stdout_done = stdout.wait_until(deadline)?;
    let stderr_done = stderr.wait_until(deadline)?;
    Ok(stdout_done && stderr_done)
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, err = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Output read on a helper thread into a shared buffer.
///
/// The buffer stays readable if the thread never finishes, so a reader stuck on
/// a pipe held open by a stray process can be abandoned without losing output.
struct Capture {
    buffer: Arc<Mutex<TailBuffer>>,
    done: Receiver<Result<()>>,
    finished: bool,
}

impl Capture {
    fn spawn<F>(buffer: TailBuffer, read: F) -> Self
    where
        F: FnOnce(&Mutex<TailBuffer>) -> Result<()> + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(buffer));
        let (tx, done) = mpsc::channel();
        let shared = Arc::clone(&buffer);
        thread::spawn(move || {
            // The receiver is gone only once the capture was abandoned.
            let _ = tx.send(read(shared.as_ref()));
        });
        Self {
            buffer,
            done,
            finished: false,
        }
    }

    fn wait_until(&mut self, deadline: Instant) -> Result<bool> {
        if self.finished {
            return Ok(true);
        }
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(timeout) {
            Ok(result) => {
                self.finished = true;
                result.map(|()| true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
        }
    }

    fn into_output(self) -> Result<(Vec<u8>, usize)> {
        let output = lock(&self.buffer)?.snapshot();
        Ok(output)
    }
}

/// Keeps the last `limit` bytes pushed into it and counts the rest.
#[derive(Debug)]
struct TailBuffer {
    bytes: Vec<u8>,
    limit: usize,
    total: usize,
    /// Drop a partial leading line when the cut lands mid-line.
    line_aligned: bool,
    last_dropped: Option<u8>,
}

impl TailBuffer {
    fn new(limit: usize, line_aligned: bool) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            total: 0,
            line_aligned,
            last_dropped: None,
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.total += data.len();
        self.bytes.extend_from_slice(data);
        if self.bytes.len() > self.limit.saturating_mul(2).max(COMPACT_FLOOR) {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let excess = self.bytes.len().saturating_sub(self.limit);
        if excess > 0 {
            self.last_dropped = Some(self.bytes[excess - 1]);
            self.bytes.drain(..excess);
        }
    }

    /// Kept bytes and the count of bytes dropped from the front.
    fn snapshot(&mut self) -> (Vec<u8>, usize) {
        self.compact();
        let mut kept = self.bytes.as_slice();
        if self.line_aligned && self.last_dropped.is_some_and(|b| b != b'\n') {
            kept = match kept.iter().position(|&b| b == b'\n') {
                Some(pos) => &kept[pos + 1..],
                None => &[],
            };
        }
        (kept.to_vec(), self.total - kept.len())
    }
}

fn lock(buffer: &Mutex<TailBuffer>) -> Result<std::sync::MutexGuard<'_, TailBuffer>> {
    buffer
        .lock()
        .map_err(|_| anyhow!("output buffer poisoned"))
}

/// Read line by line into `buffer`, copying every line to `tee`.
fn read_lines<R: Read>(
    reader: R,
    buffer: &Mutex<TailBuffer>,
    mut tee: Option<BufWriter<File>>,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            return Ok(());
        }

        let tee_error = match tee.as_mut() {
            Some(writer) => writer.write_all(&line).and_then(|()| writer.flush()).err(),
            None => None,
        };
        if let Some(e) = tee_error {
            warn!(err = %e, "failed to write execution file, continuing without it");
            tee = None;
        }

        lock(buffer)?.push(&line);
    }
}

fn read_chunks<R: Read>(mut reader: R, buffer: &Mutex<TailBuffer>) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        lock(buffer)?.push(&chunk[..n]);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn options(timeout: Duration) -> ProcessOptions<'static> {
        ProcessOptions {
            stdin: None,
            timeout,
            output_limit_bytes: 1_000,
            tee_path: None,
        }
    }

    #[test]
    fn captures_output_despite_nonzero_exit() {
        let out = run_with_timeout(
            sh("echo partial; echo oops >&2; exit 3"),
            options(Duration::from_secs(10)),
        )
        .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&out.stdout), "partial\n");
        assert_eq!(String::from_utf8_lossy(&out.stderr), "oops\n");
        assert!(!out.timed_out);
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_with_timeout(
            sh("echo started; exec sleep 5"),
            options(Duration::from_millis(300)),
        )
        .expect("run");
        assert!(out.timed_out);
        assert_eq!(String::from_utf8_lossy(&out.stdout), "started\n");
    }

    #[test]
    fn kills_background_children_on_timeout() {
        let started = Instant::now();
        let out = run_with_timeout(
            sh("sleep 4 & echo started; sleep 4"),
            options(Duration::from_millis(300)),
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "took {:?}",
            started.elapsed()
        );
        assert_eq!(String::from_utf8_lossy(&out.stdout), "started\n");
    }

    #[test]
    fn stray_background_process_does_not_hold_the_run_open() {
        let started = Instant::now();
        let out = run_with_timeout(
            sh("sleep 6 & echo done"),
            options(Duration::from_secs(10)),
        )
        .expect("run");
        assert!(!out.timed_out);
        assert_eq!(out.status.code(), Some(0));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
        assert_eq!(String::from_utf8_lossy(&out.stdout), "done\n");
    }

    #[test]
    fn unread_stdin_does_not_block_the_timeout() {
        let input = vec![b'x'; 1024 * 1024];
        let started = Instant::now();
        let out = run_with_timeout(
            sh("exec sleep 5"),
            ProcessOptions {
                stdin: Some(&input),
                ..options(Duration::from_millis(300))
            },
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn feeds_stdin_and_keeps_the_stdout_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee = temp.path().join("logs").join("exec.jsonl");
        let out = run_with_timeout(
            sh("cat"),
            ProcessOptions {
                stdin: Some(b"line one\nline two\n"),
                timeout: Duration::from_secs(10),
                output_limit_bytes: 12,
                tee_path: Some(&tee),
            },
        )
        .expect("run");
        // The cut lands inside "line one", so that partial line is dropped too.
        assert_eq!(out.stdout, b"line two\n");
        assert_eq!(out.stdout_truncated, 9);
        let teed = std::fs::read_to_string(&tee).expect("tee file");
        assert_eq!(teed, "line one\nline two\n");
    }

    #[test]
    fn tail_buffer_compacts_and_counts_dropped_bytes() {
        let mut buffer = TailBuffer::new(4, false);
        for _ in 0..COMPACT_FLOOR {
            buffer.push(b"ab");
        }
        buffer.push(b"cd");
        let (kept, dropped) = buffer.snapshot();
        assert_eq!(kept, b"abcd");
        assert_eq!(dropped, COMPACT_FLOOR * 2 - 2);
    }

    #[test]
    fn tail_buffer_keeps_whole_lines_on_a_line_boundary() {
        let mut buffer = TailBuffer::new(6, true);
        buffer.push(b"first\n");
        buffer.push(b"second\n");
        buffer.push(b"x\n");
        // Last 6 bytes are "ond\nx\n"; the partial "ond" line goes.
        let (kept, dropped) = buffer.snapshot();
        assert_eq!(kept, b"x\n");
        assert_eq!(dropped, 13);
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_with_timeout(
            Command::new("/definitely/not/a/binary"),
            options(Duration::from_secs(1)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
