// --- Process supervision ---------------------------------------------------
//
// One tokio task per child owns the `Child`. It drains stderr into the event
// sink, waits for exit, handles termination requests (SIGTERM, then SIGKILL
// after the grace period) and finally reports how the process ended. Callers
// never wait on the child directly.

use std::collections::VecDeque;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::command::ProcessInvocation;
use crate::error::StreamError;
use crate::events::{EventKind, EventSink};
use crate::media::OwnerId;

const SUMMARY_TAIL: usize = 16;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Raw bytes kept per stderr line, relative to `max_line_len` characters.
const LINE_BYTES_PER_CHAR: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// How a supervised process ended.
#[derive(Clone, Debug)]
pub struct ExitReport {
    pub pid: Option<u32>,
    pub outcome: ExitOutcome,
    /// True when the exit followed a `terminate` call.
    pub requested: bool,
    /// Last meaningful diagnostic line, redacted.
    pub last_diagnostic: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub stop_grace: Duration,
    pub diag_lines_per_sec: u32,
    pub max_line_len: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            diag_lines_per_sec: 20,
            max_line_len: 512,
        }
    }
}

/// Owner-side handle to a running child.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Asks the supervising task to stop the child. Returns immediately.
    /// Returns false if termination was already requested.
    pub fn terminate(&mut self) -> bool {
        match self.stop_tx.take() {
            // The receiver is gone only if the process already exited.
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    events: EventSink,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, events: EventSink) -> Self {
        Self { settings, events }
    }

    /// Starts the child described by `invocation` (no shell) and returns its
    /// handle plus a receiver that resolves once the child has exited.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        &self,
        owner: OwnerId,
        invocation: &ProcessInvocation,
    ) -> Result<(ProcessHandle, oneshot::Receiver<ExitReport>), StreamError> {
        let spawn_failure = |source: std::io::Error| StreamError::SpawnFailure {
            program: invocation.program_name(),
            source,
        };

        if let Some(manifest) = &invocation.manifest {
            if let Some(dir) = manifest.path.parent() {
                std::fs::create_dir_all(dir).map_err(spawn_failure)?;
            }
            std::fs::write(&manifest.path, &manifest.body).map_err(spawn_failure)?;
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(manifest) = &invocation.manifest {
                    let _ = std::fs::remove_file(&manifest.path);
                }
                return Err(spawn_failure(e));
            }
        };

        let pid = child.id();
        let stderr = child.stderr.take();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let run = SupervisedRun {
            owner,
            pid,
            invocation: invocation.clone(),
            settings: self.settings.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(run.watch(child, stderr, stop_rx, exit_tx));

        Ok((
            ProcessHandle {
                pid,
                stop_tx: Some(stop_tx),
            },
            exit_rx,
        ))
    }

    /// Fire-and-forget termination. Completion shows up on the exit receiver.
    pub fn terminate(&self, handle: &mut ProcessHandle) -> bool {
        handle.terminate()
    }
}

struct SupervisedRun {
    owner: OwnerId,
    pid: Option<u32>,
    invocation: ProcessInvocation,
    settings: SupervisorSettings,
    events: EventSink,
}

impl SupervisedRun {
    async fn watch(
        self,
        mut child: Child,
        stderr: Option<ChildStderr>,
        mut stop_rx: oneshot::Receiver<()>,
        exit_tx: oneshot::Sender<ExitReport>,
    ) {
        let drain = stderr.map(|stderr| {
            tokio::spawn(drain_diagnostics(
                stderr,
                self.owner,
                self.invocation.clone(),
                self.settings.clone(),
                self.events.clone(),
            ))
        });

        let mut stop_open = true;
        let mut requested = false;
        let waited = loop {
            tokio::select! {
                res = child.wait() => break res,
                msg = &mut stop_rx, if stop_open => {
                    stop_open = false;
                    // A dropped handle is not a stop request.
                    if msg.is_err() {
                        continue;
                    }
                    requested = true;
                    send_terminate(&mut child);
                    match tokio::time::timeout(self.settings.stop_grace, child.wait()).await {
                        Ok(res) => break res,
                        Err(_) => {
                            warn!(owner = %self.owner, pid = ?self.pid, "transcoder ignored SIGTERM, killing");
                            let _ = child.start_kill();
                            break child.wait().await;
                        }
                    }
                }
            }
        };

        let outcome = match waited {
            Ok(status) => ExitOutcome::from_status(status),
            Err(e) => {
                warn!(owner = %self.owner, pid = ?self.pid, "waiting on transcoder failed: {e}");
                ExitOutcome { code: None, signal: None }
            }
        };

        if let Some(manifest) = &self.invocation.manifest {
            if let Err(e) = tokio::fs::remove_file(&manifest.path).await {
                debug!("could not remove playlist manifest {}: {e}", manifest.path.display());
            }
        }

        // stderr normally closes with the process; a grandchild holding it
        // open must not keep the report back.
        let tail = match drain {
            Some(mut task) => match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
                Ok(Ok(tail)) => tail,
                Ok(Err(_)) => VecDeque::new(),
                Err(_) => {
                    task.abort();
                    VecDeque::new()
                }
            },
            None => VecDeque::new(),
        };

        debug!(owner = %self.owner, pid = ?self.pid, %outcome, requested, "transcoder exited");
        let _ = exit_tx.send(ExitReport {
            pid: self.pid,
            outcome,
            requested,
            last_diagnostic: last_diagnostic_summary(&tail),
        });
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we own and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

async fn drain_diagnostics(
    stderr: ChildStderr,
    owner: OwnerId,
    invocation: ProcessInvocation,
    settings: SupervisorSettings,
    events: EventSink,
) -> VecDeque<String> {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(SUMMARY_TAIL);
    let mut throttle = DiagnosticThrottle::new(settings.diag_lines_per_sec, Duration::from_secs(1));
    let byte_cap = settings.max_line_len.saturating_mul(LINE_BYTES_PER_CHAR).max(1);
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::with_capacity(256);

    loop {
        // stderr is not guaranteed to be UTF-8; decode lossily, line by line.
        let consumed = match read_capped_line(&mut reader, &mut buf, byte_cap).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(%owner, "stderr read failed: {e}");
                break;
            }
        };
        let decoded = String::from_utf8_lossy(&buf);
        let mut line = truncate_chars(invocation.redact(decoded.trim_end()), settings.max_line_len);
        if line.trim().is_empty() {
            continue;
        }
        if consumed > buf.len() && !line.ends_with('…') {
            line.push('…');
        }

        if tail.len() >= SUMMARY_TAIL {
            tail.pop_front();
        }
        tail.push_back(line.clone());

        match throttle.admit(Instant::now()) {
            Admission::Emit { suppressed_before } => {
                if suppressed_before > 0 {
                    events.append(
                        owner,
                        EventKind::Diagnostic,
                        format!("({suppressed_before} diagnostic lines suppressed)"),
                    );
                }
                events.append(owner, EventKind::Diagnostic, line);
            }
            Admission::Suppress => {}
        }
    }

    let leftover = throttle.take_suppressed();
    if leftover > 0 {
        events.append(
            owner,
            EventKind::Diagnostic,
            format!("({leftover} diagnostic lines suppressed)"),
        );
    }
    tail
}

/// Reads one line into `buf`, keeping at most `cap` bytes of it. The rest of a
/// longer line is consumed and dropped. Returns the number of bytes consumed,
/// 0 at end of stream.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>, cap: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }
        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let room = cap.saturating_sub(buf.len());
        buf.extend_from_slice(&available[..used.min(room)]);
        reader.consume(used);
        consumed += used;
        if done {
            return Ok(consumed);
        }
    }
}

fn truncate_chars(s: String, max: usize) -> String {
    if s.chars().count() <= max {
        return s;
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

/// Prefers the last non-empty, non-noisy line.
fn last_diagnostic_summary(tail: &VecDeque<String>) -> Option<String> {
    for line in tail.iter().rev() {
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        let lc = t.to_ascii_lowercase();
        if lc.contains("broken pipe") || lc.contains("conversion failed") || lc.starts_with("exiting normally") {
            continue;
        }
        return Some(t.to_string());
    }
    tail.back().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Emit { suppressed_before: u64 },
    Suppress,
}

/// Fixed-window line budget for diagnostic forwarding.
struct DiagnosticThrottle {
    per_window: u32,
    window: Duration,
    window_start: Option<Instant>,
    emitted: u32,
    suppressed: u64,
}

impl DiagnosticThrottle {
    fn new(per_window: u32, window: Duration) -> Self {
        Self {
            per_window: per_window.max(1),
            window,
            window_start: None,
            emitted: 0,
            suppressed: 0,
        }
    }

    fn admit(&mut self, now: Instant) -> Admission {
        let mut suppressed_before = 0;
        let expired = self
            .window_start
            .map_or(true, |start| now.duration_since(start) >= self.window);
        if expired {
            self.window_start = Some(now);
            self.emitted = 0;
            suppressed_before = self.take_suppressed();
        }

        if self.emitted < self.per_window {
            self.emitted += 1;
            Admission::Emit { suppressed_before }
        } else {
            self.suppressed += 1;
            Admission::Suppress
        }
    }

    fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }
}
