//! Spawning the final command under a wall-clock deadline, and the short
//! `--help` probe used by help-gated rules.

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::InterposeError;
use crate::rewrite::HelpProbe;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long a child may take to exit after a forwarded signal before the
/// tree is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bound on reading a probe's output after the probed program exited.
const PROBE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Exit code reported for a child killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub timed_out: bool,
    pub exit_observed: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Signal the wrapper received and passed on to the child.
    pub forwarded_signal: Option<i32>,
    /// Filled in by the recorder from the side channel or the facts above.
    pub reported_status: String,
}

impl ExecutionOutcome {
    fn from_status(status: ExitStatus, forwarded_signal: Option<i32>) -> Self {
        Self {
            timed_out: false,
            exit_observed: true,
            exit_code: status.code(),
            signal: exit_signal(&status),
            forwarded_signal,
            reported_status: String::new(),
        }
    }

    fn timed_out(forwarded_signal: Option<i32>) -> Self {
        Self {
            timed_out: true,
            exit_observed: false,
            exit_code: None,
            signal: None,
            forwarded_signal,
            reported_status: String::new(),
        }
    }

    /// Exit code the wrapper should end with.
    pub fn wrapper_exit_code(&self) -> i32 {
        if self.timed_out {
            return TIMEOUT_EXIT_CODE;
        }
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Where the supervised child lives relative to the wrapper's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessGroup {
    /// The child leads a new group, so the deadline kills its whole tree.
    Own,
    /// The child stays in the wrapper's group and keeps terminal access.
    /// Only the child itself is signalled.
    Inherit,
}

impl ProcessGroup {
    /// A background group touching the terminal is stopped by `SIGTTIN` /
    /// `SIGTTOU`, so interactive runs stay in the foreground group.
    pub fn for_stdin() -> Self {
        if std::io::stdin().is_terminal() {
            ProcessGroup::Inherit
        } else {
            ProcessGroup::Own
        }
    }
}

fn isolate(cmd: &mut Command, group: ProcessGroup) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        if group == ProcessGroup::Own {
            cmd.process_group(0);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (cmd, group);
    }
}

/// Send `signal` to the child (or its group). `false` when it could not be
/// delivered.
#[cfg(unix)]
fn send_signal(child: &Child, group: ProcessGroup, signal: i32) -> bool {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Ok(signal) = Signal::try_from(signal) else {
        return false;
    };
    // An `Own` child leads its group, so its pid is the group id.
    let pid = Pid::from_raw(child.id() as i32);
    let delivered = match group {
        ProcessGroup::Own => killpg(pid, signal),
        ProcessGroup::Inherit => kill(pid, signal),
    };
    delivered.is_ok()
}

#[cfg(not(unix))]
fn send_signal(_child: &Child, _group: ProcessGroup, _signal: i32) -> bool {
    false
}

#[cfg(unix)]
const KILL_SIGNAL: i32 = signal_hook::consts::SIGKILL;
#[cfg(not(unix))]
const KILL_SIGNAL: i32 = 9;

fn kill_tree(child: &mut Child, group: ProcessGroup) {
    if !send_signal(child, group, KILL_SIGNAL) {
        let _ = child.kill();
    }
}

fn terminate_tree(child: &mut Child, group: ProcessGroup) {
    kill_tree(child, group);
    if let Err(e) = child.wait() {
        warn!(pid = child.id(), "failed to reap terminated child: {}", e);
    }
}

/// Catches termination signals aimed at the wrapper while a child runs, so
/// they can be passed on instead of orphaning the child.
#[cfg(unix)]
struct SignalForwarder {
    pending: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    ids: Vec<signal_hook::SigId>,
}

#[cfg(unix)]
impl SignalForwarder {
    const SIGNALS: [i32; 3] = [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGHUP,
    ];

    fn install() -> Self {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let pending = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::with_capacity(Self::SIGNALS.len());
        for signal in Self::SIGNALS {
            match signal_hook::flag::register_usize(signal, Arc::clone(&pending), signal as usize) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(signal, "failed to install signal handler: {}", e),
            }
        }
        Self { pending, ids }
    }

    fn take(&self) -> Option<i32> {
        match self.pending.swap(0, std::sync::atomic::Ordering::SeqCst) {
            0 => None,
            signal => i32::try_from(signal).ok(),
        }
    }
}

#[cfg(unix)]
impl Drop for SignalForwarder {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(not(unix))]
struct SignalForwarder;

#[cfg(not(unix))]
impl SignalForwarder {
    fn install() -> Self {
        SignalForwarder
    }

    fn take(&self) -> Option<i32> {
        None
    }
}

enum Waited {
    Exited(ExitStatus),
    DeadlineReached,
}

/// Wait for `child` until it exits or `timeout` elapses; on the deadline the
/// tree is killed and reaped. Signals caught by `signals` are forwarded, and a
/// child still alive `SHUTDOWN_GRACE` later is killed.
fn wait_supervised(
    child: &mut Child,
    group: ProcessGroup,
    timeout: Option<Duration>,
    signals: Option<&SignalForwarder>,
) -> Result<(Waited, Option<i32>)> {
    let started = Instant::now();
    let deadline = timeout.map(|t| started + t);
    let mut forwarded = None;
    let mut grace_deadline: Option<Instant> = None;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((Waited::Exited(status), forwarded));
        }
        if let Some(signal) = signals.and_then(SignalForwarder::take) {
            info!(pid = child.id(), signal, "forwarding signal to child");
            if !send_signal(child, group, signal) {
                let _ = child.kill();
            }
            forwarded = Some(signal);
            grace_deadline.get_or_insert_with(|| Instant::now() + SHUTDOWN_GRACE);
        }
        let now = Instant::now();
        if grace_deadline.is_some_and(|grace| now >= grace) {
            warn!(pid = child.id(), "child outlived forwarded signal, killing");
            kill_tree(child, group);
            grace_deadline = None;
        }
        if let Some(deadline) = deadline {
            if now >= deadline {
                debug!(pid = child.id(), elapsed = ?started.elapsed(), "deadline reached, killing");
                terminate_tree(child, group);
                return Ok((Waited::DeadlineReached, forwarded));
            }
        }
        let wake = deadline.into_iter().chain(grace_deadline).min();
        let nap = wake.map_or(POLL_INTERVAL, |w| {
            POLL_INTERVAL.min(w.saturating_duration_since(now))
        });
        thread::sleep(nap);
    }
}

fn command_for(argv: &[String]) -> Result<Command, InterposeError> {
    let (program, args) = argv.split_first().ok_or_else(|| InterposeError::Spawn {
        program: String::new(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
    })?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Run `argv` with inherited standard streams until it exits or `timeout`
/// elapses, choosing the process group from the wrapper's stdin.
pub fn run(argv: &[String], timeout: Option<Duration>) -> Result<ExecutionOutcome> {
    run_in(argv, timeout, ProcessGroup::for_stdin())
}

pub fn run_in(
    argv: &[String],
    timeout: Option<Duration>,
    group: ProcessGroup,
) -> Result<ExecutionOutcome> {
    let mut cmd = command_for(argv)?;
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    isolate(&mut cmd, group);
    // Installed before spawning so no signal slips between spawn and wait.
    let signals = SignalForwarder::install();
    let mut child = cmd.spawn().map_err(|source| InterposeError::Spawn {
        program: argv[0].clone(),
        source,
    })?;
    match wait_supervised(&mut child, group, timeout, Some(&signals)) {
        Ok((Waited::Exited(status), forwarded)) => {
            Ok(ExecutionOutcome::from_status(status, forwarded))
        }
        Ok((Waited::DeadlineReached, forwarded)) => Ok(ExecutionOutcome::timed_out(forwarded)),
        Err(e) => {
            terminate_tree(&mut child, group);
            Err(e)
        }
    }
}

/// Capture stdout of `argv`, or `None` if it cannot be spawned or does not
/// finish within `timeout`.
pub fn capture_stdout(argv: &[String], timeout: Duration) -> Option<String> {
    let group = ProcessGroup::Own;
    let mut cmd = command_for(argv).ok()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    isolate(&mut cmd, group);
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            debug!(program = %argv[0], "probe spawn failed: {}", e);
            return None;
        }
    };
    // Drain on a thread so a chatty help text cannot fill the pipe and stall.
    let Some(mut stdout) = child.stdout.take() else {
        terminate_tree(&mut child, group);
        return None;
    };
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    match wait_supervised(&mut child, group, Some(timeout), None) {
        Ok((Waited::Exited(_), _)) => {}
        Ok((Waited::DeadlineReached, _)) => {
            warn!(program = %argv.join(" "), "help probe timed out");
            return None;
        }
        Err(e) => {
            warn!(program = %argv.join(" "), "help probe wait failed: {:#}", e);
            terminate_tree(&mut child, group);
            return None;
        }
    }
    match rx.recv_timeout(PROBE_DRAIN_GRACE) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).to_string()),
        Err(_) => {
            // A descendant still holds the pipe open.
            warn!(program = %argv.join(" "), "help probe output never closed");
            kill_tree(&mut child, group);
            None
        }
    }
}

/// Probes `<runtime> <program> --help` with a bounded wait.
#[derive(Debug, Clone)]
pub struct RuntimeHelpProbe {
    runtime: PathBuf,
    timeout: Duration,
}

impl RuntimeHelpProbe {
    pub fn new(runtime: PathBuf, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }
}

impl HelpProbe for RuntimeHelpProbe {
    fn help_text(&mut self, program: &str) -> Option<String> {
        let argv = vec![
            self.runtime.to_string_lossy().to_string(),
            program.to_string(),
            "--help".to_string(),
        ];
        capture_stdout(&argv, self.timeout)
    }
}
