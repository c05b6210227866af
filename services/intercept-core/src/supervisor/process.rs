//! Decoder pipeline supervision
//!
//! A pipeline is one or more stages whose stdout feeds the next stage's stdin.
//! All stages share one process group (led by the first stage) so that signals
//! reach every program in the pipeline, including anything they fork.
//!
//! Each started pipeline gets a supervision task that owns the `Child`
//! handles. The task finishes when either a stage exits on its own (reported
//! as unsolicited) or a stop request arrives (interrupt, grace period, kill).

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::signal::{signal_group, Signal};
use crate::config::ToolCommand;

/// Lines of stderr retained per pipeline for error reports
const STDERR_TAIL_LINES: usize = 20;

/// How long the exit report waits for stderr readers to hit EOF
const STDERR_FLUSH: Duration = Duration::from_millis(250);

/// One program invocation in a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub program: String,
    pub args: Vec<String>,
}

impl Stage {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Start from a configured launcher (program plus any argv prefix)
    pub fn from_tool(tool: &ToolCommand) -> Self {
        Self {
            program: tool.program.clone(),
            args: tool.leading_args.clone(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Full command line of a mode: a single program or a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub stages: Vec<Stage>,
}

impl CommandSpec {
    pub fn single(stage: Stage) -> Self {
        Self { stages: vec![stage] }
    }

    pub fn pipe(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{}", stage)?;
        }
        Ok(())
    }
}

/// Failure to get a pipeline running
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("command has no stages")]
    EmptyCommand,

    #[error("{program} not found (is it installed and on PATH?)")]
    NotFound { program: String },

    #[error("permission denied executing {program}")]
    PermissionDenied { program: String },

    #[error("cannot spawn {program}: system is out of process resources ({source})")]
    ResourceExhausted {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("decoder exited during startup ({status}){}", stderr_suffix(.stderr))]
    ExitedEarly { status: ExitInfo, stderr: Vec<String> },
}

impl LaunchError {
    /// Nothing can be spawned at all; needs operator intervention on the host
    pub fn is_platform_fatal(&self) -> bool {
        matches!(self, LaunchError::ResourceExhausted { .. })
    }

    fn from_spawn(program: &str, err: io::Error) -> Self {
        let program = program.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound { program },
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied { program },
            _ => match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    LaunchError::ResourceExhausted {
                        program,
                        source: err,
                    }
                }
                _ => LaunchError::Io {
                    program,
                    source: err,
                },
            },
        }
    }
}

fn stderr_suffix(stderr: &[String]) -> String {
    match stderr.last() {
        Some(line) => format!(": {}", line),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Exited within the grace period after the interrupt
    Stopped,
    /// Grace period ran out; the whole group was killed
    ForceKilled,
}

/// Terminal status of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// A stop was requested (false means the pipeline died on its own)
    pub requested: bool,
    /// SIGKILL was needed
    pub forced: bool,
}

impl ExitInfo {
    fn new(status: Option<ExitStatus>, requested: bool, forced: bool) -> Self {
        use std::os::unix::process::ExitStatusExt;

        Self {
            code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            requested,
            forced,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn outcome(&self) -> StopOutcome {
        if self.forced {
            StopOutcome::ForceKilled
        } else {
            StopOutcome::Stopped
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "killed by signal {}", sig),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

#[derive(Debug)]
struct StopRequest {
    grace: Duration,
    reply: oneshot::Sender<StopOutcome>,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Decoder stdout; every successful read refreshes the owning handle's activity time
#[derive(Debug)]
pub struct ProcessOutput {
    inner: ChildStdout,
    last_activity: Arc<AtomicI64>,
}

impl AsyncRead for ProcessOutput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            if buf.filled().len() > before {
                this.last_activity.store(now_millis(), Ordering::Relaxed);
            }
        }
        poll
    }
}

/// A running (or finished) pipeline
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pids: Vec<u32>,
    pgid: i32,
    started_at: DateTime<Utc>,
    last_activity: Arc<AtomicI64>,
    output: Option<ProcessOutput>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    control_tx: mpsc::Sender<StopRequest>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pids(&self) -> &[u32] {
        &self.pids
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.started_at)
    }

    /// The last stage's stdout. Can be taken once.
    pub fn take_output(&mut self) -> Option<ProcessOutput> {
        self.output.take()
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Exit status if the pipeline has already terminated
    pub fn exit_status(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.exit_status().is_none()
    }

    /// Resolves once every stage has exited and the group is swept
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(info) = rx.borrow_and_update().clone() {
                return info;
            }
            if rx.changed().await.is_err() {
                return rx
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| ExitInfo::new(None, false, false));
            }
        }
    }

    /// Interrupt the group, wait up to `grace`, then kill it.
    ///
    /// Stopping a pipeline that already exited returns its recorded outcome.
    pub async fn stop(&self, grace: Duration) -> StopOutcome {
        let (reply, reply_rx) = oneshot::channel();
        if self.control_tx.send(StopRequest { grace, reply }).await.is_err() {
            return self.wait().await.outcome();
        }
        match reply_rx.await {
            Ok(outcome) => outcome,
            // supervision finished before reading our request
            Err(_) => self.wait().await.outcome(),
        }
    }
}

/// Starts pipelines and keeps count of the live ones
#[derive(Debug, Clone)]
pub struct Supervisor {
    live: Arc<AtomicUsize>,
    crash_drain: Duration,
}

impl Supervisor {
    pub fn new(crash_drain: Duration) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            crash_drain,
        }
    }

    /// Pipelines started and not yet fully reaped
    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Spawn every stage of `spec` into one new process group.
    ///
    /// If a later stage fails to spawn, the stages already running are killed.
    pub fn start(&self, label: &str, spec: &CommandSpec) -> Result<ProcessHandle, LaunchError> {
        if spec.stages.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }

        info!("[{}] Starting: {}", label, spec);

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let mut children: Vec<Child> = Vec::with_capacity(spec.stages.len());
        let mut pids = Vec::with_capacity(spec.stages.len());
        let mut pgid: i32 = 0;
        let mut upstream: Option<Stdio> = None;
        let mut stderr_readers = Vec::with_capacity(spec.stages.len());

        for (i, stage) in spec.stages.iter().enumerate() {
            let mut cmd = Command::new(&stage.program);
            cmd.args(&stage.args)
                .stdin(upstream.take().unwrap_or_else(Stdio::null))
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(pgid)
                .kill_on_drop(true);

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    let err = LaunchError::from_spawn(&stage.program, e);
                    warn!("[{}] {}", label, err);
                    if let Err(e) = signal_group(pgid, Signal::Kill) {
                        warn!("[{}] Failed to kill partial pipeline: {}", label, e);
                    }
                    return Err(err);
                }
            };

            let pid = child.id().unwrap_or(0);
            pids.push(pid);
            if i == 0 {
                pgid = pid as i32;
            }

            if let Some(stderr) = child.stderr.take() {
                stderr_readers.push(spawn_stderr_reader(
                    stderr,
                    label.to_string(),
                    stage.program.clone(),
                    stderr_tail.clone(),
                ));
            }

            if i + 1 < spec.stages.len() {
                let stdout = child.stdout.take().ok_or_else(|| LaunchError::Io {
                    program: stage.program.clone(),
                    source: io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"),
                })?;
                let stdio: Stdio = stdout.try_into().map_err(|e| LaunchError::Io {
                    program: stage.program.clone(),
                    source: e,
                })?;
                upstream = Some(stdio);
            }

            children.push(child);
        }

        let started_at = Utc::now();
        let last_activity = Arc::new(AtomicI64::new(started_at.timestamp_millis()));
        let output = children
            .last_mut()
            .and_then(|c| c.stdout.take())
            .map(|inner| ProcessOutput {
                inner,
                last_activity: last_activity.clone(),
            });

        let (control_tx, control_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(None);

        self.live.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(supervise(
            children,
            stderr_readers,
            pgid,
            label.to_string(),
            control_rx,
            exit_tx,
            self.live.clone(),
            self.crash_drain,
        ));

        debug!("[{}] Pipeline running, pids={:?} pgid={}", label, pids, pgid);

        Ok(ProcessHandle {
            label: label.to_string(),
            pids,
            pgid,
            started_at,
            last_activity,
            output,
            stderr_tail,
            control_tx,
            exit_rx,
        })
    }
}

fn spawn_stderr_reader(
    stderr: ChildStderr,
    label: String,
    program: String,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf).trim().to_string();
            if line.is_empty() {
                continue;
            }
            // decoders print banners and tuner info to stderr, not just errors
            debug!("[{}] {}: {}", label, program, line);
            let mut guard = match tail.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.len() == STDERR_TAIL_LINES {
                guard.pop_front();
            }
            guard.push_back(line);
        }
    })
}

enum Trigger {
    Exited(usize, Option<ExitStatus>),
    Stop(Option<StopRequest>),
}

async fn supervise(
    mut children: Vec<Child>,
    stderr_readers: Vec<JoinHandle<()>>,
    pgid: i32,
    label: String,
    mut control_rx: mpsc::Receiver<StopRequest>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    live: Arc<AtomicUsize>,
    crash_drain: Duration,
) {
    let trigger = tokio::select! {
        (idx, status) = wait_any(&mut children) => Trigger::Exited(idx, status),
        req = control_rx.recv() => Trigger::Stop(req),
    };

    let (info, reply) = match trigger {
        Trigger::Exited(idx, status) => {
            let info = ExitInfo::new(status, false, false);
            warn!("[{}] Stage {} exited on its own ({})", label, idx, info);
            let outcome = reap(&mut children, pgid, crash_drain).await;
            let info = ExitInfo {
                forced: outcome == StopOutcome::ForceKilled,
                ..info
            };
            (info, None)
        }
        Trigger::Stop(req) => {
            // a dropped handle means nobody can stop us later: kill now
            let (grace, reply) = match req {
                Some(r) => (r.grace, Some(r.reply)),
                None => (Duration::ZERO, None),
            };
            debug!("[{}] Interrupting process group {}", label, pgid);
            if let Err(e) = signal_group(pgid, Signal::Interrupt) {
                warn!("[{}] Failed to interrupt group {}: {}", label, pgid, e);
            }
            let outcome = reap(&mut children, pgid, grace).await;
            let last = children.last_mut().and_then(|c| c.try_wait().ok().flatten());
            let info = ExitInfo::new(last, true, outcome == StopOutcome::ForceKilled);
            match outcome {
                StopOutcome::Stopped => info!("[{}] Stopped ({})", label, info),
                StopOutcome::ForceKilled => {
                    warn!("[{}] Did not exit within {:?}, killed", label, grace)
                }
            }
            (info, reply)
        }
    };

    // the tail must be complete when the exit becomes visible
    if tokio::time::timeout(STDERR_FLUSH, futures_util::future::join_all(stderr_readers))
        .await
        .is_err()
    {
        debug!("[{}] stderr still open after exit", label);
    }

    live.fetch_sub(1, Ordering::SeqCst);
    let outcome = info.outcome();
    let _ = exit_tx.send(Some(info));
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}

async fn wait_any(children: &mut [Child]) -> (usize, Option<ExitStatus>) {
    let waits = children.iter_mut().map(|c| Box::pin(c.wait()));
    let (result, idx, _) = futures_util::future::select_all(waits).await;
    (idx, result.ok())
}

async fn wait_all(children: &mut [Child]) {
    for child in children.iter_mut() {
        let _ = child.wait().await;
    }
}

/// Wait up to `grace` for every stage, kill the group if needed, and finally
/// sweep the group so descendants of exited stages cannot keep the device.
async fn reap(children: &mut [Child], pgid: i32, grace: Duration) -> StopOutcome {
    let outcome = match tokio::time::timeout(grace, wait_all(children)).await {
        Ok(()) => StopOutcome::Stopped,
        Err(_) => {
            if let Err(e) = signal_group(pgid, Signal::Kill) {
                warn!("Failed to kill process group {}: {}", pgid, e);
            }
            wait_all(children).await;
            StopOutcome::ForceKilled
        }
    };

    if let Ok(true) = signal_group(pgid, Signal::Kill) {
        debug!("Swept leftover processes in group {}", pgid);
    }

    outcome
}
