//! Runs provisioning verbs inside a workspace and streams their output.
//!
//! Every request goes through the same state machine: if the workspace has
//! not been initialized yet and the verb is not `init`, `init` runs first and
//! its output is streamed ahead of the requested verb. stdout and stderr of
//! the child share one pipe so lines arrive in the order they were written.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::{Arc, PoisonError};

use futures_util::stream::{self, BoxStream, StreamExt};
use nix::fcntl::OFlag;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::error::WorkspaceError;
use crate::state::SessionToken;
use crate::variables::VALUES_FILE;

/// Directory `terraform init` leaves behind.
pub const INIT_MARKER: &str = ".terraform";

pub const AUTO_INIT_NOTICE: &str = "\n⚠️ Running automatic init first...\n\n";
pub const INIT_FAILED_NOTICE: &str = "\n❌ Init failed - cannot proceed\n";
pub const CONTINUE_NOTICE: &str = "\n➡️ Now running command...\n\n";
pub const QUEUED_NOTICE: &str = "\n⏳ Another command is running in this workspace, waiting...\n\n";

/// Final line of every completed run.
pub fn exit_line(code: i32) -> String {
    format!("\nProcess completed with exit code {code}\n")
}

/// Lazy, finite stream of output chunks, each one line including its newline.
pub type OutputStream = BoxStream<'static, String>;

/// Provisioning actions a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Init,
    Plan,
    Apply,
    PlanDestroy,
    Destroy,
}

impl Verb {
    pub const ALL: [Verb; 5] = [
        Verb::Init,
        Verb::Plan,
        Verb::Apply,
        Verb::PlanDestroy,
        Verb::Destroy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Init => "init",
            Verb::Plan => "plan",
            Verb::Apply => "apply",
            Verb::PlanDestroy => "plan-destroy",
            Verb::Destroy => "destroy",
        }
    }

    /// Arguments passed to the provisioning binary.
    pub fn args(self) -> Vec<String> {
        let var_file = format!("-var-file={VALUES_FILE}");
        let var_file = var_file.as_str();
        let args: Vec<&str> = match self {
            Verb::Init => vec!["init"],
            Verb::Plan => vec!["plan", var_file],
            Verb::Apply => vec!["apply", "-auto-approve", var_file],
            Verb::PlanDestroy => vec!["plan", "-destroy", var_file],
            Verb::Destroy => vec!["destroy", "-auto-approve", var_file],
        };
        args.into_iter().map(str::to_string).collect()
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| WorkspaceError::UnknownVerb(s.to_string()))
    }
}

/// The provisioning binary and any arguments placed before the verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl Toolchain {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::new("terraform")
    }
}

/// True when `verb` needs an `init` run first.
pub fn needs_init(dir: &Path, verb: Verb) -> bool {
    verb != Verb::Init && !dir.join(INIT_MARKER).is_dir()
}

/// Spawns provisioning commands, one at a time per workspace.
pub struct Orchestrator {
    toolchain: Toolchain,
    locks: std::sync::Mutex<HashMap<SessionToken, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(toolchain: Toolchain) -> Self {
        Self {
            toolchain,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// Start `verb` in `dir` and return its output as it is produced.
    ///
    /// The work runs on its own task. Dropping the stream stops forwarding
    /// output, but the child is still waited on so it never lingers.
    pub fn run(&self, token: SessionToken, dir: PathBuf, verb: Verb) -> OutputStream {
        let (tx, rx) = mpsc::channel::<String>(64);
        let lock = self.lock_for(token);
        let toolchain = self.toolchain.clone();

        tokio::spawn(async move {
            let _guard = match lock.clone().try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    info!(session = %token, %verb, "Workspace busy, queueing command");
                    if tx.send(QUEUED_NOTICE.to_string()).await.is_err() {
                        info!(session = %token, %verb, "Client left before command started");
                        return;
                    }
                    lock.lock_owned().await
                }
            };
            // Nobody is listening any more; never start a verb unattended.
            if tx.is_closed() {
                info!(session = %token, %verb, "Client left while queued, command skipped");
                return;
            }
            let mut sink = LineSink::new(token, tx);
            drive(&toolchain, &dir, verb, &mut sink).await;
        });

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|line| (line, rx)) }).boxed()
    }

    /// Drop the execution lock entry for a session that is going away.
    pub fn forget(&self, token: &SessionToken) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    fn lock_for(&self, token: SessionToken) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(token)
            .or_default()
            .clone()
    }
}

/// Forwards output to the client and remembers when the client went away.
struct LineSink {
    token: SessionToken,
    tx: mpsc::Sender<String>,
    connected: bool,
}

impl LineSink {
    fn new(token: SessionToken, tx: mpsc::Sender<String>) -> Self {
        Self {
            token,
            tx,
            connected: true,
        }
    }

    async fn send(&mut self, line: impl Into<String>) -> bool {
        if self.connected && self.tx.send(line.into()).await.is_err() {
            info!(session = %self.token, "Client disconnected, output discarded");
            self.connected = false;
        }
        self.connected
    }
}

async fn drive(toolchain: &Toolchain, dir: &Path, verb: Verb, sink: &mut LineSink) {
    let token = sink.token;

    if needs_init(dir, verb) {
        info!(session = %token, %verb, "Workspace not initialized, running init first");
        sink.send(AUTO_INIT_NOTICE).await;

        let code = run_streaming(toolchain, dir, Verb::Init, sink).await;
        if code != 0 {
            warn!(session = %token, code, "Automatic init failed");
            sink.send(INIT_FAILED_NOTICE).await;
            return;
        }
        if !sink.send(CONTINUE_NOTICE).await {
            return;
        }
    }

    let code = run_streaming(toolchain, dir, verb, sink).await;
    info!(session = %token, %verb, code, "Command finished");
    sink.send(exit_line(code)).await;
}

/// Run one verb to completion, forwarding each line. Returns the exit code,
/// `-signal` when the child was killed, or -1 when it could not be started.
async fn run_streaming(toolchain: &Toolchain, dir: &Path, verb: Verb, sink: &mut LineSink) -> i32 {
    let (mut child, output) = match spawn_merged(toolchain, dir, verb) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!(session = %sink.token, %verb, error = %e, "Failed to spawn");
            sink.send(format!("\n❌ Failed to start {}: {e}\n", toolchain.program))
                .await;
            return -1;
        }
    };
    info!(session = %sink.token, %verb, pid = ?child.id(), "Spawned");

    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if !sink.send(line).await {
                    break;
                }
            }
            Err(e) => {
                warn!(session = %sink.token, %verb, error = %e, "Reading output failed");
                break;
            }
        }
    }
    // Closing the read end lets a child that is still writing fail fast.
    drop(reader);

    wait_for_exit(&mut child, sink.token, verb).await
}

async fn wait_for_exit(child: &mut Child, token: SessionToken, verb: Verb) -> i32 {
    match child.wait().await {
        Ok(status) => {
            if status.code().is_none() {
                warn!(session = %token, %verb, %status, "Terminated by signal");
            }
            exit_code(status)
        }
        Err(e) => {
            error!(session = %token, %verb, error = %e, "Waiting for child failed");
            -1
        }
    }
}

/// Exit code of a finished child; a signal death is reported as `-signal`.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

/// Spawn `verb` with stdout and stderr both writing into one pipe.
fn spawn_merged(toolchain: &Toolchain, dir: &Path, verb: Verb) -> io::Result<(Child, pipe::Receiver)> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    let stderr_end = write_end.try_clone()?;

    let mut cmd = Command::new(&toolchain.program);
    cmd.args(&toolchain.leading_args)
        .args(verb.args())
        .current_dir(dir)
        .env("TERM", "xterm-256color")
        .stdin(Stdio::null())
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr_end));

    let child = cmd.spawn()?;
    // The command still owns the parent's copies of the write end.
    drop(cmd);

    let receiver = pipe::Receiver::from_owned_fd(read_end)?;
    Ok((child, receiver))
}
