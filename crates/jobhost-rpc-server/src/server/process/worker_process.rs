//! Supervision of one worker OS process.
//!
//! A [`WorkerProcess`] is inert until [`WorkerProcess::start`] spawns it.
//! Output is forwarded to the log: stdout at info, stderr classified by
//! content, with the most recent error lines kept for exit diagnostics. A
//! monitor task owns the child handle and publishes the exit exactly once on
//! a watch channel; nothing else touches the child.

use super::{arguments::WorkerContext, sanitize::sanitize};
use jobhost_rpc_core::{
    Error, Result,
    types::{INTENTIONAL_RESTART_EXIT_CODE, PROCESS_EXIT_TIMEOUT, STDERR_TAIL_CAPACITY, SUCCESS_EXIT_CODE},
};
use parking_lot::Mutex;
use std::{collections::VecDeque, path::Path, process::Stdio, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::watch,
};
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for output readers after the process ends.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How the worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stderr_tail: Vec<String>,
    /// Set when the host killed the process itself.
    pub killed: bool,
}

/// What the dispatcher should do about an exit.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitDisposition {
    Closed,
    Restart,
    Failed(Error),
}

impl ProcessExit {
    pub fn disposition(&self, executable: &str) -> ExitDisposition {
        match self.code {
            Some(SUCCESS_EXIT_CODE) => ExitDisposition::Closed,
            Some(INTENTIONAL_RESTART_EXIT_CODE) => ExitDisposition::Restart,
            code => ExitDisposition::Failed(Error::WorkerExited {
                executable: executable.to_owned(),
                exit_code: code.unwrap_or(-1),
                stderr: self.stderr_tail.join(", "),
            }),
        }
    }
}

/// Severity assigned to a stderr line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrLevel {
    Info,
    Warning,
    Error,
}

pub fn classify_stderr(line: &str) -> StderrLevel {
    let lower = line.to_ascii_lowercase();
    if lower.contains("warn") {
        StderrLevel::Warning
    } else if ["error", "fail", "severe", "unhandled exception"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        StderrLevel::Error
    } else {
        StderrLevel::Info
    }
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

pub struct WorkerProcess {
    context: WorkerContext,
    pid: Option<u32>,
    exit: Option<watch::Receiver<Option<ProcessExit>>>,
    kill: CancellationToken,
}

impl WorkerProcess {
    /// Describes the process without starting it.
    pub fn new(context: WorkerContext) -> Self {
        Self {
            context,
            pid: None,
            exit: None,
            kill: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> String {
        self.context.arguments.executable_path.display().to_string()
    }

    pub fn has_started(&self) -> bool {
        self.exit.is_some()
    }

    /// Spawns the process with its output redirected to the log.
    pub async fn start(&mut self) -> Result<()> {
        if self.has_started() {
            return Err(Error::WorkerStart {
                reason: format!("worker {} already started", self.context.worker_id),
            });
        }

        let executable = &self.context.arguments.executable_path;
        ensure_executable(executable);

        #[cfg(feature = "tracing")]
        tracing::info!(
            worker_id = %self.context.worker_id,
            command = %self.context.display_command(),
            "Starting worker process"
        );

        let mut command = Command::new(executable);
        command
            .args(self.context.command_args())
            .envs(self.context.command_env())
            .current_dir(&self.context.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Children the worker forks share its group and die with it.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|e| Error::WorkerStart {
                reason: format!("{}: {e}", self.context.display_command()),
            })?;

        self.pid = child.id();
        let worker_id = self.context.worker_id.clone();
        let tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_CAPACITY)));

        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(forward_stdout(out, worker_id.clone()))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(forward_stderr(err, worker_id.clone(), tail.clone()))
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = self.kill.clone();
        let pid = self.pid;
        tokio::spawn(async move {
            let mut killed = false;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    killed = true;
                    kill_process_group(pid);
                    let _ = child.start_kill();
                    match tokio::time::timeout(PROCESS_EXIT_TIMEOUT, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(%worker_id, "Worker process did not exit after kill");
                            Err(std::io::Error::other("process did not exit"))
                        }
                    }
                }
            };

            // Let the readers drain so the tail is complete. A descendant
            // holding the pipes open must not stall the exit.
            let readers = futures::future::join_all([stdout, stderr].into_iter().flatten());
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, readers).await;

            let exit = ProcessExit {
                code: status.ok().and_then(|s| s.code()),
                stderr_tail: tail.lock().iter().cloned().collect(),
                killed,
            };
            #[cfg(feature = "tracing")]
            tracing::debug!(%worker_id, code = ?exit.code, killed, "Worker process exited");
            let _ = exit_tx.send(Some(exit));
        });

        self.exit = Some(exit_rx);
        Ok(())
    }

    /// The exit, if the process has already ended.
    pub fn try_exit(&self) -> Option<ProcessExit> {
        self.exit.as_ref().and_then(|rx| rx.borrow().clone())
    }

    /// A handle that resolves once the process exits. Resolves immediately
    /// for a process that was never started.
    pub fn exit_signal(&self) -> ExitSignal {
        ExitSignal(self.exit.clone())
    }

    /// Kills the process with its process group and waits briefly for it to
    /// go away.
    pub async fn kill(&self) -> Option<ProcessExit> {
        self.kill.cancel();
        self.wait_for_exit(PROCESS_EXIT_TIMEOUT * 2).await
    }

    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessExit> {
        tokio::time::timeout(timeout, self.exit_signal().wait())
            .await
            .ok()
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Cloneable view of a process exit.
#[derive(Debug, Clone)]
pub struct ExitSignal(Option<watch::Receiver<Option<ProcessExit>>>);

impl ExitSignal {
    pub async fn wait(self) -> ProcessExit {
        let unknown = ProcessExit {
            code: None,
            stderr_tail: Vec::new(),
            killed: false,
        };
        let Some(mut rx) = self.0 else {
            return unknown;
        };
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or(unknown),
            Err(_) => unknown,
        }
    }
}

/// Sends `SIGKILL` to the group led by `pid`.
fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // SAFETY: killpg takes plain integers and touches no memory.
        let _rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        #[cfg(feature = "tracing")]
        if _rc != 0 {
            tracing::debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Sets the execute bit when it is missing. Failures are logged, the spawn
/// reports the real error.
fn ensure_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let Ok(meta) = std::fs::metadata(path) else {
            return;
        };
        let mut perms = meta.permissions();
        if perms.mode() & 0o111 != 0 {
            return;
        }
        perms.set_mode(perms.mode() | 0o755);
        if let Err(_e) = std::fs::set_permissions(path, perms) {
            #[cfg(feature = "tracing")]
            tracing::warn!(path = %path.display(), error = %_e, "Could not set execute permission");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

async fn forward_stdout<R>(out: R, _worker_id: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(out).lines();
    while let Ok(Some(_line)) = lines.next_line().await {
        #[cfg(feature = "tracing")]
        tracing::info!(worker_id = %_worker_id, "{}", sanitize(&_line));
    }
}

async fn forward_stderr<R>(err: R, _worker_id: String, tail: StderrTail)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(err).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = sanitize(&line);
        match classify_stderr(&line) {
            StderrLevel::Warning => {
                #[cfg(feature = "tracing")]
                tracing::warn!(worker_id = %_worker_id, "{line}");
            }
            StderrLevel::Error => {
                #[cfg(feature = "tracing")]
                tracing::error!(worker_id = %_worker_id, "{line}");
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_CAPACITY {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            StderrLevel::Info => {
                #[cfg(feature = "tracing")]
                tracing::info!(worker_id = %_worker_id, "{line}");
            }
        }
    }
}
