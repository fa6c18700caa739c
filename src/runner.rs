//! Supervisor for the user's command
//!
//! The command line runs under a shell in its own process group so that a
//! restart takes down everything it spawned (compilers, dev servers, watchers).

use crate::config::Config;
use crate::error::RunError;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for the stderr pump after the command exited
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// The currently tracked child. The tokio `Child` itself is owned by whoever
/// waits on it, so it is always reaped.
struct ChildProcess {
    pid: u32,
    /// Set when we killed the process, so its exit is not reported as a failure
    killed: Arc<AtomicBool>,
}

/// Runs and restarts a single command
pub struct Runner {
    shell: String,
    command: String,
    wait: bool,
    /// Extra environment for the child, applied over the inherited one
    env: Vec<(String, String)>,
    current: Mutex<Option<ChildProcess>>,
    errors: mpsc::UnboundedSender<RunError>,
    runs: AtomicUsize,
    /// Set on shutdown; no child is started afterwards
    stopped: AtomicBool,
}

impl Runner {
    /// Create a runner for `args` joined with spaces.
    ///
    /// Failures of commands that exit after `run` returned are delivered on
    /// the returned receiver.
    pub fn new(config: &Config, args: Vec<String>) -> (Self, mpsc::UnboundedReceiver<RunError>) {
        let (errors, errors_rx) = mpsc::unbounded_channel();
        let runner = Self {
            shell: config.shell.clone(),
            command: args.join(" "),
            wait: config.wait,
            env: Vec::new(),
            current: Mutex::new(None),
            errors,
            runs: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        };
        (runner, errors_rx)
    }

    /// Set an environment variable for every child started from now on
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Number of children started so far
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Pid of the tracked child, if any
    pub fn pid(&self) -> Option<u32> {
        self.current.lock().as_ref().map(|c| c.pid)
    }

    /// Kill the previous child (if any) and start the command again.
    ///
    /// In wait mode this returns once the command exited; otherwise it returns
    /// as soon as the command was spawned.
    pub async fn run(&self) -> Result<(), RunError> {
        self.kill();

        let Some((child, pump, stderr, killed)) = self.execute()? else {
            debug!("Runner stopped, not starting command");
            return Ok(());
        };

        if self.wait {
            return wait_for_exit(child, pump, stderr, killed).await;
        }

        let errors = self.errors.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_exit(child, pump, stderr, killed).await {
                // Receiver gone means the server is shutting down
                let _ = errors.send(e);
            }
        });
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn execute(
        &self,
    ) -> Result<Option<(Child, JoinHandle<()>, Arc<Mutex<Vec<u8>>>, Arc<AtomicBool>)>, RunError>
    {
        let mut current = self.current.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&self.command);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::piped());

        // New process group, so kill() reaches everything the command spawns
        #[cfg(unix)]
        cmd.process_group(0);

        // Nothing can reach stderr before the shell runs, so the OS error is the report
        let mut child = cmd
            .spawn()
            .map_err(|e| RunError::Spawn(format!("failed to start `{}`: {}", self.command, e)))?;

        let stderr = Arc::new(Mutex::new(Vec::new()));

        let pid = child.id().unwrap_or(0);
        let pump = spawn_stderr_pump(&mut child, Arc::clone(&stderr));
        let killed = Arc::new(AtomicBool::new(false));

        *current = Some(ChildProcess {
            pid,
            killed: Arc::clone(&killed),
        });
        self.runs.fetch_add(1, Ordering::SeqCst);
        info!(pid, command = %self.command, "Command started");

        Ok(Some((child, pump, stderr, killed)))
    }

    /// Kill the current child and refuse to start any more. Reruns already in
    /// flight become no-ops.
    pub fn shutdown(&self) {
        {
            // Taken with the child lock so a concurrent `execute` either sees
            // the flag or has already registered its child for the kill below
            let _current = self.current.lock();
            self.stopped.store(true, Ordering::SeqCst);
        }
        self.kill();
    }

    /// Kill the tracked child and its whole process group. Safe to call when
    /// nothing is running.
    pub fn kill(&self) {
        let Some(child) = self.current.lock().take() else {
            return;
        };
        child.killed.store(true, Ordering::SeqCst);
        debug!(pid = child.pid, "Killing command process group");

        #[cfg(unix)]
        kill_process_group(child.pid);
    }
}

/// Copy the child's stderr to ours while keeping a copy for error reports
fn spawn_stderr_pump(child: &mut Child, captured: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()> {
    let pipe = child.stderr.take();
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut out = tokio::io::stderr();
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    captured.lock().extend_from_slice(&buf[..n]);
                    let _ = out.write_all(&buf[..n]).await;
                }
                Err(e) => {
                    debug!(error = %e, "Failed reading command stderr");
                    break;
                }
            }
        }
        let _ = out.flush().await;
    })
}

/// Wait for the child to exit. Only positive exit codes are failures: signal
/// deaths (including our own SIGKILL) report no code.
async fn wait_for_exit(
    mut child: Child,
    pump: JoinHandle<()>,
    stderr: Arc<Mutex<Vec<u8>>>,
    killed: Arc<AtomicBool>,
) -> Result<(), RunError> {
    let status = child.wait().await;

    // A background grandchild may hold the pipe open; don't wait on it forever
    if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, pump).await.is_err() {
        debug!("Command stderr still open after exit");
    }

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, "Failed waiting for command");
            return Ok(());
        }
    };

    if killed.load(Ordering::SeqCst) {
        debug!(?status, "Killed command exited");
        return Ok(());
    }

    match status.code() {
        Some(code) if code > 0 => {
            let err = RunError::exit(code, &stderr.lock());
            warn!(code, "Command exited with failure");
            Err(err)
        }
        _ => {
            debug!(?status, "Command exited");
            Ok(())
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }

    // ESRCH (already gone) is expected here and ignored
    unsafe {
        let pgid = libc::getpgid(pid);
        // Never signal our own group
        if pgid > 0 && pgid != libc::getpgrp() {
            libc::kill(-pgid, libc::SIGKILL);
        }
        libc::kill(-pid, libc::SIGKILL);
    }
}
