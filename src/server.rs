//! Control loop tying the proxy, watcher and runner together

use crate::config::Config;
use crate::debounce::{Action, Debouncer};
use crate::error::RunError;
use crate::proxy::{ErrorMode, Gate, ProxyServer, Release};
use crate::runner::Runner;
use crate::watcher::Watcher;
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Parked requests the gate can hold before new ones wait to enqueue
const GATE_CAPACITY: usize = 1024;

/// How long `stop` waits for the control loop and listener to wind down
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Scans the tree and restarts the command when something changed.
///
/// Reruns are serialized: one started by a debounce timer never overlaps one
/// started by the control loop.
struct Reloader {
    watcher: Watcher,
    runner: Arc<Runner>,
    error_mode: Arc<ErrorMode>,
    lock: tokio::sync::Mutex<()>,
}

impl Reloader {
    async fn rerun(&self) {
        let _guard = self.lock.lock().await;

        if !self.watcher.scan() {
            return;
        }

        info!("fs modified, rerunning...");
        match self.runner.run().await {
            Ok(()) => {
                self.error_mode.clear();
                // Files the command wrote while building are not changes
                self.watcher.set_last_run(SystemTime::now());
            }
            Err(e) => {
                warn!(error = %e, "Rerun failed");
                self.error_mode.set(e.to_string());
            }
        }
    }

    fn action(self: &Arc<Self>) -> Action {
        let reloader = Arc::clone(self);
        Arc::new(move || {
            let reloader = Arc::clone(&reloader);
            async move { reloader.rerun().await }.boxed()
        })
    }
}

/// The development proxy: a listener in front of the app, a supervisor for
/// the app's command and a watcher deciding when to restart it.
pub struct Server {
    config: Arc<Config>,
    runner: Runner,
    errors_rx: mpsc::UnboundedReceiver<RunError>,
}

impl Server {
    /// Create a server that runs `args` (joined with spaces) under the shell
    pub fn new(config: Config, args: Vec<String>) -> Self {
        let (runner, errors_rx) = Runner::new(&config, args);
        Self {
            config: Arc::new(config),
            runner,
            errors_rx,
        }
    }

    /// Set an environment variable for the supervised command
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.runner = self.runner.with_env(key, value);
        self
    }

    /// Bind the proxy, start the command once and enter the control loop.
    ///
    /// Returns once the listener is bound; a bind failure is returned as an
    /// error and nothing is started.
    pub async fn start(self) -> anyhow::Result<ServerHandle> {
        let Server {
            config,
            runner,
            errors_rx,
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (gate, pending_rx) = Gate::new(GATE_CAPACITY);
        let error_mode = Arc::new(ErrorMode::default());

        let proxy = ProxyServer::bind(&config, gate, Arc::clone(&error_mode), shutdown_rx.clone())
            .await?;
        let addr = proxy.local_addr()?;

        let proxy_handle = tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "Proxy server error");
            }
        });

        let runner = Arc::new(runner);
        if let Err(e) = runner.run().await {
            warn!(error = %e, "Initial run failed");
            error_mode.set(e.to_string());
        }

        let reloader = Arc::new(Reloader {
            watcher: Watcher::new(config.root.clone(), config.ignore_paths()),
            runner: Arc::clone(&runner),
            error_mode: Arc::clone(&error_mode),
            lock: tokio::sync::Mutex::new(()),
        });
        info!(root = %reloader.watcher.root().display(), "Watching for changes");

        let control = ControlLoop {
            debouncer: Debouncer::new(config.debounce(), config.debounce_ceiling()),
            reloader: Arc::clone(&reloader),
            pending_rx,
            errors_rx,
            shutdown_rx,
        };
        let loop_handle = tokio::spawn(control.run());

        Ok(ServerHandle {
            addr,
            shutdown_tx,
            loop_handle,
            proxy_handle,
            reloader,
        })
    }

    /// Start the server and run until SIGINT, SIGTERM or SIGQUIT
    pub async fn run_until_signal(self) -> anyhow::Result<()> {
        let handle = self.start().await?;
        wait_for_signal().await?;
        handle.stop().await;
        Ok(())
    }
}

struct ControlLoop {
    debouncer: Debouncer,
    reloader: Arc<Reloader>,
    pending_rx: mpsc::Receiver<Release>,
    errors_rx: mpsc::UnboundedReceiver<RunError>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlLoop {
    async fn run(mut self) {
        let action = self.reloader.action();

        loop {
            tokio::select! {
                Some(release) = self.pending_rx.recv() => {
                    self.debouncer.trigger(Arc::clone(&action)).await;

                    // Everything that parked meanwhile saw the same decision
                    let mut released = 1;
                    let _ = release.send(());
                    while let Ok(release) = self.pending_rx.try_recv() {
                        let _ = release.send(());
                        released += 1;
                    }
                    debug!(released, "Released parked requests");
                }
                Some(err) = self.errors_rx.recv() => {
                    warn!(error = %err, "runner: error");
                    self.reloader.error_mode.set(err.to_string());
                }
                changed = self.shutdown_rx.changed() => {
                    // A dropped handle counts as a stop request
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.debouncer.cancel();
        self.reloader.runner.shutdown();
        info!("Control loop stopped");
    }
}

/// A started server
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: JoinHandle<()>,
    proxy_handle: JoinHandle<()>,
    reloader: Arc<Reloader>,
}

impl ServerHandle {
    /// Address the proxy is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of filesystem scans so far
    pub fn scan_count(&self) -> usize {
        self.reloader.watcher.scan_count()
    }

    /// Number of times the command has been started
    pub fn run_count(&self) -> usize {
        self.reloader.runner.run_count()
    }

    /// Pid of the current command process
    pub fn pid(&self) -> Option<u32> {
        self.reloader.runner.pid()
    }

    /// Current error-mode message, if the last run failed
    pub fn error_message(&self) -> Option<String> {
        self.reloader.error_mode.get()
    }

    /// Kill the command's process group and stop serving
    pub async fn stop(self) {
        // Shut down here too: a wait-mode run can hold the control loop
        self.reloader.runner.shutdown();
        let _ = self.shutdown_tx.send(true);

        let _ = tokio::time::timeout(STOP_TIMEOUT, async {
            let _ = self.loop_handle.await;
            let _ = self.proxy_handle.await;
        })
        .await;
        info!("Shutdown complete");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}
