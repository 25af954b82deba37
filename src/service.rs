//! Per-domain backend supervisor.
//!
//! A `Service` owns the lifecycle of exactly one backend process for one
//! domain: start it, watch for exit, restart after a fixed delay, and
//! replace-and-restart when its run parameters change.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Delay between a backend exiting and its replacement being spawned.
///
/// Deliberately fixed: no backoff growth and no retry ceiling. The policy
/// keeps development backends always available.
pub const RESTART_DELAY: Duration = Duration::from_millis(5000);

/// Desired run configuration for a backend process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParams {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub port: u16,
}

struct ServiceState {
    params: Option<RunParams>,
    monitoring: bool,
    /// Signals the current process's exit watcher to kill and stand down.
    kill_tx: Option<oneshot::Sender<()>>,
    /// Bumped on every spawn and on shutdown. An exit watcher only schedules
    /// a restart if its generation is still current, so a superseded process
    /// never respawns over its replacement.
    generation: u64,
    restarts: u64,
}

/// The live, in-memory representation of one domain's backend.
///
/// Designed to be shared behind an `Arc`; methods that spawn supervision
/// tasks take `&Arc<Self>`.
pub struct Service {
    domain: String,
    restart_delay: Duration,
    state: Mutex<ServiceState>,
}

impl Service {
    pub fn new(domain: impl Into<String>) -> Arc<Self> {
        Self::with_restart_delay(domain, RESTART_DELAY)
    }

    /// Like [`new`](Service::new) with a custom crash-recovery delay.
    pub fn with_restart_delay(domain: impl Into<String>, restart_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            domain: domain.into(),
            restart_delay,
            state: Mutex::new(ServiceState {
                params: None,
                monitoring: false,
                kill_tx: None,
                generation: 0,
                restarts: 0,
            }),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The port currently assigned to this backend, if parameters were set.
    pub fn port(&self) -> Option<u16> {
        self.state.lock().params.as_ref().map(|p| p.port)
    }

    /// How many times a process has been spawned for this service.
    pub fn restarts(&self) -> u64 {
        self.state.lock().restarts
    }

    pub fn is_monitoring(&self) -> bool {
        self.state.lock().monitoring
    }

    /// Whether the stored command, args and working directory already match.
    /// Used by reconciliation to decide if the existing port can be reused.
    pub fn params_match(&self, command: &str, args: &[String], working_dir: &Path) -> bool {
        let state = self.state.lock();
        state
            .params
            .as_ref()
            .map(|p| p.command == command && p.args == args && p.working_dir == working_dir)
            .unwrap_or(false)
    }

    /// Update the desired run configuration.
    ///
    /// A no-op when command, args, working directory and port are all
    /// unchanged; this is what keeps re-reading an unchanged map file from
    /// causing a restart storm. Any difference stores the new values and
    /// triggers an immediate restart.
    pub fn set_parameters(self: &Arc<Self>, params: RunParams) {
        {
            let mut state = self.state.lock();
            if state.params.as_ref() == Some(&params) {
                debug!(domain = %self.domain, "Parameters unchanged, not restarting");
                return;
            }
            state.params = Some(params);
        }
        self.restart();
    }

    /// Terminate the current process (signal, no synchronous wait) and spawn
    /// a replacement with the stored parameters.
    pub fn restart(self: &Arc<Self>) {
        let (params, generation) = {
            let mut state = self.state.lock();
            let Some(params) = state.params.clone() else {
                warn!(domain = %self.domain, "Restart requested before parameters were set");
                return;
            };
            if let Some(kill_tx) = state.kill_tx.take() {
                let _ = kill_tx.send(());
            }
            state.monitoring = true;
            state.generation += 1;
            state.restarts += 1;
            (params, state.generation)
        };
        self.spawn(params, generation);
    }

    /// Stop supervising: kill the current process and suppress any pending
    /// delayed restart. Used when a domain disappears from configuration.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.monitoring = false;
        state.generation += 1;
        if let Some(kill_tx) = state.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    fn spawn(self: &Arc<Self>, params: RunParams, generation: u64) {
        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .current_dir(&params.working_dir)
            // The PORT variable is the sole channel by which a backend
            // learns where to listen.
            .env("PORT", params.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    domain = %self.domain,
                    command = %params.command,
                    error = %e,
                    "Failed to spawn backend"
                );
                // A process that never started will never emit an exit
                // event, so the retry has to be scheduled here.
                self.schedule_restart(generation);
                return;
            }
        };

        let pid = child.id().unwrap_or(0);
        info!(domain = %self.domain, port = params.port, pid, "Backend started");

        if let Some(stdout) = child.stdout.take() {
            self.forward_output(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.forward_output(stderr);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        self.state.lock().kill_tx = Some(kill_tx);

        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => info!(
                            domain = %service.domain,
                            %status,
                            delay_ms = service.restart_delay.as_millis() as u64,
                            "Backend exited, scheduling restart"
                        ),
                        Err(e) => warn!(
                            domain = %service.domain,
                            error = %e,
                            "Error waiting for backend exit"
                        ),
                    }
                    service.schedule_restart(generation);
                }
                _ = kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    debug!(domain = %service.domain, pid, "Backend superseded");
                }
            }
        });
    }

    /// Schedule exactly one restart after the fixed delay, unless a newer
    /// process has taken over or supervision was shut down in the meantime.
    fn schedule_restart(self: &Arc<Self>, generation: u64) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(service.restart_delay).await;
            {
                let state = service.state.lock();
                if !state.monitoring || state.generation != generation {
                    return;
                }
            }
            info!(domain = %service.domain, "Restarting backend");
            service.restart();
        });
    }

    /// Forward a backend output stream line by line, domain-tagged, to the
    /// operator-visible log.
    fn forward_output<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let domain = self.domain.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(domain = %domain, "{}", line);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_params(port: u16) -> RunParams {
        RunParams {
            command: "sleep".to_string(),
            args: vec!["60".to_string()],
            working_dir: PathBuf::from("."),
            port,
        }
    }

    #[tokio::test]
    async fn test_set_parameters_is_noop_when_unchanged() {
        let service = Service::new("a.test");
        service.set_parameters(sleep_params(4100));
        assert_eq!(service.restarts(), 1);
        assert_eq!(service.port(), Some(4100));

        service.set_parameters(sleep_params(4100));
        assert_eq!(service.restarts(), 1);

        service.shutdown();
    }

    #[tokio::test]
    async fn test_set_parameters_change_triggers_restart() {
        let service = Service::new("a.test");
        service.set_parameters(sleep_params(4101));
        assert_eq!(service.restarts(), 1);

        let mut changed = sleep_params(4101);
        changed.args = vec!["120".to_string()];
        service.set_parameters(changed);
        assert_eq!(service.restarts(), 2);
        // The port is untouched by an argument change.
        assert_eq!(service.port(), Some(4101));

        service.shutdown();
    }

    #[tokio::test]
    async fn test_port_change_triggers_restart() {
        let service = Service::new("a.test");
        service.set_parameters(sleep_params(4102));
        service.set_parameters(sleep_params(4103));
        assert_eq!(service.restarts(), 2);
        assert_eq!(service.port(), Some(4103));

        service.shutdown();
    }

    #[tokio::test]
    async fn test_restart_before_parameters_is_harmless() {
        let service = Service::new("a.test");
        service.restart();
        assert_eq!(service.restarts(), 0);
        assert!(!service.is_monitoring());
        assert_eq!(service.port(), None);
    }

    #[tokio::test]
    async fn test_explicit_restart_keeps_port() {
        let service = Service::new("a.test");
        service.set_parameters(sleep_params(4104));
        let port = service.port();

        service.restart();
        assert_eq!(service.port(), port);
        assert_eq!(service.restarts(), 2);

        service.shutdown();
    }

    #[tokio::test]
    async fn test_exited_backend_is_respawned_after_delay() {
        let service = Service::with_restart_delay("a.test", Duration::from_millis(50));
        // `true` exits immediately, driving the exit -> delay -> restart loop.
        service.set_parameters(RunParams {
            command: "true".to_string(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            port: 4105,
        });
        assert_eq!(service.restarts(), 1);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(service.restarts() >= 2, "backend was never respawned");
        assert!(service.is_monitoring());
        assert_eq!(service.port(), Some(4105));

        service.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_suppresses_pending_restart() {
        let service = Service::with_restart_delay("a.test", Duration::from_millis(50));
        service.set_parameters(RunParams {
            command: "true".to_string(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            port: 4106,
        });
        service.shutdown();
        let after_shutdown = service.restarts();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(service.restarts(), after_shutdown);
        assert!(!service.is_monitoring());
    }

    #[tokio::test]
    async fn test_spawn_failure_schedules_retry() {
        let service = Service::with_restart_delay("a.test", Duration::from_millis(50));
        service.set_parameters(RunParams {
            command: "/nonexistent/backend".to_string(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            port: 4107,
        });
        assert_eq!(service.restarts(), 1);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(service.restarts() >= 2, "spawn failure was never retried");

        service.shutdown();
    }
}
