//! Process supervisor - spawns, probes and terminates dev servers
//!
//! One dev server runs per site. Each run gets a fresh port from the
//! registry counter; the port doubles as the run's generation so that the exit
//! of a replaced process never touches the record of its successor.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout};

use crate::config::CommandTemplate;
use crate::defaults;
use crate::registry::{ExitInfo, PreviewRecord, PreviewState, Registry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to launch dev server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dev server on port {port} exited during startup ({})", describe_exit(.exit))]
    ExitedDuringStartup { port: u16, exit: Option<ExitInfo> },
}

fn describe_exit(exit: &Option<ExitInfo>) -> String {
    match exit {
        Some(ExitInfo { code: Some(code), .. }) => format!("exit code {code}"),
        Some(ExitInfo {
            signal: Some(signal),
            ..
        }) => format!("signal {signal}"),
        _ => "stopped".to_string(),
    }
}

/// Ownership token for a live dev server process.
///
/// The `Child` itself lives in the exit watcher task; the handle can signal
/// the process group and ask the watcher to escalate if it does not exit.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send SIGTERM to the process group. Fire-and-forget: the exit watcher
    /// follows up with SIGKILL after a grace period.
    pub fn terminate(mut self) -> Result<(), std::io::Error> {
        let result = signal_group(self.pid, libc::SIGTERM);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        result
    }
}

fn signal_group(pid: u32, signal: libc::c_int) -> Result<(), std::io::Error> {
    if pid == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "process id unknown",
        ));
    }
    // Dev servers are spawned as group leaders, so the pgid equals the pid.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Result of a successful start
#[derive(Debug, Clone)]
pub struct StartedServer {
    pub port: u16,
    pub pid: u32,
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

pub struct Supervisor {
    registry: Arc<Registry>,
    dev_command: CommandTemplate,
    readiness_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        dev_command: CommandTemplate,
        readiness_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            dev_command,
            readiness_timeout,
        }
    }

    /// Launch the dev server for a site and wait until it accepts connections.
    ///
    /// The record is `starting` while the probe runs and `running` afterwards.
    /// If the probe times out while the process is alive, the record still
    /// becomes `running` and a warning is returned.
    pub async fn start(&self, site_id: &str, workspace: &Path) -> Result<StartedServer, SupervisorError> {
        let port = self.registry.allocate_port()?;
        let mut warnings = Vec::new();

        if let Some(previous) = self.registry.insert(PreviewRecord::starting(site_id, port)) {
            let pid = previous.pid();
            if let Err(e) = previous.terminate() {
                warnings.push(format!("failed to signal previous dev server (pid {pid}): {e}"));
            }
        }

        let argv = self.dev_command.render(Some(port));
        tracing::info!(
            site = %site_id,
            port = port,
            command = %argv.join(" "),
            "Starting dev server"
        );

        let mut child = match spawn_dev_server(&argv, workspace, port) {
            Ok(child) => child,
            Err(source) => {
                self.registry.mark_stopped(site_id);
                return Err(SupervisorError::Spawn {
                    command: argv.join(" "),
                    source,
                });
            }
        };

        let pid = child.id().unwrap_or_default();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, site_id.to_string(), OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, site_id.to_string(), OutputStream::Stderr));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = ProcessHandle {
            pid,
            stop_tx: Some(stop_tx),
        };
        if let Some(orphan) = self.registry.set_process(site_id, port, handle) {
            // Record was replaced while spawning; this run is already obsolete.
            let _ = orphan.terminate();
        }

        tokio::spawn(watch_exit(
            child,
            pid,
            site_id.to_string(),
            port,
            self.registry.clone(),
            stop_rx,
        ));

        let upstream = match self.wait_for_ready(site_id, port).await {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                let message = format!(
                    "dev server did not accept connections on port {} within {}s",
                    port,
                    self.readiness_timeout.as_secs()
                );
                tracing::warn!(site = %site_id, port = port, "{}", message);
                warnings.push(message);
                SocketAddr::from((Ipv4Addr::LOCALHOST, port))
            }
            Err(e) => return Err(e),
        };

        if !self.registry.mark_running(site_id, port, pid, upstream) {
            let exit = match self.registry.get(site_id).map(|s| s.state) {
                Some(PreviewState::Stopped { exit }) => exit,
                _ => None,
            };
            return Err(SupervisorError::ExitedDuringStartup { port, exit });
        }

        tracing::info!(site = %site_id, port = port, pid = pid, upstream = %upstream, "Dev server is running");

        Ok(StartedServer {
            port,
            pid,
            warnings,
        })
    }

    /// Poll the port until something accepts a TCP connection.
    ///
    /// `Ok(None)` means the timeout elapsed with the process still alive.
    async fn wait_for_ready(&self, site_id: &str, port: u16) -> Result<Option<SocketAddr>, SupervisorError> {
        let deadline = Instant::now() + self.readiness_timeout;
        let candidates = [
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
        ];
        let mut interval = tokio::time::interval(defaults::READINESS_PROBE_INTERVAL);
        let mut attempts = 0u32;

        loop {
            interval.tick().await;

            match self.registry.get(site_id) {
                Some(snapshot) if snapshot.port == port && !snapshot.state.is_stopped() => {}
                Some(snapshot) if snapshot.port == port => {
                    let exit = match snapshot.state {
                        PreviewState::Stopped { exit } => exit,
                        _ => None,
                    };
                    return Err(SupervisorError::ExitedDuringStartup { port, exit });
                }
                _ => return Err(SupervisorError::ExitedDuringStartup { port, exit: None }),
            }

            for addr in candidates {
                if let Ok(Ok(_)) =
                    timeout(defaults::READINESS_CONNECT_TIMEOUT, TcpStream::connect(addr)).await
                {
                    tracing::debug!(site = %site_id, attempts = attempts, addr = %addr, "Readiness probe succeeded");
                    return Ok(Some(addr));
                }
            }

            attempts += 1;
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Stop the site's dev server. Signal failures are returned as warnings;
    /// the record is marked stopped either way.
    pub fn stop(&self, site_id: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(handle) = self.registry.mark_stopped(site_id) {
            let pid = handle.pid();
            tracing::info!(site = %site_id, pid = pid, "Stopping dev server");
            if let Err(e) = handle.terminate() {
                tracing::warn!(site = %site_id, pid = pid, "Failed to signal dev server: {}", e);
                warnings.push(format!("failed to signal dev server (pid {pid}): {e}"));
            }
        }
        warnings
    }
}

fn spawn_dev_server(argv: &[String], workspace: &Path, port: u16) -> Result<Child, std::io::Error> {
    let Some((program, args)) = argv.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty dev command",
        ));
    };
    Command::new(program)
        .args(args)
        .current_dir(workspace)
        .env("PORT", port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
}

async fn forward_output<R>(reader: R, site_id: String, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match stream {
            OutputStream::Stdout => tracing::info!(site = %site_id, "{}", line),
            OutputStream::Stderr => tracing::warn!(site = %site_id, "{}", line),
        }
    }
}

async fn watch_exit(
    mut child: Child,
    pid: u32,
    site_id: String,
    port: u16,
    registry: Arc<Registry>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        requested = &mut stop_rx => {
            if requested.is_ok() {
                match timeout(defaults::STOP_GRACE_PERIOD, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        tracing::warn!(site = %site_id, pid = pid, "Dev server ignored SIGTERM, killing");
                        let _ = signal_group(pid, libc::SIGKILL);
                        child.wait().await
                    }
                }
            } else {
                child.wait().await
            }
        }
    };

    let exit = match status {
        Ok(status) => exit_info(status),
        Err(e) => {
            tracing::warn!(site = %site_id, pid = pid, "Failed to wait on dev server: {}", e);
            ExitInfo {
                code: None,
                signal: None,
                at: Utc::now(),
            }
        }
    };

    if registry.mark_exited(&site_id, port, exit) {
        tracing::info!(
            site = %site_id,
            port = port,
            code = ?exit.code,
            signal = ?exit.signal,
            "Dev server exited"
        );
    } else {
        tracing::debug!(site = %site_id, port = port, "Replaced dev server exited");
    }
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
        at: Utc::now(),
    }
}
