//! Bundled Tor process supervisor
//!
//! Spawns the tor child with an ephemeral control port, recovers the
//! endpoint from the `control_port` file Tor writes into the data
//! directory, and watches the child for unexpected exit.

pub mod password;

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

/// How long the control-port file may take to appear.
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exact contents of the defaults file handed to the child.
const DEFAULT_TORRC: &str = "SocksPort auto\nAvoidDiskWrites 1\n__ReloadTorrcOnSIGHUP 0\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Ready,
    Failed,
}

/// Notifications pushed to the Manager loop.
#[derive(Debug)]
pub enum ProcessEvent {
    StateChanged(ProcessState),
    LogMessage(String),
    ErrorMessage(String),
}

/// Supervisor for one bundled tor child.
pub struct TorProcess {
    state: ProcessState,
    control_host: String,
    control_port: u16,
    control_password: Option<String>,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    stop_tx: Option<oneshot::Sender<()>>,
    /// Most recent output line, kept for failure reporting.
    last_log_line: Arc<Mutex<String>>,
}

impl TorProcess {
    pub fn new(event_tx: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        Self {
            state: ProcessState::NotStarted,
            control_host: String::new(),
            control_port: 0,
            control_password: None,
            event_tx,
            stop_tx: None,
            last_log_line: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn control_host(&self) -> &str {
        &self.control_host
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn control_password(&self) -> Option<&str> {
        self.control_password.as_deref()
    }

    /// Launch the child and wait for its control endpoint.
    pub async fn start(&mut self, executable: &Path, data_dir: &Path) -> Result<()> {
        self.set_state(ProcessState::Starting);

        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::DataDirUnwritable(data_dir.to_path_buf(), e))?;

        let default_torrc = data_dir.join("default_torrc");
        if !default_torrc.exists() {
            std::fs::write(&default_torrc, DEFAULT_TORRC)
                .map_err(|e| Error::DataDirUnwritable(default_torrc.clone(), e))?;
        }

        // Tor refuses to start without its -f file; an empty one is fine.
        let torrc = data_dir.join("torrc");
        if !torrc.exists() {
            std::fs::write(&torrc, "")
                .map_err(|e| Error::DataDirUnwritable(torrc.clone(), e))?;
        }

        let port_file = data_dir.join("control_port");
        let _ = std::fs::remove_file(&port_file);

        let password = password::generate_control_password();
        let hashed = password::hashed_control_password(&password);

        info!("starting tor: {}", executable.display());
        let mut child = Command::new(executable)
            .arg("--defaults-torrc")
            .arg(&default_torrc)
            .arg("-f")
            .arg(&torrc)
            .arg("DataDirectory")
            .arg(data_dir)
            .arg("HashedControlPassword")
            .arg(&hashed)
            .arg("ControlPort")
            .arg("auto")
            .arg("ControlPortWriteToFile")
            .arg(&port_file)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.set_state(ProcessState::Failed);
                Error::ProcessFailed(format!("cannot spawn {}: {}", executable.display(), e))
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_logs(
                stdout,
                self.event_tx.clone(),
                Arc::clone(&self.last_log_line),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_logs(
                stderr,
                self.event_tx.clone(),
                Arc::clone(&self.last_log_line),
            ));
        }

        match self.await_control_endpoint(&mut child, &port_file).await {
            Ok((host, port)) => {
                info!("tor control endpoint at {}:{}", host, port);
                self.control_host = host;
                self.control_port = port;
                self.control_password = Some(password);

                let (stop_tx, stop_rx) = oneshot::channel();
                self.stop_tx = Some(stop_tx);
                tokio::spawn(watch_child(
                    child,
                    stop_rx,
                    self.event_tx.clone(),
                    Arc::clone(&self.last_log_line),
                ));

                self.set_state(ProcessState::Ready);
                Ok(())
            },
            Err(e) => {
                let _ = child.kill().await;
                let _ = self.event_tx.send(ProcessEvent::ErrorMessage(e.to_string()));
                self.set_state(ProcessState::Failed);
                Err(e)
            },
        }
    }

    /// Poll for the control-port file, failing fast if the child dies.
    async fn await_control_endpoint(
        &self,
        child: &mut Child,
        port_file: &Path,
    ) -> Result<(String, u16)> {
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| Error::ProcessFailed(e.to_string()))?
            {
                let last = self.last_log_line.lock().unwrap().clone();
                return Err(Error::ProcessFailed(format!(
                    "tor exited with {} before becoming ready: {}",
                    status, last
                )));
            }

            if let Ok(contents) = std::fs::read_to_string(port_file) {
                if let Some(endpoint) = parse_control_port_file(&contents) {
                    return Ok(endpoint);
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::ProcessFailed(format!(
                    "control port file {} did not appear within {:?}",
                    port_file.display(),
                    READY_TIMEOUT
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Ask the child to exit. TAKEOWNERSHIP on the control connection
    /// covers the case where we crash before reaching this.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.control_password = None;
        self.set_state(ProcessState::NotStarted);
    }

    fn set_state(&mut self, state: ProcessState) {
        if self.state != state {
            self.state = state;
            let _ = self.event_tx.send(ProcessEvent::StateChanged(state));
        }
    }
}

/// `PORT=HOST:PORT` as written by `ControlPortWriteToFile`.
fn parse_control_port_file(contents: &str) -> Option<(String, u16)> {
    let line = contents.lines().find(|l| l.starts_with("PORT="))?;
    let endpoint = &line["PORT=".len()..];
    let (host, port) = endpoint.rsplit_once(':')?;
    let port: u16 = port.trim().parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

async fn forward_logs(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    last_line: Arc<Mutex<String>>,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        debug!("tor: {}", line);
        *last_line.lock().unwrap() = line.clone();
        if event_tx.send(ProcessEvent::LogMessage(line)).is_err() {
            break;
        }
    }
}

async fn watch_child(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    last_line: Arc<Mutex<String>>,
) {
    tokio::select! {
        _ = stop_rx => {
            debug!("stopping tor child");
            let _ = child.kill().await;
            let _ = child.wait().await;
        },
        status = child.wait() => {
            let last = last_line.lock().unwrap().clone();
            let message = match status {
                Ok(s) => format!("tor exited unexpectedly with {}: {}", s, last),
                Err(e) => format!("tor wait failed: {}", e),
            };
            warn!("{}", message);
            let _ = event_tx.send(ProcessEvent::ErrorMessage(message));
            let _ = event_tx.send(ProcessEvent::StateChanged(ProcessState::Failed));
        },
    }
}

/// Locate a tor executable: explicit configuration, beside our own binary,
/// the homebrew keg, then `$PATH`.
pub fn tor_executable_path(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        return None;
    }

    let filename = if cfg!(windows) { "tor.exe" } else { "tor" };

    if let Ok(own) = std::env::current_exe() {
        if let Some(dir) = own.parent() {
            let candidate = dir.join(filename);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    let brew = Path::new("/usr/local/opt/tor/bin").join(filename);
    if brew.exists() {
        return Some(brew);
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(filename);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

pub fn is_tor_available(configured: Option<&Path>) -> bool {
    tor_executable_path(configured).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_file() {
        assert_eq!(
            parse_control_port_file("PORT=127.0.0.1:9151\n"),
            Some(("127.0.0.1".to_string(), 9151))
        );
        assert_eq!(
            parse_control_port_file("UNIX_PORT=/run/tor\nPORT=127.0.0.1:40001\n"),
            Some(("127.0.0.1".to_string(), 40001))
        );
        assert_eq!(parse_control_port_file(""), None);
        assert_eq!(parse_control_port_file("PORT=127.0.0.1:"), None);
        assert_eq!(parse_control_port_file("PORT=bogus"), None);
        assert_eq!(parse_control_port_file("PORT=127.0.0.1:0"), None);
    }

    #[test]
    fn default_torrc_content_is_exact() {
        assert_eq!(
            DEFAULT_TORRC,
            "SocksPort auto\nAvoidDiskWrites 1\n__ReloadTorrcOnSIGHUP 0\n"
        );
    }

    #[test]
    fn configured_executable_must_exist() {
        assert!(tor_executable_path(Some(Path::new("/nonexistent/tor"))).is_none());
        assert!(!is_tor_available(Some(Path::new("/nonexistent/tor"))));
    }
}
