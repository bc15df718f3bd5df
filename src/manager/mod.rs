//! Top-level Tor manager
//!
//! Glues the process supervisor, the control connection, and the hidden
//! service together on a single event loop. External callers hold a
//! [`TorManager`] handle from any thread; every operation is marshalled
//! onto the loop through a request channel.

pub mod persist;

use crate::config::Config;
use crate::control::command::Event;
use crate::control::{ConnectionStatus, ControlEvent, TorControl, TorStatus};
use crate::crypto::OnionKey;
use crate::error::{Error, Result};
use crate::friends::FriendRequester;
use crate::process::{self, ProcessEvent, ProcessState, TorProcess};
use crate::service::{HiddenService, HsStatus};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Retained log history, matching what the UI can usefully show.
const MAX_LOG_LINES: usize = 50;

/// Events surfaced to the host application.
#[derive(Debug, Clone)]
pub enum TorManagerEvent {
    /// torrc is missing/empty, or DisableNetwork=1.
    ConfigurationNeeded,
    Error(String),
    HiddenServiceStatusChanged { old: HsStatus, new: HsStatus },
    BootstrapProgress(HashMap<String, String>),
}

/// Snapshot of the published hidden service.
#[derive(Debug, Clone)]
pub struct HiddenServiceInfo {
    pub service_id: String,
    pub onion_address: String,
    pub service_port: u16,
    pub target_address: String,
    pub target_port: u16,
}

/// Handle to the manager loop. Clone freely; all clones address the same
/// loop.
#[derive(Clone)]
pub struct TorManager {
    req_tx: mpsc::UnboundedSender<Request>,
    events_tx: broadcast::Sender<TorManagerEvent>,
}

enum Request {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
    AttachFriendRequester(FriendRequester),
    HiddenServiceInfo(oneshot::Sender<Option<HiddenServiceInfo>>),
    ProxyServerInfo(oneshot::Sender<Option<(String, u16)>>),
    BootstrapStatus(oneshot::Sender<HashMap<String, String>>),
    TorStatus(oneshot::Sender<TorStatus>),
    ConnectivityStatus(oneshot::Sender<ConnectionStatus>),
    HiddenServiceStatus(oneshot::Sender<HsStatus>),
    LogMessages(oneshot::Sender<Vec<String>>),
    ErrorMessage(oneshot::Sender<Option<String>>),
    ConfigurationNeeded(oneshot::Sender<bool>),
}

/// Everything the loop can be woken by.
enum LoopMsg {
    Request(Request),
    Process(ProcessEvent),
    Control(ControlEvent),
    TorEvent(Event),
    SocketClosed(Error),
}

impl TorManager {
    /// Create the manager and spawn its event loop. Nothing touches the
    /// filesystem or spawns tor until [`start`](Self::start).
    pub fn new(config: Config) -> Self {
        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<Request>();
        let (events_tx, _) = broadcast::channel(64);
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();

        // Requests funnel into the same loop as every other wakeup source.
        {
            let loop_tx = loop_tx.clone();
            tokio::spawn(async move {
                while let Some(req) = req_rx.recv().await {
                    if loop_tx.send(LoopMsg::Request(req)).is_err() {
                        break;
                    }
                }
            });
        }

        let state = ManagerState::new(config, events_tx.clone(), loop_tx.clone());
        tokio::spawn(run_manager(state, loop_rx));

        Self { req_tx, events_tx }
    }

    /// Subscribe to manager events. Safe to call before `start`.
    pub fn subscribe(&self) -> broadcast::Receiver<TorManagerEvent> {
        self.events_tx.subscribe()
    }

    /// Launch tor and bring the hidden service up. Completes once the
    /// control connection is established (or the attempt failed).
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.req_tx.send(Request::Start(tx)).is_err() {
            return Err(Error::ConnectionLost);
        }
        rx.await.unwrap_or(Err(Error::ConnectionLost))
    }

    /// Ordered shutdown: friend requester, control socket, child process.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.req_tx.send(Request::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Hand over a running friend requester; it is stopped with the manager.
    pub fn attach_friend_requester(&self, requester: FriendRequester) {
        let _ = self.req_tx.send(Request::AttachFriendRequester(requester));
    }

    pub async fn hidden_service_info(&self) -> Option<HiddenServiceInfo> {
        self.request(Request::HiddenServiceInfo, None).await
    }

    /// SOCKS proxy endpoint once tor has bound it (port > 1023).
    pub async fn proxy_server_info(&self) -> Option<(String, u16)> {
        self.request(Request::ProxyServerInfo, None).await
    }

    pub async fn bootstrap_status(&self) -> HashMap<String, String> {
        self.request(Request::BootstrapStatus, HashMap::new()).await
    }

    pub async fn tor_status(&self) -> TorStatus {
        self.request(Request::TorStatus, TorStatus::Unknown).await
    }

    pub async fn connectivity_status(&self) -> ConnectionStatus {
        self.request(Request::ConnectivityStatus, ConnectionStatus::NotConnected)
            .await
    }

    pub async fn hidden_service_status(&self) -> HsStatus {
        self.request(Request::HiddenServiceStatus, HsStatus::NotCreated)
            .await
    }

    /// Most recent tor output, capped at 50 lines.
    pub async fn log_messages(&self) -> Vec<String> {
        self.request(Request::LogMessages, Vec::new()).await
    }

    pub async fn error_message(&self) -> Option<String> {
        self.request(Request::ErrorMessage, None).await
    }

    pub async fn configuration_needed(&self) -> bool {
        self.request(Request::ConfigurationNeeded, false).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
        fallback: T,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        if self.req_tx.send(make(tx)).is_err() {
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }
}

struct ManagerState {
    config: Config,
    process: Option<TorProcess>,
    control: TorControl,
    friends: Option<FriendRequester>,
    log_messages: VecDeque<String>,
    error_message: Option<String>,
    config_needed: bool,
    started: bool,
    events_tx: broadcast::Sender<TorManagerEvent>,
    loop_tx: mpsc::UnboundedSender<LoopMsg>,
    /// Keeps the process-event forwarder alive across restarts.
    process_event_tx: mpsc::UnboundedSender<ProcessEvent>,
}

impl ManagerState {
    fn new(
        config: Config,
        events_tx: broadcast::Sender<TorManagerEvent>,
        loop_tx: mpsc::UnboundedSender<LoopMsg>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        forward(control_rx, loop_tx.clone(), LoopMsg::Control);

        let (process_event_tx, process_event_rx) = mpsc::unbounded_channel();
        forward(process_event_rx, loop_tx.clone(), LoopMsg::Process);

        Self {
            config,
            process: None,
            control: TorControl::new(control_tx),
            friends: None,
            log_messages: VecDeque::new(),
            error_message: None,
            config_needed: false,
            started: false,
            events_tx,
            loop_tx,
            process_event_tx,
        }
    }

    async fn handle_start(&mut self) -> Result<()> {
        if self.started {
            debug!("start() called twice; ignoring");
            return Ok(());
        }
        self.error_message = None;
        // A failed earlier attempt may have left a child behind.
        if let Some(mut stale) = self.process.take() {
            stale.stop();
        }

        let executable = process::tor_executable_path(self.config.tor.executable.as_deref())
            .ok_or(Error::ExecutableMissing)
            .map_err(|e| self.record_error(e))?;

        // An absent or empty torrc means the operator has never configured
        // this instance; say so before spawning anything.
        let torrc = self.config.tor.data_dir.join("torrc");
        let torrc_empty = std::fs::metadata(&torrc).map(|m| m.len() == 0).unwrap_or(true);
        if torrc_empty && !self.config_needed {
            self.config_needed = true;
            self.emit(TorManagerEvent::ConfigurationNeeded);
        }

        self.setup_hidden_service().map_err(|e| self.record_error(e))?;

        let mut process = TorProcess::new(self.process_event_tx.clone());
        process
            .start(&executable, &self.config.tor.data_dir)
            .await
            .map_err(|e| self.record_error(e))?;

        let host = process.control_host().to_string();
        let port = process.control_port();
        let password = process.control_password().map(str::to_string);
        self.process = Some(process);

        self.connect_control(&host, port, password.as_deref()).await
            .map_err(|e| self.record_error(e))?;

        self.started = true;
        Ok(())
    }

    /// Load or create the service identity before anything is published.
    fn setup_hidden_service(&mut self) -> Result<()> {
        if !self.control.services().is_empty() {
            return Ok(());
        }

        let hs_dir = &self.config.tor.hidden_service_dir;
        std::fs::create_dir_all(hs_dir)
            .map_err(|e| Error::DataDirUnwritable(hs_dir.clone(), e))?;

        let mut service = match persist::load_private_key(hs_dir) {
            Some(Ok(key)) => {
                info!("loaded service identity {}", key.service_id());
                HiddenService::with_key(key)
            },
            Some(Err(e)) => return Err(e),
            None => {
                info!("no persisted key; tor will mint one on publish");
                HiddenService::new()
            },
        };

        let svc = &self.config.service;
        service.add_target(svc.service_port, svc.target_address.clone(), svc.target_port);
        self.control.add_hidden_service(service);
        Ok(())
    }

    async fn connect_control(
        &mut self,
        host: &str,
        port: u16,
        password: Option<&str>,
    ) -> Result<()> {
        // We launched the child, so we own it: tor exits with this socket.
        let own_pid = Some(std::process::id());
        let (event_rx, closed_rx) = self.control.connect(host, port, password, own_pid).await?;

        forward(event_rx, self.loop_tx.clone(), LoopMsg::TorEvent);
        forward(closed_rx, self.loop_tx.clone(), LoopMsg::SocketClosed);
        Ok(())
    }

    fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::LogMessage(line) => {
                if self.log_messages.len() >= MAX_LOG_LINES {
                    self.log_messages.pop_front();
                }
                self.log_messages.push_back(line);
            },
            ProcessEvent::ErrorMessage(message) => {
                self.record_error(Error::ProcessFailed(message));
            },
            ProcessEvent::StateChanged(state) => {
                debug!("tor process state: {:?}", state);
                if state == ProcessState::Failed && self.error_message.is_none() {
                    self.record_error(Error::ProcessFailed("tor process failed".into()));
                }
            },
        }
    }

    fn handle_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::StatusChanged { old, new } => {
                debug!("control connectivity {:?} -> {:?}", old, new);
            },
            ControlEvent::TorStatusChanged { old, new } => {
                debug!("tor status {:?} -> {:?}", old, new);
            },
            ControlEvent::BootstrapProgress(map) => {
                self.emit(TorManagerEvent::BootstrapProgress(map));
            },
            ControlEvent::ConfigurationNeeded => {
                if !self.config_needed {
                    self.config_needed = true;
                    self.emit(TorManagerEvent::ConfigurationNeeded);
                }
            },
            ControlEvent::ServiceStatusChanged { old, new, .. } => {
                self.emit(TorManagerEvent::HiddenServiceStatusChanged { old, new });
            },
            ControlEvent::ServiceKeyAdopted(key) => self.persist_key(&key),
            ControlEvent::ServiceHostnameChanged(hostname) => {
                let hs_dir = self.config.tor.hidden_service_dir.clone();
                if let Err(e) = persist::save_hostname(&hs_dir, &hostname) {
                    self.record_error(e);
                }
            },
            ControlEvent::Error(message) => {
                self.set_error_message(message);
            },
        }
    }

    fn persist_key(&mut self, key: &OnionKey) {
        let hs_dir = self.config.tor.hidden_service_dir.clone();
        info!("persisting new service identity {}", key.service_id());
        if let Err(e) = persist::save_private_key(&hs_dir, key) {
            self.record_error(e);
        }
    }

    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Start(ack) => {
                let result = self.handle_start().await;
                let _ = ack.send(result);
            },
            Request::Stop(ack) => {
                self.shutdown();
                let _ = ack.send(());
                return false;
            },
            Request::AttachFriendRequester(requester) => {
                self.friends = Some(requester);
            },
            Request::HiddenServiceInfo(tx) => {
                let _ = tx.send(self.hidden_service_info());
            },
            Request::ProxyServerInfo(tx) => {
                let info = self
                    .control
                    .socks_address()
                    .filter(|(_, port)| *port > 1023)
                    .map(|(host, port)| (host.to_string(), port));
                let _ = tx.send(info);
            },
            Request::BootstrapStatus(tx) => {
                let _ = tx.send(self.control.bootstrap_status());
            },
            Request::TorStatus(tx) => {
                let _ = tx.send(self.control.tor_status());
            },
            Request::ConnectivityStatus(tx) => {
                let _ = tx.send(self.control.status());
            },
            Request::HiddenServiceStatus(tx) => {
                let status = self
                    .control
                    .services()
                    .first()
                    .map(|s| s.status())
                    .unwrap_or(HsStatus::NotCreated);
                let _ = tx.send(status);
            },
            Request::LogMessages(tx) => {
                let _ = tx.send(self.log_messages.iter().cloned().collect());
            },
            Request::ErrorMessage(tx) => {
                let _ = tx.send(self.error_message.clone());
            },
            Request::ConfigurationNeeded(tx) => {
                let _ = tx.send(self.config_needed);
            },
        }
        true
    }

    fn hidden_service_info(&self) -> Option<HiddenServiceInfo> {
        let service = self.control.services().first()?;
        let service_id = service.service_id()?;
        let target = service.targets().first()?;
        Some(HiddenServiceInfo {
            onion_address: format!("{}.onion", service_id),
            service_id,
            service_port: target.service_port,
            target_address: target.target_address.clone(),
            target_port: target.target_port,
        })
    }

    fn shutdown(&mut self) {
        info!("shutting down tor manager");
        if let Some(friends) = self.friends.take() {
            friends.stop();
        }
        self.control.shutdown();
        if let Some(mut process) = self.process.take() {
            process.stop();
        }
        self.started = false;
    }

    fn record_error(&mut self, error: Error) -> Error {
        self.set_error_message(error.to_string());
        error
    }

    fn set_error_message(&mut self, message: String) {
        warn!("tor manager error: {}", message);
        self.error_message = Some(message.clone());
        self.emit(TorManagerEvent::Error(message));
    }

    fn emit(&self, event: TorManagerEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}

async fn run_manager(mut state: ManagerState, mut loop_rx: mpsc::UnboundedReceiver<LoopMsg>) {
    while let Some(msg) = loop_rx.recv().await {
        match msg {
            LoopMsg::Request(req) => {
                if !state.handle_request(req).await {
                    break;
                }
            },
            LoopMsg::Process(ev) => state.handle_process_event(ev),
            LoopMsg::Control(ev) => state.handle_control_event(ev),
            LoopMsg::TorEvent(ev) => state.control.handle_event(&ev),
            LoopMsg::SocketClosed(err) => {
                state.control.handle_connection_lost(&err);
            },
        }
    }
    debug!("manager loop exited");
}

/// Funnel a channel into the manager loop.
fn forward<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<T>,
    tx: mpsc::UnboundedSender<LoopMsg>,
    wrap: impl Fn(T) -> LoopMsg + Send + 'static,
) {
    tokio::spawn(async move {
        while let Some(value) = rx.recv().await {
            if tx.send(wrap(value)).is_err() {
                break;
            }
        }
    });
}
