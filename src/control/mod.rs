//! Tor control connection state machine
//!
//! Owns the [`ControlSocket`], drives authentication, keeps the daemon's
//! bootstrap/circuit status, and publishes the hidden services it owns.
//! All mutation happens on the Manager's event loop; the async methods here
//! only suspend on socket I/O.

pub mod command;
pub mod commands;
pub mod socket;

use crate::control::command::{split_quoted, Event, Reply};
use crate::control::commands::{
    choose_method, safecookie_client_hash, safecookie_server_hash, AddOnion, AuthChallenge,
    AuthMethod, Authenticate, GetConf, ProtocolInfo, SetConf, SetEvents, TakeOwnership,
};
use crate::crypto::OnionKey;
use crate::error::{Error, Result};
use crate::service::{HiddenService, HsStatus};
use socket::ControlSocket;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Bound on the PROTOCOLINFO/AUTHENTICATE exchange after TCP connect.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

const SUBSCRIBED_EVENTS: [&str; 3] = ["STATUS_CLIENT", "STATUS_GENERAL", "HS_DESC"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Authenticating,
    Connected,
    Error,
}

/// What we know about the daemon's network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorStatus {
    Unknown,
    Offline,
    Ready,
}

/// Notifications from the control layer to the Manager loop.
#[derive(Debug)]
pub enum ControlEvent {
    StatusChanged {
        old: ConnectionStatus,
        new: ConnectionStatus,
    },
    TorStatusChanged {
        old: TorStatus,
        new: TorStatus,
    },
    BootstrapProgress(HashMap<String, String>),
    ConfigurationNeeded,
    ServiceStatusChanged {
        service_id: String,
        old: HsStatus,
        new: HsStatus,
    },
    /// Tor minted a key for a NEW service; the owner must persist it.
    ServiceKeyAdopted(OnionKey),
    ServiceHostnameChanged(String),
    Error(String),
}

pub struct TorControl {
    socket: Option<ControlSocket>,
    status: ConnectionStatus,
    tor_status: TorStatus,
    bootstrap: HashMap<String, String>,
    socks_address: Option<(String, u16)>,
    services: Vec<HiddenService>,
    notify_tx: mpsc::UnboundedSender<ControlEvent>,
}

impl TorControl {
    pub fn new(notify_tx: mpsc::UnboundedSender<ControlEvent>) -> Self {
        Self {
            socket: None,
            status: ConnectionStatus::NotConnected,
            tor_status: TorStatus::Unknown,
            bootstrap: HashMap::new(),
            socks_address: None,
            services: Vec::new(),
            notify_tx,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn tor_status(&self) -> TorStatus {
        self.tor_status
    }

    /// Last seen bootstrap key/value pairs (`PROGRESS`, `TAG`, `SUMMARY`, …).
    pub fn bootstrap_status(&self) -> HashMap<String, String> {
        self.bootstrap.clone()
    }

    /// SOCKS proxy endpoint, once discovered.
    pub fn socks_address(&self) -> Option<(&str, u16)> {
        self.socks_address.as_ref().map(|(h, p)| (h.as_str(), *p))
    }

    pub fn services(&self) -> &[HiddenService] {
        &self.services
    }

    /// Hand a hidden service to the controller. Published on connect, or
    /// immediately when already connected (caller runs `publish_services`).
    pub fn add_hidden_service(&mut self, service: HiddenService) {
        self.services.push(service);
    }

    /// Connect, authenticate, subscribe, query initial state, take
    /// ownership, publish pending services.
    ///
    /// Returns the event stream and the closed-notification stream the
    /// Manager loop must drain.
    pub async fn connect(
        &mut self,
        host: &str,
        port: u16,
        password: Option<&str>,
        owned_pid: Option<u32>,
    ) -> Result<(
        mpsc::UnboundedReceiver<Event>,
        mpsc::UnboundedReceiver<Error>,
    )> {
        self.set_status(ConnectionStatus::Connecting);

        let (socket, closed_rx) = match ControlSocket::connect(host, port).await {
            Ok(pair) => pair,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            },
        };
        self.socket = Some(socket);

        self.set_status(ConnectionStatus::Authenticating);
        match timeout(AUTH_TIMEOUT, self.authenticate(password)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                self.fail(&e);
                return Err(e);
            },
            Err(_) => {
                let e = Error::AuthFailed(format!("no authentication within {:?}", AUTH_TIMEOUT));
                self.fail(&e);
                return Err(e);
            },
        }
        self.set_status(ConnectionStatus::Connected);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        {
            let socket = self.socket.as_ref().expect("socket set above");
            for keyword in SUBSCRIBED_EVENTS {
                socket.register_event(keyword, event_tx.clone());
            }
        }

        match self.post_connect(owned_pid).await {
            Ok(()) => Ok((event_rx, closed_rx)),
            Err(e) => {
                self.fail(&e);
                Err(e)
            },
        }
    }

    /// Close the connection deliberately. With TAKEOWNERSHIP in effect this
    /// also asks Tor to exit.
    pub fn shutdown(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.shutdown();
        }
        self.set_status(ConnectionStatus::NotConnected);
        self.set_tor_status(TorStatus::Unknown);
    }

    /// Called by the Manager loop when the socket task reports death.
    pub fn handle_connection_lost(&mut self, error: &Error) {
        self.socket = None;
        self.set_status(ConnectionStatus::Error);
        self.set_tor_status(TorStatus::Unknown);
        let _ = self
            .notify_tx
            .send(ControlEvent::Error(error.to_string()));
    }

    async fn send(&self, line: String) -> Result<Reply> {
        let socket = self.socket.as_ref().ok_or(Error::ConnectionLost)?;
        socket.send_command(line).await
    }

    async fn authenticate(&mut self, password: Option<&str>) -> Result<()> {
        let info = ProtocolInfo::parse(&self.send(ProtocolInfo::line()).await?)?;
        debug!("tor advertises auth methods {:?}", info.methods);

        // Restrict to methods we hold credentials for.
        let usable: Vec<AuthMethod> = info
            .methods
            .iter()
            .copied()
            .filter(|m| match m {
                AuthMethod::Null => true,
                AuthMethod::HashedPassword => password.is_some(),
                AuthMethod::Cookie | AuthMethod::SafeCookie => info.cookie_file.is_some(),
            })
            .collect();

        let method = choose_method(&usable).ok_or_else(|| {
            Error::AuthFailed(format!(
                "no usable authentication method among {:?}",
                info.methods
            ))
        })?;
        info!("authenticating via {:?}", method);

        let request = match method {
            AuthMethod::Null => Authenticate::Null,
            AuthMethod::HashedPassword => {
                Authenticate::Password(password.expect("filtered above").to_string())
            },
            AuthMethod::Cookie => {
                let cookie = read_cookie(info.cookie_file.as_deref().expect("filtered above"))?;
                Authenticate::Cookie(cookie)
            },
            AuthMethod::SafeCookie => {
                let cookie = read_cookie(info.cookie_file.as_deref().expect("filtered above"))?;
                let challenge = AuthChallenge::new();
                let reply = AuthChallenge::parse(&self.send(challenge.line()).await?)?;

                let expected = safecookie_server_hash(
                    &cookie,
                    &challenge.client_nonce,
                    &reply.server_nonce,
                );
                if reply.server_hash != expected {
                    return Err(Error::AuthFailed(
                        "server failed the safe-cookie proof; wrong cookie file?".into(),
                    ));
                }
                Authenticate::SafeCookie(safecookie_client_hash(
                    &cookie,
                    &challenge.client_nonce,
                    &reply.server_nonce,
                ))
            },
        };

        Authenticate::parse(&self.send(request.line()).await?)
    }

    /// The fixed post-authentication sequence.
    async fn post_connect(&mut self, owned_pid: Option<u32>) -> Result<()> {
        let reply = self.send(SetEvents::new(SUBSCRIBED_EVENTS).line()).await?;
        SetEvents::parse(&reply)?;

        let reply = self
            .send(GetConf::info(["status/bootstrap-phase"]).line())
            .await?;
        let values = GetConf::parse(&reply)?;
        if let Some(phase) = values.first("status/bootstrap-phase") {
            self.update_bootstrap(&split_quoted(phase));
        }

        let reply = self.send(GetConf::conf(["DisableNetwork"]).line()).await?;
        let values = GetConf::parse(&reply)?;
        if values.first("DisableNetwork") == Some("1") {
            info!("DisableNetwork=1: operator configuration required");
            let _ = self.notify_tx.send(ControlEvent::ConfigurationNeeded);
        }

        self.discover_socks_endpoint().await?;

        if let Some(pid) = owned_pid {
            TakeOwnership::parse(&self.send(TakeOwnership::line()).await?)?;
            let setconf = SetConf::new("__OwningControllerProcess", pid.to_string());
            SetConf::parse(&self.send(setconf.line()).await?)?;
        }

        self.publish_services().await
    }

    /// `GETCONF SocksPort` under our defaults says `auto`; the actually
    /// bound listener comes from GETINFO.
    async fn discover_socks_endpoint(&mut self) -> Result<()> {
        let reply = self.send(GetConf::conf(["SocksPort"]).line()).await?;
        let values = GetConf::parse(&reply)?;
        let configured = values.first("SocksPort").unwrap_or("").to_string();

        if let Some(endpoint) = parse_socks_endpoint(&configured) {
            self.socks_address = Some(endpoint);
            return Ok(());
        }

        let reply = self
            .send(GetConf::info(["net/listeners/socks"]).line())
            .await?;
        let values = GetConf::parse(&reply)?;
        if let Some(listeners) = values.first("net/listeners/socks") {
            if let Some(first) = split_quoted(listeners).into_iter().next() {
                if let Some(endpoint) = parse_socks_endpoint(&first) {
                    info!("socks proxy at {}:{}", endpoint.0, endpoint.1);
                    self.socks_address = Some(endpoint);
                }
            }
        }
        Ok(())
    }

    /// Issue ADD_ONION for every service not yet registered.
    pub async fn publish_services(&mut self) -> Result<()> {
        let notify = self.notify_tx.clone();
        for idx in 0..self.services.len() {
            if self.services[idx].status() != HsStatus::NotCreated {
                continue;
            }

            let line = AddOnion {
                key: self.services[idx].key(),
                targets: self.services[idx].targets(),
            }
            .line();
            let had_key = self.services[idx].key().is_some();

            let reply = self.send(line).await?;
            let parsed = AddOnion::parse(&reply)?;

            let service = &mut self.services[idx];
            if had_key {
                // The id is derived from our key; Tor disagreeing means the
                // key material is corrupt or the daemon is lying.
                let derived = service.service_id().expect("service has a key");
                if derived != parsed.service_id {
                    return Err(Error::ProtocolViolation(format!(
                        "service id mismatch: derived {} but tor reports {}",
                        derived, parsed.service_id
                    )));
                }
            } else {
                let key = parsed.key.ok_or_else(|| {
                    Error::ProtocolViolation("ADD_ONION NEW reply carried no PrivateKey".into())
                })?;
                if key.service_id() != parsed.service_id {
                    return Err(Error::ProtocolViolation(format!(
                        "returned key derives {} but tor reports {}",
                        key.service_id(),
                        parsed.service_id
                    )));
                }
                service.adopt_key(key.clone());
                let _ = notify.send(ControlEvent::ServiceKeyAdopted(key));
            }

            let hostname = service.hostname().expect("key present after publish");
            info!("hidden service registered: {}", hostname);
            let _ = notify.send(ControlEvent::ServiceHostnameChanged(hostname));

            if let Some((old, new)) = service.set_status(HsStatus::Offline) {
                let _ = notify.send(ControlEvent::ServiceStatusChanged {
                    service_id: parsed.service_id,
                    old,
                    new,
                });
            }
        }
        Ok(())
    }

    /// Apply one asynchronous event from the socket.
    pub fn handle_event(&mut self, event: &Event) {
        match event.keyword.as_str() {
            "STATUS_CLIENT" | "STATUS_GENERAL" => self.handle_status_event(event),
            "HS_DESC" => self.handle_hs_desc_event(event),
            other => debug!("ignoring {} event", other),
        }
    }

    fn handle_status_event(&mut self, event: &Event) {
        let Some(first) = event.lines.first() else {
            return;
        };
        let tokens = split_quoted(first);
        // [keyword, severity, action, args...]
        let Some(action) = tokens.get(2) else {
            warn!("unparseable status event: {}", first);
            return;
        };

        match action.as_str() {
            "BOOTSTRAP" => self.update_bootstrap(&tokens[1..]),
            "CIRCUIT_ESTABLISHED" => self.set_tor_status(TorStatus::Ready),
            "CIRCUIT_NOT_ESTABLISHED" => self.set_tor_status(TorStatus::Offline),
            _ => debug!("status event {}", action),
        }
    }

    /// Fold a tokenized `SEVERITY BOOTSTRAP k=v…` payload into the map.
    fn update_bootstrap(&mut self, tokens: &[String]) {
        if let Some(severity) = tokens.first() {
            if !severity.contains('=') {
                self.bootstrap
                    .insert("SEVERITY".to_string(), severity.clone());
            }
        }
        for token in tokens {
            if let Some((k, v)) = token.split_once('=') {
                self.bootstrap.insert(k.to_string(), v.to_string());
            }
        }

        let _ = self
            .notify_tx
            .send(ControlEvent::BootstrapProgress(self.bootstrap.clone()));

        if self.bootstrap.get("PROGRESS").map(String::as_str) == Some("100") {
            self.set_tor_status(TorStatus::Ready);
        }
    }

    fn handle_hs_desc_event(&mut self, event: &Event) {
        let Some(first) = event.lines.first() else {
            return;
        };
        let tokens = split_quoted(first);
        // HS_DESC <action> <address> <authtype> <hsdir> ...
        let (Some(action), Some(address)) = (tokens.get(1), tokens.get(2)) else {
            warn!("unparseable HS_DESC event: {}", first);
            return;
        };

        let notify = self.notify_tx.clone();
        for service in &mut self.services {
            if let Some((old, new)) = service.handle_descriptor_event(action, address) {
                let _ = notify.send(ControlEvent::ServiceStatusChanged {
                    service_id: address.clone(),
                    old,
                    new,
                });
            }
        }
    }

    fn set_status(&mut self, new: ConnectionStatus) {
        if self.status != new {
            let old = std::mem::replace(&mut self.status, new);
            debug!("control connection {:?} -> {:?}", old, new);
            let _ = self
                .notify_tx
                .send(ControlEvent::StatusChanged { old, new });
        }
    }

    fn set_tor_status(&mut self, new: TorStatus) {
        if self.tor_status != new {
            let old = std::mem::replace(&mut self.tor_status, new);
            info!("tor network status {:?} -> {:?}", old, new);
            let _ = self
                .notify_tx
                .send(ControlEvent::TorStatusChanged { old, new });
        }
    }

    fn fail(&mut self, error: &Error) {
        if let Some(socket) = self.socket.take() {
            socket.shutdown();
        }
        self.set_status(ConnectionStatus::Error);
        let _ = self
            .notify_tx
            .send(ControlEvent::Error(error.to_string()));
    }
}

fn read_cookie(path: &Path) -> Result<Vec<u8>> {
    let cookie = std::fs::read(path)
        .map_err(|e| Error::AuthFailed(format!("cannot read cookie {}: {}", path.display(), e)))?;
    if cookie.len() != 32 {
        return Err(Error::AuthFailed(format!(
            "cookie {} is {} bytes, expected 32",
            path.display(),
            cookie.len()
        )));
    }
    Ok(cookie)
}

/// Parse `addr:port`, with or without surrounding quotes already stripped.
/// Plain `auto`, `0`, or a bare port are not usable endpoints yet.
fn parse_socks_endpoint(value: &str) -> Option<(String, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}
