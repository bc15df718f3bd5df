//! Friend-server request loop
//!
//! Periodically asks a remote friend server for peer invitations through
//! the Tor SOCKS proxy. The closer the peer set is to the wanted size, the
//! longer the pause between campaigns, on a log scale from 30 s up to an
//! hour. The underlying request blocks, so the loop runs on its own worker
//! thread and never touches control-connection state.

pub mod client;

pub use client::FsClient;

use crate::config::FriendsConfig;
use crate::util::time::unix_timestamp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Worker tick cadence; campaigns are gated separately by `campaign_delay`.
const TICK_INTERVAL: Duration = Duration::from_secs(2);

const MIN_DELAY_SECS: u64 = 30;
const MAX_DELAY_SECS: f64 = 3600.0;

/// The host application's view of the peer set.
pub trait PeerBook: Send + Sync {
    fn friend_count(&self) -> u32;
    /// Is this short invite already a known peer?
    fn is_known(&self, invite: &str) -> bool;
    fn add_peer(&self, invite: &str, accepted: bool);
}

/// Handle to the requester worker thread.
pub struct FriendRequester {
    stop: Arc<AtomicBool>,
    config: FriendsConfig,
    client: Arc<dyn FsClient>,
}

impl FriendRequester {
    /// Spawn the worker. `passphrase` unlocks the identity used to sign
    /// our own invite, when the client implementation needs it.
    pub fn start(
        config: FriendsConfig,
        client: Arc<dyn FsClient>,
        peers: Arc<dyn PeerBook>,
        passphrase: Option<String>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));

        let worker_stop = Arc::clone(&stop);
        let worker_config = config.clone();
        let worker_client = Arc::clone(&client);
        std::thread::Builder::new()
            .name("friend-requester".into())
            .spawn(move || {
                info!("friend requester started");
                let mut last_campaign = 0u64;
                loop {
                    std::thread::sleep(TICK_INTERVAL);
                    if worker_stop.load(Ordering::Relaxed) {
                        break;
                    }
                    tick(
                        &worker_config,
                        &*worker_client,
                        &*peers,
                        passphrase.as_deref(),
                        &mut last_campaign,
                        unix_timestamp(),
                    );
                }
                info!("friend requester stopped");
            })
            .expect("spawn friend-requester thread");

        Self {
            stop,
            config,
            client,
        }
    }

    /// Ask the worker to exit at its next tick boundary.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Probe the server address through the proxy without blocking the
    /// caller; the callback fires from a throwaway thread.
    pub fn check_server_address(
        &self,
        address: String,
        port: u16,
        timeout_ms: u64,
        callback: impl FnOnce(&str, u16, bool) + Send + 'static,
    ) {
        let client = Arc::clone(&self.client);
        let proxy_address = self.config.proxy_address.clone();
        let proxy_port = self.config.proxy_port;
        std::thread::spawn(move || {
            let reachable = client.check_connection(
                &address,
                port,
                &proxy_address,
                proxy_port,
                Duration::from_millis(timeout_ms),
            );
            callback(&address, port, reachable);
        });
    }
}

/// One worker tick: decide whether a campaign is due and run it.
fn tick(
    config: &FriendsConfig,
    client: &dyn FsClient,
    peers: &dyn PeerBook,
    passphrase: Option<&str>,
    last_campaign: &mut u64,
    now: u64,
) {
    let Some(server_address) = config.server_address.as_deref() else {
        warn!("no friend server address configured");
        return;
    };

    let friends = peers.friend_count();
    if config.wanted_friends == 0 || config.wanted_friends < friends {
        warn!(
            "wanted {} friends but have {}; nothing to request",
            config.wanted_friends, friends
        );
        return;
    }

    let delay = campaign_delay(friends, config.wanted_friends);
    if *last_campaign + delay >= now {
        return;
    }
    *last_campaign = now;

    debug!(
        "requesting friends: have {}, want {}, next campaign in {}s",
        friends, config.wanted_friends, delay
    );

    let invites = match client.request_friends(
        server_address,
        config.server_port,
        &config.proxy_address,
        config.proxy_port,
        config.wanted_friends,
        passphrase,
    ) {
        Ok(invites) => invites,
        Err(e) => {
            warn!("friend server request failed: {}", e);
            return;
        },
    };

    for (invite, accepted) in invites {
        if peers.is_known(&invite) {
            debug!("known peer ({}): {:.32}", if accepted { "ok" } else { "--" }, invite);
            continue;
        }
        info!("new peer ({}): {:.32}", if accepted { "ok" } else { "--" }, invite);
        peers.add_peer(&invite, accepted);
    }
}

/// Seconds to wait between campaigns given the current peer count.
///
/// Log-scale interpolation between 30 s (no friends yet) and an hour
/// (nearly saturated): with a wanted count of 10 the series for 0..10
/// friends is 30, 30, 32, 35, 44, 66, 121, 258, 603, 1466.
fn campaign_delay(friends: u32, wanted: u32) -> u64 {
    let s = if friends < wanted {
        f64::from(wanted - friends) / f64::from(wanted)
    } else {
        1.0
    };
    MIN_DELAY_SECS + (-s + MAX_DELAY_SECS.ln() * (1.0 - s)).exp().floor() as u64
}
