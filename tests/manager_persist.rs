//! Persistence and manager-handle behavior that needs no running tor

use onionlink::config::{Config, FriendsConfig, ServiceConfig, TorConfig};
use onionlink::control::{ConnectionStatus, TorStatus};
use onionlink::crypto::OnionKey;
use onionlink::manager::persist;
use onionlink::service::HsStatus;
use onionlink::TorManager;

fn config(base: &std::path::Path) -> Config {
    Config {
        tor: TorConfig {
            executable: None,
            data_dir: base.join("tor"),
            hidden_service_dir: base.join("hs"),
        },
        service: ServiceConfig::default(),
        friends: FriendsConfig::default(),
    }
}

#[test]
fn cold_start_file_layout() {
    let dir = tempfile::tempdir().unwrap();
    let key = OnionKey::generate();

    persist::save_private_key(dir.path(), &key).unwrap();
    persist::save_hostname(dir.path(), &key.onion_address()).unwrap();

    let key_raw = std::fs::read_to_string(dir.path().join("private_key")).unwrap();
    assert!(key_raw.starts_with("ED25519-V3:"));
    assert!(key_raw.ends_with('\n'));
    assert_eq!(key_raw.lines().count(), 1);

    let hostname_raw = std::fs::read_to_string(dir.path().join("hostname")).unwrap();
    assert_eq!(hostname_raw, format!("{}\n", key.onion_address()));
    assert_eq!(hostname_raw.trim_end().len(), 56 + ".onion".len());
}

#[test]
fn restart_reloads_identical_identity() {
    let dir = tempfile::tempdir().unwrap();
    let key = OnionKey::generate();
    persist::save_private_key(dir.path(), &key).unwrap();

    // A later run must derive the same address without rewriting anything.
    let before = std::fs::metadata(dir.path().join("private_key"))
        .unwrap()
        .modified()
        .unwrap();
    let reloaded = persist::load_private_key(dir.path()).unwrap().unwrap();
    assert_eq!(reloaded.service_id(), key.service_id());
    let after = std::fs::metadata(dir.path().join("private_key"))
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn crash_between_tmp_write_and_rename_keeps_old_key() {
    let dir = tempfile::tempdir().unwrap();
    let old = OnionKey::generate();
    persist::save_private_key(dir.path(), &old).unwrap();

    // Simulate the crash: the replacement made it to the tmp file only.
    let next = OnionKey::generate();
    std::fs::write(
        dir.path().join("private_key.tmp"),
        format!("{}\n", next.to_key_blob()),
    )
    .unwrap();

    let reloaded = persist::load_private_key(dir.path()).unwrap().unwrap();
    assert_eq!(reloaded, old);

    // A completed save replaces it.
    persist::save_private_key(dir.path(), &next).unwrap();
    let reloaded = persist::load_private_key(dir.path()).unwrap().unwrap();
    assert_eq!(reloaded, next);
}

#[tokio::test]
async fn manager_handle_defaults_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TorManager::new(config(dir.path()));

    assert_eq!(manager.tor_status().await, TorStatus::Unknown);
    assert_eq!(
        manager.connectivity_status().await,
        ConnectionStatus::NotConnected
    );
    assert_eq!(manager.hidden_service_status().await, HsStatus::NotCreated);
    assert!(manager.hidden_service_info().await.is_none());
    assert!(manager.proxy_server_info().await.is_none());
    assert!(manager.error_message().await.is_none());
    assert!(manager.log_messages().await.is_empty());
    assert!(!manager.configuration_needed().await);
    assert!(manager.bootstrap_status().await.is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn start_without_tor_executable_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    // Point at a binary that cannot exist.
    cfg.tor.executable = Some(dir.path().join("no-such-tor"));

    let manager = TorManager::new(cfg);
    let result = manager.start().await;
    assert!(result.is_err());
    assert!(manager.error_message().await.is_some());
    manager.stop().await;
}
